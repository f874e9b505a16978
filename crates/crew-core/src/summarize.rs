// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session summarization: a tool-free model turn that replaces the log with
//! a compact summary while the aggregate counters stay untouched.

use std::sync::Arc;

use crew_model::{CompletionRequest, Message, RequestOptions, ResponseEvent, Role};
use crew_session::{Session, SessionMessage};
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::events::RuntimeEvent;
use crate::runtime::Runtime;

const SUMMARIZE_PROMPT: &str = "Summarize the conversation below so another \
    assistant can continue it seamlessly. Preserve: the user's goals, key \
    decisions and their reasons, important facts and artifacts, and any \
    unfinished work. Be concise; do not add commentary.";

impl Runtime {
    /// Replace the session log with a model-written summary.
    ///
    /// The summary turn streams `AgentChoice` events like a normal turn.
    /// On any failure the session is left exactly as it was.
    pub async fn summarize(
        &self,
        session: &Arc<RwLock<Session>>,
        extra_prompt: Option<&str>,
    ) -> anyhow::Result<()> {
        let cancel = self.new_run_token();
        let agent = self
            .team
            .get(&self.start_agent)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown agent: {}", self.start_agent))?;

        let transcript = {
            let s = session.read().await;
            if s.is_empty() {
                anyhow::bail!("nothing to summarize");
            }
            render_transcript(s.messages())
        };

        let mut instruction = SUMMARIZE_PROMPT.to_string();
        if let Some(extra) = extra_prompt {
            instruction.push_str("\n\n");
            instruction.push_str(extra);
        }

        let request = CompletionRequest {
            messages: vec![Message::system(instruction), Message::user(transcript)],
            tools: Vec::new(),
            options: RequestOptions {
                thinking: false,
                ..agent.request_options(false)
            },
        };

        self.bus
            .publish(RuntimeEvent::StreamStarted {
                agent: agent.name().to_string(),
            })
            .await;

        let mut stream = agent
            .provider()
            .create_chat_completion_stream(request)
            .await?;
        let mut summary = String::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            match item? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    summary.push_str(&delta);
                    self.bus
                        .publish(RuntimeEvent::AgentChoice {
                            agent: agent.name().to_string(),
                            delta,
                        })
                        .await;
                }
                ResponseEvent::Finish(_) => break,
                _ => {}
            }
        }

        self.bus
            .publish(RuntimeEvent::StreamStopped {
                agent: agent.name().to_string(),
                reason: crew_model::FinishReason::Stop,
            })
            .await;

        if summary.trim().is_empty() {
            anyhow::bail!("summarization produced no text");
        }

        let mut s = session.write().await;
        s.replace_messages(vec![SessionMessage::new(
            agent.name(),
            Message::user(format!("Summary of the conversation so far:\n\n{summary}")),
        )]);
        Ok(())
    }
}

/// Render the log for the summarization prompt.  Implicit messages are
/// runtime plumbing and stay out; tool results are labelled by call id.
fn render_transcript(messages: &[SessionMessage]) -> String {
    let mut out = String::new();
    for m in messages.iter().filter(|m| !m.implicit) {
        let role = match m.message.role {
            Role::System => continue,
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool result",
        };
        if m.message.content.is_empty() && m.message.tool_calls.is_empty() {
            continue;
        }
        out.push_str(&format!("{role} ({agent}):\n", agent = m.agent_name));
        if !m.message.content.is_empty() {
            out.push_str(&m.message.content);
            out.push('\n');
        }
        for call in &m.message.tool_calls {
            out.push_str(&format!(
                "[called {} with {}]\n",
                call.function.name, call.function.arguments
            ));
        }
        out.push('\n');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
