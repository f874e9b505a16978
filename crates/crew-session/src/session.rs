// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use crew_model::{Message, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in the session log: a message plus runtime bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Name of the agent that owned the turn this message belongs to.
    pub agent_name: String,
    pub message: Message,
    /// Synthesized by the runtime (transfer acknowledgments, sub-task
    /// prompts).  Hidden from user-facing transcripts, still part of the
    /// prompt so tool-call pairing stays intact.
    pub implicit: bool,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(agent_name: impl Into<String>, message: Message) -> Self {
        Self {
            agent_name: agent_name.into(),
            message,
            implicit: false,
            timestamp: Utc::now(),
        }
    }

    pub fn implicit(agent_name: impl Into<String>, message: Message) -> Self {
        Self {
            implicit: true,
            ..Self::new(agent_name, message)
        }
    }
}

/// The full append-only history of a conversation plus aggregate counters.
///
/// Messages are only ever appended during a run; readers observe the log
/// through an outer read lock held by the application.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    messages: Vec<SessionMessage>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost: f64,
    pub starred: bool,
    /// Global auto-approve: skip the confirmation gate for every tool call.
    pub tools_approved: bool,
    /// Request reasoning traces when the model supports them.
    pub thinking: bool,
    pub hide_tool_results: bool,
    pub working_dir: PathBuf,
    /// Directories tools may touch; enforced by tool implementations.
    pub allowed_directories: Vec<PathBuf>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            created_at: Utc::now(),
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            cost: 0.0,
            starred: false,
            tools_approved: false,
            thinking: false,
            hide_tool_results: false,
            working_dir: PathBuf::from("."),
            allowed_directories: Vec::new(),
        }
    }

    /// Rebuild a session from persisted parts.  Used by the store.
    pub(crate) fn from_parts(
        id: String,
        title: String,
        created_at: DateTime<Utc>,
        messages: Vec<SessionMessage>,
    ) -> Self {
        Self {
            id,
            title,
            created_at,
            messages,
            ..Self::new()
        }
    }

    pub fn push(&mut self, msg: SessionMessage) {
        self.messages.push(msg);
    }

    /// Append a user message attributed to the given agent's turn.
    pub fn push_user(&mut self, agent_name: impl Into<String>, text: impl Into<String>) {
        self.push(SessionMessage::new(agent_name, Message::user(text)));
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The most recent top-level user message, if any.
    ///
    /// Sub-task prompts (user messages carrying a `tool_call_id`) are not
    /// user turns and are skipped.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.message.role == Role::User && m.message.tool_call_id.is_none())
            .map(|m| m.message.content.as_str())
    }

    /// The message log as seen from one agent's thread.
    ///
    /// User messages are universal; assistant and tool messages belong to
    /// the agent that produced them.  User messages carrying a
    /// `tool_call_id` are sub-task prompts and stay scoped to their
    /// sub-thread.
    pub fn thread(&self, agent_name: &str) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| match m.message.role {
                Role::User => m.message.tool_call_id.is_none(),
                Role::System => false,
                _ => m.agent_name == agent_name,
            })
            .map(|m| &m.message)
            .collect()
    }

    /// The sub-thread a `transfer_task` call created: the synthetic user
    /// prompt carrying the calling tool-call id, plus everything the target
    /// agent produced after it.
    pub fn task_thread(&self, agent_name: &str, task_call_id: &str) -> Vec<&Message> {
        let Some(start) = self.messages.iter().position(|m| {
            m.message.role == Role::User
                && m.message.tool_call_id.as_deref() == Some(task_call_id)
        }) else {
            return Vec::new();
        };
        self.messages[start..]
            .iter()
            .filter(|m| m.agent_name == agent_name)
            .map(|m| &m.message)
            .collect()
    }

    /// Accumulate per-turn usage into the session counters.
    pub fn add_usage(&mut self, input: u64, output: u64, reasoning: u64, cost: f64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.reasoning_tokens += reasoning;
        self.cost += cost;
    }

    /// Drop the message log and keep counters.  Used by summarization.
    pub fn replace_messages(&mut self, messages: Vec<SessionMessage>) {
        self.messages = messages;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crew_model::ToolCall;

    use super::*;

    // ── Construction ──────────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = Session::new();
        assert!(s.is_empty());
        assert_eq!(s.input_tokens, 0);
        assert_eq!(s.title, "");
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    #[test]
    fn add_usage_accumulates() {
        let mut s = Session::new();
        s.add_usage(100, 20, 5, 0.01);
        s.add_usage(50, 10, 0, 0.02);
        assert_eq!(s.input_tokens, 150);
        assert_eq!(s.output_tokens, 30);
        assert_eq!(s.reasoning_tokens, 5);
        assert!((s.cost - 0.03).abs() < f64::EPSILON);
    }

    // ── Thread filtering ──────────────────────────────────────────────────────

    #[test]
    fn thread_includes_universal_user_messages() {
        let mut s = Session::new();
        s.push_user("root", "hello");
        s.push(SessionMessage::new("root", Message::assistant("hi")));
        s.push(SessionMessage::new("writer", Message::assistant("draft")));

        let root_thread = s.thread("root");
        assert_eq!(root_thread.len(), 2);
        let writer_thread = s.thread("writer");
        assert_eq!(writer_thread.len(), 2);
        assert_eq!(writer_thread[0].content, "hello");
        assert_eq!(writer_thread[1].content, "draft");
    }

    #[test]
    fn thread_excludes_other_agents_tool_messages() {
        let mut s = Session::new();
        s.push_user("root", "go");
        s.push(SessionMessage::new(
            "root",
            Message::assistant_with_calls("", None, vec![ToolCall::new("c1", "echo", "{}")]),
        ));
        s.push(SessionMessage::new("root", Message::tool_result("c1", "ok")));

        assert_eq!(s.thread("root").len(), 3);
        assert_eq!(s.thread("writer").len(), 1);
    }

    #[test]
    fn sub_task_prompts_stay_out_of_main_threads() {
        let mut s = Session::new();
        s.push_user("root", "top level");
        let mut task = Message::user("sub task");
        task.tool_call_id = Some("call-7".into());
        s.push(SessionMessage::implicit("writer", task));

        assert_eq!(s.thread("root").len(), 1);
        assert_eq!(s.thread("writer").len(), 1, "universal user msg only");
    }

    #[test]
    fn task_thread_scopes_to_the_calling_id() {
        let mut s = Session::new();
        s.push_user("root", "top");
        let mut task = Message::user("do the thing");
        task.tool_call_id = Some("call-9".into());
        s.push(SessionMessage::implicit("writer", task));
        s.push(SessionMessage::new("writer", Message::assistant("done")));
        s.push(SessionMessage::new("root", Message::assistant("wrap")));

        let tt = s.task_thread("writer", "call-9");
        assert_eq!(tt.len(), 2);
        assert_eq!(tt[0].content, "do the thing");
        assert_eq!(tt[1].content, "done");
    }

    #[test]
    fn task_thread_unknown_id_is_empty() {
        let s = Session::new();
        assert!(s.task_thread("writer", "missing").is_empty());
    }

    // ── Last user text ────────────────────────────────────────────────────────

    #[test]
    fn last_user_text_skips_sub_task_prompts() {
        let mut s = Session::new();
        s.push_user("root", "real question");
        let mut task = Message::user("internal task");
        task.tool_call_id = Some("c".into());
        s.push(SessionMessage::implicit("writer", task));
        assert_eq!(s.last_user_text(), Some("real question"));
    }

    #[test]
    fn last_user_text_none_when_empty() {
        assert!(Session::new().last_user_text().is_none());
    }
}
