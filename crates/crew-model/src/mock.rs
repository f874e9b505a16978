// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, FinishReason, ProviderError, ResponseEvent, Role,
    ToolCallDelta,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    async fn create_chat_completion_stream(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
                reasoning_tokens: 0,
                cost: 0.0,
            }),
            Ok(ResponseEvent::Finish(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted `create_chat_completion_stream` outcome.
pub enum Script {
    /// The call succeeds and the stream yields these events.
    Events(Vec<ResponseEvent>),
    /// The call fails before any chunk is produced.
    Fail(ProviderError),
}

/// A pre-scripted mock provider.  Each stream request pops the next script
/// from the front of the queue, so tests can specify exact event sequences
/// (including tool calls and provider failures) without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    id: String,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self::from_scripts(scripts.into_iter().map(Script::Events).collect())
    }

    pub fn from_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            id: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_turn(reply)])
    }

    /// Events for one plain text turn ending in `stop`.
    pub fn text_turn(reply: impl Into<String>) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
                reasoning_tokens: 0,
                cost: 0.0,
            },
            ResponseEvent::Finish(FinishReason::Stop),
        ]
    }

    /// Events for one turn that requests a single tool call.
    pub fn tool_call_turn(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args_json.into(),
            }),
            ResponseEvent::Finish(FinishReason::ToolCalls),
        ]
    }

    /// Convenience: a tool call on the first turn, text on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_turn(tool_id, tool_name, args_json),
            Self::text_turn(final_text),
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_chat_completion_stream(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Script::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Finish(FinishReason::Stop),
                ])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Events(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
            Script::Fail(err) => Err(err.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
