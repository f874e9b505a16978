// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crew_model::{FinishReason, ToolCall};
use crew_tools::{ElicitationRequest, ToolCallResult};

/// Events published by the runtime during a run.
/// Consumers (UIs, exporters, transport adapters) subscribe to these to
/// drive their output.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A user turn began
    UserMessage { text: String },
    /// A model stream opened for the given agent
    StreamStarted { agent: String },
    /// A text chunk streamed from the model
    AgentChoice { agent: String, delta: String },
    /// A reasoning chunk (when thinking was requested and is supported)
    AgentChoiceReasoning { agent: String, delta: String },
    /// The model is streaming tool-call arguments; `call` is the
    /// accumulated snapshot and may hold truncated JSON
    PartialToolCall { agent: String, call: ToolCall },
    /// The runtime paused, awaiting an approval decision for this call
    ToolCallConfirmation { agent: String, call: ToolCall },
    /// Tool execution began (after any approval)
    ToolCall { agent: String, call: ToolCall },
    /// Tool execution completed
    ToolCallResponse {
        agent: String,
        call: ToolCall,
        result: ToolCallResult,
    },
    /// One model stream ended
    StreamStopped {
        agent: String,
        reason: FinishReason,
    },
    /// Cumulative session counters after a turn's usage arrived
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        reasoning_tokens: u64,
        cost: f64,
    },
    /// The session title was set or regenerated
    SessionTitle { title: String },
    /// A transfer was executed
    AgentTransfer {
        from: String,
        to: String,
        task: Option<String>,
    },
    /// Output of a user-invoked shell escape
    Shell { output: String },
    /// A non-fatal error surfaced to subscribers
    Error { message: String },
    /// A tool requires structured user input
    Elicitation { request: ElicitationRequest },
    /// A tool requires the user to visit a URL
    OAuth { url: String },
}

impl RuntimeEvent {
    /// High-frequency events that the bus may merge when a subscriber's
    /// buffer is full.  Everything else is delivered losslessly.
    pub fn is_coalescable(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::AgentChoice { .. }
                | RuntimeEvent::AgentChoiceReasoning { .. }
                | RuntimeEvent::PartialToolCall { .. }
        )
    }
}
