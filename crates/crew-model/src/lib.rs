// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
pub mod mock;
mod provider;
mod types;

pub use error::{Backoff, ProviderError};
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    Attachment, CompletionRequest, FinishReason, FunctionCall, Message, RequestOptions,
    ResponseEvent, Role, ToolCall, ToolCallDelta, ToolSchema,
};
