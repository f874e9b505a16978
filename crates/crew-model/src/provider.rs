// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

/// A lazy, finite, non-restartable sequence of completion chunks.
pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The contract the runtime consumes for streaming chat completions.
///
/// Concrete bindings (hosted APIs, local servers, gateways) live outside the
/// runtime; the run loop only ever sees this trait.  Errors returned from
/// [`create_chat_completion_stream`][Self::create_chat_completion_stream]
/// should carry a [`ProviderError`][crate::ProviderError] in their chain so
/// the run loop can pick the right retry policy.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Opaque identifier used in logs and events.
    fn id(&self) -> &str;

    /// Send a completion request and return the streaming response.
    async fn create_chat_completion_stream(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream>;
}
