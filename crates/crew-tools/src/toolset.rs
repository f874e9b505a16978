// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tool::ToolDef;

/// A structured question a tool asks the user mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationRequest {
    /// Human-readable prompt shown to the user.
    pub message: String,
    /// JSON Schema describing the expected answer shape, when the tool
    /// wants structured content rather than free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationResponse {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Callback a tool set invokes to ask the user a structured question.
/// Registered by the runtime; resolves when the user answers.
pub type ElicitationHandler =
    Arc<dyn Fn(ElicitationRequest) -> BoxFuture<'static, anyhow::Result<ElicitationResponse>>
        + Send
        + Sync>;

/// Callback invoked after a tool set completes an OAuth flow, so the runtime
/// can re-discover tools that only appear once authorized.
pub type OAuthSuccessHandler = Arc<dyn Fn() + Send + Sync>;

/// Failures a tool set may surface during discovery or startup.
#[derive(Debug, Error)]
pub enum ToolSetError {
    /// The tool set needs the user to complete an authorization flow at the
    /// given URL before it can publish tools.
    #[error("authorization required: {0}")]
    OAuthRequired(String),
}

/// A lifecycle-managed bundle that publishes a list of tools.
///
/// The tool list MAY change over time (an MCP server adds tools after
/// OAuth, for example), so the runtime re-queries `tools()` at each aggregation
/// point rather than caching the first answer.
///
/// Handler registration uses interior mutability: tool sets are shared
/// behind `Arc` once the team owns them, so the setters take `&self` and
/// default to no-ops for sets that never elicit or authorize.  Decorators
/// forward every capability to their inner set (§ capability-query style,
/// not inheritance).
#[async_trait]
pub trait ToolSet: Send + Sync {
    /// Discover the current tools.
    async fn tools(&self) -> anyhow::Result<Vec<ToolDef>>;

    /// Called once by the owning team before the first run.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once in reverse declaration order when the team shuts down.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Extra text the runtime appends to the agent's system prompt.
    fn instructions(&self) -> Option<String> {
        None
    }

    fn set_elicitation_handler(&self, _handler: ElicitationHandler) {}

    fn set_oauth_success_handler(&self, _handler: OAuthSuccessHandler) {}

    /// When managed, the runtime drives the OAuth flow (publishing the URL
    /// to subscribers) instead of the tool set opening a browser itself.
    fn set_managed_oauth(&self, _managed: bool) {}
}

/// A fixed in-memory tool set.  The building block for built-in tools and
/// the workhorse of the test suite.
#[derive(Default)]
pub struct StaticToolSet {
    tools: Vec<ToolDef>,
    instructions: Option<String>,
}

impl StaticToolSet {
    pub fn new(tools: Vec<ToolDef>) -> Self {
        Self {
            tools,
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[async_trait]
impl ToolSet for StaticToolSet {
    async fn tools(&self) -> anyhow::Result<Vec<ToolDef>> {
        Ok(self.tools.clone())
    }

    fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
