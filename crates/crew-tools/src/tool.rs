// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation with parsed JSON arguments.
///
/// The runtime parses the model's wire-format argument string before
/// dispatch, so handlers never see incomplete JSON.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallResult {
    /// Text surfaced back to the model as the tool message content.
    pub output: String,
    /// Structured side information for UI consumers; never sent to the model.
    pub meta: Option<Value>,
    /// If true, the tool failed non-fatally and `output` carries the error
    /// message.  The model self-corrects on the next turn.
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            meta: None,
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            output: msg.into(),
            meta: None,
            is_error: true,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Executes one tool call.  Implementations observe the cancellation token
/// and return promptly when the containing run is stopped.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        call: &ToolCall,
    ) -> anyhow::Result<ToolCallResult>;
}

/// Adapter that lets a plain async closure act as a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ToolCallResult>> + Send,
{
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        call: &ToolCall,
    ) -> anyhow::Result<ToolCallResult> {
        (self.0)(call.clone()).await
    }
}

/// A tool published by a [`ToolSet`][crate::ToolSet].
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
    /// JSON Schema of the output, when the tool declares one.
    pub output_schema: Option<Value>,
    /// Free-form grouping used by permission patterns and UIs.
    pub category: String,
    /// When set, the runtime injects a free-text `description` parameter the
    /// model fills in to annotate the call.  The field is stripped before the
    /// handler runs.
    pub add_description_parameter: bool,
    /// Human-facing name; falls back to `name` when absent.
    pub display_name: Option<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            output_schema: None,
            category: String::new(),
            add_description_parameter: false,
            display_name: None,
            handler,
        }
    }

    /// Construct a tool from an async closure; handy in tests and built-ins.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolCallResult>> + Send + 'static,
    {
        Self::new(name, description, parameters, Arc::new(FnHandler(f)))
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_description_parameter(mut self) -> Self {
        self.add_description_parameter = true;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("category", &self.category)
            .field(
                "add_description_parameter",
                &self.add_description_parameter,
            )
            .finish_non_exhaustive()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
