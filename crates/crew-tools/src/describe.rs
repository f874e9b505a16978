// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Description-parameter injection decorator.
//!
//! Wraps an inner [`ToolSet`] and, for every tool flagged with
//! `add_description_parameter`, adds a free-text `description` property to
//! the schema the model sees.  The model uses it to annotate why it is
//! making the call; the invoker strips the field before the handler runs.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::ToolDef;
use crate::toolset::{ElicitationHandler, OAuthSuccessHandler, ToolSet};

/// Name of the injected parameter.  The invoker removes this key from the
/// parsed arguments before dispatch.
pub const DESCRIPTION_PARAMETER: &str = "description";

/// Decorator owning its inner set exclusively and forwarding every
/// capability it does not change itself.
pub struct DescribedToolSet {
    inner: Box<dyn ToolSet>,
}

impl DescribedToolSet {
    pub fn new(inner: Box<dyn ToolSet>) -> Self {
        Self { inner }
    }
}

/// Add the `description` property to a parameters schema.
///
/// Non-object schemas are left untouched: injecting into them would
/// produce an invalid schema, and the tool author opted in per tool.
pub fn inject_description_parameter(parameters: &Value) -> Value {
    let Some(obj) = parameters.as_object() else {
        return parameters.clone();
    };
    let mut out = obj.clone();
    let props = out
        .entry("properties")
        .or_insert_with(|| json!({}));
    if let Some(props) = props.as_object_mut() {
        props.insert(
            DESCRIPTION_PARAMETER.to_string(),
            json!({
                "type": "string",
                "description": "One sentence explaining why this tool is being called"
            }),
        );
    }
    Value::Object(out)
}

#[async_trait]
impl ToolSet for DescribedToolSet {
    async fn tools(&self) -> anyhow::Result<Vec<ToolDef>> {
        let tools = self.inner.tools().await?;
        Ok(tools
            .into_iter()
            .map(|mut t| {
                if t.add_description_parameter {
                    t.parameters = inject_description_parameter(&t.parameters);
                }
                t
            })
            .collect())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.stop().await
    }

    fn instructions(&self) -> Option<String> {
        self.inner.instructions()
    }

    fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        self.inner.set_elicitation_handler(handler);
    }

    fn set_oauth_success_handler(&self, handler: OAuthSuccessHandler) {
        self.inner.set_oauth_success_handler(handler);
    }

    fn set_managed_oauth(&self, managed: bool) {
        self.inner.set_managed_oauth(managed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolCall, ToolCallResult, ToolDef};
    use crate::toolset::StaticToolSet;

    fn tool(name: &str, flagged: bool) -> ToolDef {
        let t = ToolDef::from_fn(
            name,
            "test tool",
            json!({ "type": "object", "properties": { "x": { "type": "string" } } }),
            |_: ToolCall| async { Ok(ToolCallResult::ok("")) },
        );
        if flagged {
            t.with_description_parameter()
        } else {
            t
        }
    }

    #[tokio::test]
    async fn flagged_tool_gains_description_property() {
        let ts = DescribedToolSet::new(Box::new(StaticToolSet::new(vec![tool("a", true)])));
        let tools = ts.tools().await.unwrap();
        assert!(tools[0].parameters["properties"][DESCRIPTION_PARAMETER].is_object());
        // The original property survives
        assert!(tools[0].parameters["properties"]["x"].is_object());
    }

    #[tokio::test]
    async fn unflagged_tool_schema_is_unchanged() {
        let ts = DescribedToolSet::new(Box::new(StaticToolSet::new(vec![tool("a", false)])));
        let tools = ts.tools().await.unwrap();
        assert!(tools[0].parameters["properties"][DESCRIPTION_PARAMETER].is_null());
    }

    #[test]
    fn injection_into_schema_without_properties_creates_them() {
        let injected = inject_description_parameter(&json!({ "type": "object" }));
        assert!(injected["properties"][DESCRIPTION_PARAMETER].is_object());
    }

    #[test]
    fn injection_into_non_object_schema_is_identity() {
        let schema = json!("not a schema");
        assert_eq!(inject_description_parameter(&schema), schema);
    }

    #[tokio::test]
    async fn decorator_forwards_instructions() {
        let inner = StaticToolSet::default().with_instructions("inner text");
        let ts = DescribedToolSet::new(Box::new(inner));
        assert_eq!(ts.instructions().as_deref(), Some("inner text"));
    }
}
