// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single tool-call execution with full gating: permission check, approval
//! wait, lifecycle hooks, cancellation, result events.

use std::collections::HashMap;
use std::sync::Arc;

use crew_session::Session;
use crew_tools::{
    Decision, HookRunner, PermissionsChecker, ToolCallResult, ToolDef, DESCRIPTION_PARAMETER,
};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::EventBus;
use crate::events::RuntimeEvent;

/// The user's answer to a `ToolCallConfirmation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run this call.
    Approve,
    /// Skip this call; the model sees a rejection result.
    Reject,
    /// Run this call and auto-approve everything else in this session.
    ApproveSession,
}

/// One approval channel per pending call id.  `Runtime::resume` looks the
/// sender up and closes it; an unknown id is a silent no-op, which makes a
/// second resume for the same call harmless.
pub(crate) type ApprovalRegistry = Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>>;

pub(crate) struct ToolInvoker {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) permissions: Arc<PermissionsChecker>,
    pub(crate) approvals: ApprovalRegistry,
    pub(crate) hooks: Option<Arc<HookRunner>>,
    pub(crate) session: Arc<RwLock<Session>>,
    pub(crate) cancel: CancellationToken,
}

impl ToolInvoker {
    /// Execute one complete tool call and return the result the run loop
    /// appends as the Tool message.  Never panics, never propagates tool
    /// failures; the model self-corrects from error results.
    pub(crate) async fn invoke(
        &self,
        agent_name: &str,
        defs: &[ToolDef],
        call: &crew_model::ToolCall,
    ) -> ToolCallResult {
        let name = call.function.name.as_str();

        let Some(def) = defs.iter().find(|d| d.name == name) else {
            // No gating for unresolvable names: the error result is the
            // whole response.
            return ToolCallResult::err(format!("unknown tool: {name}"));
        };

        let mut args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => return ToolCallResult::err(format!("{e:#}")),
        };
        // The injected annotation parameter is for humans and events, not
        // for handlers.  A tool that declares its own `description`
        // argument keeps it.
        if def.add_description_parameter {
            if let Some(obj) = args.as_object_mut() {
                obj.remove(DESCRIPTION_PARAMETER);
            }
        }

        let decision = self.permissions.check_with_args(name, args.as_object());
        match decision {
            Decision::Deny => {
                debug!(tool = name, "tool call denied by permissions");
                return self
                    .finish(
                        agent_name,
                        call,
                        ToolCallResult::err(format!("permission denied: {name}")),
                    )
                    .await;
            }
            Decision::Allow => {}
            Decision::Ask => {
                let auto = self.session.read().await.tools_approved;
                if !auto {
                    match self.await_approval(agent_name, call).await {
                        ApprovalDecision::Approve => {}
                        ApprovalDecision::ApproveSession => {
                            self.session.write().await.tools_approved = true;
                        }
                        ApprovalDecision::Reject => {
                            return self
                                .finish(
                                    agent_name,
                                    call,
                                    ToolCallResult::err("user rejected the tool call"),
                                )
                                .await;
                        }
                    }
                }
            }
        }

        if let Some(hooks) = &self.hooks {
            let outcome = hooks
                .pre_tool_use(&self.cancel, name, &call.id, &args)
                .await;
            if let Some(reason) = outcome.blocked {
                return self
                    .finish(
                        agent_name,
                        call,
                        ToolCallResult::err(format!("blocked by hook: {reason}")),
                    )
                    .await;
            }
            if let Some(updated) = outcome.updated_input {
                debug!(tool = name, "hook rewrote tool arguments");
                args = updated;
            }
        }

        self.bus
            .publish(RuntimeEvent::ToolCall {
                agent: agent_name.to_string(),
                call: call.clone(),
            })
            .await;

        let tool_call = crew_tools::ToolCall {
            id: call.id.clone(),
            name: name.to_string(),
            args: args.clone(),
        };
        let mut result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ToolCallResult::err("cancelled"),
            res = def.handler.handle(&self.cancel, &tool_call) => match res {
                Ok(result) => result,
                Err(e) => ToolCallResult::err(format!("tool {name} failed: {e:#}")),
            },
        };

        if let Some(hooks) = &self.hooks {
            if !self.cancel.is_cancelled() {
                let outcome = hooks
                    .post_tool_use(&self.cancel, name, &call.id, &args, &result.output)
                    .await;
                if let Some(context) = outcome.additional_context {
                    result.output = format!("{context}\n{}", result.output);
                }
            }
        }

        self.bus
            .publish(RuntimeEvent::ToolCallResponse {
                agent: agent_name.to_string(),
                call: call.clone(),
                result: result.clone(),
            })
            .await;
        result
    }

    /// Publish the confirmation event and suspend until the user decides,
    /// the run is cancelled (implicit rejection), or the channel is closed.
    async fn await_approval(
        &self,
        agent_name: &str,
        call: &crew_model::ToolCall,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        self.approvals.lock().await.insert(call.id.clone(), tx);
        self.bus
            .publish(RuntimeEvent::ToolCallConfirmation {
                agent: agent_name.to_string(),
                call: call.clone(),
            })
            .await;

        let decision = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ApprovalDecision::Reject,
            decision = rx => decision.unwrap_or(ApprovalDecision::Reject),
        };
        // Drop a registration the resume path did not consume, so a late
        // resume after cancellation stays a no-op.
        self.approvals.lock().await.remove(&call.id);
        decision
    }

    /// Publish the response event for a call that never reached its
    /// handler and hand the synthesized result back.
    async fn finish(
        &self,
        agent_name: &str,
        call: &crew_model::ToolCall,
        result: ToolCallResult,
    ) -> ToolCallResult {
        self.bus
            .publish(RuntimeEvent::ToolCallResponse {
                agent: agent_name.to_string(),
                call: call.clone(),
                result: result.clone(),
            })
            .await;
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
