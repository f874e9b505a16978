// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_recursion::async_recursion;
use crew_model::{
    Backoff, CompletionRequest, FinishReason, Message, ProviderError, ResponseEvent,
    ResponseStream, Role, ToolCall, ToolCallDelta,
};
use crew_session::{Session, SessionMessage};
use crew_tools::{
    ElicitationAction, ElicitationResponse, HookRunner, HooksConfig, PermissionsChecker,
    ToolCallResult, ToolSetError,
};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::events::RuntimeEvent;
use crate::invoker::{ApprovalDecision, ApprovalRegistry, ToolInvoker};
use crate::prompts::system_prompt;
use crate::team::{Agent, Team, TRANSFER_TASK, TRANSFER_TO_AGENT};

/// Failures the run loop surfaces to its caller.  Every variant has already
/// been published as an `Error` event by the time it is returned.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("max iterations reached")]
    MaxIterations,
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Provider(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

/// Scope marker for a `transfer_task` sub-run: which call created it and
/// whether its messages are hidden from transcripts.
struct TaskScope {
    call_id: String,
    implicit: bool,
}

/// The streaming run loop: drives one session's conversation through model
/// calls, tool calls, approval gates, and agent transfers until a terminal
/// condition.
///
/// The runtime borrows the session for the duration of a run; the
/// application owns it and must not start two runs for the same session
/// concurrently.
pub struct Runtime {
    pub(crate) team: Arc<Team>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) permissions: Arc<PermissionsChecker>,
    pub(crate) start_agent: String,
    hooks_config: Option<HooksConfig>,
    hook_env: Vec<(String, String)>,
    /// Cancel handle for the current run; replaced at each run start.
    cancel: std::sync::Mutex<CancellationToken>,
    approvals: ApprovalRegistry,
    elicitation: Arc<Mutex<Option<oneshot::Sender<ElicitationResponse>>>>,
    handlers_installed: AtomicBool,
}

impl Runtime {
    pub fn new(team: Arc<Team>) -> Self {
        let start_agent = team.root_name().to_string();
        Self {
            team,
            bus: Arc::new(EventBus::new()),
            permissions: Arc::new(PermissionsChecker::empty()),
            start_agent,
            hooks_config: None,
            hook_env: Vec::new(),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            approvals: Arc::new(Mutex::new(HashMap::new())),
            elicitation: Arc::new(Mutex::new(None)),
            handlers_installed: AtomicBool::new(false),
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionsChecker) -> Self {
        self.permissions = Arc::new(permissions);
        self
    }

    pub fn with_hooks(mut self, config: HooksConfig, env: Vec<(String, String)>) -> Self {
        self.hooks_config = Some(config);
        self.hook_env = env;
        self
    }

    pub fn with_start_agent(mut self, name: impl Into<String>) -> Self {
        self.start_agent = name.into();
        self
    }

    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }

    /// The event bus; applications publish `Shell` output through it and
    /// auxiliary components (title generation) publish their events here.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<RuntimeEvent> {
        self.bus.subscribe().await
    }

    /// Cancel the current run.  The provider stream, any in-flight tool
    /// handler, and any pending approval wait observe this promptly.
    pub fn stop(&self) {
        self.cancel.lock().expect("cancel lock poisoned").cancel();
    }

    /// Unblock the approval wait for `call_id`.  A second resume for the
    /// same call, or a resume after cancellation already unblocked the
    /// wait, is a silent no-op.
    pub async fn resume(&self, call_id: &str, decision: ApprovalDecision) {
        if let Some(tx) = self.approvals.lock().await.remove(call_id) {
            let _ = tx.send(decision);
        }
    }

    /// Unblock a tool handler waiting on an elicitation.
    pub async fn resume_elicitation(
        &self,
        action: ElicitationAction,
        content: Option<serde_json::Value>,
    ) {
        if let Some(tx) = self.elicitation.lock().await.take() {
            let _ = tx.send(ElicitationResponse { action, content });
        }
    }

    /// Run to completion in blocking mode and return the full message log.
    pub async fn run(&self, session: Arc<RwLock<Session>>) -> anyhow::Result<Vec<SessionMessage>> {
        self.run_inner(Arc::clone(&session)).await?;
        Ok(session.read().await.messages().to_vec())
    }

    /// Run in streaming mode: events arrive on the returned channel, which
    /// closes after the terminal event.  Fatal outcomes surface as `Error`
    /// events followed by a clean end-of-stream.
    pub async fn run_stream(
        self: Arc<Self>,
        session: Arc<RwLock<Session>>,
    ) -> mpsc::Receiver<RuntimeEvent> {
        let rx = self.bus.subscribe().await;
        let runtime = self;
        tokio::spawn(async move {
            if let Err(e) = runtime.run_inner(session).await {
                debug!("run ended with error: {e}");
            }
            runtime.bus.close().await;
        });
        rx
    }

    /// Fire the configured `session_end` hooks.
    pub async fn end_session(&self, session: &Arc<RwLock<Session>>) {
        if let Some(hooks) = self.hook_runner(session).await {
            hooks.session_end(&CancellationToken::new()).await;
        }
    }

    async fn run_inner(&self, session: Arc<RwLock<Session>>) -> Result<(), RuntimeError> {
        self.install_handlers();
        let cancel = self.new_run_token();
        let hooks = self.hook_runner(&session).await;

        let invoker = ToolInvoker {
            bus: Arc::clone(&self.bus),
            permissions: Arc::clone(&self.permissions),
            approvals: Arc::clone(&self.approvals),
            hooks: hooks.clone(),
            session: Arc::clone(&session),
            cancel: cancel.clone(),
        };

        let (user_text, fresh_session) = {
            let s = session.read().await;
            let fresh = !s
                .messages()
                .iter()
                .any(|m| m.message.role == Role::Assistant);
            (s.last_user_text().map(str::to_string), fresh)
        };
        if let Some(text) = user_text {
            self.bus.publish(RuntimeEvent::UserMessage { text }).await;
        }
        if fresh_session {
            if let Some(hooks) = &hooks {
                hooks.session_start(&cancel).await;
            }
        }

        self.drive_agent(&session, &invoker, &cancel, self.start_agent.clone(), None)
            .await
            .map(|_| ())
    }

    pub(crate) fn new_run_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = token.clone();
        token
    }

    async fn hook_runner(&self, session: &Arc<RwLock<Session>>) -> Option<Arc<HookRunner>> {
        let config = self.hooks_config.clone()?;
        let s = session.read().await;
        Some(Arc::new(HookRunner::new(
            config,
            s.id.clone(),
            s.working_dir.clone(),
            self.hook_env.clone(),
        )))
    }

    /// Register the elicitation callback on every tool set, once.
    fn install_handlers(&self) {
        if self.handlers_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        for toolset in self.team.toolsets() {
            let bus = Arc::clone(&self.bus);
            let slot = Arc::clone(&self.elicitation);
            toolset.set_elicitation_handler(Arc::new(move |request| {
                let bus = Arc::clone(&bus);
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    let (tx, rx) = oneshot::channel();
                    *slot.lock().await = Some(tx);
                    bus.publish(RuntimeEvent::Elicitation { request }).await;
                    rx.await
                        .map_err(|_| anyhow::anyhow!("elicitation abandoned"))
                })
            }));
            toolset.set_managed_oauth(true);
        }
    }

    /// Drive one agent (and any agents it transfers to) until a turn ends
    /// without tool calls.  Returns the final assistant text, which
    /// `transfer_task` surfaces as its tool output.
    #[async_recursion]
    async fn drive_agent(
        &self,
        session: &Arc<RwLock<Session>>,
        invoker: &ToolInvoker,
        cancel: &CancellationToken,
        start_agent: String,
        task_scope: Option<TaskScope>,
    ) -> Result<String, RuntimeError> {
        let mut agent = self
            .team
            .get(&start_agent)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownAgent(start_agent.clone()))?;
        let mut final_text = String::new();
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > agent.max_iterations() {
                self.publish_error("max iterations reached").await;
                return Err(RuntimeError::MaxIterations);
            }
            if cancel.is_cancelled() {
                self.publish_error("cancelled").await;
                return Err(RuntimeError::Cancelled);
            }

            // Discover tools fresh each turn; sets may change over time
            // (e.g. an MCP server adds tools after OAuth).
            let (defs, errors) = agent.tool_defs().await;
            for e in &errors {
                let toolset_err = e.chain().find_map(|c| c.downcast_ref::<ToolSetError>());
                if let Some(ToolSetError::OAuthRequired(url)) = toolset_err {
                    self.bus
                        .publish(RuntimeEvent::OAuth { url: url.clone() })
                        .await;
                } else {
                    self.publish_error(format!("tool discovery failed: {e:#}"))
                        .await;
                }
            }

            let (messages, thinking) = {
                let s = session.read().await;
                let mut msgs =
                    vec![Message::system(system_prompt(&agent, &self.team, &s.working_dir))];
                let thread = match &task_scope {
                    Some(scope) => s.task_thread(agent.name(), &scope.call_id),
                    None => s.thread(agent.name()),
                };
                msgs.extend(thread.into_iter().cloned());
                (msgs, s.thinking)
            };

            self.bus
                .publish(RuntimeEvent::StreamStarted {
                    agent: agent.name().to_string(),
                })
                .await;

            let request = CompletionRequest {
                messages,
                tools: Agent::tool_schemas(&defs),
                options: agent.request_options(thinking),
            };
            let mut stream = self.open_stream(&agent, request, cancel).await?;

            // Accumulate the turn: text, reasoning, tool-call fragments
            // keyed by the provider's parallel-call index.
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
            let mut finish: Option<FinishReason> = None;

            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Nothing from this turn was appended yet; the
                        // half-streamed completion is discarded.
                        self.publish_error("cancelled").await;
                        return Err(RuntimeError::Cancelled);
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };
                match item {
                    Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                        text.push_str(&delta);
                        self.bus
                            .publish(RuntimeEvent::AgentChoice {
                                agent: agent.name().to_string(),
                                delta,
                            })
                            .await;
                    }
                    Ok(ResponseEvent::ReasoningDelta(delta)) if !delta.is_empty() => {
                        reasoning.push_str(&delta);
                        self.bus
                            .publish(RuntimeEvent::AgentChoiceReasoning {
                                agent: agent.name().to_string(),
                                delta,
                            })
                            .await;
                    }
                    Ok(ResponseEvent::ToolCallDelta(delta)) => {
                        let entry = pending.entry(delta.index).or_default();
                        entry.merge(delta);
                        // The snapshot's arguments are a growing JSON
                        // prefix; subscribers must not parse them yet.
                        self.bus
                            .publish(RuntimeEvent::PartialToolCall {
                                agent: agent.name().to_string(),
                                call: entry.snapshot(),
                            })
                            .await;
                    }
                    Ok(ResponseEvent::Usage {
                        input_tokens,
                        output_tokens,
                        reasoning_tokens,
                        cost,
                    }) => {
                        let totals = {
                            let mut s = session.write().await;
                            s.add_usage(input_tokens, output_tokens, reasoning_tokens, cost);
                            (s.input_tokens, s.output_tokens, s.reasoning_tokens, s.cost)
                        };
                        self.bus
                            .publish(RuntimeEvent::TokenUsage {
                                input_tokens: totals.0,
                                output_tokens: totals.1,
                                reasoning_tokens: totals.2,
                                cost: totals.3,
                            })
                            .await;
                    }
                    Ok(ResponseEvent::Finish(reason)) => finish = Some(reason),
                    Ok(_) => {}
                    Err(e) => {
                        // A half-consumed stream cannot be resumed; abort
                        // the turn.
                        warn!("model stream error: {e:#}");
                        let message = format!("model stream failed: {e:#}");
                        self.publish_error(message.clone()).await;
                        self.bus
                            .publish(RuntimeEvent::StreamStopped {
                                agent: agent.name().to_string(),
                                reason: FinishReason::Error,
                            })
                            .await;
                        return Err(RuntimeError::Provider(message));
                    }
                }
            }

            let calls: Vec<ToolCall> = pending
                .into_values()
                .enumerate()
                .filter_map(|(position, p)| p.finish(position))
                .collect();
            let finish = finish.unwrap_or(if calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            });

            {
                let mut s = session.write().await;
                let msg = Message::assistant_with_calls(
                    text.clone(),
                    Some(reasoning).filter(|r| !r.is_empty()),
                    calls.clone(),
                );
                let mut record = SessionMessage::new(agent.name(), msg);
                if let Some(scope) = &task_scope {
                    record.implicit = scope.implicit;
                }
                s.push(record);
            }
            if !text.is_empty() {
                final_text = text;
            }

            self.bus
                .publish(RuntimeEvent::StreamStopped {
                    agent: agent.name().to_string(),
                    reason: finish,
                })
                .await;

            if calls.is_empty() && finish != FinishReason::ToolCalls {
                return Ok(final_text);
            }

            // Execute the calls strictly sequentially, in the order the
            // model emitted them.
            let mut transfer_to: Option<String> = None;
            for call in &calls {
                if cancel.is_cancelled() {
                    self.publish_error("cancelled").await;
                    return Err(RuntimeError::Cancelled);
                }

                let result = match call.function.name.as_str() {
                    TRANSFER_TO_AGENT => {
                        self.handle_transfer(&agent, call, &mut transfer_to).await
                    }
                    TRANSFER_TASK => {
                        self.handle_transfer_task(&agent, call, session, invoker, cancel)
                            .await?
                    }
                    _ => invoker.invoke(agent.name(), &defs, call).await,
                };

                if cancel.is_cancelled() {
                    self.publish_error("cancelled").await;
                    return Err(RuntimeError::Cancelled);
                }

                let mut record = SessionMessage::new(
                    agent.name(),
                    Message::tool_result(&call.id, &result.output),
                );
                record.implicit = task_scope.as_ref().map(|s| s.implicit).unwrap_or(false)
                    || (call.function.name == TRANSFER_TO_AGENT && !result.is_error);
                session.write().await.push(record);
            }

            if let Some(to) = transfer_to {
                // Validated in handle_transfer; the next iteration builds
                // the prompt from the new agent's perspective.
                agent = self
                    .team
                    .get(&to)
                    .cloned()
                    .ok_or_else(|| RuntimeError::UnknownAgent(to))?;
            }
        }
    }

    /// `transfer_to_agent`: validate the target and flag the switch; the
    /// caller flips the current-agent pointer after this turn's calls.
    async fn handle_transfer(
        &self,
        agent: &Agent,
        call: &ToolCall,
        transfer_to: &mut Option<String>,
    ) -> ToolCallResult {
        self.bus
            .publish(RuntimeEvent::ToolCall {
                agent: agent.name().to_string(),
                call: call.clone(),
            })
            .await;

        let target = call
            .parsed_arguments()
            .ok()
            .and_then(|args| args["agent"].as_str().map(str::to_string));
        let result = match target {
            Some(target) if agent.sub_agents().contains(&target) => {
                *transfer_to = Some(target.clone());
                self.bus
                    .publish(RuntimeEvent::AgentTransfer {
                        from: agent.name().to_string(),
                        to: target.clone(),
                        task: None,
                    })
                    .await;
                ToolCallResult::ok(format!("transferred to agent {target}"))
            }
            Some(target) => ToolCallResult::err(format!("unknown sub-agent: {target}")),
            None => ToolCallResult::err("transfer_to_agent requires an 'agent' argument"),
        };

        self.bus
            .publish(RuntimeEvent::ToolCallResponse {
                agent: agent.name().to_string(),
                call: call.clone(),
                result: result.clone(),
            })
            .await;
        result
    }

    /// `transfer_task`: run the target agent to completion in a nested
    /// sub-loop scoped to this call id, and return its final text as the
    /// tool output.
    async fn handle_transfer_task(
        &self,
        agent: &Agent,
        call: &ToolCall,
        session: &Arc<RwLock<Session>>,
        invoker: &ToolInvoker,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, RuntimeError> {
        self.bus
            .publish(RuntimeEvent::ToolCall {
                agent: agent.name().to_string(),
                call: call.clone(),
            })
            .await;

        let args = call.parsed_arguments().unwrap_or(serde_json::Value::Null);
        let target = args["agent"].as_str().unwrap_or_default().to_string();
        let task = args["task"].as_str().unwrap_or_default().to_string();

        let result = if target.is_empty() || task.is_empty() {
            ToolCallResult::err("transfer_task requires 'agent' and 'task' arguments")
        } else if !agent.sub_agents().contains(&target) {
            ToolCallResult::err(format!("unknown sub-agent: {target}"))
        } else {
            self.bus
                .publish(RuntimeEvent::AgentTransfer {
                    from: agent.name().to_string(),
                    to: target.clone(),
                    task: Some(task.clone()),
                })
                .await;

            let hide = agent.hide_subagent_trace();
            {
                let mut s = session.write().await;
                let prompt = match args["expected_output"].as_str() {
                    Some(expected) => format!("{task}\n\nExpected output: {expected}"),
                    None => task.clone(),
                };
                let mut msg = Message::user(prompt);
                msg.tool_call_id = Some(call.id.clone());
                let mut record = SessionMessage::new(&target, msg);
                record.implicit = hide;
                s.push(record);
            }

            let scope = TaskScope {
                call_id: call.id.clone(),
                implicit: hide,
            };
            match self
                .drive_agent(session, invoker, cancel, target, Some(scope))
                .await
            {
                Ok(text) if text.is_empty() => {
                    ToolCallResult::ok("(sub-agent produced no text output)")
                }
                Ok(text) => ToolCallResult::ok(text),
                Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(e) => ToolCallResult::err(format!("sub-agent failed: {e}")),
            }
        };

        self.bus
            .publish(RuntimeEvent::ToolCallResponse {
                agent: agent.name().to_string(),
                call: call.clone(),
                result: result.clone(),
            })
            .await;
        Ok(result)
    }

    /// Open the provider stream, retrying transient failures with
    /// exponential backoff (rate limits honour the server-suggested delay).
    /// Fatal errors surface as an `Error` event and a balancing
    /// `StreamStopped`.
    async fn open_stream(
        &self,
        agent: &Agent,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseStream, RuntimeError> {
        let backoff = Backoff::default();
        let mut attempt = 0u32;
        loop {
            match agent
                .provider()
                .create_chat_completion_stream(request.clone())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let provider_err = ProviderError::find_in(&e);
                    if matches!(provider_err, Some(pe) if pe.is_retryable()) {
                        attempt += 1;
                        if let Some(base_delay) = backoff.delay(attempt) {
                            let delay = match provider_err {
                                Some(ProviderError::RateLimited {
                                    retry_after: Some(suggested),
                                }) => *suggested,
                                _ => base_delay,
                            };
                            warn!(attempt, ?delay, "transient provider error, retrying: {e:#}");
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => {
                                    self.publish_error("cancelled").await;
                                    return Err(RuntimeError::Cancelled);
                                }
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                    }
                    let message = format!("model stream failed: {e:#}");
                    self.publish_error(message.clone()).await;
                    self.bus
                        .publish(RuntimeEvent::StreamStopped {
                            agent: agent.name().to_string(),
                            reason: FinishReason::Error,
                        })
                        .await;
                    return Err(RuntimeError::Provider(message));
                }
            }
        }
    }

    async fn publish_error(&self, message: impl Into<String>) {
        self.bus
            .publish(RuntimeEvent::Error {
                message: message.into(),
            })
            .await;
    }
}

/// A tool call under assembly from streamed fragments.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn merge(&mut self, delta: ToolCallDelta) {
        if !delta.id.is_empty() {
            self.id = delta.id;
        }
        if !delta.name.is_empty() {
            self.name = delta.name;
        }
        self.arguments.push_str(&delta.arguments);
    }

    fn snapshot(&self) -> ToolCall {
        ToolCall::new(&self.id, &self.name, &self.arguments)
    }

    /// Resolve the accumulated fragments into a dispatchable call.
    ///
    /// A call with no name cannot be dispatched and is dropped: storing it
    /// would corrupt the history sent back to the provider on the next
    /// turn.  An empty id gets a runtime-generated fallback so the turn can
    /// still complete.
    fn finish(self, position: usize) -> Option<ToolCall> {
        if self.name.is_empty() {
            warn!(call_id = %self.id, "dropping tool call with empty name from model");
            return None;
        }
        let id = if self.id.is_empty() {
            warn!(tool = %self.name, "tool call had no id; generating one");
            format!("call_{position}")
        } else {
            self.id
        };
        let arguments = if self.arguments.is_empty() {
            "{}".to_string()
        } else {
            self.arguments
        };
        Some(ToolCall::new(id, self.name, arguments))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_call_merges_fragments_in_order() {
        let mut p = PendingToolCall::default();
        p.merge(ToolCallDelta {
            index: 0,
            id: "c1".into(),
            name: "echo".into(),
            arguments: r#"{"te"#.into(),
        });
        p.merge(ToolCallDelta {
            index: 0,
            id: String::new(),
            name: String::new(),
            arguments: r#"xt":"hi"}"#.into(),
        });
        let call = p.finish(0).unwrap();
        assert_eq!(call.id, "c1");
        assert_eq!(call.function.arguments, r#"{"text":"hi"}"#);
    }

    #[test]
    fn pending_call_without_name_is_dropped() {
        let mut p = PendingToolCall::default();
        p.merge(ToolCallDelta {
            index: 0,
            id: "c1".into(),
            name: String::new(),
            arguments: "{}".into(),
        });
        assert!(p.finish(0).is_none());
    }

    #[test]
    fn pending_call_without_id_gets_synthetic_one() {
        let mut p = PendingToolCall::default();
        p.merge(ToolCallDelta {
            index: 2,
            id: String::new(),
            name: "echo".into(),
            arguments: String::new(),
        });
        let call = p.finish(2).unwrap();
        assert_eq!(call.id, "call_2");
        assert_eq!(call.function.arguments, "{}");
    }
}
