// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre/post-tool and session-start/end shell callouts.
//!
//! Each hook command receives a JSON payload on stdin and talks back through
//! its exit code and stdout:
//!
//! - exit 0 → allow; stdout MAY carry JSON with `decision: "block"`,
//!   `hook_specific_output.updated_input`, or `additional_context`
//! - exit 2 → block, with stderr as the reason
//! - any other non-zero exit → logged and ignored (the call proceeds)

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-command timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_tool_use: Vec<HookMatcher>,
    #[serde(default)]
    pub post_tool_use: Vec<HookMatcher>,
    #[serde(default)]
    pub session_start: Vec<HookCommand>,
    #[serde(default)]
    pub session_end: Vec<HookCommand>,
}

/// One matcher entry: a tool-name pattern plus the commands to run when it
/// matches.  The matcher is a regex or `|`-alternation over tool names;
/// `*` (or an empty string) matches every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default = "default_matcher")]
    pub matcher: String,
    #[serde(default)]
    pub commands: Vec<HookCommand>,
}

fn default_matcher() -> String {
    "*".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    pub command: String,
    /// Timeout in seconds; defaults to 60.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Aggregated result of running the hooks for one event.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// A hook blocked the call; carries the reason shown to the model.
    pub blocked: Option<String>,
    /// Rewritten tool arguments, when a hook supplied them.
    pub updated_input: Option<Value>,
    /// Extra text the runtime prepends to the tool message content.
    pub additional_context: Option<String>,
}

impl HookOutcome {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Executes the configured hooks for one session.
///
/// Commands run in the session's working directory with the environment
/// given at runtime creation; the containing cancellation token kills any
/// in-flight hook process.
pub struct HookRunner {
    config: HooksConfig,
    session_id: String,
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

impl HookRunner {
    pub fn new(
        config: HooksConfig,
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            cwd: cwd.into(),
            env,
        }
    }

    pub async fn pre_tool_use(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        tool_use_id: &str,
        tool_input: &Value,
    ) -> HookOutcome {
        let mut outcome = HookOutcome::default();
        let mut input = tool_input.clone();
        for entry in &self.config.pre_tool_use {
            if !matcher_matches(&entry.matcher, tool_name) {
                continue;
            }
            for hook in &entry.commands {
                let payload = json!({
                    "session_id": self.session_id,
                    "cwd": self.cwd,
                    "hook_event_name": "pre_tool_use",
                    "tool_name": tool_name,
                    "tool_use_id": tool_use_id,
                    "tool_input": input,
                });
                match self.run_command(cancel, hook, &payload).await {
                    Ok(exec) => {
                        if let Some(reason) = exec.block_reason() {
                            outcome.blocked = Some(reason);
                            return outcome;
                        }
                        if let Some(updated) = exec.updated_input() {
                            input = updated.clone();
                            outcome.updated_input = Some(updated);
                        }
                        if let Some(ctx) = exec.additional_context() {
                            append_context(&mut outcome.additional_context, ctx);
                        }
                    }
                    Err(e) => warn!(command = %hook.command, "pre_tool_use hook failed: {e:#}"),
                }
            }
        }
        outcome
    }

    pub async fn post_tool_use(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        tool_use_id: &str,
        tool_input: &Value,
        tool_response: &str,
    ) -> HookOutcome {
        let mut outcome = HookOutcome::default();
        for entry in &self.config.post_tool_use {
            if !matcher_matches(&entry.matcher, tool_name) {
                continue;
            }
            for hook in &entry.commands {
                let payload = json!({
                    "session_id": self.session_id,
                    "cwd": self.cwd,
                    "hook_event_name": "post_tool_use",
                    "tool_name": tool_name,
                    "tool_use_id": tool_use_id,
                    "tool_input": tool_input,
                    "tool_response": tool_response,
                });
                match self.run_command(cancel, hook, &payload).await {
                    Ok(exec) => {
                        if let Some(ctx) = exec.additional_context() {
                            append_context(&mut outcome.additional_context, ctx);
                        }
                    }
                    Err(e) => warn!(command = %hook.command, "post_tool_use hook failed: {e:#}"),
                }
            }
        }
        outcome
    }

    pub async fn session_start(&self, cancel: &CancellationToken) {
        self.run_session_hooks(cancel, "session_start", &self.config.session_start)
            .await;
    }

    pub async fn session_end(&self, cancel: &CancellationToken) {
        self.run_session_hooks(cancel, "session_end", &self.config.session_end)
            .await;
    }

    async fn run_session_hooks(
        &self,
        cancel: &CancellationToken,
        event: &str,
        hooks: &[HookCommand],
    ) {
        for hook in hooks {
            let payload = json!({
                "session_id": self.session_id,
                "cwd": self.cwd,
                "hook_event_name": event,
            });
            if let Err(e) = self.run_command(cancel, hook, &payload).await {
                warn!(command = %hook.command, "{event} hook failed: {e:#}");
            }
        }
    }

    async fn run_command(
        &self,
        cancel: &CancellationToken,
        hook: &HookCommand,
        payload: &Value,
    ) -> anyhow::Result<HookExecution> {
        let timeout = Duration::from_secs(hook.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
        debug!(command = %hook.command, "running hook");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&hook.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.cwd)
            // Dropping the wait future (timeout or cancellation) must not
            // leave the hook process running.
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning hook command {:?}", hook.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(payload)?;
            // A hook that never reads stdin closes the pipe early; that is
            // not an error.
            let _ = stdin.write_all(&bytes).await;
            drop(stdin);
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("hook cancelled"),
            res = tokio::time::timeout(timeout, child.wait_with_output()) => {
                res.map_err(|_| anyhow::anyhow!("hook timed out after {}s", timeout.as_secs()))?
                    .context("waiting for hook")?
            }
        };

        Ok(HookExecution {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn append_context(slot: &mut Option<String>, extra: String) {
    match slot {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(&extra);
        }
        None => *slot = Some(extra),
    }
}

/// `*` or empty matches every tool; anything else is treated as an anchored
/// regex (which covers plain names and `a|b` alternations).  An invalid
/// regex falls back to exact comparison against the alternation parts.
fn matcher_matches(matcher: &str, tool_name: &str) -> bool {
    if matcher.is_empty() || matcher == "*" {
        return true;
    }
    match Regex::new(&format!("^(?:{matcher})$")) {
        Ok(re) => re.is_match(tool_name),
        Err(_) => matcher.split('|').any(|part| part == tool_name),
    }
}

/// Raw result of one hook command, with the stdout JSON parsed lazily.
struct HookExecution {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl HookExecution {
    fn stdout_json(&self) -> Option<Value> {
        serde_json::from_str(self.stdout.trim()).ok()
    }

    /// The reason this execution blocks the tool call, if it does.
    fn block_reason(&self) -> Option<String> {
        match self.exit_code {
            Some(0) => {
                let body = self.stdout_json()?;
                if body.get("decision").and_then(Value::as_str) == Some("block") {
                    let reason = body
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("blocked by hook")
                        .to_string();
                    Some(reason)
                } else {
                    None
                }
            }
            Some(2) => {
                let reason = self.stderr.trim();
                Some(if reason.is_empty() {
                    "blocked by hook".into()
                } else {
                    reason.to_string()
                })
            }
            Some(code) => {
                warn!(code, "hook exited non-zero; allowing tool call");
                None
            }
            None => {
                warn!("hook terminated by signal; allowing tool call");
                None
            }
        }
    }

    fn updated_input(&self) -> Option<Value> {
        self.stdout_json()?
            .get("hook_specific_output")?
            .get("updated_input")
            .cloned()
    }

    fn additional_context(&self) -> Option<String> {
        let body = self.stdout_json()?;
        body.get("additional_context")
            .or_else(|| {
                body.get("hook_specific_output")
                    .and_then(|h| h.get("additional_context"))
            })
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn runner(config: HooksConfig) -> HookRunner {
        HookRunner::new(config, "sess-1", std::env::temp_dir(), vec![])
    }

    fn pre_hook(matcher: &str, command: &str) -> HooksConfig {
        HooksConfig {
            pre_tool_use: vec![HookMatcher {
                matcher: matcher.into(),
                commands: vec![HookCommand {
                    command: command.into(),
                    timeout: None,
                }],
            }],
            ..Default::default()
        }
    }

    // ── Matcher semantics ─────────────────────────────────────────────────────

    #[test]
    fn star_matches_everything() {
        assert!(matcher_matches("*", "shell"));
        assert!(matcher_matches("", "shell"));
    }

    #[test]
    fn alternation_matches_listed_tools_only() {
        assert!(matcher_matches("shell|filesystem", "shell"));
        assert!(matcher_matches("shell|filesystem", "filesystem"));
        assert!(!matcher_matches("shell|filesystem", "memory"));
    }

    #[test]
    fn regex_matcher_is_anchored() {
        assert!(matcher_matches("she.*", "shell"));
        assert!(!matcher_matches("hell", "shell"));
    }

    // ── Exit-code protocol ────────────────────────────────────────────────────

    #[tokio::test]
    async fn exit_zero_allows() {
        let r = runner(pre_hook("*", "true"));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert!(!out.is_blocked());
    }

    #[tokio::test]
    async fn exit_two_blocks_with_stderr_reason() {
        let r = runner(pre_hook("*", "echo 'not allowed' >&2; exit 2"));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert_eq!(out.blocked.as_deref(), Some("not allowed"));
    }

    #[tokio::test]
    async fn other_nonzero_exit_allows() {
        let r = runner(pre_hook("*", "exit 1"));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert!(!out.is_blocked());
    }

    #[tokio::test]
    async fn stdout_block_decision_blocks_with_reason() {
        let r = runner(pre_hook(
            "*",
            r#"echo '{"decision":"block","reason":"policy says no"}'"#,
        ));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert_eq!(out.blocked.as_deref(), Some("policy says no"));
    }

    #[tokio::test]
    async fn stdout_updated_input_rewrites_arguments() {
        let r = runner(pre_hook(
            "*",
            r#"echo '{"hook_specific_output":{"updated_input":{"cmd":"ls -la"}}}'"#,
        ));
        let out = r
            .pre_tool_use(
                &CancellationToken::new(),
                "shell",
                "tc-1",
                &json!({"cmd": "ls"}),
            )
            .await;
        assert_eq!(out.updated_input.unwrap()["cmd"], "ls -la");
    }

    #[tokio::test]
    async fn non_matching_hook_is_skipped() {
        let r = runner(pre_hook("filesystem", "exit 2"));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert!(!out.is_blocked());
    }

    #[tokio::test]
    async fn hook_receives_payload_on_stdin() {
        // The hook reads stdin and blocks iff the payload names the tool.
        let r = runner(pre_hook(
            "*",
            "grep -q '\"tool_name\":\"shell\"' && { echo blocked >&2; exit 2; } || exit 0",
        ));
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert!(out.is_blocked());
    }

    #[tokio::test]
    async fn post_tool_use_collects_additional_context() {
        let config = HooksConfig {
            post_tool_use: vec![HookMatcher {
                matcher: "*".into(),
                commands: vec![HookCommand {
                    command: r#"echo '{"additional_context":"lint passed"}'"#.into(),
                    timeout: None,
                }],
            }],
            ..Default::default()
        };
        let r = runner(config);
        let out = r
            .post_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}), "ok")
            .await;
        assert_eq!(out.additional_context.as_deref(), Some("lint passed"));
    }

    #[tokio::test]
    async fn timed_out_hook_allows() {
        let config = HooksConfig {
            pre_tool_use: vec![HookMatcher {
                matcher: "*".into(),
                commands: vec![HookCommand {
                    command: "sleep 5; exit 2".into(),
                    timeout: Some(1),
                }],
            }],
            ..Default::default()
        };
        let r = runner(config);
        let out = r
            .pre_tool_use(&CancellationToken::new(), "shell", "tc-1", &json!({}))
            .await;
        assert!(!out.is_blocked());
    }

    #[tokio::test]
    async fn cancelled_hook_allows_and_returns_promptly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = runner(pre_hook("*", "sleep 10; exit 2"));
        let start = std::time::Instant::now();
        let out = r.pre_tool_use(&cancel, "shell", "tc-1", &json!({})).await;
        assert!(!out.is_blocked());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
