// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Context;
use regex::Regex;
use serde_json::Value;

/// Outcome of a permission check for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run without asking
    Allow,
    /// Never run; synthesize a denial result
    Deny,
    /// Prompt the user before running
    Ask,
}

/// Pattern-based allow/deny checker over `tool[:arg=value[:arg=value…]]`
/// strings.
///
/// The tool part may itself contain colons (`mcp:server:tool`); the parser
/// splits on the first `key=` segment.  Value patterns are case-insensitive
/// globs: `*` is greedy within the value (whitespace and path separators
/// included), `?` matches one character, `[set]` a character set.  A pattern
/// with no argument constraints matches every call of that tool.
///
/// Evaluation order per call: deny patterns first (first match wins), then
/// allow patterns, otherwise Ask.  Deny always beats allow.  An empty
/// checker asks for everything.
#[derive(Debug, Default)]
pub struct PermissionsChecker {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl PermissionsChecker {
    pub fn new(allow: &[String], deny: &[String]) -> anyhow::Result<Self> {
        let compile = |patterns: &[String]| -> anyhow::Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| Pattern::parse(p).with_context(|| format!("invalid pattern {p:?}")))
                .collect()
        };
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    /// Checker with no patterns: every call resolves to [`Decision::Ask`].
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn check(&self, tool: &str) -> Decision {
        self.check_with_args(tool, None)
    }

    pub fn check_with_args(
        &self,
        tool: &str,
        args: Option<&serde_json::Map<String, Value>>,
    ) -> Decision {
        if self.deny.iter().any(|p| p.matches(tool, args)) {
            return Decision::Deny;
        }
        if self.allow.iter().any(|p| p.matches(tool, args)) {
            return Decision::Allow;
        }
        Decision::Ask
    }
}

#[derive(Debug)]
struct Pattern {
    tool: String,
    args: Vec<(String, ValueMatcher)>,
}

impl Pattern {
    fn parse(pattern: &str) -> anyhow::Result<Self> {
        let segments: Vec<&str> = pattern.split(':').collect();
        let first_arg = segments.iter().position(|s| is_arg_segment(s));
        let (tool_segs, arg_segs) = match first_arg {
            Some(0) => anyhow::bail!("pattern has no tool name"),
            Some(i) => segments.split_at(i),
            None => (segments.as_slice(), &[] as &[&str]),
        };
        let tool = tool_segs.join(":");
        if tool.is_empty() {
            anyhow::bail!("pattern has no tool name");
        }
        let mut args = Vec::with_capacity(arg_segs.len());
        for seg in arg_segs {
            let (key, value) = seg
                .split_once('=')
                .context("argument segment missing '='")?;
            args.push((key.to_string(), ValueMatcher::compile(value)?));
        }
        Ok(Self { tool, args })
    }

    fn matches(&self, tool: &str, args: Option<&serde_json::Map<String, Value>>) -> bool {
        if self.tool != tool {
            return false;
        }
        self.args.iter().all(|(key, matcher)| {
            args.and_then(|a| a.get(key))
                .map(|v| matcher.matches(&stringify(v)))
                .unwrap_or(false)
        })
    }
}

/// A segment of the form `key=…` with a non-empty key.
fn is_arg_segment(seg: &str) -> bool {
    seg.split_once('=')
        .map(|(key, _)| !key.is_empty())
        .unwrap_or(false)
}

#[derive(Debug)]
enum ValueMatcher {
    /// `value*` with no other metacharacters: plain prefix comparison.
    Prefix(String),
    Glob(Regex),
}

impl ValueMatcher {
    fn compile(pattern: &str) -> anyhow::Result<Self> {
        if let Some(prefix) = pattern.strip_suffix('*') {
            if !prefix.contains(|c| matches!(c, '*' | '?' | '[')) {
                return Ok(Self::Prefix(prefix.to_lowercase()));
            }
        }
        Ok(Self::Glob(glob_to_regex(pattern)?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Prefix(prefix) => value.to_lowercase().starts_with(prefix),
            Self::Glob(re) => re.is_match(value),
        }
    }
}

/// Convert a glob value pattern to an anchored, case-insensitive [`Regex`].
/// `*` matches anything (newlines included), `?` one character, `[set]` a
/// character set (`[!set]` negates).  An unclosed `[` is taken literally.
fn glob_to_regex(pattern: &str) -> anyhow::Result<Regex> {
    let mut re = String::from("(?is)^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut set = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    set.push(c);
                }
                if closed && !set.is_empty() {
                    re.push('[');
                    if let Some(rest) = set.strip_prefix('!') {
                        re.push('^');
                        re.push_str(rest);
                    } else {
                        re.push_str(&set);
                    }
                    re.push(']');
                } else {
                    re.push_str(&regex::escape("["));
                    re.push_str(&regex::escape(&set));
                }
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).context("glob compiled to invalid regex")
}

/// Render an argument value the way patterns expect to see it: strings
/// as-is, `true`/`false` for booleans, integers without trailing zeros,
/// floats in their shortest round-trip form.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format!("{}", n.as_f64().unwrap_or(0.0))
            }
        }
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn checker(allow: &[&str], deny: &[&str]) -> PermissionsChecker {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        PermissionsChecker::new(&allow, &deny).unwrap()
    }

    fn args(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    // ── Deny takes priority ───────────────────────────────────────────────────

    #[test]
    fn deny_beats_allow_for_overlapping_patterns() {
        let c = checker(&["shell:cmd=*"], &["shell:cmd=rm*"]);
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"cmd": "rm -rf /"})))),
            Decision::Deny
        );
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"cmd": "ls"})))),
            Decision::Allow
        );
    }

    #[test]
    fn bare_tool_pattern_matches_any_args() {
        let c = checker(&["echo"], &[]);
        assert_eq!(c.check("echo"), Decision::Allow);
        assert_eq!(
            c.check_with_args("echo", Some(&args(json!({"text": "hi"})))),
            Decision::Allow
        );
    }

    // ── Ask fallback ──────────────────────────────────────────────────────────

    #[test]
    fn empty_checker_asks_for_everything() {
        let c = PermissionsChecker::empty();
        assert_eq!(c.check("anything"), Decision::Ask);
    }

    #[test]
    fn unmatched_tool_asks() {
        let c = checker(&["shell:cmd=ls*"], &[]);
        assert_eq!(c.check("filesystem"), Decision::Ask);
    }

    #[test]
    fn pattern_with_args_does_not_match_call_without_them() {
        let c = checker(&["shell:cmd=ls*"], &[]);
        // No args at all → the constraint cannot be satisfied
        assert_eq!(c.check("shell"), Decision::Ask);
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"other": "x"})))),
            Decision::Ask
        );
    }

    #[test]
    fn check_without_args_equals_check_with_none() {
        let c = checker(&["echo", "shell:cmd=ls*"], &["danger"]);
        for tool in ["echo", "shell", "danger", "unknown"] {
            assert_eq!(c.check(tool), c.check_with_args(tool, None));
        }
    }

    // ── Glob semantics ────────────────────────────────────────────────────────

    #[test]
    fn value_globs_are_case_insensitive() {
        let c = checker(&[], &["shell:cmd=RM*"]);
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"cmd": "rm -rf /tmp"})))),
            Decision::Deny
        );
    }

    #[test]
    fn star_crosses_whitespace_and_separators() {
        let c = checker(&["shell:cmd=git * --force"], &[]);
        assert_eq!(
            c.check_with_args(
                "shell",
                Some(&args(json!({"cmd": "git push origin/main --force"})))
            ),
            Decision::Allow
        );
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        let c = checker(&["shell:cmd=ls -?"], &[]);
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"cmd": "ls -l"})))),
            Decision::Allow
        );
        assert_eq!(
            c.check_with_args("shell", Some(&args(json!({"cmd": "ls -la"})))),
            Decision::Ask
        );
    }

    #[test]
    fn character_set_matches_members_only() {
        let c = checker(&["fs:mode=[rw]"], &[]);
        assert_eq!(
            c.check_with_args("fs", Some(&args(json!({"mode": "r"})))),
            Decision::Allow
        );
        assert_eq!(
            c.check_with_args("fs", Some(&args(json!({"mode": "x"})))),
            Decision::Ask
        );
    }

    #[test]
    fn trailing_star_is_prefix_match() {
        let c = checker(&["fetch:url=https://internal.*"], &[]);
        assert_eq!(
            c.check_with_args(
                "fetch",
                Some(&args(json!({"url": "https://internal.example.com/x"})))
            ),
            Decision::Allow
        );
    }

    // ── Tool names with colons ────────────────────────────────────────────────

    #[test]
    fn mcp_style_tool_name_parses() {
        let c = checker(&["mcp:github:search_issues:query=*"], &[]);
        assert_eq!(
            c.check_with_args(
                "mcp:github:search_issues",
                Some(&args(json!({"query": "is:open"})))
            ),
            Decision::Allow
        );
    }

    #[test]
    fn mcp_style_bare_tool_name_parses() {
        let c = checker(&["mcp:github:search_issues"], &[]);
        assert_eq!(c.check("mcp:github:search_issues"), Decision::Allow);
    }

    // ── Argument stringification ──────────────────────────────────────────────

    #[test]
    fn bool_and_integer_args_stringify() {
        let c = checker(&["fs:recursive=true:depth=3"], &[]);
        assert_eq!(
            c.check_with_args(
                "fs",
                Some(&args(json!({"recursive": true, "depth": 3})))
            ),
            Decision::Allow
        );
    }

    #[test]
    fn float_args_stringify_without_trailing_zeros() {
        assert_eq!(stringify(&json!(1.5)), "1.5");
        assert_eq!(stringify(&json!(3)), "3");
        assert_eq!(stringify(&json!(true)), "true");
    }

    #[test]
    fn multiple_arg_constraints_must_all_match() {
        let c = checker(&["shell:cmd=ls*:cwd=/tmp*"], &[]);
        assert_eq!(
            c.check_with_args(
                "shell",
                Some(&args(json!({"cmd": "ls -l", "cwd": "/tmp/work"})))
            ),
            Decision::Allow
        );
        assert_eq!(
            c.check_with_args(
                "shell",
                Some(&args(json!({"cmd": "ls -l", "cwd": "/home"})))
            ),
            Decision::Ask
        );
    }

    // ── Parse errors ──────────────────────────────────────────────────────────

    #[test]
    fn pattern_without_tool_name_is_rejected() {
        assert!(PermissionsChecker::new(&["cmd=ls".into()], &[]).is_err());
    }
}
