// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper that returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// The designated default agent every team must declare.
pub const ROOT_AGENT: &str = "root";

/// A versioned team document: agents, models, environment, metadata.
///
/// Unknown keys at the document root are a parse error; extra keys inside
/// `provider_opts` are preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Environment variables made available to tool sets and hooks.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Free-form document metadata (author, license, …).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            agents: HashMap::new(),
            models: HashMap::new(),
            env: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

impl TeamConfig {
    /// Resolve a model reference to a concrete model config.
    ///
    /// A reference is either the name of an entry under `models`, an inline
    /// `provider/model` shorthand, or `auto` (first declared model, or an
    /// error when none exist).
    pub fn resolve_model(&self, reference: &str) -> anyhow::Result<ModelConfig> {
        match ModelRef::parse(reference)? {
            ModelRef::Named(name) => self
                .models
                .get(&name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown model: {name}")),
            ModelRef::Inline { provider, model } => Ok(ModelConfig {
                provider,
                model,
                ..ModelConfig::default()
            }),
            ModelRef::Auto => {
                let mut names: Vec<&String> = self.models.keys().collect();
                names.sort();
                names
                    .first()
                    .and_then(|n| self.models.get(*n))
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("model is 'auto' but no models are declared"))
            }
        }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agents.is_empty() {
            anyhow::bail!("document declares no agents");
        }
        if !self.agents.contains_key(ROOT_AGENT) {
            anyhow::bail!("document must declare an agent named {ROOT_AGENT:?}");
        }
        for (name, agent) in &self.agents {
            for sub in &agent.sub_agents {
                if !self.agents.contains_key(sub) {
                    anyhow::bail!("agent {name:?} references unknown sub-agent {sub:?}");
                }
            }
            self.resolve_model(agent.model_ref())
                .map_err(|e| anyhow::anyhow!("agent {name:?}: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model reference: a name under `models`, `provider/model`, or `auto`.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub description: String,
    /// The agent's system instruction.
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub toolsets: Vec<ToolsetConfig>,
    #[serde(default)]
    pub sub_agents: Vec<String>,
    /// Append the current date to the system prompt.
    #[serde(default)]
    pub add_date: bool,
    /// Append working directory / platform info to the system prompt.
    #[serde(default)]
    pub add_environment_info: bool,
    /// User-typed `/name` aliases expanded to canned prompts.
    #[serde(default)]
    pub commands: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
    /// Run-loop iteration cap; the runtime default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Mark a `transfer_task` sub-run's messages implicit so exports omit
    /// them.
    #[serde(default = "default_true")]
    pub hide_subagent_trace: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "auto".into(),
            description: String::new(),
            instruction: String::new(),
            toolsets: Vec::new(),
            sub_agents: Vec::new(),
            add_date: false,
            add_environment_info: false,
            commands: HashMap::new(),
            welcome_message: None,
            max_iterations: None,
            hide_subagent_trace: true,
        }
    }
}

impl AgentConfig {
    /// The model reference, defaulting to `auto` when the field is empty.
    pub fn model_ref(&self) -> &str {
        if self.model.is_empty() {
            "auto"
        } else {
            &self.model
        }
    }
}

/// One tool-set declaration: a `type` discriminator plus whatever options
/// that type understands.  The runtime hands the options to the tool-set
/// factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsetConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Anthropic,
    Google,
    Dmr,
    Mistral,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Dmr => "dmr",
            Provider::Mistral => "mistral",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::Openai),
            "anthropic" => Ok(Provider::Anthropic),
            "google" => Ok(Provider::Google),
            "dmr" => Ok(Provider::Dmr),
            "mistral" => Ok(Provider::Mistral),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Model name forwarded to the provider API
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Base URL override for local proxies and gateways.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    /// Environment variables the provider binding needs (API key names, …).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Free-form provider-specific options forwarded as-is to the binding.
    /// Extra keys in here are preserved, never validated.
    #[serde(default)]
    pub provider_opts: HashMap<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            model: String::new(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            base_url: None,
            parallel_tool_calls: None,
            env: HashMap::new(),
            provider_opts: HashMap::new(),
        }
    }
}

/// A parsed model reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef {
    /// Pick the first declared model.
    Auto,
    /// A named entry under `models`.
    Named(String),
    /// Inline `provider/model` shorthand.
    Inline { provider: Provider, model: String },
}

impl ModelRef {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() || s == "auto" {
            return Ok(ModelRef::Auto);
        }
        if let Some((provider, model)) = s.split_once('/') {
            if model.is_empty() {
                anyhow::bail!("model reference {s:?} has an empty model name");
            }
            return Ok(ModelRef::Inline {
                provider: provider.parse()?,
                model: model.to_string(),
            });
        }
        Ok(ModelRef::Named(s.to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
agents:
  root:
    model: main
    instruction: Be helpful.
models:
  main:
    provider: anthropic
    model: claude-sonnet-4-5
"#
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn minimal_document_parses_and_validates() {
        let cfg: TeamConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.agents["root"].instruction, "Be helpful.");
        assert_eq!(cfg.models["main"].provider, Provider::Anthropic);
    }

    #[test]
    fn unknown_root_key_is_a_parse_error() {
        let yaml = "agents: {}\nmodels: {}\nsurprise: true\n";
        assert!(serde_yaml::from_str::<TeamConfig>(yaml).is_err());
    }

    #[test]
    fn provider_opts_extra_keys_are_preserved() {
        let yaml = r#"
agents:
  root:
    model: main
models:
  main:
    provider: openai
    model: gpt-4o
    provider_opts:
      reasoning_format: deepseek
      parse_tool_calls: false
"#;
        let cfg: TeamConfig = serde_yaml::from_str(yaml).unwrap();
        let opts = &cfg.models["main"].provider_opts;
        assert_eq!(opts["reasoning_format"], "deepseek");
        assert_eq!(opts["parse_tool_calls"], false);
    }

    #[test]
    fn toolset_type_specific_options_are_preserved() {
        let yaml = r#"
agents:
  root:
    model: openai/gpt-4o
    toolsets:
      - type: memory
        path: ./memory.db
      - type: shell
"#;
        let cfg: TeamConfig = serde_yaml::from_str(yaml).unwrap();
        let toolsets = &cfg.agents["root"].toolsets;
        assert_eq!(toolsets[0].kind, "memory");
        assert_eq!(toolsets[0].options["path"], "./memory.db");
        assert_eq!(toolsets[1].kind, "shell");
        assert!(toolsets[1].options.is_empty());
    }

    #[test]
    fn hide_subagent_trace_defaults_to_true() {
        let cfg: TeamConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(cfg.agents["root"].hide_subagent_trace);
    }

    // ── Model references ──────────────────────────────────────────────────────

    #[test]
    fn model_ref_parses_all_forms() {
        assert_eq!(ModelRef::parse("auto").unwrap(), ModelRef::Auto);
        assert_eq!(ModelRef::parse("").unwrap(), ModelRef::Auto);
        assert_eq!(
            ModelRef::parse("main").unwrap(),
            ModelRef::Named("main".into())
        );
        assert_eq!(
            ModelRef::parse("anthropic/claude-sonnet-4-5").unwrap(),
            ModelRef::Inline {
                provider: Provider::Anthropic,
                model: "claude-sonnet-4-5".into()
            }
        );
    }

    #[test]
    fn model_ref_unknown_provider_errors() {
        assert!(ModelRef::parse("frobnicator/x").is_err());
    }

    #[test]
    fn resolve_named_model() {
        let cfg: TeamConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        let m = cfg.resolve_model("main").unwrap();
        assert_eq!(m.model, "claude-sonnet-4-5");
    }

    #[test]
    fn resolve_inline_model() {
        let cfg = TeamConfig::default();
        let m = cfg.resolve_model("openai/gpt-4o").unwrap();
        assert_eq!(m.provider, Provider::Openai);
        assert_eq!(m.model, "gpt-4o");
    }

    #[test]
    fn resolve_auto_without_models_errors() {
        let cfg = TeamConfig::default();
        assert!(cfg.resolve_model("auto").is_err());
    }

    #[test]
    fn resolve_unknown_named_model_errors() {
        let cfg: TeamConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(cfg.resolve_model("missing").is_err());
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn validation_requires_root_agent() {
        let yaml = r#"
agents:
  helper:
    model: openai/gpt-4o
"#;
        let cfg: TeamConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_sub_agent() {
        let yaml = r#"
agents:
  root:
    model: openai/gpt-4o
    sub_agents: [ghost]
"#;
        let cfg: TeamConfig = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ghost"), "unexpected error: {err}");
    }

    #[test]
    fn validation_rejects_unresolvable_model() {
        let yaml = r#"
agents:
  root:
    model: nonexistent
"#;
        let cfg: TeamConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_document_fails_validation() {
        assert!(TeamConfig::default().validate().is_err());
    }
}
