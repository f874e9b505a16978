// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use crew_config::{AgentConfig, ModelConfig, TeamConfig, ToolsetConfig};
use crew_model::{ModelProvider, RequestOptions, ToolSchema};
use crew_tools::{inject_description_parameter, ToolCallResult, ToolDef, ToolSet};
use serde_json::json;
use tracing::warn;

/// Iteration cap applied when neither the agent config nor the builder sets
/// one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Synthesized tool that switches the conversation to a sub-agent.
pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";
/// Synthesized tool that runs a sub-agent to completion on a scoped task.
pub const TRANSFER_TASK: &str = "transfer_task";

/// A named policy: instruction + model + tools + sub-agents.
pub struct Agent {
    name: String,
    description: String,
    instruction: String,
    provider: Arc<dyn ModelProvider>,
    toolsets: Vec<Arc<dyn ToolSet>>,
    sub_agents: Vec<String>,
    max_iterations: u32,
    commands: HashMap<String, String>,
    welcome_message: Option<String>,
    add_date: bool,
    add_environment_info: bool,
    hide_subagent_trace: bool,
    options: RequestOptions,
}

impl Agent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            provider,
            toolsets: Vec::new(),
            sub_agents: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            commands: HashMap::new(),
            welcome_message: None,
            add_date: false,
            add_environment_info: false,
            hide_subagent_trace: true,
            options: RequestOptions::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_toolsets(mut self, toolsets: Vec<Arc<dyn ToolSet>>) -> Self {
        self.toolsets = toolsets;
        self
    }

    pub fn with_sub_agents(mut self, sub_agents: Vec<String>) -> Self {
        self.sub_agents = sub_agents;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_commands(mut self, commands: HashMap<String, String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_welcome_message(mut self, message: impl Into<String>) -> Self {
        self.welcome_message = Some(message.into());
        self
    }

    pub fn with_add_date(mut self, on: bool) -> Self {
        self.add_date = on;
        self
    }

    pub fn with_add_environment_info(mut self, on: bool) -> Self {
        self.add_environment_info = on;
        self
    }

    pub fn with_hide_subagent_trace(mut self, hide: bool) -> Self {
        self.hide_subagent_trace = hide;
        self
    }

    pub fn with_request_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn toolsets(&self) -> &[Arc<dyn ToolSet>] {
        &self.toolsets
    }

    pub fn sub_agents(&self) -> &[String] {
        &self.sub_agents
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Canned prompt for a user-typed `/name` alias.
    pub fn command(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(String::as_str)
    }

    pub fn welcome_message(&self) -> Option<&str> {
        self.welcome_message.as_deref()
    }

    pub fn add_date(&self) -> bool {
        self.add_date
    }

    pub fn add_environment_info(&self) -> bool {
        self.add_environment_info
    }

    pub fn hide_subagent_trace(&self) -> bool {
        self.hide_subagent_trace
    }

    /// Base request options with the session's thinking preference applied.
    pub fn request_options(&self, thinking: bool) -> RequestOptions {
        RequestOptions {
            thinking,
            ..self.options.clone()
        }
    }

    /// Effective tool list: the union of this agent's tool sets (first
    /// declaration wins on a name clash), with the description parameter
    /// injected where requested, plus the synthesized transfer tools when
    /// the agent has sub-agents.
    ///
    /// Discovery errors are returned alongside the tools that did resolve;
    /// a single misbehaving tool set must not take the whole turn down.
    pub async fn tool_defs(&self) -> (Vec<ToolDef>, Vec<anyhow::Error>) {
        let mut defs: Vec<ToolDef> = Vec::new();
        let mut errors = Vec::new();

        for toolset in &self.toolsets {
            match toolset.tools().await {
                Ok(tools) => {
                    for mut tool in tools {
                        if defs.iter().any(|d| d.name == tool.name) {
                            warn!(tool = %tool.name, "duplicate tool name; keeping first");
                            continue;
                        }
                        if tool.add_description_parameter {
                            tool.parameters = inject_description_parameter(&tool.parameters);
                        }
                        defs.push(tool);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        if !self.sub_agents.is_empty() {
            defs.push(transfer_to_agent_tool(&self.sub_agents));
            defs.push(transfer_task_tool(&self.sub_agents));
        }

        (defs, errors)
    }

    /// Schemas for the provider, in the same order as [`tool_defs`][Self::tool_defs].
    pub fn tool_schemas(defs: &[ToolDef]) -> Vec<ToolSchema> {
        defs.iter()
            .map(|d| ToolSchema {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.parameters.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.provider.id())
            .field("sub_agents", &self.sub_agents)
            .finish_non_exhaustive()
    }
}

fn agent_name_schema(sub_agents: &[String]) -> serde_json::Value {
    json!({
        "type": "string",
        "enum": sub_agents,
        "description": "Name of the agent to hand off to"
    })
}

fn transfer_to_agent_tool(sub_agents: &[String]) -> ToolDef {
    ToolDef::from_fn(
        TRANSFER_TO_AGENT,
        "Transfer the conversation to another agent. The target agent continues \
         with the full conversation history and its own instructions and tools.",
        json!({
            "type": "object",
            "properties": { "agent": agent_name_schema(sub_agents) },
            "required": ["agent"]
        }),
        |_| async {
            // Dispatched by the run loop before normal tool execution.
            Ok(ToolCallResult::err("transfer calls are handled by the runtime"))
        },
    )
}

fn transfer_task_tool(sub_agents: &[String]) -> ToolDef {
    ToolDef::from_fn(
        TRANSFER_TASK,
        "Delegate a self-contained task to another agent and get its final \
         answer back as this tool's result. The conversation stays with you.",
        json!({
            "type": "object",
            "properties": {
                "agent": agent_name_schema(sub_agents),
                "task": {
                    "type": "string",
                    "description": "Complete description of the task to perform"
                },
                "expected_output": {
                    "type": "string",
                    "description": "What the result should look like"
                }
            },
            "required": ["agent", "task"]
        }),
        |_| async {
            Ok(ToolCallResult::err("transfer calls are handled by the runtime"))
        },
    )
}

/// An in-memory directed graph of agents with a designated root.
/// Read-only after construction; lookups by name are O(1).
///
/// The team owns every tool set its agents reference and drives their
/// lifecycle: `start` in declaration order, `stop` in reverse.
pub struct Team {
    name: String,
    agents: HashMap<String, Arc<Agent>>,
    root: String,
    /// Unique tool sets in declaration order, for lifecycle management.
    toolsets: Vec<Arc<dyn ToolSet>>,
}

impl Team {
    pub fn new(agents: Vec<Agent>, root: impl Into<String>) -> anyhow::Result<Self> {
        Self::named("team", agents, root)
    }

    pub fn named(
        name: impl Into<String>,
        agents: Vec<Agent>,
        root: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        let mut map = HashMap::with_capacity(agents.len());
        let mut toolsets: Vec<Arc<dyn ToolSet>> = Vec::new();

        for agent in agents {
            for ts in agent.toolsets() {
                if !toolsets.iter().any(|t| Arc::ptr_eq(t, ts)) {
                    toolsets.push(Arc::clone(ts));
                }
            }
            if map
                .insert(agent.name.clone(), Arc::new(agent))
                .is_some()
            {
                anyhow::bail!("duplicate agent name in team");
            }
        }

        if !map.contains_key(&root) {
            anyhow::bail!("root agent {root:?} is not part of the team");
        }
        for agent in map.values() {
            for sub in &agent.sub_agents {
                if !map.contains_key(sub) {
                    anyhow::bail!(
                        "agent {:?} references unknown sub-agent {sub:?}",
                        agent.name
                    );
                }
            }
        }

        Ok(Self {
            name: name.into(),
            agents: map,
            root,
            toolsets,
        })
    }

    /// Build a team from a config document using the given factories for
    /// the interfaces the core consumes.
    pub fn from_config(
        config: &TeamConfig,
        provider_factory: &dyn Fn(&ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>>,
        toolset_factory: &dyn Fn(&ToolsetConfig) -> anyhow::Result<Arc<dyn ToolSet>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let mut agents = Vec::with_capacity(config.agents.len());
        for (name, agent_cfg) in &config.agents {
            let model = config.resolve_model(agent_cfg.model_ref())?;
            let provider = provider_factory(&model)?;
            let mut toolsets = Vec::with_capacity(agent_cfg.toolsets.len());
            for ts_cfg in &agent_cfg.toolsets {
                toolsets.push(toolset_factory(ts_cfg)?);
            }
            agents.push(build_agent(name, agent_cfg, &model, provider, toolsets));
        }

        let name = config
            .metadata
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("team");
        Self::named(name, agents, crew_config::ROOT_AGENT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.get(name)
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn root_agent(&self) -> &Arc<Agent> {
        &self.agents[&self.root]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Every unique tool set owned by this team, in declaration order.
    pub fn toolsets(&self) -> &[Arc<dyn ToolSet>] {
        &self.toolsets
    }

    /// Start every tool set in declaration order.  The first failure stops
    /// the sequence; already-started sets are left running for `stop`.
    pub async fn start(&self) -> anyhow::Result<()> {
        for ts in &self.toolsets {
            ts.start().await?;
        }
        Ok(())
    }

    /// Stop every tool set in reverse declaration order.  Failures are
    /// logged and do not prevent the remaining sets from stopping.
    pub async fn stop(&self) {
        for ts in self.toolsets.iter().rev() {
            if let Err(e) = ts.stop().await {
                warn!("toolset stop failed: {e:#}");
            }
        }
    }
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("name", &self.name)
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("root", &self.root)
            .finish()
    }
}

fn build_agent(
    name: &str,
    cfg: &AgentConfig,
    model: &ModelConfig,
    provider: Arc<dyn ModelProvider>,
    toolsets: Vec<Arc<dyn ToolSet>>,
) -> Agent {
    let options = RequestOptions {
        max_tokens: model.max_tokens,
        temperature: model.temperature,
        top_p: model.top_p,
        frequency_penalty: model.frequency_penalty,
        presence_penalty: model.presence_penalty,
        gateway: model.base_url.clone(),
        parallel_tool_calls: model.parallel_tool_calls,
        ..RequestOptions::default()
    };
    let mut agent = Agent::new(name, provider)
        .with_description(cfg.description.clone())
        .with_instruction(cfg.instruction.clone())
        .with_toolsets(toolsets)
        .with_sub_agents(cfg.sub_agents.clone())
        .with_commands(cfg.commands.clone())
        .with_add_date(cfg.add_date)
        .with_add_environment_info(cfg.add_environment_info)
        .with_hide_subagent_trace(cfg.hide_subagent_trace)
        .with_request_options(options);
    if let Some(max) = cfg.max_iterations {
        agent = agent.with_max_iterations(max);
    }
    if let Some(welcome) = &cfg.welcome_message {
        agent = agent.with_welcome_message(welcome.clone());
    }
    agent
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
