// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt assembly for one agent's turn.

use std::path::Path;

use chrono::Utc;

use crate::team::{Agent, Team, TRANSFER_TASK, TRANSFER_TO_AGENT};

/// Build the system message for `agent`: its instruction, each tool set's
/// extra instructions, the optional date/environment block, and, when the
/// agent has sub-agents, a paragraph naming them and how to hand off.
pub fn system_prompt(agent: &Agent, team: &Team, working_dir: &Path) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !agent.instruction().is_empty() {
        sections.push(agent.instruction().to_string());
    }

    for toolset in agent.toolsets() {
        if let Some(instructions) = toolset.instructions() {
            if !instructions.is_empty() {
                sections.push(instructions);
            }
        }
    }

    if agent.add_date() {
        sections.push(format!("Today's date is {}.", Utc::now().format("%Y-%m-%d")));
    }

    if agent.add_environment_info() {
        sections.push(format!(
            "Environment: os={}, working directory={}",
            std::env::consts::OS,
            working_dir.display()
        ));
    }

    if !agent.sub_agents().is_empty() {
        sections.push(sub_agent_block(agent, team));
    }

    sections.join("\n\n")
}

fn sub_agent_block(agent: &Agent, team: &Team) -> String {
    let mut block = format!(
        "You can delegate to the following agents. Use `{TRANSFER_TO_AGENT}` to hand \
         the conversation over, or `{TRANSFER_TASK}` to run a scoped task and get \
         the result back:\n",
    );
    for name in agent.sub_agents() {
        let description = team
            .get(name)
            .map(|a| a.description().to_string())
            .unwrap_or_default();
        if description.is_empty() {
            block.push_str(&format!("- {name}\n"));
        } else {
            block.push_str(&format!("- {name}: {description}\n"));
        }
    }
    block.truncate(block.trim_end().len());
    block
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use crew_model::ScriptedMockProvider;
    use crew_tools::StaticToolSet;

    use super::*;
    use crate::team::{Agent, Team};

    fn provider() -> Arc<dyn crew_model::ModelProvider> {
        Arc::new(ScriptedMockProvider::always_text("ok"))
    }

    fn wd() -> PathBuf {
        PathBuf::from("/work")
    }

    #[test]
    fn instruction_is_the_first_section() {
        let team = Team::new(
            vec![Agent::new("root", provider()).with_instruction("Be terse.")],
            "root",
        )
        .unwrap();
        let prompt = system_prompt(team.root_agent(), &team, &wd());
        assert!(prompt.starts_with("Be terse."));
    }

    #[test]
    fn toolset_instructions_are_appended() {
        let ts = StaticToolSet::default().with_instructions("Always cite sources.");
        let team = Team::new(
            vec![Agent::new("root", provider())
                .with_instruction("Lead.")
                .with_toolsets(vec![Arc::new(ts)])],
            "root",
        )
        .unwrap();
        let prompt = system_prompt(team.root_agent(), &team, &wd());
        assert!(prompt.contains("Always cite sources."));
    }

    #[test]
    fn date_block_present_only_when_enabled() {
        let team = Team::new(
            vec![
                Agent::new("root", provider()).with_add_date(true),
                Agent::new("bare", provider()),
            ],
            "root",
        )
        .unwrap();
        let with_date = system_prompt(team.root_agent(), &team, &wd());
        assert!(with_date.contains("Today's date is"));
        let without = system_prompt(team.get("bare").unwrap(), &team, &wd());
        assert!(!without.contains("Today's date is"));
    }

    #[test]
    fn environment_block_names_working_dir() {
        let team = Team::new(
            vec![Agent::new("root", provider()).with_add_environment_info(true)],
            "root",
        )
        .unwrap();
        let prompt = system_prompt(team.root_agent(), &team, &wd());
        assert!(prompt.contains("/work"));
    }

    #[test]
    fn sub_agents_are_listed_with_descriptions() {
        let team = Team::new(
            vec![
                Agent::new("root", provider()).with_sub_agents(vec!["writer".into()]),
                Agent::new("writer", provider()).with_description("Writes prose."),
            ],
            "root",
        )
        .unwrap();
        let prompt = system_prompt(team.root_agent(), &team, &wd());
        assert!(prompt.contains("- writer: Writes prose."));
        assert!(prompt.contains("transfer_to_agent"));
    }

    #[test]
    fn agent_without_sub_agents_has_no_delegation_block() {
        let team = Team::new(vec![Agent::new("root", provider())], "root").unwrap();
        let prompt = system_prompt(team.root_agent(), &team, &wd());
        assert!(!prompt.contains("delegate"));
    }
}
