// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;
pub mod upgrade;

pub use loader::{load, load_str};
pub use schema::{
    AgentConfig, ModelConfig, ModelRef, Provider, TeamConfig, ToolsetConfig, ROOT_AGENT,
};
