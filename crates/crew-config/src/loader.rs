// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::{upgrade, TeamConfig};

/// Load and validate a team document from a YAML file.
///
/// Legacy `version: 0` documents are upgraded in memory before the strict
/// parse, so callers only ever see the current shape.
pub fn load(path: &Path) -> anyhow::Result<TeamConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config =
        load_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Parse a team document from YAML text.
pub fn load_str(text: &str) -> anyhow::Result<TeamConfig> {
    // Parse loosely first so the version gate can run before strict
    // field checking rejects legacy keys.
    let raw: serde_json::Value =
        serde_yaml::from_str(text).context("document is not valid YAML")?;

    let raw = if upgrade::needs_upgrade(&raw) {
        debug!("upgrading v0 document");
        upgrade::upgrade(&raw)?
    } else {
        raw
    };

    let config: TeamConfig =
        serde_json::from_value(raw).context("document does not match the schema")?;
    config.validate()?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
