// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One-way upgrade from the legacy `version: 0` document shape.
//!
//! v0 agents declared their tools as boolean/object keys
//! (`todo: true`, `think: true`, `memory: {path: …}`); v1 replaced those
//! with the uniform `toolsets:` list.  The upgrade is a JSON clone plus key
//! rewrite; the result is re-parsed strictly.  There is no downgrade path.

use serde_json::{json, Value};
use tracing::debug;

/// Keys a v0 agent may carry in place of `toolsets`.
const LEGACY_KEYS: [&str; 3] = ["todo", "think", "memory"];

/// Return true when the raw document needs the v0→v1 rewrite.
pub fn needs_upgrade(doc: &Value) -> bool {
    doc.get("version").and_then(Value::as_u64) == Some(0)
}

/// Rewrite a v0 document into v1 shape.
///
/// The input is cloned; the original value is never mutated.
pub fn upgrade(doc: &Value) -> anyhow::Result<Value> {
    let mut out = doc.clone();
    let Some(agents) = out.get_mut("agents").and_then(Value::as_object_mut) else {
        out["version"] = json!(1);
        return Ok(out);
    };

    for (name, agent) in agents.iter_mut() {
        let Some(fields) = agent.as_object_mut() else {
            continue;
        };
        let mut toolsets: Vec<Value> = fields
            .get("toolsets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if fields.get("todo").and_then(Value::as_bool) == Some(true) {
            toolsets.push(json!({ "type": "todo" }));
        }
        if fields.get("think").and_then(Value::as_bool) == Some(true) {
            toolsets.push(json!({ "type": "think" }));
        }
        if let Some(memory) = fields.get("memory").cloned() {
            let mut entry = json!({ "type": "memory" });
            if let Some(path) = memory.get("path") {
                entry["path"] = path.clone();
            }
            toolsets.push(entry);
        }

        let had_legacy = LEGACY_KEYS.iter().any(|k| fields.contains_key(*k));
        for key in LEGACY_KEYS {
            fields.remove(key);
        }
        if had_legacy {
            debug!(agent = %name, "rewrote legacy tool keys to toolsets");
        }
        if !toolsets.is_empty() {
            fields.insert("toolsets".into(), Value::Array(toolsets));
        }
    }

    out["version"] = json!(1);
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
