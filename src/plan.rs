//! Plan document loading (spec §6): a structured document describing
//! schema version, plan id, globals, and an ordered list of tasks.
//! Accepts YAML or JSON, tried in order; unknown top-level fields are
//! rejected (strict mode), matching `phase.rs`'s `PhasesFile::load`
//! JSON round-trip idiom generalized to two encodings.

use crate::model::Plan;
use anyhow::{Context, Result};
use std::path::Path;

/// Deny-unknown-fields mirror of `Plan`, used only to enforce strict
/// top-level parsing before handing back the real `Plan`.
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictPlan {
    #[allow(dead_code)]
    schema_version: u32,
    #[allow(dead_code)]
    plan_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    globals: crate::model::PlanGlobals,
    #[allow(dead_code)]
    tasks: Vec<crate::model::Task>,
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan document at {}", path.display()))?;
    parse_plan(&raw, path.extension().and_then(|e| e.to_str()))
}

fn parse_plan(raw: &str, extension_hint: Option<&str>) -> Result<Plan> {
    let try_yaml_first = matches!(extension_hint, Some("yaml") | Some("yml"));

    let attempts: [fn(&str) -> Result<Plan>; 2] = if try_yaml_first {
        [parse_as_yaml, parse_as_json]
    } else {
        [parse_as_json, parse_as_yaml]
    };

    let mut last_err = None;
    for attempt in attempts {
        match attempt(raw) {
            Ok(plan) => return Ok(plan),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("empty plan document")))
        .context("plan document is neither valid strict JSON nor valid strict YAML")
}

fn parse_as_json(raw: &str) -> Result<Plan> {
    let strict: StrictPlan = serde_json::from_str(raw)?;
    let _ = strict;
    Ok(serde_json::from_str(raw)?)
}

fn parse_as_yaml(raw: &str) -> Result<Plan> {
    let strict: StrictPlan = serde_yaml::from_str(raw)?;
    let _ = strict;
    Ok(serde_yaml::from_str(raw)?)
}
