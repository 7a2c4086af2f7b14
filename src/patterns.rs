//! Pattern Registry (C3): loads pattern specs from a configured root at
//! run start, indexes by `pattern_id`, read-only for the lifetime of a
//! Run — a run uses the snapshot taken at its own start; hot reload is
//! explicitly not supported (spec §4.3).
//!
//! Grounded on `patterns/learning.rs`'s `get_patterns_dir`/`get_pattern`/
//! `list_patterns` directory-of-JSON-files convention, generalized from
//! `~/.forge/patterns/<name>.json` to a configurable root holding one
//! file per pattern (JSON or YAML).

use crate::model::{Pattern, PatternId};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A small fixed catalog of anti-pattern identifiers the Anti-Pattern
/// Detector (C13) raises; kept alongside the registry since both are
/// static, read-only-at-runtime sets (spec §4.3, §4.13).
pub const ANTI_PATTERNS: &[&str] = &[
    "AP_PLANNING_LOOP",
    "AP_HALLUCINATED_SUCCESS",
    "AP_OSCILLATION",
    "AP_STUCK",
];

pub struct PatternRegistry {
    patterns: HashMap<PatternId, Pattern>,
}

impl PatternRegistry {
    /// Loads every `*.json`/`*.yaml`/`*.yml` file directly under `root`
    /// into the registry. Missing root is treated as an empty registry
    /// (a plan with no `pattern_id` references is legal).
    pub fn load(root: &Path) -> Result<Self> {
        let mut patterns = HashMap::new();
        if !root.exists() {
            return Ok(Self { patterns });
        }

        for entry in std::fs::read_dir(root)
            .with_context(|| format!("failed to read pattern root {}", root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(ext, "json" | "yaml" | "yml") {
                continue;
            }
            let pattern = load_pattern_file(&path)
                .with_context(|| format!("failed to load pattern spec {}", path.display()))?;
            patterns.insert(pattern.pattern_id.clone(), pattern);
        }

        Ok(Self { patterns })
    }

    pub fn in_memory(patterns: Vec<Pattern>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| (p.pattern_id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, pattern_id: &str) -> Option<&Pattern> {
        self.patterns.get(pattern_id)
    }

    pub fn exists(&self, pattern_id: &str) -> bool {
        self.patterns.contains_key(pattern_id)
    }

    pub fn list_anti_patterns(&self) -> &'static [&'static str] {
        ANTI_PATTERNS
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn load_pattern_file(path: &PathBuf) -> Result<Pattern> {
    let raw = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&raw)?),
        _ => Ok(serde_yaml::from_str(&raw)?),
    }
}
