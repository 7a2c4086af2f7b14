//! Guardrails (C9): pre-execution checks, post-execution checks
//! (hallucinated-success detection), and plan validation including
//! cycle detection (spec §4.9).
//!
//! Pre/post predicate evaluation is new code (the teacher has no
//! equivalent gate system over tool results); grounded in shape on the
//! teacher's `gates/mod.rs` enumerated-decision convention referenced
//! in SPEC_FULL.md §15's closed `PostCheckKind` set, and composed with
//! `dag.rs`'s `PlanGraph` for the plan-validation surface.

use crate::dag::PlanGraph;
use crate::errors::{GuardrailError, PlanError};
use crate::model::{Pattern, PostCheckKind, PreCheckKind, Plan, SafetyTier, Task};
use crate::tools::ToolResult;
use std::collections::HashMap;

pub struct PreCheckContext<'a> {
    pub task: &'a Task,
    pub tool_id: &'a str,
    pub tool_safety_tier: SafetyTier,
    pub required_safety_tier: SafetyTier,
    pub declared_paths: &'a [String],
}

/// Pre-execution guardrail (spec §4.9): pattern exists, tool allowed,
/// paths within allowed globs, required metadata present, safety tier
/// sufficient. Any failure is non-retriable (`ErrGuardrailPre`).
pub fn check_pre_execution(
    ctx: &PreCheckContext,
    pattern: Option<&Pattern>,
) -> Result<(), GuardrailError> {
    let fail = |reason: String| GuardrailError::Pre {
        task_id: ctx.task.task_id.clone(),
        reason,
    };

    let Some(pattern) = pattern else {
        // No pattern declared is legal ("legacy mode" — spec.md §9
        // design note: named, log-only variant, not a silent path).
        return Ok(());
    };

    if !pattern.allowed_tool_ids.iter().any(|t| t == ctx.tool_id) {
        return Err(fail(format!(
            "tool '{}' not in allowed set for pattern '{}'",
            ctx.tool_id, pattern.pattern_id
        )));
    }

    for path in ctx.declared_paths {
        if !path_matches_any_glob(path, &pattern.allowed_path_globs) {
            return Err(fail(format!(
                "path '{path}' does not match any allowed glob for pattern '{}'",
                pattern.pattern_id
            )));
        }
    }

    for key in &pattern.required_metadata_keys {
        if !ctx.task.metadata.contains_key(key) {
            return Err(fail(format!("required metadata key '{key}' missing")));
        }
    }

    if ctx.tool_safety_tier < ctx.required_safety_tier {
        return Err(fail(format!(
            "tool safety tier {:?} below required tier {:?}",
            ctx.tool_safety_tier, ctx.required_safety_tier
        )));
    }

    for check in &pattern.pre_checks {
        match check {
            PreCheckKind::MetadataPresent { key } => {
                if !ctx.task.metadata.contains_key(key) {
                    return Err(fail(format!("pre-check: metadata key '{key}' missing")));
                }
            }
            PreCheckKind::PathInGlobs => {
                for path in ctx.declared_paths {
                    if !path_matches_any_glob(path, &pattern.allowed_path_globs) {
                        return Err(fail(format!("pre-check: path '{path}' outside allowed globs")));
                    }
                }
            }
        }
    }

    Ok(())
}

pub fn path_matches_any_glob(path: &str, globs: &[String]) -> bool {
    globs.iter().any(|g| {
        glob::Pattern::new(g)
            .map(|p| p.matches(path))
            .unwrap_or(false)
    })
}

/// Outcome of post-execution Guardrails: whether the attempt should be
/// relabelled `failed` with `hallucinated_success`, and which checks
/// failed (spec §4.9).
#[derive(Debug, Clone, PartialEq)]
pub struct PostCheckOutcome {
    pub hallucinated_success: bool,
    pub failed_checks: Vec<String>,
}

/// Post-execution guardrail (spec §4.9): runs every pattern post-check
/// against the tool result and declared evidence; if exit_code was 0
/// but any post-check fails, the attempt is relabelled `failed` with
/// reason `hallucinated_success`.
pub fn check_post_execution(
    result: &ToolResult,
    produced_patch_nonempty: bool,
    pattern: Option<&Pattern>,
    produced_paths: &[String],
    tests_passed: Option<bool>,
    evidence_metadata: &HashMap<String, String>,
) -> PostCheckOutcome {
    let Some(pattern) = pattern else {
        return PostCheckOutcome {
            hallucinated_success: false,
            failed_checks: Vec::new(),
        };
    };

    let mut failed_checks = Vec::new();
    for check in &pattern.post_checks {
        let passed = match check {
            PostCheckKind::PatchNonempty => produced_patch_nonempty,
            PostCheckKind::TestsPassed => tests_passed.unwrap_or(false),
            PostCheckKind::ExitCodeEq { code } => result.exit_code == Some(*code),
            PostCheckKind::PathInGlobs => produced_paths
                .iter()
                .all(|p| path_matches_any_glob(p, &pattern.allowed_path_globs)),
            PostCheckKind::MetadataPresent { key } => evidence_metadata.contains_key(key),
        };
        if !passed {
            failed_checks.push(format!("{check:?}"));
        }
    }

    let hallucinated_success = result.exit_code == Some(0) && !failed_checks.is_empty();

    PostCheckOutcome {
        hallucinated_success,
        failed_checks,
    }
}

/// Plan validation (spec §4.9, once at run start): every
/// `task.pattern_id` exists, `depends_on` closes inside the plan, the
/// DAG is acyclic with the exact cycle path reported on failure.
pub fn validate_plan(
    plan: &Plan,
    pattern_exists: impl Fn(&str) -> bool,
) -> Result<PlanGraph, PlanError> {
    for task in &plan.tasks {
        if let Some(pid) = &task.pattern_id
            && !pattern_exists(pid)
        {
            return Err(PlanError::UnknownPattern {
                task_id: task.task_id.clone(),
                pattern_id: pid.clone(),
            });
        }
    }

    let graph = PlanGraph::build(plan)?;

    if let Some(cycle) = graph.detect_cycle() {
        return Err(PlanError::Cycle { path: cycle });
    }

    Ok(graph)
}
