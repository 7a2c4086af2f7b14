//! Error taxonomy at the core boundary (spec §7).
//!
//! One enum per subsystem rather than a single flat enum, following the
//! teacher's `OrchestratorError` / `PhaseError` / `FactoryError` split —
//! each boundary gets its own typed cases plus an `Other(anyhow::Error)`
//! catch-all for plumbing that doesn't warrant a dedicated variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("task '{task_id}' references unknown pattern '{pattern_id}'")]
    UnknownPattern { task_id: String, pattern_id: String },

    #[error("task '{task_id}' depends on unknown task '{dep_id}'")]
    DanglingDependency { task_id: String, dep_id: String },

    #[error("task '{task_id}' depends on itself")]
    SelfDependency { task_id: String },

    #[error("cycle detected in task dependencies: {}", .path.join(" \u{2192} "))]
    Cycle { path: Vec<String> },

    #[error("duplicate task id '{task_id}'")]
    DuplicateTask { task_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route found for task '{task_id}' (kind '{task_kind}')")]
    NoRoute { task_id: String, task_kind: String },
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("pre-execution guardrail failed for task '{task_id}': {reason}")]
    Pre { task_id: String, reason: String },

    #[error("post-execution guardrail failed for attempt '{attempt_id}': {reason}")]
    Post { attempt_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn tool '{tool_id}': {source}")]
    Spawn {
        tool_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool '{tool_id}' timed out after {timeout_secs}s")]
    Timeout { tool_id: String, timeout_secs: u64 },

    #[error("tool '{tool_id}' exited with code {code}")]
    NonZero { tool_id: String, code: i32 },

    #[error(
        "command template for tool '{tool_id}' references undefined placeholder '{placeholder}'"
    )]
    UndefinedPlaceholder { tool_id: String, placeholder: String },
}

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("circuit open for tool '{tool_id}'")]
    CircuitOpen { tool_id: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid patch for ledger entry '{patch_id}': {reason}")]
    Invalid { patch_id: String, reason: String },

    #[error("patch '{patch_id}' failed to apply cleanly: {reason}")]
    ApplyConflict { patch_id: String, reason: String },

    #[error("illegal ledger transition for patch '{patch_id}': {from} -> {to}")]
    IllegalTransition {
        patch_id: String,
        from: String,
        to: String,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler deadlocked: {remaining} task(s) remain with none running or ready")]
    Deadlock { remaining: usize },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("branch '{branch}' is already checked out")]
    Busy { branch: String },

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AntiPatternError {
    #[error("critical anti-pattern detected: {kind}")]
    Critical { kind: String },
}

/// Aggregate error for functions (notably the Executor's attempt loop)
/// that can fail across more than one subsystem boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Guardrail(#[from] GuardrailError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    AntiPattern(#[from] AntiPatternError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_std_error<E: std::error::Error>(_: &E) {}

    #[test]
    fn plan_error_cycle_renders_arrow_path() {
        let err = PlanError::Cycle {
            path: vec!["T1".into(), "T2".into(), "T1".into()],
        };
        assert_std_error(&err);
        assert_eq!(
            err.to_string(),
            "cycle detected in task dependencies: T1 \u{2192} T2 \u{2192} T1"
        );
    }

    #[test]
    fn route_error_message_contains_task_id() {
        let err = RouteError::NoRoute {
            task_id: "T1".into(),
            task_kind: "edit".into(),
        };
        assert!(err.to_string().contains("T1"));
    }

    #[test]
    fn engine_error_from_conversions() {
        let e: EngineError = RouteError::NoRoute {
            task_id: "T1".into(),
            task_kind: "edit".into(),
        }
        .into();
        assert!(matches!(e, EngineError::Route(_)));

        let e: EngineError = ResilienceError::CircuitOpen {
            tool_id: "tool_a".into(),
        }
        .into();
        assert!(matches!(e, EngineError::Resilience(_)));
    }

    #[test]
    fn workspace_error_busy_message() {
        let err = WorkspaceError::Busy {
            branch: "engine/r1/t1".into(),
        };
        assert!(err.to_string().contains("engine/r1/t1"));
    }
}
