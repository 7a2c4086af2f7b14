//! Core data model shared by every component: Plan, Task, Run, Step
//! Attempt, Patch, Pattern, CircuitBreakerState and LedgerEntry (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type TaskId = String;
pub type RunId = String;
pub type PatternId = String;
pub type ToolId = String;

/// Global settings carried by a Plan (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanGlobals {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    #[serde(default)]
    pub deterministic_id_mode: bool,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_retries() -> u32 {
    2
}

impl Default for PlanGlobals {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_secs: default_timeout_secs(),
            default_retries: default_retries(),
            deterministic_id_mode: false,
        }
    }
}

/// One unit of work in a Plan (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub task_kind: String,
    #[serde(default)]
    pub pattern_id: Option<PatternId>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

/// Immutable input artifact describing a run's tasks and settings (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub schema_version: u32,
    pub plan_id: String,
    #[serde(default)]
    pub globals: PlanGlobals,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    pub fn task_ids(&self) -> HashSet<TaskId> {
        self.tasks.iter().map(|t| t.task_id.clone()).collect()
    }
}

/// Run lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Quarantined,
    Canceled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Quarantined | RunState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Quarantined => "quarantined",
            RunState::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "quarantined" => Ok(RunState::Quarantined),
            "canceled" => Ok(RunState::Canceled),
            other => anyhow::bail!("unknown run state '{other}'"),
        }
    }
}

/// Accumulated statistics tracked on a Run (spec §3, §4.13).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub planning_attempts: u32,
    pub patches_applied: u32,
    pub hallucination_count: u32,
    pub anti_patterns_detected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub plan_id: String,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: RunStats,
}

impl Run {
    pub fn pending(run_id: RunId, plan_id: String) -> Self {
        Self {
            run_id,
            plan_id,
            state: RunState::Pending,
            started_at: None,
            finished_at: None,
            stats: RunStats::default(),
        }
    }
}

/// Step Attempt lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Running => "running",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
            AttemptState::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for AttemptState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AttemptState::Running),
            "succeeded" => Ok(AttemptState::Succeeded),
            "failed" => Ok(AttemptState::Failed),
            "canceled" => Ok(AttemptState::Canceled),
            other => anyhow::bail!("unknown attempt state '{other}'"),
        }
    }
}

/// One invocation of a tool for a task (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepAttempt {
    pub attempt_id: String,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt_index: u32,
    pub tool_id: ToolId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output_patch_id: Option<String>,
    pub state: AttemptState,
    /// Set when post-execution guardrails relabel a zero-exit attempt failed.
    pub failure_reason: Option<String>,
}

/// Per-file diff statistics for a Patch (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffStats {
    pub files_added: u32,
    pub files_modified: u32,
    pub files_deleted: u32,
    pub lines_added: u32,
    pub lines_deleted: u32,
}

/// A produced unified-diff artifact, tracked through the Ledger (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patch {
    pub patch_id: String,
    pub step_attempt_id: String,
    pub diff: String,
    pub paths: Vec<String>,
    pub diff_stats: DiffStats,
    pub diff_hash: String,
}

/// A predicate descriptor drawn from a fixed closed set (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostCheckKind {
    PatchNonempty,
    TestsPassed,
    ExitCodeEq { code: i32 },
    PathInGlobs,
    MetadataPresent { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreCheckKind {
    MetadataPresent { key: String },
    PathInGlobs,
}

/// A named contract a task must honor (spec §3, §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub pattern_id: PatternId,
    #[serde(default)]
    pub required_metadata_keys: Vec<String>,
    pub allowed_tool_ids: Vec<ToolId>,
    pub allowed_path_globs: Vec<String>,
    #[serde(default)]
    pub pre_checks: Vec<PreCheckKind>,
    #[serde(default)]
    pub post_checks: Vec<PostCheckKind>,
    /// When set, a patch validated under this pattern is routed to
    /// `awaiting_review` instead of `queued` (spec §4.10/§4.12,
    /// SPEC_FULL.md §15 Open Question 2) and only proceeds once an
    /// operator calls `resume-review`.
    #[serde(default)]
    pub requires_review: bool,
}

/// Safety tier of a tool, gating pattern eligibility (spec §4.9, §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    Low,
    Medium,
    High,
}

/// Circuit breaker state for a single tool (spec §3, §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Lifecycle state of a Ledger Entry (spec §3, §4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Created,
    Validated,
    Queued,
    Applied,
    Verified,
    Committed,
    ApplyFailed,
    Quarantined,
    Dropped,
    RolledBack,
    AwaitingReview,
}

impl LedgerState {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerState::Created => "created",
            LedgerState::Validated => "validated",
            LedgerState::Queued => "queued",
            LedgerState::Applied => "applied",
            LedgerState::Verified => "verified",
            LedgerState::Committed => "committed",
            LedgerState::ApplyFailed => "apply_failed",
            LedgerState::Quarantined => "quarantined",
            LedgerState::Dropped => "dropped",
            LedgerState::RolledBack => "rolled_back",
            LedgerState::AwaitingReview => "awaiting_review",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LedgerState::Committed
                | LedgerState::RolledBack
                | LedgerState::Quarantined
                | LedgerState::Dropped
        )
    }
}

impl std::str::FromStr for LedgerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(LedgerState::Created),
            "validated" => Ok(LedgerState::Validated),
            "queued" => Ok(LedgerState::Queued),
            "applied" => Ok(LedgerState::Applied),
            "verified" => Ok(LedgerState::Verified),
            "committed" => Ok(LedgerState::Committed),
            "apply_failed" => Ok(LedgerState::ApplyFailed),
            "quarantined" => Ok(LedgerState::Quarantined),
            "dropped" => Ok(LedgerState::Dropped),
            "rolled_back" => Ok(LedgerState::RolledBack),
            "awaiting_review" => Ok(LedgerState::AwaitingReview),
            other => anyhow::bail!("unknown ledger state '{other}'"),
        }
    }
}

/// One append-only transition in a patch's lifecycle (spec §3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerTransition {
    pub to_state: LedgerState,
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub patch_id: String,
    pub state: LedgerState,
    pub transitions: Vec<LedgerTransition>,
    #[serde(default)]
    pub review_metadata: Option<String>,
}

impl LedgerEntry {
    pub fn new(patch_id: String) -> Self {
        Self {
            patch_id,
            state: LedgerState::Created,
            transitions: Vec::new(),
            review_metadata: None,
        }
    }
}
