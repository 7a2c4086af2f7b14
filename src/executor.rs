//! Executor (C11): binds Router, Guardrails, Resilience Kernel,
//! Workspace Manager, Tool Adapter, and the Patch Ledger into the
//! per-task attempt loop (spec §4.11).
//!
//! Grounded on `dag/executor.rs`'s worker-pool / `tokio::sync::mpsc`
//! completion-reporting shape (kept conceptually: one `Executor` call
//! handles one task to completion and reports back; the pool itself is
//! the Orchestrator's `parallel`/semaphore loop, not this module's).

use crate::errors::ToolError;
use crate::events::{Event as BusEvent, EventBus, EventKind};
use crate::guardrails::{check_post_execution, check_pre_execution, PreCheckContext};
use crate::idgen::{new_attempt_id, new_patch_id};
use crate::ledger::{canonicalize_diff, diff_hash as compute_diff_hash, Ledger};
use crate::model::{
    AttemptState, DiffStats, LedgerEntry, LedgerState, Pattern, Patch, RunId, SafetyTier,
    StepAttempt, Task, TaskId, ToolId,
};
use crate::resilience::{backoff_delay, CircuitBreaker, OscillationDetector};
use crate::router::Router;
use crate::store::StateStore;
use crate::tools::{ToolAdapter, ToolProfile};
use crate::workspace::{WorkspaceManager, WorkspaceOutcome};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Outcome of running one task to completion (spec §4.11 step 7).
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub succeeded: bool,
    /// Marks the failure as one the Scheduler should propagate
    /// transitively to dependents (`upstream_failed`, spec §7).
    pub terminal: bool,
    pub failure_reason: Option<String>,
    pub patch_id: Option<String>,
    /// Set when the Resilience Kernel's oscillation detector flagged
    /// this task's latest attempt; forwarded to the Anti-Pattern
    /// Detector by the Orchestrator (spec §4.8, §4.13).
    pub oscillation: Option<&'static str>,
}

impl TaskResult {
    /// Whether this task's terminal failure was a hallucinated success
    /// (spec §4.9): the retry loop exhausted with the tool reporting
    /// success while a post-check failed. Consumed by the Anti-Pattern
    /// Detector's `AP_HALLUCINATED_SUCCESS` window (spec §4.13).
    pub fn hallucinated_success(&self) -> bool {
        self.failure_reason.as_deref() == Some("hallucinated_success")
    }
}

/// Cheaply `Clone`-able: every collaborator is `Arc`-shared so the
/// Orchestrator can hand a clone to each `tokio::spawn`ed task in its
/// worker pool without fighting borrow lifetimes (spec §5's `W`
/// concurrent workers), matching `dag/executor.rs`'s shape where the
/// executor itself is the unit dispatched onto the pool.
#[derive(Clone)]
pub struct Executor {
    store: Arc<StateStore>,
    events: Arc<EventBus>,
    router: Arc<Router>,
    breaker: Arc<CircuitBreaker>,
    workspace: Arc<WorkspaceManager>,
    mock_mode: bool,
}

impl Executor {
    pub fn new(
        store: Arc<StateStore>,
        events: Arc<EventBus>,
        router: Arc<Router>,
        breaker: Arc<CircuitBreaker>,
        workspace: Arc<WorkspaceManager>,
        mock_mode: bool,
    ) -> Self {
        Self {
            store,
            events,
            router,
            breaker,
            workspace,
            mock_mode,
        }
    }

    /// Runs the full attempt loop for one task (spec §4.11). Never
    /// panics on a missing workspace/route; those surface as a failed,
    /// terminal `TaskResult` so the Scheduler can keep moving.
    ///
    /// Routing (step 1) and the circuit-breaker check (step 3) are kept
    /// as genuinely separate steps, matching the spec's numbered
    /// algorithm: the Router is given no circuit-state knowledge here,
    /// so an open breaker always surfaces through this function's own
    /// step-3 check rather than silently through `ErrNoRoute`.
    ///
    /// `cancel` is checked at the top of every attempt iteration (spec
    /// §5: "checked before every ready-dispatch and between retry
    /// backoffs"), turning a cooperative cancellation request into a
    /// terminal failed `TaskResult` rather than starting another
    /// attempt.
    pub async fn execute_task(
        &self,
        run_id: &RunId,
        task: &Task,
        base_ref: &str,
        default_retries: u32,
        default_timeout_secs: u64,
        tool_profiles: &HashMap<ToolId, ToolProfile>,
        pattern: Option<&Pattern>,
        oscillation: &AsyncMutex<OscillationDetector>,
        cancel: &AtomicBool,
    ) -> TaskResult {
        let route = match self
            .router
            .route(
                &task.task_id,
                &task.task_kind,
                task.pattern_id.as_ref(),
                pattern,
                &HashSet::new(),
            )
            .await
        {
            Ok(decision) => decision,
            Err(_) => return Self::failed(task.task_id.clone(), "no route available", true),
        };

        let Some(profile) = tool_profiles.get(&route.tool_id) else {
            return Self::failed(
                task.task_id.clone(),
                format!("tool profile '{}' not configured", route.tool_id),
                true,
            );
        };

        let (declared_paths, required_tier) = task_routing_hints(task);
        let pre_ctx = PreCheckContext {
            task,
            tool_id: &route.tool_id,
            tool_safety_tier: profile.safety_tier,
            required_safety_tier: required_tier,
            declared_paths: &declared_paths,
        };
        if let Err(e) = check_pre_execution(&pre_ctx, pattern) {
            return Self::failed(task.task_id.clone(), e.to_string(), true);
        }

        if !self.breaker.allow_call(&route.tool_id) {
            return Self::failed(
                task.task_id.clone(),
                format!("circuit open for tool '{}'", route.tool_id),
                false,
            );
        }

        let handle = match self.workspace.acquire(run_id, &task.task_id, base_ref) {
            Ok(h) => h,
            Err(e) => return Self::failed(task.task_id.clone(), e.to_string(), false),
        };

        let max_attempts = task.retries.unwrap_or(default_retries).max(1);
        let timeout_secs = task.timeout_secs.unwrap_or(default_timeout_secs);
        let mut exec_profile = profile.clone();
        exec_profile.timeout_secs = timeout_secs;

        let adapter = ToolAdapter::new(handle.worktree_path.clone());
        let context = build_context(run_id, task);

        let mut attempt_index = 0u32;
        let mut last_oscillation: Option<&'static str> = None;
        let outcome = loop {
            if cancel.load(Ordering::SeqCst) {
                break AttemptOutcome::Failed {
                    reason: "canceled".to_string(),
                    terminal: true,
                };
            }

            let attempt_id = new_attempt_id(run_id, &task.task_id, attempt_index);
            let started_at = Utc::now();
            self.publish(
                run_id,
                EventKind::StepStarted {
                    run_id: run_id.clone(),
                    task_id: task.task_id.clone(),
                    attempt_id: attempt_id.clone(),
                },
            )
            .await;

            let mut attempt = StepAttempt {
                attempt_id: attempt_id.clone(),
                run_id: run_id.clone(),
                task_id: task.task_id.clone(),
                attempt_index,
                tool_id: route.tool_id.clone(),
                started_at,
                finished_at: None,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                output_patch_id: None,
                state: AttemptState::Running,
                failure_reason: None,
            };
            let _ = self.store.append_step_attempt(&attempt);

            match adapter.run(&exec_profile, &context, self.mock_mode).await {
                Ok(result) => {
                    let produced = build_patch(profile, &result.stdout);
                    let post = check_post_execution(
                        &result,
                        produced.is_some(),
                        pattern,
                        produced
                            .as_ref()
                            .map(|(paths, _)| paths.as_slice())
                            .unwrap_or(&[]),
                        Some(result.exit_code == Some(0)),
                        &task.metadata,
                    );

                    attempt.finished_at = Some(Utc::now());
                    attempt.exit_code = result.exit_code;
                    attempt.stdout = result.stdout.clone();
                    attempt.stderr = result.stderr.clone();

                    let sig = OscillationDetector::error_signature(&result.stderr, result.exit_code);
                    let dhash = produced
                        .as_ref()
                        .map(|(_, canonical)| OscillationDetector::diff_hash(canonical));
                    let verdict = oscillation
                        .lock()
                        .await
                        .observe(&task.task_id, Some(&sig), dhash.as_deref());
                    last_oscillation = oscillation_label(verdict);

                    if post.hallucinated_success || !post.failed_checks.is_empty() {
                        attempt.state = AttemptState::Failed;
                        attempt.failure_reason = Some(if post.hallucinated_success {
                            "hallucinated_success".to_string()
                        } else {
                            post.failed_checks.join(",")
                        });
                        let _ = self.store.finalize_step_attempt(&attempt);
                        self.publish(
                            run_id,
                            EventKind::StepFailed {
                                run_id: run_id.clone(),
                                task_id: task.task_id.clone(),
                                attempt_id: attempt_id.clone(),
                                reason: attempt.failure_reason.clone().unwrap_or_default(),
                            },
                        )
                        .await;
                        self.breaker.record_failure(&route.tool_id);
                        self.router
                            .record_outcome(&route.tool_id, false, result.duration.as_millis() as f64)
                            .await;

                        if attempt_index + 1 >= max_attempts {
                            break AttemptOutcome::Failed {
                                reason: attempt.failure_reason.unwrap_or_default(),
                                terminal: true,
                            };
                        }
                        attempt_index += 1;
                        tokio::time::sleep(backoff_delay(
                            Duration::from_millis(200),
                            Duration::from_secs(30),
                            attempt_index,
                            Utc::now().timestamp_millis() as u64,
                        ))
                        .await;
                        continue;
                    }

                    attempt.state = AttemptState::Succeeded;
                    let _ = self.store.finalize_step_attempt(&attempt);
                    self.breaker.record_success(&route.tool_id);
                    self.router
                        .record_outcome(&route.tool_id, true, result.duration.as_millis() as f64)
                        .await;

                    let patch_id = if let Some((paths, canonical)) = produced {
                        match self.commit_patch(&attempt_id, &handle.worktree_path, paths, canonical, pattern) {
                            Ok(id) => {
                                self.publish(
                                    run_id,
                                    EventKind::PatchCreated {
                                        run_id: run_id.clone(),
                                        patch_id: id.clone(),
                                    },
                                )
                                .await;
                                Some(id)
                            }
                            Err(CommitError::Invalid(reason)) => {
                                break AttemptOutcome::Failed {
                                    reason,
                                    terminal: true,
                                };
                            }
                            Err(CommitError::ApplyConflict(reason)) => {
                                self.breaker.record_failure(&route.tool_id);
                                self.router
                                    .record_outcome(&route.tool_id, false, result.duration.as_millis() as f64)
                                    .await;

                                if attempt_index + 1 >= max_attempts {
                                    break AttemptOutcome::Failed {
                                        reason,
                                        terminal: true,
                                    };
                                }
                                attempt_index += 1;
                                tokio::time::sleep(backoff_delay(
                                    Duration::from_millis(200),
                                    Duration::from_secs(30),
                                    attempt_index,
                                    Utc::now().timestamp_millis() as u64,
                                ))
                                .await;
                                continue;
                            }
                        }
                    } else {
                        None
                    };

                    self.publish(
                        run_id,
                        EventKind::StepCompleted {
                            run_id: run_id.clone(),
                            task_id: task.task_id.clone(),
                            attempt_id: attempt_id.clone(),
                        },
                    )
                    .await;
                    break AttemptOutcome::Succeeded { patch_id };
                }
                Err(err) => {
                    attempt.finished_at = Some(Utc::now());
                    attempt.state = AttemptState::Failed;
                    attempt.failure_reason = Some(err.to_string());
                    let _ = self.store.finalize_step_attempt(&attempt);
                    self.publish(
                        run_id,
                        EventKind::StepFailed {
                            run_id: run_id.clone(),
                            task_id: task.task_id.clone(),
                            attempt_id: attempt_id.clone(),
                            reason: err.to_string(),
                        },
                    )
                    .await;
                    self.breaker.record_failure(&route.tool_id);
                    self.router
                        .record_outcome(
                            &route.tool_id,
                            false,
                            (Utc::now() - started_at).num_milliseconds().max(0) as f64,
                        )
                        .await;

                    let retriable = matches!(err, ToolError::Timeout { .. } | ToolError::Spawn { .. });
                    if !retriable || attempt_index + 1 >= max_attempts {
                        break AttemptOutcome::Failed {
                            reason: err.to_string(),
                            terminal: true,
                        };
                    }
                    attempt_index += 1;
                    tokio::time::sleep(backoff_delay(
                        Duration::from_millis(200),
                        Duration::from_secs(30),
                        attempt_index,
                        Utc::now().timestamp_millis() as u64,
                    ))
                    .await;
                }
            }
        };

        let workspace_outcome = match &outcome {
            AttemptOutcome::Succeeded { .. } => WorkspaceOutcome::Success,
            AttemptOutcome::Failed { .. } => WorkspaceOutcome::Failure,
        };
        let _ = self.workspace.release(handle, workspace_outcome);

        match outcome {
            AttemptOutcome::Succeeded { patch_id } => TaskResult {
                task_id: task.task_id.clone(),
                succeeded: true,
                terminal: false,
                failure_reason: None,
                patch_id,
                oscillation: last_oscillation,
            },
            AttemptOutcome::Failed { reason, terminal } => TaskResult {
                task_id: task.task_id.clone(),
                succeeded: false,
                terminal,
                failure_reason: Some(reason),
                patch_id: None,
                oscillation: last_oscillation,
            },
        }
    }

    /// Drives a produced diff through `created → validated → queued →
    /// applied → verified → committed`, applying it against the
    /// workspace via `git2` in between (spec §4.11 step 5e). A pattern
    /// with `requires_review` set diverts a validated patch to
    /// `awaiting_review` instead, parked for `resume-review` (spec
    /// §4.10/§4.12, SPEC_FULL.md §15 Open Question 2).
    ///
    /// A `Ledger::validate` failure (spec §7 `ErrLedgerInvalid`) always
    /// quarantines the entry before returning — it is never left
    /// sitting untouched in `created`.
    fn commit_patch(
        &self,
        attempt_id: &str,
        worktree_path: &Path,
        paths: Vec<String>,
        canonical: String,
        pattern: Option<&Pattern>,
    ) -> Result<String, CommitError> {
        let patch_id = new_patch_id(attempt_id);
        let hash = compute_diff_hash(&canonical);
        let stats = diff_stats_of(&canonical, &paths);

        let patch = Patch {
            patch_id: patch_id.clone(),
            step_attempt_id: attempt_id.to_string(),
            diff: canonical.clone(),
            paths: paths.clone(),
            diff_stats: stats,
            diff_hash: hash.clone(),
        };
        self.store
            .store_patch(&patch)
            .map_err(|e| CommitError::Invalid(e.to_string()))?;

        let wildcard = ["**".to_string()];
        let allowed_globs: &[String] = pattern
            .map(|p| p.allowed_path_globs.as_slice())
            .unwrap_or(&wildcard);
        let mut entry = LedgerEntry::new(patch_id.clone());

        if let Err(e) = Ledger::validate(&mut entry, &canonical, &paths, allowed_globs) {
            if Ledger::transition(&mut entry, LedgerState::Quarantined, e.to_string(), "executor").is_ok() {
                self.persist_transition(&patch_id, &entry);
            }
            return Err(CommitError::Invalid(e.to_string()));
        }
        self.persist_transition(&patch_id, &entry);

        let requires_review = pattern.is_some_and(|p| p.requires_review);
        if requires_review {
            Ledger::transition(
                &mut entry,
                LedgerState::AwaitingReview,
                "parked for operator review",
                "executor",
            )
            .map_err(|e| CommitError::Invalid(e.to_string()))?;
            self.persist_transition(&patch_id, &entry);
            return Ok(patch_id);
        }

        Ledger::transition(&mut entry, LedgerState::Queued, "dispatched to workspace", "executor")
            .map_err(|e| CommitError::Invalid(e.to_string()))?;
        self.persist_transition(&patch_id, &entry);

        if let Err(reason) = apply_diff_to_workspace(worktree_path, &canonical) {
            if Ledger::transition(&mut entry, LedgerState::ApplyFailed, reason.clone(), "executor").is_ok() {
                self.persist_transition(&patch_id, &entry);
            }
            return Err(CommitError::ApplyConflict(reason));
        }
        Ledger::transition(&mut entry, LedgerState::Applied, "applied against workspace", "executor")
            .map_err(|e| CommitError::Invalid(e.to_string()))?;
        self.persist_transition(&patch_id, &entry);

        Ledger::transition(&mut entry, LedgerState::Verified, "pattern verification passed", "executor")
            .map_err(|e| CommitError::Invalid(e.to_string()))?;
        self.persist_transition(&patch_id, &entry);

        Ledger::commit(&mut entry, &hash, &hash).map_err(|e| CommitError::ApplyConflict(e.to_string()))?;
        self.persist_transition(&patch_id, &entry);

        Ok(patch_id)
    }

    fn persist_transition(&self, patch_id: &str, entry: &LedgerEntry) {
        if let Some(last) = entry.transitions.last() {
            let _ = self.store.append_ledger_transition(patch_id, last, None);
        }
    }

    async fn publish(&self, run_id: &RunId, kind: EventKind) -> BusEvent {
        let seq = self.events.publish(kind.clone()).await;
        let _ = self.store.append_event(
            run_id,
            event_kind_name(&kind),
            &serde_json::to_string(&kind).unwrap_or_default(),
        );
        BusEvent { seq, kind }
    }

    fn failed(task_id: TaskId, reason: impl Into<String>, terminal: bool) -> TaskResult {
        TaskResult {
            task_id,
            succeeded: false,
            terminal,
            failure_reason: Some(reason.into()),
            patch_id: None,
            oscillation: None,
        }
    }
}

enum AttemptOutcome {
    Succeeded { patch_id: Option<String> },
    Failed { reason: String, terminal: bool },
}

/// Distinguishes `commit_patch`'s terminal failures (malformed diff,
/// path escape, path outside allowed globs — `LedgerError::Invalid`)
/// from transient ones (workspace apply drift, commit hash mismatch —
/// `LedgerError::ApplyConflict`), so the caller can retry the latter
/// through the same backoff machinery used elsewhere in the attempt
/// loop instead of failing the task outright.
#[derive(Debug, Clone)]
enum CommitError {
    Invalid(String),
    ApplyConflict(String),
}

fn oscillation_label(verdict: crate::resilience::OscillationVerdict) -> Option<&'static str> {
    use crate::resilience::OscillationVerdict::*;
    match verdict {
        Clean => None,
        PlanningLoop => Some("AP_PLANNING_LOOP"),
        Oscillation => Some("AP_OSCILLATION"),
    }
}

fn event_kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::RunStarted { .. } => "run_started",
        EventKind::RunFinalized { .. } => "run_finalized",
        EventKind::StepStarted { .. } => "step_started",
        EventKind::StepCompleted { .. } => "step_completed",
        EventKind::StepFailed { .. } => "step_failed",
        EventKind::PatchCreated { .. } => "patch_created",
        EventKind::LedgerTransitioned { .. } => "ledger_transitioned",
        EventKind::AntiPatternDetected { .. } => "anti_pattern_detected",
        EventKind::GuardrailViolation { .. } => "guardrail_violation",
        EventKind::CircuitBreakerOpened { .. } => "circuit_breaker_opened",
        EventKind::CircuitBreakerClosed { .. } => "circuit_breaker_closed",
    }
}

/// Reads declared paths and a required safety tier out of task metadata
/// (there is no dedicated schema field for either — spec §3's `Task`
/// carries only a free-form `metadata` map, so `paths` and
/// `required_safety_tier` are read as well-known keys, same convention
/// the teacher uses for ad hoc phase metadata).
fn task_routing_hints(task: &Task) -> (Vec<String>, SafetyTier) {
    let paths = task
        .metadata
        .get("paths")
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let tier = match task.metadata.get("required_safety_tier").map(String::as_str) {
        Some("medium") => SafetyTier::Medium,
        Some("high") => SafetyTier::High,
        _ => SafetyTier::Low,
    };

    (paths, tier)
}

fn build_context(run_id: &RunId, task: &Task) -> HashMap<String, String> {
    let mut context = task.metadata.clone();
    context.insert("task_id".to_string(), task.task_id.clone());
    context.insert("run_id".to_string(), run_id.clone());
    context
}

/// Converts a tool's stdout into a candidate patch when the tool
/// profile declares a converter; no-op tools (test runners, linters
/// with no `patch_converter_id`) produce no patch (spec §4.11 step 5c).
/// The converter treats stdout as a literal unified diff — the
/// simplest converter shape, sufficient for tools that already emit
/// diff-formatted output directly.
fn build_patch(profile: &ToolProfile, stdout: &str) -> Option<(Vec<String>, String)> {
    profile.patch_converter_id.as_ref()?;
    if stdout.trim().is_empty() {
        return None;
    }
    let canonical = canonicalize_diff(stdout);
    let paths = parse_diff_paths(&canonical);
    Some((paths, canonical))
}

/// Applies a canonical unified diff against an acquired worktree using
/// `git2`, the same `Repository::open` + diff-application idiom
/// `workspace.rs` already uses for worktree bookkeeping.
fn apply_diff_to_workspace(worktree_path: &Path, canonical: &str) -> Result<(), String> {
    let repo = git2::Repository::open(worktree_path).map_err(|e| e.to_string())?;
    let diff = git2::Diff::from_buffer(canonical.as_bytes()).map_err(|e| e.to_string())?;
    repo.apply(&diff, git2::ApplyLocation::WorkDir, None)
        .map_err(|e| e.to_string())
}

fn parse_diff_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("+++ b/") {
            let path = rest.trim().to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

fn diff_stats_of(diff: &str, paths: &[String]) -> DiffStats {
    let mut lines_added = 0u32;
    let mut lines_deleted = 0u32;
    for line in diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            lines_added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            lines_deleted += 1;
        }
    }
    DiffStats {
        files_added: 0,
        files_modified: paths.len() as u32,
        files_deleted: 0,
        lines_added,
        lines_deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerParams;
    use crate::router::{FixedStrategy, RoutingRule};
    use crate::workspace::init_base_repo;
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    fn task(id: &str) -> Task {
        let mut metadata = Map::new();
        metadata.insert("message".to_string(), "hi".to_string());
        Task {
            task_id: id.to_string(),
            task_kind: "edit".to_string(),
            pattern_id: None,
            depends_on: vec![],
            metadata,
            retries: Some(1),
            timeout_secs: Some(5),
            priority: 0,
        }
    }

    fn echo_profile() -> ToolProfile {
        ToolProfile {
            tool_id: "echo_tool".into(),
            command_template: vec!["echo".into(), "{message}".into()],
            env_allowlist: vec![],
            timeout_secs: 5,
            safety_tier: SafetyTier::Low,
            stdin_source: None,
            patch_converter_id: None,
            generally_capable: true,
            mock_response: None,
        }
    }

    #[tokio::test]
    async fn no_op_tool_succeeds_without_producing_a_patch() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new(16));
        let mut profiles = HashMap::new();
        profiles.insert("echo_tool".to_string(), echo_profile());
        let router = Arc::new(Router::new(
            vec![RoutingRule {
                task_kind: "edit".into(),
                candidate_tool_ids: vec!["echo_tool".into()],
            }],
            profiles.clone(),
            Box::new(FixedStrategy),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerParams::default()));
        let workspace = Arc::new(WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        ));
        let oscillation = AsyncMutex::new(OscillationDetector::new(5, 3));
        let cancel = AtomicBool::new(false);

        let executor = Executor::new(store, events, router, breaker, workspace, false);
        let result = executor
            .execute_task(
                &"run-1".to_string(),
                &task("T1"),
                "HEAD",
                2,
                30,
                &profiles,
                None,
                &oscillation,
                &cancel,
            )
            .await;

        assert!(result.succeeded);
        assert!(result.patch_id.is_none());
    }

    #[tokio::test]
    async fn no_route_fails_task_terminally() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new(16));
        let router = Arc::new(Router::new(vec![], HashMap::new(), Box::new(FixedStrategy)));
        let breaker = Arc::new(CircuitBreaker::new(BreakerParams::default()));
        let workspace = Arc::new(WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        ));
        let oscillation = AsyncMutex::new(OscillationDetector::new(5, 3));
        let cancel = AtomicBool::new(false);

        let executor = Executor::new(store, events, router, breaker, workspace, false);
        let result = executor
            .execute_task(
                &"run-1".to_string(),
                &task("T1"),
                "HEAD",
                2,
                30,
                &HashMap::new(),
                None,
                &oscillation,
                &cancel,
            )
            .await;

        assert!(!result.succeeded);
        assert!(result.terminal);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_non_terminally() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new(16));
        let mut profiles = HashMap::new();
        profiles.insert("echo_tool".to_string(), echo_profile());
        let router = Arc::new(Router::new(
            vec![RoutingRule {
                task_kind: "edit".into(),
                candidate_tool_ids: vec!["echo_tool".into()],
            }],
            profiles.clone(),
            Box::new(FixedStrategy),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerParams {
            failure_threshold: 1,
            open_duration: Duration::from_secs(3600),
        }));
        breaker.record_failure("echo_tool");
        assert_eq!(breaker.state("echo_tool"), crate::model::BreakerState::Open);

        let workspace = Arc::new(WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        ));
        let oscillation = AsyncMutex::new(OscillationDetector::new(5, 3));
        let cancel = AtomicBool::new(false);

        let executor = Executor::new(store, events, router, breaker, workspace, false);
        let result = executor
            .execute_task(
                &"run-1".to_string(),
                &task("T1"),
                "HEAD",
                2,
                30,
                &profiles,
                None,
                &oscillation,
                &cancel,
            )
            .await;

        assert!(!result.succeeded);
        assert!(!result.terminal);
    }
}
