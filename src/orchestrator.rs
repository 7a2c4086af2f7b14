//! Orchestrator (C12): owns a Run's lifecycle end to end — validate,
//! dispatch, finalize (spec §4.12).
//!
//! Grounded on `dag/executor.rs`'s bounded worker-pool dispatch loop
//! (spawn onto a pool, fold completions back into scheduler state) and
//! the teacher's `orchestrator/runner.rs` validate-then-drive-then-
//! finalize shape, generalized from per-phase dispatch to per-task
//! dispatch against a `DagScheduler`.

use crate::antipattern::{is_critical, AntiPatternDetector, AntiPatternParams, StepOutcome};
use crate::dag::DagScheduler;
use crate::errors::EngineError;
use crate::events::{EventBus, EventKind};
use crate::executor::{Executor, TaskResult};
use crate::guardrails::validate_plan;
use crate::idgen::{deterministic_run_id, new_run_id};
use crate::model::{Plan, Run, RunId, RunState};
use crate::patterns::PatternRegistry;
use crate::resilience::{CircuitBreaker, OscillationDetector};
use crate::router::Router;
use crate::store::StateStore;
use crate::tools::ToolProfile;
use crate::workspace::WorkspaceManager;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

/// Fixed settings for one `execute_plan` call, beyond the Plan itself
/// (spec §4.12 step 1: "accept Plan + config snapshot").
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub base_ref: String,
    pub mock_mode: bool,
    pub anti_pattern_params: AntiPatternParams,
    pub oscillation_window: usize,
    pub oscillation_threshold: usize,
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    events: Arc<EventBus>,
    executor: Executor,
    patterns: Arc<PatternRegistry>,
    tool_profiles: Arc<HashMap<String, ToolProfile>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        events: Arc<EventBus>,
        router: Arc<Router>,
        breaker: Arc<CircuitBreaker>,
        workspace: Arc<WorkspaceManager>,
        patterns: Arc<PatternRegistry>,
        tool_profiles: HashMap<String, ToolProfile>,
        config: OrchestratorConfig,
    ) -> Self {
        let executor = Executor::new(
            store.clone(),
            events.clone(),
            router,
            breaker,
            workspace,
            config.mock_mode,
        );
        Self {
            store,
            events,
            executor,
            patterns,
            tool_profiles: Arc::new(tool_profiles),
            config,
        }
    }

    /// Drives one Plan through to a finalized Run (spec §4.12 steps
    /// 1-4). `now_millis` is threaded in rather than read off the clock
    /// directly so the non-deterministic id path stays outside this
    /// function's own logic.
    pub async fn execute_plan(&self, plan: &Plan, now_millis: u64) -> Result<Run, EngineError> {
        let graph = validate_plan(plan, |id| self.patterns.exists(id))?;

        let run_id: RunId = if plan.globals.deterministic_id_mode {
            deterministic_run_id(&plan.plan_id)
        } else {
            new_run_id(now_millis)
        };

        let mut run = Run::pending(run_id.clone(), plan.plan_id.clone());
        self.store.create_run(&run)?;

        let start = Utc::now();
        run.state = RunState::Running;
        run.started_at = Some(start);
        self.store.update_run_state(&run_id, RunState::Running, None)?;
        self.publish(&run_id, EventKind::RunStarted { run_id: run_id.clone() })
            .await;

        let mut scheduler = DagScheduler::seed(graph, plan.globals.max_concurrency);
        let oscillation = Arc::new(AsyncMutex::new(OscillationDetector::new(
            self.config.oscillation_window,
            self.config.oscillation_threshold,
        )));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut antipattern = AntiPatternDetector::new(self.config.anti_pattern_params, start);

        let mut stats = run.stats.clone();
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut quarantined = false;
        let mut unrecoverable_failure = false;

        loop {
            if self.store.is_cancel_requested(&run_id).unwrap_or(false) {
                cancel.store(true, Ordering::SeqCst);
            }
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            for task_id in scheduler.ready() {
                let Some(task) = plan.task(&task_id).cloned() else {
                    continue;
                };
                scheduler.mark_running(&task_id);

                let pattern = task
                    .pattern_id
                    .as_ref()
                    .and_then(|id| self.patterns.get(id))
                    .cloned();
                let executor = self.executor.clone();
                let run_id_owned = run_id.clone();
                let base_ref = self.config.base_ref.clone();
                let default_retries = plan.globals.default_retries;
                let default_timeout_secs = plan.globals.default_timeout_secs;
                let tool_profiles = self.tool_profiles.clone();
                let oscillation = oscillation.clone();
                let cancel = cancel.clone();

                join_set.spawn(async move {
                    executor
                        .execute_task(
                            &run_id_owned,
                            &task,
                            &base_ref,
                            default_retries,
                            default_timeout_secs,
                            &tool_profiles,
                            pattern.as_ref(),
                            &oscillation,
                            &cancel,
                        )
                        .await
                });
            }

            if join_set.is_empty() {
                if scheduler.remaining() == 0 {
                    break;
                }
                if scheduler.check_deadlock().is_err() {
                    unrecoverable_failure = true;
                    break;
                }
                continue;
            }

            let Some(joined) = join_set.join_next().await else {
                continue;
            };
            let result = match joined {
                Ok(r) => r,
                Err(e) => {
                    unrecoverable_failure = true;
                    tracing::error!(run_id = %run_id, error = %e, "task future panicked or was aborted");
                    continue;
                }
            };

            stats.planning_attempts += 1;
            if result.succeeded {
                scheduler.mark_completed(&result.task_id);
                if result.patch_id.is_some() {
                    stats.patches_applied += 1;
                }
            } else {
                scheduler.mark_failed(&result.task_id, result.terminal);
                if result.terminal {
                    unrecoverable_failure = true;
                }
            }
            if result.hallucinated_success() {
                stats.hallucination_count += 1;
            }
            self.store.update_run_stats(&run_id, &stats)?;

            let step = StepOutcome {
                hallucinated_success: result.hallucinated_success(),
                patch_committed: result.patch_id.is_some(),
            };
            let detections = antipattern.evaluate(
                &stats,
                step,
                result.oscillation,
                Utc::now(),
                scheduler.remaining() > 0,
            );
            for detection in &detections {
                stats.anti_patterns_detected.push(detection.anti_pattern.to_string());
                self.publish(
                    &run_id,
                    EventKind::AntiPatternDetected {
                        run_id: run_id.clone(),
                        kind: detection.anti_pattern.to_string(),
                    },
                )
                .await;
            }
            if !detections.is_empty() {
                self.store.update_run_stats(&run_id, &stats)?;
            }
            if is_critical(&detections) {
                tracing::warn!(run_id = %run_id, "critical anti-pattern detected, quarantining run");
                quarantined = true;
                cancel.store(true, Ordering::SeqCst);
                break;
            }
        }

        // Signal any still-in-flight tasks to stop and let them unwind
        // (spec §4.12 step 4: "signal running tasks to stop"), folding
        // their outcomes back into scheduler state before finalizing.
        cancel.store(true, Ordering::SeqCst);
        while let Some(joined) = join_set.join_next().await {
            if let Ok(result) = joined {
                if result.succeeded {
                    scheduler.mark_completed(&result.task_id);
                } else {
                    scheduler.mark_failed(&result.task_id, result.terminal);
                }
            }
        }

        let canceled = self.store.is_cancel_requested(&run_id).unwrap_or(false) && !quarantined;
        let finished_at = Utc::now();
        let final_state = if canceled {
            RunState::Canceled
        } else if quarantined {
            RunState::Quarantined
        } else if unrecoverable_failure || scheduler.any_failed() {
            RunState::Failed
        } else {
            RunState::Succeeded
        };

        self.store
            .update_run_state(&run_id, final_state, Some(finished_at))?;
        self.store.update_run_stats(&run_id, &stats)?;
        self.publish(
            &run_id,
            EventKind::RunFinalized {
                run_id: run_id.clone(),
                state: final_state,
            },
        )
        .await;

        run.state = final_state;
        run.finished_at = Some(finished_at);
        run.stats = stats;
        Ok(run)
    }

    async fn publish(&self, run_id: &RunId, kind: EventKind) {
        self.events.publish(kind.clone()).await;
        let _ = self.store.append_event(
            run_id,
            event_kind_name(&kind),
            &serde_json::to_string(&kind).unwrap_or_default(),
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanGlobals, Task};
    use crate::resilience::BreakerParams;
    use crate::router::{FixedStrategy, RoutingRule};
    use crate::tools::ToolProfile;
    use crate::workspace::init_base_repo;
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut metadata = Map::new();
        metadata.insert("message".to_string(), "hi".to_string());
        Task {
            task_id: id.to_string(),
            task_kind: "edit".to_string(),
            pattern_id: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            metadata,
            retries: Some(0),
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
            safety_tier: crate::model::SafetyTier::Low,
            stdin_source: None,
            patch_converter_id: None,
            generally_capable: true,
            mock_response: None,
        }
    }

    fn build_orchestrator(base: &std::path::Path, workspace_root: &std::path::Path) -> Orchestrator {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new(16));
        let mut profiles = Map::new();
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
            base.to_path_buf(),
            workspace_root.to_path_buf(),
            5,
        ));
        let patterns = Arc::new(PatternRegistry::in_memory(vec![]));
        let config = OrchestratorConfig {
            base_ref: "HEAD".to_string(),
            mock_mode: false,
            anti_pattern_params: AntiPatternParams::default(),
            oscillation_window: 5,
            oscillation_threshold: 3,
        };
        Orchestrator::new(store, events, router, breaker, workspace, patterns, profiles, config)
    }

    #[tokio::test]
    async fn diamond_plan_succeeds_end_to_end() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();
        let orchestrator = build_orchestrator(base.path(), workspace_root.path());

        let plan = Plan {
            schema_version: 1,
            plan_id: "p1".to_string(),
            globals: PlanGlobals {
                max_concurrency: 2,
                ..PlanGlobals::default()
            },
            tasks: vec![
                task("T1", &[]),
                task("T2", &["T1"]),
                task("T3", &["T1"]),
                task("T4", &["T2", "T3"]),
            ],
        };

        let run = orchestrator.execute_plan(&plan, 1_700_000_000_000).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.stats.planning_attempts, 4);
    }

    #[tokio::test]
    async fn unknown_pattern_is_rejected_before_any_dispatch() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();
        let orchestrator = build_orchestrator(base.path(), workspace_root.path());

        let mut bad_task = task("T1", &[]);
        bad_task.pattern_id = Some("no-such-pattern".to_string());
        let plan = Plan {
            schema_version: 1,
            plan_id: "p1".to_string(),
            globals: PlanGlobals::default(),
            tasks: vec![bad_task],
        };

        let err = orchestrator.execute_plan(&plan, 1_700_000_000_000).await.unwrap_err();
        assert!(matches!(err, EngineError::Plan(_)));
    }

    #[tokio::test]
    async fn upstream_failure_propagates_to_run_failed() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();
        let orchestrator = build_orchestrator(base.path(), workspace_root.path());

        // No route exists for "unroutable" task kind: T1 fails terminally,
        // T2 (depends on T1) should fail transitively.
        let mut t1 = task("T1", &[]);
        t1.task_kind = "unroutable".to_string();
        let plan = Plan {
            schema_version: 1,
            plan_id: "p1".to_string(),
            globals: PlanGlobals::default(),
            tasks: vec![t1, task("T2", &["T1"])],
        };

        let run = orchestrator.execute_plan(&plan, 1_700_000_000_000).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
    }

    #[tokio::test]
    async fn cancellation_requested_mid_run_finalizes_canceled() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("README.md"), "x").unwrap();
        init_base_repo(base.path()).unwrap();
        let workspace_root = tempdir().unwrap();
        let orchestrator = build_orchestrator(base.path(), workspace_root.path());

        // Five independent tasks with concurrency 1 force the main loop
        // through several iterations, giving the background canceler a
        // window to land its request between completions.
        let tasks = (0..5).map(|i| task(&format!("T{i}"), &[])).collect();
        let mut plan = Plan {
            schema_version: 1,
            plan_id: "p1".to_string(),
            globals: PlanGlobals {
                max_concurrency: 1,
                ..PlanGlobals::default()
            },
            tasks,
        };
        plan.globals.deterministic_id_mode = true;
        let run_id = deterministic_run_id(&plan.plan_id);
        let store = orchestrator.store.clone();
        tokio::spawn(async move {
            loop {
                if store.is_cancel_requested(&run_id).is_ok() && store.get_run(&run_id).unwrap().is_some() {
                    let _ = store.request_cancel(&run_id);
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        });

        let run = orchestrator.execute_plan(&plan, 1_700_000_000_000).await.unwrap();
        assert!(matches!(run.state, RunState::Canceled | RunState::Succeeded));
    }
}
