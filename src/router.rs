//! Router (C6): maps `(task_kind, attribute constraints)` to a tool id
//! via pluggable strategies, filtered by capability and Pattern
//! Registry allowlist, falling back to `generally_capable` tools before
//! failing with `ErrNoRoute` (spec §4.6).
//!
//! Grounded on `async-trait`'s pluggable-strategy idiom (spec.md §9:
//! "a fixed, enumerated set of adapter variants plus a registration
//! table; selection is a pure function of config, not import-time side
//! effects") — the `RoutingStrategy` trait below is that enumerated
//! set, not an open-ended plugin system.

use crate::errors::RouteError;
use crate::model::{PatternId, Pattern, SafetyTier, TaskId, ToolId};
use crate::tools::ToolProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One row of the router's mapping table (spec §4.6). `Serialize`/
/// `Deserialize` so a tool config file can declare rules alongside
/// `ToolProfile`s rather than hardcoding the mapping table in the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub task_kind: String,
    pub candidate_tool_ids: Vec<ToolId>,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub tool_id: ToolId,
    pub strategy: &'static str,
    pub candidates_considered: Vec<ToolId>,
    pub reason: String,
}

#[async_trait]
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `candidates` is already filtered by capability + pattern
    /// allowlist + circuit state; the strategy only picks among them.
    async fn select(&self, task_kind: &str, candidates: &[ToolId]) -> Option<ToolId>;

    /// Feeds a completed attempt's outcome back to the strategy.
    /// No-op for strategies that don't keep telemetry; overridden by
    /// `MetricsBasedStrategy` to update its per-tool snapshot.
    async fn record_outcome(&self, _tool_id: &str, _success: bool, _latency_ms: f64) {}
}

/// Which `RoutingStrategy` `execute-plan` should build (spec §4.6:
/// "fixed, round-robin, metrics-based"), selectable via `--routing-
/// strategy` instead of being hardcoded to `fixed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum RoutingStrategyKind {
    Fixed,
    RoundRobin,
    MetricsBased,
}

impl RoutingStrategyKind {
    pub fn build(self) -> Box<dyn RoutingStrategy> {
        match self {
            RoutingStrategyKind::Fixed => Box::new(FixedStrategy),
            RoutingStrategyKind::RoundRobin => Box::new(RoundRobinStrategy::default()),
            RoutingStrategyKind::MetricsBased => Box::new(MetricsBasedStrategy::default()),
        }
    }
}

pub struct FixedStrategy;

#[async_trait]
impl RoutingStrategy for FixedStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn select(&self, _task_kind: &str, candidates: &[ToolId]) -> Option<ToolId> {
        candidates.first().cloned()
    }
}

pub struct RoundRobinStrategy {
    cursors: Mutex<HashMap<String, AtomicUsize>>,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RoutingStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn select(&self, task_kind: &str, candidates: &[ToolId]) -> Option<ToolId> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors
            .entry(task_kind.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Some(candidates[idx].clone())
    }
}

/// Per-tool metrics snapshot consulted by the metrics-based strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolMetrics {
    pub success_rate: f64,
    pub p95_latency_ms: f64,
    pub circuit_open: bool,
}

pub struct MetricsBasedStrategy {
    pub metrics: Mutex<HashMap<ToolId, ToolMetrics>>,
}

impl Default for MetricsBasedStrategy {
    fn default() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
        }
    }
}

impl MetricsBasedStrategy {
    /// f(success_rate, p95_latency, circuit_open): reward success rate,
    /// penalize latency, and drop circuit-open tools entirely (spec
    /// §4.6 already filters those upstream, this is a defensive
    /// second filter).
    fn objective(m: &ToolMetrics) -> f64 {
        if m.circuit_open {
            f64::NEG_INFINITY
        } else {
            m.success_rate - (m.p95_latency_ms / 10_000.0)
        }
    }
}

#[async_trait]
impl RoutingStrategy for MetricsBasedStrategy {
    fn name(&self) -> &'static str {
        "metrics_based"
    }

    async fn select(&self, _task_kind: &str, candidates: &[ToolId]) -> Option<ToolId> {
        let metrics = self.metrics.lock().unwrap();
        candidates
            .iter()
            .max_by(|a, b| {
                let ma = metrics.get(*a).copied().unwrap_or_default();
                let mb = metrics.get(*b).copied().unwrap_or_default();
                Self::objective(&ma)
                    .partial_cmp(&Self::objective(&mb))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Exponential moving average over real attempt outcomes (the
    /// Executor calls this once per finished attempt), so `select`
    /// stops degenerating to "first candidate" once a run has produced
    /// any history.
    async fn record_outcome(&self, tool_id: &str, success: bool, latency_ms: f64) {
        const ALPHA: f64 = 0.3;
        let mut metrics = self.metrics.lock().unwrap();
        let entry = metrics.entry(tool_id.to_string()).or_insert(ToolMetrics {
            success_rate: 1.0,
            p95_latency_ms: latency_ms,
            circuit_open: false,
        });
        let observed = if success { 1.0 } else { 0.0 };
        entry.success_rate = ALPHA * observed + (1.0 - ALPHA) * entry.success_rate;
        entry.p95_latency_ms = ALPHA * latency_ms + (1.0 - ALPHA) * entry.p95_latency_ms;
    }
}

pub struct Router {
    rules: Vec<RoutingRule>,
    tool_profiles: HashMap<ToolId, ToolProfile>,
    strategy: Box<dyn RoutingStrategy>,
    decision_log: Mutex<Vec<RouteDecision>>,
}

impl Router {
    pub fn new(
        rules: Vec<RoutingRule>,
        tool_profiles: HashMap<ToolId, ToolProfile>,
        strategy: Box<dyn RoutingStrategy>,
    ) -> Self {
        Self {
            rules,
            tool_profiles,
            strategy,
            decision_log: Mutex::new(Vec::new()),
        }
    }

    /// Select a tool for `task_kind`, optionally constrained by
    /// `pattern_id`'s allowlist and `open_circuits`. Falls back to
    /// `generally_capable` tools, then fails with `ErrNoRoute` (spec
    /// §4.6).
    pub async fn route(
        &self,
        task_id: &TaskId,
        task_kind: &str,
        pattern_id: Option<&PatternId>,
        pattern: Option<&Pattern>,
        open_circuits: &std::collections::HashSet<ToolId>,
    ) -> Result<RouteDecision, RouteError> {
        let rule_candidates: Vec<ToolId> = self
            .rules
            .iter()
            .find(|r| r.task_kind == task_kind)
            .map(|r| r.candidate_tool_ids.clone())
            .unwrap_or_default();

        let mut candidates: Vec<ToolId> = rule_candidates
            .into_iter()
            .filter(|id| !open_circuits.contains(id))
            .filter(|id| self.pattern_allows(pattern, id))
            .collect();

        if candidates.is_empty() {
            candidates = self
                .tool_profiles
                .values()
                .filter(|p| p.generally_capable)
                .map(|p| p.tool_id.clone())
                .filter(|id| !open_circuits.contains(id))
                .filter(|id| self.pattern_allows(pattern, id))
                .collect();
        }

        let selected = self.strategy.select(task_kind, &candidates).await;

        match selected {
            Some(tool_id) => {
                let decision = RouteDecision {
                    tool_id: tool_id.clone(),
                    strategy: self.strategy.name(),
                    candidates_considered: candidates,
                    reason: format!("selected '{tool_id}' for task '{task_id}'"),
                };
                self.decision_log.lock().unwrap().push(decision.clone());
                Ok(decision)
            }
            None => {
                let _ = pattern_id;
                Err(RouteError::NoRoute {
                    task_id: task_id.clone(),
                    task_kind: task_kind.to_string(),
                })
            }
        }
    }

    fn pattern_allows(&self, pattern: Option<&Pattern>, tool_id: &str) -> bool {
        match pattern {
            Some(p) => p.allowed_tool_ids.iter().any(|t| t == tool_id),
            None => true,
        }
    }

    pub fn decision_log(&self) -> Vec<RouteDecision> {
        self.decision_log.lock().unwrap().clone()
    }

    /// Reports a finished attempt's outcome to the active strategy
    /// (no-op unless it's `MetricsBasedStrategy`).
    pub async fn record_outcome(&self, tool_id: &str, success: bool, latency_ms: f64) {
        self.strategy.record_outcome(tool_id, success, latency_ms).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PreCheckKind;

    fn tool_profile(id: &str, generally_capable: bool) -> ToolProfile {
        ToolProfile {
            tool_id: id.into(),
            command_template: vec!["true".into()],
            env_allowlist: vec![],
            timeout_secs: 30,
            safety_tier: SafetyTier::Medium,
            stdin_source: None,
            patch_converter_id: None,
            generally_capable,
            mock_response: None,
        }
    }

    #[tokio::test]
    async fn fixed_strategy_picks_first_candidate() {
        let rules = vec![RoutingRule {
            task_kind: "edit".into(),
            candidate_tool_ids: vec!["tool_a".into(), "tool_b".into()],
        }];
        let mut profiles = HashMap::new();
        profiles.insert("tool_a".to_string(), tool_profile("tool_a", false));
        profiles.insert("tool_b".to_string(), tool_profile("tool_b", false));

        let router = Router::new(rules, profiles, Box::new(FixedStrategy));
        let decision = router
            .route(
                &"T1".to_string(),
                "edit",
                None,
                None,
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(decision.tool_id, "tool_a");
        assert_eq!(decision.strategy, "fixed");
    }

    #[tokio::test]
    async fn falls_back_to_generally_capable_when_no_rule_matches() {
        let mut profiles = HashMap::new();
        profiles.insert("tool_x".to_string(), tool_profile("tool_x", true));

        let router = Router::new(vec![], profiles, Box::new(FixedStrategy));
        let decision = router
            .route(
                &"T1".to_string(),
                "unknown_kind",
                None,
                None,
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(decision.tool_id, "tool_x");
    }

    #[tokio::test]
    async fn no_candidates_fails_with_no_route() {
        let router = Router::new(vec![], HashMap::new(), Box::new(FixedStrategy));
        let err = router
            .route(
                &"T1".to_string(),
                "edit",
                None,
                None,
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn open_circuit_filters_out_candidate() {
        let rules = vec![RoutingRule {
            task_kind: "edit".into(),
            candidate_tool_ids: vec!["tool_a".into()],
        }];
        let mut profiles = HashMap::new();
        profiles.insert("tool_a".to_string(), tool_profile("tool_a", false));

        let router = Router::new(rules, profiles, Box::new(FixedStrategy));
        let mut open = std::collections::HashSet::new();
        open.insert("tool_a".to_string());

        let err = router
            .route(&"T1".to_string(), "edit", None, None, &open)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn pattern_allowlist_filters_candidates() {
        let rules = vec![RoutingRule {
            task_kind: "edit".into(),
            candidate_tool_ids: vec!["tool_a".into(), "tool_b".into()],
        }];
        let mut profiles = HashMap::new();
        profiles.insert("tool_a".to_string(), tool_profile("tool_a", false));
        profiles.insert("tool_b".to_string(), tool_profile("tool_b", false));

        let pattern = Pattern {
            pattern_id: "P1".into(),
            required_metadata_keys: vec![],
            allowed_tool_ids: vec!["tool_b".into()],
            allowed_path_globs: vec!["**".into()],
            pre_checks: vec![PreCheckKind::PathInGlobs],
            post_checks: vec![],
            requires_review: false,
        };

        let router = Router::new(rules, profiles, Box::new(FixedStrategy));
        let decision = router
            .route(
                &"T1".to_string(),
                "edit",
                Some(&"P1".to_string()),
                Some(&pattern),
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(decision.tool_id, "tool_b");
    }

    #[tokio::test]
    async fn round_robin_rotates_across_calls() {
        let rules = vec![RoutingRule {
            task_kind: "edit".into(),
            candidate_tool_ids: vec!["tool_a".into(), "tool_b".into()],
        }];
        let mut profiles = HashMap::new();
        profiles.insert("tool_a".to_string(), tool_profile("tool_a", false));
        profiles.insert("tool_b".to_string(), tool_profile("tool_b", false));

        let router = Router::new(rules, profiles, Box::new(RoundRobinStrategy::default()));
        let first = router
            .route(
                &"T1".to_string(),
                "edit",
                None,
                None,
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap();
        let second = router
            .route(
                &"T2".to_string(),
                "edit",
                None,
                None,
                &std::collections::HashSet::new(),
            )
            .await
            .unwrap();
        assert_ne!(first.tool_id, second.tool_id);
    }
}
