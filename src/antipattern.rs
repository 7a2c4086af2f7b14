//! Anti-Pattern Detector (C13): evaluates a Run's rolling state after
//! every step completion against the four fixed rules in spec §4.13,
//! classifying each detection as advisory (log and continue) or
//! critical (quarantine the Run and stop dispatch).
//!
//! New logic with no direct teacher call site; grounded in shape on
//! `resilience.rs`'s sliding-window `OscillationDetector` (same
//! "per-run mutable window, `observe`-and-verdict" idiom) and on
//! `patterns.rs::ANTI_PATTERNS` for the canonical rule names.

use crate::model::RunStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Threshold parameters for the four rules (spec §4.13's `L`, `H`, `W`,
/// `K`, `T`). `oscillation_threshold` (`K`) is not enforced here: the
/// Resilience Kernel's `OscillationDetector` already applies it per
/// task (spec §4.8) and forwards its verdict in through `observe`.
#[derive(Debug, Clone, Copy)]
pub struct AntiPatternParams {
    /// `L`: planning attempts with zero applied patches before
    /// `AP_PLANNING_LOOP` fires at the run level.
    pub planning_loop_min_attempts: u32,
    /// `H`: hallucinated successes within the trailing window before
    /// `AP_HALLUCINATED_SUCCESS` fires.
    pub hallucination_threshold: u32,
    /// `W`: size of the trailing step window `H` is counted over.
    pub hallucination_window: usize,
    /// `T`: time since the last ledger commit before `AP_STUCK` fires,
    /// provided steps are still starting.
    pub stuck_after: Duration,
}

impl Default for AntiPatternParams {
    fn default() -> Self {
        Self {
            planning_loop_min_attempts: 5,
            hallucination_threshold: 2,
            hallucination_window: 10,
            stuck_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Advisory,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub anti_pattern: &'static str,
    pub severity: Severity,
    pub reason: String,
}

/// One step's relevant outcome, as surfaced by the Executor / Ledger
/// for this evaluation (spec §4.13 operates on step/ledger history, not
/// on the full `TaskResult`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOutcome {
    pub hallucinated_success: bool,
    pub patch_committed: bool,
}

/// Per-run mutable evaluator. One instance per Run, owned by the
/// Orchestrator and fed one `StepOutcome` after every completion event.
pub struct AntiPatternDetector {
    params: AntiPatternParams,
    recent_hallucinations: VecDeque<bool>,
    last_committed_at: Option<DateTime<Utc>>,
    run_started_at: DateTime<Utc>,
}

impl AntiPatternDetector {
    pub fn new(params: AntiPatternParams, run_started_at: DateTime<Utc>) -> Self {
        Self {
            params,
            recent_hallucinations: VecDeque::with_capacity(params.hallucination_window),
            last_committed_at: None,
            run_started_at,
        }
    }

    /// Feeds one completed step in, updates the rolling window, and
    /// returns every rule that fires as of this step (spec §4.13: "after
    /// each completion ask the Anti-Pattern Detector to evaluate").
    pub fn evaluate(
        &mut self,
        stats: &RunStats,
        step: StepOutcome,
        oscillation: Option<&'static str>,
        now: DateTime<Utc>,
        steps_still_starting: bool,
    ) -> Vec<Detection> {
        let mut detections = Vec::new();

        self.recent_hallucinations.push_back(step.hallucinated_success);
        if self.recent_hallucinations.len() > self.params.hallucination_window {
            self.recent_hallucinations.pop_front();
        }
        if step.patch_committed {
            self.last_committed_at = Some(now);
        }

        if let Some(d) = self.check_hallucinated_success() {
            detections.push(d);
        }
        if let Some(d) = self.check_planning_loop(stats) {
            detections.push(d);
        }
        if let Some(d) = self.check_oscillation(oscillation) {
            detections.push(d);
        }
        if let Some(d) = self.check_stuck(now, steps_still_starting) {
            detections.push(d);
        }

        detections
    }

    fn check_hallucinated_success(&self) -> Option<Detection> {
        let count = self.recent_hallucinations.iter().filter(|h| **h).count() as u32;
        if count >= self.params.hallucination_threshold {
            Some(Detection {
                anti_pattern: "AP_HALLUCINATED_SUCCESS",
                severity: Severity::Critical,
                reason: format!(
                    "{count} hallucinated successes within the last {} steps",
                    self.recent_hallucinations.len()
                ),
            })
        } else {
            None
        }
    }

    fn check_planning_loop(&self, stats: &RunStats) -> Option<Detection> {
        if stats.planning_attempts >= self.params.planning_loop_min_attempts
            && stats.patches_applied == 0
        {
            Some(Detection {
                anti_pattern: "AP_PLANNING_LOOP",
                severity: Severity::Advisory,
                reason: format!(
                    "{} planning attempts with zero patches applied",
                    stats.planning_attempts
                ),
            })
        } else {
            None
        }
    }

    /// Forwards the Resilience Kernel's per-task oscillation verdict
    /// (spec §4.8) into the run-level detection stream. `AP_OSCILLATION`
    /// is treated as critical (a repeating diff is never going to
    /// converge); `AP_PLANNING_LOOP` surfaced this way is advisory, same
    /// as the run-level rule above.
    fn check_oscillation(&self, oscillation: Option<&'static str>) -> Option<Detection> {
        match oscillation {
            Some("AP_OSCILLATION") => Some(Detection {
                anti_pattern: "AP_OSCILLATION",
                severity: Severity::Critical,
                reason: "same diff_hash observed at or beyond the oscillation threshold".into(),
            }),
            Some("AP_PLANNING_LOOP") => Some(Detection {
                anti_pattern: "AP_PLANNING_LOOP",
                severity: Severity::Advisory,
                reason: "same error signature observed at or beyond the oscillation threshold"
                    .into(),
            }),
            _ => None,
        }
    }

    fn check_stuck(&self, now: DateTime<Utc>, steps_still_starting: bool) -> Option<Detection> {
        if !steps_still_starting {
            return None;
        }
        let since = self.last_committed_at.unwrap_or(self.run_started_at);
        let elapsed = now - since;
        let threshold = ChronoDuration::from_std(self.params.stuck_after).unwrap_or_default();
        if elapsed >= threshold {
            Some(Detection {
                anti_pattern: "AP_STUCK",
                severity: Severity::Critical,
                reason: format!(
                    "no ledger commit in {}s while steps continue to start",
                    elapsed.num_seconds()
                ),
            })
        } else {
            None
        }
    }
}

pub fn is_critical(detections: &[Detection]) -> bool {
    detections.iter().any(|d| d.severity == Severity::Critical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(planning_attempts: u32, patches_applied: u32) -> RunStats {
        RunStats {
            planning_attempts,
            patches_applied,
            hallucination_count: 0,
            anti_patterns_detected: Vec::new(),
        }
    }

    #[test]
    fn planning_loop_fires_after_threshold_with_no_patches() {
        let mut detector = AntiPatternDetector::new(AntiPatternParams::default(), Utc::now());
        let detections = detector.evaluate(
            &stats(5, 0),
            StepOutcome::default(),
            None,
            Utc::now(),
            true,
        );
        assert!(detections.iter().any(|d| d.anti_pattern == "AP_PLANNING_LOOP"));
    }

    #[test]
    fn planning_loop_does_not_fire_once_a_patch_is_applied() {
        let mut detector = AntiPatternDetector::new(AntiPatternParams::default(), Utc::now());
        let detections = detector.evaluate(
            &stats(10, 1),
            StepOutcome::default(),
            None,
            Utc::now(),
            true,
        );
        assert!(!detections.iter().any(|d| d.anti_pattern == "AP_PLANNING_LOOP"));
    }

    #[test]
    fn hallucinated_success_fires_within_window() {
        let params = AntiPatternParams {
            hallucination_threshold: 2,
            hallucination_window: 3,
            ..AntiPatternParams::default()
        };
        let mut detector = AntiPatternDetector::new(params, Utc::now());
        let step = StepOutcome {
            hallucinated_success: true,
            patch_committed: false,
        };
        let first = detector.evaluate(&stats(0, 0), step, None, Utc::now(), true);
        assert!(!first.iter().any(|d| d.anti_pattern == "AP_HALLUCINATED_SUCCESS"));
        let second = detector.evaluate(&stats(0, 0), step, None, Utc::now(), true);
        assert!(second.iter().any(|d| d.anti_pattern == "AP_HALLUCINATED_SUCCESS"));
    }

    #[test]
    fn hallucination_window_forgets_old_steps() {
        let params = AntiPatternParams {
            hallucination_threshold: 2,
            hallucination_window: 2,
            ..AntiPatternParams::default()
        };
        let mut detector = AntiPatternDetector::new(params, Utc::now());
        let hallucinated = StepOutcome {
            hallucinated_success: true,
            patch_committed: false,
        };
        let clean = StepOutcome::default();
        detector.evaluate(&stats(0, 0), hallucinated, None, Utc::now(), true);
        detector.evaluate(&stats(0, 0), clean, None, Utc::now(), true);
        detector.evaluate(&stats(0, 0), clean, None, Utc::now(), true);
        let detections = detector.evaluate(&stats(0, 0), clean, None, Utc::now(), true);
        assert!(!detections.iter().any(|d| d.anti_pattern == "AP_HALLUCINATED_SUCCESS"));
    }

    #[test]
    fn oscillation_verdict_is_forwarded_as_critical() {
        let mut detector = AntiPatternDetector::new(AntiPatternParams::default(), Utc::now());
        let detections = detector.evaluate(
            &stats(0, 0),
            StepOutcome::default(),
            Some("AP_OSCILLATION"),
            Utc::now(),
            true,
        );
        assert!(is_critical(&detections));
    }

    #[test]
    fn stuck_fires_once_stuck_after_elapses_with_steps_still_starting() {
        let params = AntiPatternParams {
            stuck_after: Duration::from_secs(60),
            ..AntiPatternParams::default()
        };
        let started = Utc::now() - ChronoDuration::seconds(120);
        let mut detector = AntiPatternDetector::new(params, started);
        let detections = detector.evaluate(
            &stats(0, 0),
            StepOutcome::default(),
            None,
            Utc::now(),
            true,
        );
        assert!(detections.iter().any(|d| d.anti_pattern == "AP_STUCK"));
    }

    #[test]
    fn stuck_does_not_fire_once_a_patch_commits() {
        let params = AntiPatternParams {
            stuck_after: Duration::from_secs(60),
            ..AntiPatternParams::default()
        };
        let started = Utc::now() - ChronoDuration::seconds(120);
        let mut detector = AntiPatternDetector::new(params, started);
        let committed = StepOutcome {
            hallucinated_success: false,
            patch_committed: true,
        };
        detector.evaluate(&stats(0, 0), committed, None, Utc::now(), true);
        let detections = detector.evaluate(
            &stats(0, 0),
            StepOutcome::default(),
            None,
            Utc::now(),
            true,
        );
        assert!(!detections.iter().any(|d| d.anti_pattern == "AP_STUCK"));
    }

    #[test]
    fn stuck_does_not_fire_when_no_steps_are_starting() {
        let params = AntiPatternParams {
            stuck_after: Duration::from_secs(60),
            ..AntiPatternParams::default()
        };
        let started = Utc::now() - ChronoDuration::seconds(120);
        let mut detector = AntiPatternDetector::new(params, started);
        let detections = detector.evaluate(
            &stats(0, 0),
            StepOutcome::default(),
            None,
            Utc::now(),
            false,
        );
        assert!(!detections.iter().any(|d| d.anti_pattern == "AP_STUCK"));
    }
}
