//! Resilience Kernel (C8): per-tool circuit breaker, retry with
//! full-jitter exponential backoff, and oscillation/fix-loop detection
//! — merged into a single module per SPEC_FULL.md §15 resolution of
//! spec.md §9's third Open Question (spec §4.8).
//!
//! Grounded on `dashmap::DashMap` for the per-tool breaker table (the
//! teacher declares `dashmap` for exactly this "concurrent map of
//! independent per-key state" shape, generalized here from no existing
//! call site since the teacher has none) and on `sha2::Sha256` content
//! hashing the same way `factory/`'s content-addressed artifacts are
//! hashed elsewhere in the pack.

use crate::model::{BreakerState, ToolId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_probe_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerParams {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Per-tool fail-fast state controlling dispatchability (spec §3, §4.8,
/// §5: "per-tool atomics guarding failure counters... transitions are
/// compare-and-swap" — modeled here with a `DashMap` entry lock per
/// tool, which gives the same per-key independence without a hand
/// rolled CAS loop).
pub struct CircuitBreaker {
    params: BreakerParams,
    entries: DashMap<ToolId, BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            params,
            entries: DashMap::new(),
        }
    }

    /// Current externally-visible state, resolving `open` → `half_open`
    /// if `open_duration` has elapsed since the breaker tripped.
    pub fn state(&self, tool_id: &str) -> BreakerState {
        let mut entry = self.entries.entry(tool_id.to_string()).or_default();
        if entry.state == BreakerState::Open
            && let Some(opened_at) = entry.opened_at
            && Utc::now() - opened_at
                >= chrono::Duration::from_std(self.params.open_duration).unwrap_or_default()
            && !entry.half_open_probe_in_flight
        {
            entry.state = BreakerState::HalfOpen;
        }
        entry.state
    }

    /// Returns `true` if a call is allowed to proceed (closed, or
    /// half-open with no probe currently in flight — only one probe at
    /// a time).
    pub fn allow_call(&self, tool_id: &str) -> bool {
        match self.state(tool_id) {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                let mut entry = self.entries.entry(tool_id.to_string()).or_default();
                if entry.half_open_probe_in_flight {
                    false
                } else {
                    entry.half_open_probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => false,
        }
    }

    pub fn record_success(&self, tool_id: &str) {
        let mut entry = self.entries.entry(tool_id.to_string()).or_default();
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        entry.half_open_probe_in_flight = false;
    }

    pub fn record_failure(&self, tool_id: &str) {
        let mut entry = self.entries.entry(tool_id.to_string()).or_default();
        entry.half_open_probe_in_flight = false;
        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Utc::now());
                entry.consecutive_failures += 1;
            }
            BreakerState::Closed | BreakerState::Open => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.params.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Utc::now());
                }
            }
        }
    }
}

/// Exponential backoff with full jitter: `delay = min(cap, base *
/// 2^attempt) * uniform(0,1)` (spec §4.8). `jitter_seed` stands in for
/// `uniform(0,1)` without pulling in a `rand` dependency the teacher
/// doesn't carry — callers pass a fresh seed per call (e.g. derived
/// from a monotonic counter or `Uuid::new_v4()`'s low bits).
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32, jitter_seed: u64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jitter = (jitter_seed % 10_000) as f64 / 10_000.0;
    Duration::from_secs_f64(capped * jitter)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AttemptKey {
    task_id: String,
}

#[derive(Debug, Clone, Default)]
struct TaskWindow {
    error_signatures: Vec<String>,
    diff_hashes: Vec<String>,
}

/// Sliding-window oscillation / fix-loop detector (spec §4.8): raises
/// `AP_PLANNING_LOOP` when the same `error_signature` repeats ≥ K times
/// within the last N attempts for a task, or `AP_OSCILLATION` when the
/// same `diff_hash` repeats ≥ K times.
pub struct OscillationDetector {
    window: usize,
    threshold: usize,
    per_task: HashMap<String, TaskWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillationVerdict {
    Clean,
    PlanningLoop,
    Oscillation,
}

impl OscillationDetector {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            per_task: HashMap::new(),
        }
    }

    pub fn error_signature(stderr: &str, exit_code: Option<i32>) -> String {
        let normalized = stderr.trim().lines().take(3).collect::<Vec<_>>().join("\n");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(exit_code.unwrap_or(-1).to_le_bytes());
        hex(hasher.finalize().as_slice())
    }

    pub fn diff_hash(canonical_diff: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_diff.as_bytes());
        hex(hasher.finalize().as_slice())
    }

    /// Record one attempt's signatures and return whether the task
    /// should be aborted (and why).
    pub fn observe(
        &mut self,
        task_id: &str,
        error_signature: Option<&str>,
        diff_hash: Option<&str>,
    ) -> OscillationVerdict {
        let window_size = self.window;
        let entry = self.per_task.entry(task_id.to_string()).or_default();

        if let Some(sig) = error_signature {
            entry.error_signatures.push(sig.to_string());
            if entry.error_signatures.len() > window_size {
                entry.error_signatures.remove(0);
            }
        }
        if let Some(hash) = diff_hash {
            entry.diff_hashes.push(hash.to_string());
            if entry.diff_hashes.len() > window_size {
                entry.diff_hashes.remove(0);
            }
        }

        if let Some(sig) = error_signature
            && count_occurrences(&entry.error_signatures, sig) >= self.threshold
        {
            return OscillationVerdict::PlanningLoop;
        }
        if let Some(hash) = diff_hash
            && count_occurrences(&entry.diff_hashes, hash) >= self.threshold
        {
            return OscillationVerdict::Oscillation;
        }
        OscillationVerdict::Clean
    }
}

fn count_occurrences(haystack: &[String], needle: &str) -> usize {
    haystack.iter().filter(|s| s.as_str() == needle).count()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
