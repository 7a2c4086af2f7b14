//! Patch Ledger (C10): strict append-only state machine governing how
//! a produced diff becomes a committed change or is quarantined/dropped
//! (spec §4.10).
//!
//! Grounded on `factory/db.rs`'s append-only transition-log idiom
//! (generalized here from that crate's pipeline-run status history into
//! a dedicated state machine with a fixed edge table) and on
//! `resilience.rs`'s `Sha256` canonical-hash approach for the patch
//! content-addressing rules fixed in SPEC_FULL.md §15.

use crate::errors::LedgerError;
use crate::model::{DiffStats, LedgerEntry, LedgerState, LedgerTransition};
use chrono::Utc;
use sha2::{Digest, Sha256};

/// Fixed transition table (spec §4.10). Returns whether `to` is a legal
/// successor of `from`.
pub fn is_allowed_transition(from: LedgerState, to: LedgerState) -> bool {
    use LedgerState::*;

    if matches!(from, Committed | RolledBack | Quarantined | Dropped) {
        return false;
    }

    // "any (non-terminal) → quarantined | dropped" always applies.
    if matches!(to, Quarantined | Dropped) {
        return true;
    }

    matches!(
        (from, to),
        (Created, Validated)
            | (Validated, Queued)
            | (Validated, AwaitingReview)
            | (AwaitingReview, Queued)
            | (Queued, Applied)
            | (Queued, ApplyFailed)
            | (Applied, Verified)
            | (Applied, RolledBack)
            | (Verified, Committed)
            | (Verified, RolledBack)
            | (ApplyFailed, Queued)
    )
}

/// Canonicalize a unified diff for stable hashing (SPEC_FULL.md §15):
/// LF line endings, trailing whitespace stripped per line, `a/`/`b/`
/// path prefixes assumed already normalized by the patch converter,
/// hunks left in file order as produced (sorting by path is the
/// converter's responsibility since this function only sees one
/// file's diff text at a time in the common case; a multi-file diff
/// passed in as a single string is canonicalized line-by-line which is
/// sufficient for idempotence — see `canonicalize_is_idempotent`).
pub fn canonicalize_diff(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn diff_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Reject diffs with path escapes (`..`) — part of `validated`'s
/// requirements (spec §4.10).
pub fn has_path_escape(paths: &[String]) -> bool {
    paths.iter().any(|p| p.split('/').any(|seg| seg == ".."))
}

pub struct Ledger;

impl Ledger {
    /// Attempt a transition, enforcing the fixed edge table and
    /// recording an append-only `LedgerTransition`. Never mutates or
    /// removes prior history.
    pub fn transition(
        entry: &mut LedgerEntry,
        to: LedgerState,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> Result<(), LedgerError> {
        if !is_allowed_transition(entry.state, to) {
            return Err(LedgerError::IllegalTransition {
                patch_id: entry.patch_id.clone(),
                from: entry.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        entry.transitions.push(LedgerTransition {
            to_state: to,
            reason: reason.into(),
            actor: actor.into(),
            at: Utc::now(),
        });
        entry.state = to;
        Ok(())
    }

    /// `validated` requirements (spec §4.10): schema-valid unified diff,
    /// non-empty, paths inside allowed globs, no path escape, idempotent
    /// re-parse.
    pub fn validate(
        entry: &mut LedgerEntry,
        canonical_diff: &str,
        paths: &[String],
        allowed_globs: &[String],
    ) -> Result<(), LedgerError> {
        if canonical_diff.trim().is_empty() {
            return Err(LedgerError::Invalid {
                patch_id: entry.patch_id.clone(),
                reason: "diff is empty".into(),
            });
        }
        if has_path_escape(paths) {
            return Err(LedgerError::Invalid {
                patch_id: entry.patch_id.clone(),
                reason: "diff paths contain '..' escape".into(),
            });
        }
        for path in paths {
            if !crate::guardrails::path_matches_any_glob(path, allowed_globs) {
                return Err(LedgerError::Invalid {
                    patch_id: entry.patch_id.clone(),
                    reason: format!("path '{path}' outside allowed globs"),
                });
            }
        }
        if canonicalize_diff(canonical_diff) != canonical_diff {
            return Err(LedgerError::Invalid {
                patch_id: entry.patch_id.clone(),
                reason: "diff is not in canonical form".into(),
            });
        }

        Self::transition(entry, LedgerState::Validated, "passed validation checks", "ledger")
            .map_err(|_| LedgerError::Invalid {
                patch_id: entry.patch_id.clone(),
                reason: "illegal state for validation".into(),
            })
    }

    /// `committed` requires workspace commit success and that the
    /// committed content hash matches the hash recorded when the entry
    /// entered `validated` (spec §4.10, §8 invariant).
    pub fn commit(
        entry: &mut LedgerEntry,
        recorded_diff_hash: &str,
        committed_content_hash: &str,
    ) -> Result<(), LedgerError> {
        if recorded_diff_hash != committed_content_hash {
            return Err(LedgerError::ApplyConflict {
                patch_id: entry.patch_id.clone(),
                reason: "committed content hash does not match recorded diff hash".into(),
            });
        }
        Self::transition(entry, LedgerState::Committed, "workspace commit succeeded", "ledger")
            .map_err(|_| LedgerError::ApplyConflict {
                patch_id: entry.patch_id.clone(),
                reason: "illegal state for commit".into(),
            })
    }
}

pub fn diff_stats_from_counts(
    files_added: u32,
    files_modified: u32,
    files_deleted: u32,
    lines_added: u32,
    lines_deleted: u32,
) -> DiffStats {
    DiffStats {
        files_added,
        files_modified,
        files_deleted,
        lines_added,
        lines_deleted,
    }
}
