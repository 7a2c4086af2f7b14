//! Run/attempt/patch identifier generation (SPEC_FULL.md §15).
//!
//! Grounded on the teacher's `uuid` dependency (already declared,
//! previously used only for generic ids) — reused here as the entropy
//! source for a lexicographically-sortable ULID-like id instead of a
//! raw v4 UUID, since `Run` ids need to sort by creation order in
//! `list-runs` without a secondary timestamp column.

use sha2::{Digest, Sha256};

const CROCKFORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// 26-char Crockford base32 over a millisecond timestamp (48 bits) plus
/// an 80-bit random payload, the same layout as the ULID spec.
pub fn new_run_id(now_millis: u64) -> String {
    let random = uuid::Uuid::new_v4();
    encode_ulid(now_millis, random.as_bytes())
}

/// Deterministic run id for `deterministic_id_mode` (SPEC_FULL.md §15):
/// `run-{sha256(plan_id)[:16]}`.
pub fn deterministic_run_id(plan_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("run-{}", &hex[..16])
}

pub fn new_attempt_id(run_id: &str, task_id: &str, attempt_index: u32) -> String {
    format!("{run_id}-{task_id}-a{attempt_index}")
}

pub fn new_patch_id(attempt_id: &str) -> String {
    format!("{attempt_id}-patch")
}

fn encode_ulid(timestamp_millis: u64, random: &[u8; 16]) -> String {
    let mut out = String::with_capacity(26);

    // 48-bit timestamp -> 10 chars, 5 bits each.
    for i in (0..10).rev() {
        let shift = i * 5;
        let idx = ((timestamp_millis >> shift) & 0x1F) as usize;
        out.push(CROCKFORD_ALPHABET[idx] as char);
    }

    // 80-bit random payload -> 16 chars, 5 bits each, MSB first.
    let mut bits: u128 = 0;
    for byte in &random[..10] {
        bits = (bits << 8) | (*byte as u128);
    }
    for i in (0..16).rev() {
        let shift = i * 5;
        let idx = ((bits >> shift) & 0x1F) as usize;
        out.push(CROCKFORD_ALPHABET[idx] as char);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_26_chars_of_crockford_alphabet() {
        let id = new_run_id(1_700_000_000_000);
        assert_eq!(id.len(), 26);
        assert!(id.bytes().all(|b| CROCKFORD_ALPHABET.contains(&b)));
    }

    #[test]
    fn later_timestamp_sorts_after_earlier_timestamp() {
        let earlier = new_run_id(1_700_000_000_000);
        let later = new_run_id(1_700_000_001_000);
        assert!(later.as_str() > earlier.as_str());
    }

    #[test]
    fn deterministic_run_id_is_stable_for_same_plan_id() {
        assert_eq!(deterministic_run_id("plan-a"), deterministic_run_id("plan-a"));
        assert_ne!(deterministic_run_id("plan-a"), deterministic_run_id("plan-b"));
        assert!(deterministic_run_id("plan-a").starts_with("run-"));
    }

    #[test]
    fn attempt_and_patch_ids_are_derived_and_stable() {
        let attempt = new_attempt_id("run-1", "T1", 0);
        assert_eq!(attempt, "run-1-T1-a0");
        assert_eq!(new_patch_id(&attempt), "run-1-T1-a0-patch");
    }
}
