//! Organize plans and plan-hash commitments.
//!
//! A plan is the dry-run output of the `organize_plan` tool: an ordered
//! list of file moves plus the policy that produced them. The approval
//! gate commits to a plan by SHA-256 over the exact bytes stored in the
//! plan job's result row (never a re-serialization), so there is no
//! ambiguity about field ordering between what was reviewed and what is
//! executed.
//!
//! The plan JSON additionally embeds a `plan_hash` field computed over the
//! plan body before the field is added, which lets the UI display a stable
//! fingerprint without fetching approval state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// One proposed move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMove {
    /// Absolute source path.
    pub from: String,
    /// Absolute destination path.
    pub to: String,
}

/// A dry-run file organization plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizePlan {
    /// Policy that generated the plan (`by_ext`, ...).
    pub policy: String,
    /// Number of proposed moves.
    pub count: usize,
    /// The proposed moves, in walk order.
    pub moves: Vec<PlanMove>,
    /// Hex SHA-256 over the plan body, filled by [`OrganizePlan::new`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_hash: String,
}

impl OrganizePlan {
    /// Builds a plan and stamps its body hash.
    #[must_use]
    pub fn new(policy: impl Into<String>, moves: Vec<PlanMove>) -> Self {
        let mut plan = Self {
            policy: policy.into(),
            count: moves.len(),
            moves,
            plan_hash: String::new(),
        };
        plan.plan_hash = plan.body_digest();
        plan
    }

    /// Hex SHA-256 over the serialized plan body (without `plan_hash`).
    #[must_use]
    pub fn body_digest(&self) -> String {
        let body = Self {
            policy: self.policy.clone(),
            count: self.count,
            moves: self.moves.clone(),
            plan_hash: String::new(),
        };
        // `plan_hash` is skipped while empty, so this serializes the body
        // fields only, in declaration order.
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Constant-time equality for hex digest strings.
///
/// Digests are not secrets, but approval verification compares them on a
/// path adjacent to token handling, so the comparison is kept
/// timing-uniform like every other credential check in the server.
#[must_use]
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_moves() -> Vec<PlanMove> {
        vec![
            PlanMove {
                from: "/w/a.txt".into(),
                to: "/w/txt/a.txt".into(),
            },
            PlanMove {
                from: "/w/b.rs".into(),
                to: "/w/rs/b.rs".into(),
            },
        ]
    }

    #[test]
    fn plan_hash_is_stable_for_identical_inputs() {
        let one = OrganizePlan::new("by_ext", sample_moves());
        let two = OrganizePlan::new("by_ext", sample_moves());
        assert_eq!(one.plan_hash, two.plan_hash);
        assert_eq!(one.plan_hash.len(), 64);
    }

    #[test]
    fn plan_hash_changes_with_content() {
        let base = OrganizePlan::new("by_ext", sample_moves());
        let mut other_moves = sample_moves();
        other_moves[0].to = "/w/text/a.txt".into();
        let other = OrganizePlan::new("by_ext", other_moves);
        assert_ne!(base.plan_hash, other.plan_hash);
    }

    #[test]
    fn embedded_hash_does_not_feed_itself() {
        let plan = OrganizePlan::new("by_ext", sample_moves());
        // Recomputing the body digest on the stamped plan must agree with
        // the stamp; the hash field itself is excluded from the hash.
        assert_eq!(plan.body_digest(), plan.plan_hash);
    }

    #[test]
    fn roundtrips_through_json() {
        let plan = OrganizePlan::new("by_ext", sample_moves());
        let bytes = serde_json::to_vec(&plan).unwrap();
        let back: OrganizePlan = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.count, 2);
        assert_eq!(back.plan_hash, plan.plan_hash);
        assert_eq!(back.moves, plan.moves);
    }

    #[test]
    fn digest_comparison_requires_exact_match() {
        let digest = sha256_hex(b"payload");
        assert!(hashes_equal(&digest, &digest));
        assert!(!hashes_equal(&digest, &sha256_hex(b"payload2")));
        assert!(!hashes_equal(&digest, &digest[..63]));
    }
}
