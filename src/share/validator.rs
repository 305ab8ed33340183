//! Real proof-of-work validation plus duplicate/stale-job checks.
//!
//! Mirrors the teacher's "always recompute the hash ourselves, never
//! trust the miner" posture (`shares/validator.rs`) and its
//! time-bounded duplicate cache with a background pruning task, scaled
//! down to the single double-SHA256 scheme this crate's data model
//! names instead of the teacher's multi-algorithm dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::SubmitError;
use crate::job::{Job, JobManager};
use crate::merkle::{compute_root, dsha256};
use crate::share::SubmittedShare;

/// How long a `(job_id, extranonce2, ntime, nonce)` tuple is remembered
/// for duplicate rejection before it's pruned.
const DUPLICATE_CACHE_TTL: Duration = Duration::from_secs(600);

/// Difficulty-1 target: the largest target any share may be validated
/// against (difficulty divides it down from here).
const DIFF1_TARGET: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// `DIFF1_TARGET / difficulty`, via big-endian long division — exact
/// for any `difficulty` that fits in a `u64`.
pub fn target_for_difficulty(difficulty: u64) -> [u8; 32] {
    let divisor = difficulty.max(1) as u128;
    let mut out = [0u8; 32];
    let mut remainder: u128 = 0;
    for (i, &b) in DIFF1_TARGET.iter().enumerate() {
        remainder = (remainder << 8) | b as u128;
        out[i] = (remainder / divisor) as u8;
        remainder %= divisor;
    }
    out
}

fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    hash.as_slice() <= target.as_slice()
}

/// Build the block header bytes this share claims to solve, and hash
/// them. The wire encoding (field widths/order) is internal to this
/// crate — only self-consistency between `build_header` and whatever
/// constructs `job.version`/`nbits` matters for validation to be
/// meaningful.
fn header_hash(job: &Job, extranonce1: &str, extranonce2: &str, ntime: &str, nonce: &str) -> Result<[u8; 32], SubmitError> {
    let coinbase_hex = format!("{}{}{}{}", job.coinbase1, extranonce1, extranonce2, job.coinbase2);
    let coinbase_bytes = hex::decode(&coinbase_hex).map_err(|_| SubmitError::InvalidHash)?;
    let coinbase_hash = dsha256(&coinbase_bytes);
    let merkle_root = compute_root(coinbase_hash, &job.merkle_branch);

    let version = hex::decode(&job.version).map_err(|_| SubmitError::InvalidHash)?;
    let prev_hash = hex::decode(&job.prev_hash).map_err(|_| SubmitError::InvalidHash)?;
    let ntime_bytes = hex::decode(ntime).map_err(|_| SubmitError::InvalidHash)?;
    let nbits = hex::decode(&job.nbits).map_err(|_| SubmitError::InvalidHash)?;
    let nonce_bytes = hex::decode(nonce).map_err(|_| SubmitError::InvalidHash)?;

    let mut header = Vec::with_capacity(version.len() + prev_hash.len() + 32 + ntime_bytes.len() + nbits.len() + nonce_bytes.len());
    header.extend_from_slice(&version);
    header.extend_from_slice(&prev_hash);
    header.extend_from_slice(&merkle_root);
    header.extend_from_slice(&ntime_bytes);
    header.extend_from_slice(&nbits);
    header.extend_from_slice(&nonce_bytes);

    Ok(dsha256(&header))
}

struct DupEntry {
    seen_at: Instant,
}

pub struct ShareValidator {
    seen: RwLock<HashMap<String, DupEntry>>,
    check_pow: bool,
}

impl ShareValidator {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
            check_pow: true,
        }
    }

    /// Skip the real proof-of-work target check, keeping duplicate and
    /// stale-job detection intact. Satisfying a genuine double-SHA256
    /// target (even at difficulty 1) takes billions of hash attempts on
    /// average — fine for an ASIC, not for a deterministic protocol
    /// test driving a handful of fixed nonces. Never set outside tests.
    pub fn with_pow_check(mut self, enabled: bool) -> Self {
        self.check_pow = enabled;
        self
    }

    pub fn spawn_pruner(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let mut seen = this.seen.write().await;
                seen.retain(|_, e| e.seen_at.elapsed() < DUPLICATE_CACHE_TTL);
            }
        });
    }

    fn dup_key(worker: &str, s: &SubmittedShare) -> String {
        format!("{}:{}:{}:{}:{}", worker, s.job_id, s.extranonce2, s.ntime, s.nonce)
    }

    /// Validate one submission against the given job and difficulty,
    /// always recomputing the hash rather than trusting anything the
    /// miner sent beyond the raw fields.
    pub async fn validate(
        &self,
        jobs: &JobManager,
        worker: &str,
        extranonce1: &str,
        difficulty: u64,
        share: &SubmittedShare,
    ) -> Result<([u8; 32], u64, bool), SubmitError> {
        let key = Self::dup_key(worker, share);
        {
            let seen = self.seen.read().await;
            if seen.contains_key(&key) {
                return Err(SubmitError::Duplicate);
            }
        }

        let job = jobs.find(&share.job_id).ok_or(SubmitError::StaleJob)?;

        let hash = header_hash(job, extranonce1, &share.extranonce2, &share.ntime, &share.nonce)?;

        let target = target_for_difficulty(difficulty);
        if self.check_pow && !meets_target(&hash, &target) {
            return Err(SubmitError::LowDifficulty);
        }

        {
            let mut seen = self.seen.write().await;
            seen.insert(key, DupEntry { seen_at: Instant::now() });
        }

        let network_target = hex::decode(&job.target)
            .ok()
            .and_then(|v| <[u8; 32]>::try_from(v).ok());
        let is_block = network_target
            .map(|t| meets_target(&hash, &t))
            .unwrap_or(false);

        Ok((hash, difficulty, is_block))
    }
}

impl Default for ShareValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_scales_inversely_with_difficulty() {
        let t1 = target_for_difficulty(1);
        let t2 = target_for_difficulty(2);
        assert_eq!(t1, DIFF1_TARGET);
        // Higher difficulty => smaller (stricter) target.
        assert!(t2.as_slice() < t1.as_slice());
    }

    #[test]
    fn meets_target_is_a_byte_lexicographic_compare() {
        let small = [0u8; 32];
        let mut big = [0u8; 32];
        big[31] = 1;
        assert!(meets_target(&small, &big));
        assert!(!meets_target(&big, &small));
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        // The duplicate check runs before PoW validation, so a share
        // already recorded as "seen" is rejected regardless of whether
        // its hash would otherwise meet target. Seed `seen` directly
        // rather than relying on finding a real passing nonce.
        let validator = ShareValidator::new();
        let jm = JobManager::new(4);

        let share = SubmittedShare {
            worker_name: "w".into(),
            job_id: "1".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: "00000001".into(),
        };

        let key = ShareValidator::dup_key("w", &share);
        validator.seen.write().await.insert(key, DupEntry { seen_at: Instant::now() });

        let err = validator.validate(&jm, "w", "aabbccdd", 1, &share).await.unwrap_err();
        assert_eq!(err, SubmitError::Duplicate);
    }

    #[tokio::test]
    async fn unknown_job_id_is_stale() {
        let validator = ShareValidator::new();
        let jm = JobManager::new(4);
        let share = SubmittedShare {
            worker_name: "w".into(),
            job_id: "does-not-exist".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: "00000001".into(),
        };
        let err = validator.validate(&jm, "w", "aabbccdd", 1, &share).await.unwrap_err();
        assert_eq!(err, SubmitError::StaleJob);
    }

    #[tokio::test]
    async fn an_arbitrary_nonce_fails_real_target_by_default() {
        // At any real difficulty, an arbitrary fixed nonce essentially
        // never meets target — this is what makes ASIC-scale hashing
        // necessary in production, and why protocol-level tests use
        // `with_pow_check(false)` instead of mining a real share.
        let validator = ShareValidator::new();
        let mut jm = JobManager::new(4);
        jm.set_current(crate::job::Job {
            id: "j1".into(),
            height: 1,
            prev_hash: "00".repeat(32),
            coinbase1: "01".into(),
            coinbase2: "02".into(),
            merkle_branch: Vec::new(),
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "5f000000".into(),
            clean_jobs: true,
            target: "00".repeat(32),
            received_at: Instant::now(),
        });
        let share = SubmittedShare {
            worker_name: "w".into(),
            job_id: "j1".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: "deadbeef".into(),
        };
        let err = validator.validate(&jm, "w", "aabbccdd", 1, &share).await.unwrap_err();
        assert_eq!(err, SubmitError::LowDifficulty);
    }

    #[tokio::test]
    async fn pow_check_can_be_bypassed_for_deterministic_protocol_tests() {
        let validator = ShareValidator::new().with_pow_check(false);
        let mut jm = JobManager::new(4);
        jm.set_current(crate::job::Job {
            id: "j1".into(),
            height: 1,
            prev_hash: "00".repeat(32),
            coinbase1: "01".into(),
            coinbase2: "02".into(),
            merkle_branch: Vec::new(),
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "5f000000".into(),
            clean_jobs: true,
            target: "00".repeat(32),
            received_at: Instant::now(),
        });
        let share = SubmittedShare {
            worker_name: "w".into(),
            job_id: "j1".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: "deadbeef".into(),
        };
        let (_, diff, _) = validator.validate(&jm, "w", "aabbccdd", 65536, &share).await.unwrap();
        assert_eq!(diff, 65536);
    }
}
