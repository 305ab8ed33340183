//! Share submission: the wire-level submit, real proof-of-work
//! validation, duplicate/stale detection, and the worker-pool pipeline
//! that processes submissions off the connection's own task.

pub mod pipeline;
pub mod validator;

use async_trait::async_trait;

pub use pipeline::SharePipeline;
pub use validator::ShareValidator;

/// What a miner sent in `mining.submit`.
#[derive(Debug, Clone)]
pub struct SubmittedShare {
    pub worker_name: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// Outcome of validating one share, handed back to the submitting
/// connection and to any `ShareSink`.
#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub accepted: bool,
    pub difficulty: u64,
    pub is_block: bool,
    pub hash_hex: String,
}

/// Best-effort external accounting for accepted/rejected shares (PPLNS
/// ledgers, per-miner stats, block-found notification). Kept opaque to
/// this crate the same way `job::TemplateProvider` keeps template
/// construction opaque — a pipeline failure here never blocks or
/// rejects the share itself.
#[async_trait]
pub trait ShareSink: Send + Sync + 'static {
    async fn record(&self, worker_name: &str, outcome: &ShareOutcome);
}

/// A `ShareSink` that does nothing, for deployments that wire
/// accounting in some other way (or not at all in tests).
pub struct NullShareSink;

#[async_trait]
impl ShareSink for NullShareSink {
    async fn record(&self, _worker_name: &str, _outcome: &ShareOutcome) {}
}
