//! Mining jobs and the external template-construction collaborator.
//!
//! Block template assembly (selecting transactions, building the
//! coinbase, computing a reward split) is opaque to this crate — a
//! deployment supplies it through `TemplateProvider`, mirroring the
//! way the teacher's job pipeline fetches an externally-built template
//! (`jobs.rs`'s `fetch_template`) rather than constructing one inline.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::merkle::Hash32;

/// One unit of work broadcast to miners via `mining.notify`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub height: u64,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<Hash32>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    /// Tells miners to discard all previous jobs (a new block arrived)
    /// rather than just preferring this one.
    pub clean_jobs: bool,
    pub target: String,
    pub received_at: Instant,
}

/// Constructs `Job`s from whatever backs block templates in a given
/// deployment (a node RPC, an external template service).
#[async_trait]
pub trait TemplateProvider: Send + Sync + 'static {
    /// Fetch the current best-known template, already merklized into a
    /// ready-to-broadcast `Job`. `clean_jobs` is set by the caller
    /// (`JobManager`), not the provider, since only the manager knows
    /// whether this is a genuinely new block versus a refreshed
    /// coinbase value on the same block.
    async fn next_job(&self, job_id: String) -> anyhow::Result<Job>;
}

/// Tracks the current job plus however many prior jobs are still valid
/// for share submission (until the next `clean_jobs` job arrives).
pub struct JobManager {
    current: Option<Job>,
    recent: Vec<Job>,
    max_recent: usize,
    next_id: u64,
}

impl JobManager {
    pub fn new(max_recent: usize) -> Self {
        Self {
            current: None,
            recent: Vec::new(),
            max_recent,
            next_id: 0,
        }
    }

    pub fn next_job_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:x}", self.next_id)
    }

    /// Install a newly-fetched job as current. If it's a clean-jobs
    /// job, every previously-tracked job becomes stale immediately;
    /// otherwise the old current job is retained in the recent-jobs
    /// list (callers may still submit shares against it) up to
    /// `max_recent` entries.
    pub fn set_current(&mut self, job: Job) {
        if job.clean_jobs {
            self.recent.clear();
        } else if let Some(prev) = self.current.take() {
            self.recent.push(prev);
            if self.recent.len() > self.max_recent {
                self.recent.remove(0);
            }
        }
        self.current = Some(job);
    }

    pub fn current(&self) -> Option<&Job> {
        self.current.as_ref()
    }

    /// Find a job by id among current + recent (a share may reference
    /// either). Returns `None` if it has aged out — the caller should
    /// treat that as a stale-job submit error.
    pub fn find(&self, job_id: &str) -> Option<&Job> {
        if let Some(c) = &self.current {
            if c.id == job_id {
                return Some(c);
            }
        }
        self.recent.iter().find(|j| j.id == job_id)
    }
}

/// Convenience wrapper so `JobManager` can be shared across the
/// connection-handling tasks and the job-broadcast loop.
pub type SharedJobManager = Arc<tokio::sync::RwLock<JobManager>>;

/// A `TemplateProvider` that hands out a fixed, synthetic template with
/// an incrementing height. Meant for running this crate standalone
/// (demos, smoke tests) where no real node/template service is wired
/// in — never a substitute for one in production.
pub struct StaticTemplateProvider {
    base_height: u64,
    counter: std::sync::atomic::AtomicU64,
}

impl StaticTemplateProvider {
    pub fn new(base_height: u64) -> Self {
        Self {
            base_height,
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Default for StaticTemplateProvider {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl TemplateProvider for StaticTemplateProvider {
    async fn next_job(&self, job_id: String) -> anyhow::Result<Job> {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tx_hashes = Vec::new();
        let merkle_branch = crate::merkle::build_branch(&tx_hashes);
        Ok(Job {
            id: job_id,
            height: self.base_height + n,
            prev_hash: "00".repeat(32),
            coinbase1: "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20".to_string(),
            coinbase2: "ffffffff0100f2052a010000001976a914000000000000000000000000000000000000000088ac00000000".to_string(),
            merkle_branch,
            version: "20000000".to_string(),
            nbits: "1d00ffff".to_string(),
            ntime: format!("{:08x}", chrono::Utc::now().timestamp() as u32),
            clean_jobs: true,
            target: "00000000ffff0000000000000000000000000000000000000000000000000000".to_string(),
            received_at: Instant::now(),
        })
    }
}
