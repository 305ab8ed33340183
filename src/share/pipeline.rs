//! Bounded work-queue and worker pool that processes share submissions
//! off the connection's own task, so one slow validation never stalls
//! the socket read loop feeding it.
//!
//! Grounded in the teacher's `ShareProcessor` orchestration shape
//! (`shares/processor.rs`: validate, then notify storage/metrics) but
//! restructured around an explicit mpsc queue and worker tasks, since
//! this crate's concurrency model (§5) calls out a bounded queue with
//! a configurable worker count rather than one task per submission.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::SubmitError;
use crate::job::SharedJobManager;
use crate::metrics;
use crate::share::validator::ShareValidator;
use crate::share::{ShareOutcome, ShareSink, SubmittedShare};

/// A queued submission plus enough connection context to validate it
/// and a reply channel back to the submitting task.
pub struct QueuedShare {
    pub worker_name: String,
    pub extranonce1: String,
    pub difficulty: u64,
    pub share: SubmittedShare,
    pub reply: oneshot::Sender<Result<ShareOutcome, SubmitError>>,
}

/// A simple token bucket: `capacity` tokens, refilled at `refill_per_sec`,
/// used to cap the pool-wide share-processing rate.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            tokens: Mutex::new((capacity as f64, Instant::now())),
        }
    }

    pub async fn try_acquire(&self) -> bool {
        let mut guard = self.tokens.lock().await;
        let (tokens, last) = *guard;
        let elapsed = last.elapsed().as_secs_f64();
        let replenished = (tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if replenished >= 1.0 {
            *guard = (replenished - 1.0, Instant::now());
            true
        } else {
            *guard = (replenished, Instant::now());
            false
        }
    }
}

pub struct PipelineConfig {
    pub queue_size: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

#[derive(Default)]
pub struct PipelineStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub blocks_found: AtomicU64,
    pub queue_depth_high_water: AtomicU32,
}

/// Owns the submission queue; `spawn_workers` drains it across
/// `workers` tasks that each pull up to `batch_size` items (or whatever
/// arrives within `batch_timeout`) per iteration, so duplicate/stale
/// lookups against the shared job manager can be done once per batch
/// rather than once per share where that matters for a given sink.
pub struct SharePipeline {
    tx: mpsc::Sender<QueuedShare>,
    queue_capacity: usize,
    stats: Arc<PipelineStats>,
    rate_limiter: Option<Arc<TokenBucket>>,
}

impl SharePipeline {
    pub fn new<S: ShareSink>(
        cfg: PipelineConfig,
        validator: Arc<ShareValidator>,
        jobs: SharedJobManager,
        sink: Arc<S>,
        rate_limiter: Option<Arc<TokenBucket>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_size);
        let queue_capacity = cfg.queue_size;
        let stats = Arc::new(PipelineStats::default());

        Self::spawn_workers(cfg, rx, validator, jobs, sink, stats.clone());

        Self {
            tx,
            queue_capacity,
            stats,
            rate_limiter,
        }
    }

    /// Number of submissions currently sitting in the queue, waiting
    /// for a worker. Used by the idle-drain check on graceful shutdown.
    pub fn queue_depth(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    fn spawn_workers<S: ShareSink>(
        cfg: PipelineConfig,
        rx: mpsc::Receiver<QueuedShare>,
        validator: Arc<ShareValidator>,
        jobs: SharedJobManager,
        sink: Arc<S>,
        stats: Arc<PipelineStats>,
    ) {
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..cfg.workers.max(1) {
            let rx = rx.clone();
            let validator = validator.clone();
            let jobs = jobs.clone();
            let sink = sink.clone();
            let stats = stats.clone();
            let batch_size = cfg.batch_size.max(1);
            let batch_timeout = cfg.batch_timeout;

            tokio::spawn(async move {
                loop {
                    let batch = Self::collect_batch(&rx, batch_size, batch_timeout).await;
                    if batch.is_empty() {
                        // An empty batch only happens when the first
                        // `recv()` returned `None`: every sender has
                        // dropped and the queue is drained for good.
                        break;
                    }

                    for item in batch {
                        Self::process_one(&validator, &jobs, &sink, &stats, item).await;
                    }
                    tracing::trace!(worker_id, "share batch processed");
                }
            });
        }
    }

    async fn collect_batch(
        rx: &Arc<Mutex<mpsc::Receiver<QueuedShare>>>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Vec<QueuedShare> {
        let mut rx = rx.lock().await;
        let mut batch = Vec::with_capacity(batch_size);

        match rx.recv().await {
            Some(first) => batch.push(first),
            None => return batch,
        }

        let deadline = Instant::now() + batch_timeout;
        while batch.len() < batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                _ => break,
            }
        }

        batch
    }

    async fn process_one<S: ShareSink>(
        validator: &Arc<ShareValidator>,
        jobs: &SharedJobManager,
        sink: &Arc<S>,
        stats: &Arc<PipelineStats>,
        item: QueuedShare,
    ) {
        let jobs_guard = jobs.read().await;
        let result = validator
            .validate(
                &jobs_guard,
                &item.worker_name,
                &item.extranonce1,
                item.difficulty,
                &item.share,
            )
            .await;
        drop(jobs_guard);

        let reply = match &result {
            Ok((hash, difficulty, is_block)) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::inc_miner_share(&item.worker_name, true);
                if *is_block {
                    stats.blocks_found.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_blocks_found();
                }
                let outcome = ShareOutcome {
                    accepted: true,
                    difficulty: *difficulty,
                    is_block: *is_block,
                    hash_hex: hex::encode(hash),
                };
                sink.record(&item.worker_name, &outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::inc_miner_share(&item.worker_name, false);
                let outcome = ShareOutcome {
                    accepted: false,
                    difficulty: item.difficulty,
                    is_block: false,
                    hash_hex: String::new(),
                };
                sink.record(&item.worker_name, &outcome).await;
                Err(*e)
            }
        };

        let _ = item.reply.send(reply);
    }

    /// Enqueue a submission for background processing. If a rate
    /// limiter is configured and exhausted, the share is rejected
    /// immediately without ever reaching the queue.
    pub async fn submit(
        &self,
        worker_name: String,
        extranonce1: String,
        difficulty: u64,
        share: SubmittedShare,
    ) -> Result<ShareOutcome, SubmitError> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire().await {
                return Err(SubmitError::RateLimited);
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedShare {
            worker_name,
            extranonce1,
            difficulty,
            share,
            reply: reply_tx,
        };

        if self.tx.try_send(queued).is_err() {
            return Err(SubmitError::QueueFull);
        }
        let depth = self.queue_depth() as u32;
        self.stats
            .queue_depth_high_water
            .fetch_max(depth, Ordering::Relaxed);

        match reply_rx.await {
            Ok(r) => r,
            Err(_) => Err(SubmitError::Internal("pipeline worker dropped reply".into())),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobManager;
    use crate::share::NullShareSink;
    use tokio::sync::RwLock;

    fn test_cfg() -> PipelineConfig {
        PipelineConfig {
            queue_size: 16,
            workers: 2,
            batch_size: 4,
            batch_timeout: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn stale_job_is_rejected_through_the_pipeline() {
        let jobs: SharedJobManager = Arc::new(RwLock::new(JobManager::new(4)));
        let pipeline = SharePipeline::new(
            test_cfg(),
            Arc::new(ShareValidator::new()),
            jobs,
            Arc::new(NullShareSink),
            None,
        );

        let share = SubmittedShare {
            worker_name: "w".into(),
            job_id: "missing".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: "00000000".into(),
        };

        let err = pipeline
            .submit("w".into(), "aabbccdd".into(), 1, share)
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::StaleJob);
        assert_eq!(pipeline.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rate_limiter_rejects_once_exhausted() {
        let jobs: SharedJobManager = Arc::new(RwLock::new(JobManager::new(4)));
        let limiter = Arc::new(TokenBucket::new(1, 0));
        let pipeline = SharePipeline::new(
            test_cfg(),
            Arc::new(ShareValidator::new()),
            jobs,
            Arc::new(NullShareSink),
            Some(limiter),
        );

        let share = |n: &str| SubmittedShare {
            worker_name: "w".into(),
            job_id: "missing".into(),
            extranonce2: "00000000".into(),
            ntime: "5f000000".into(),
            nonce: n.into(),
        };

        let first = pipeline.submit("w".into(), "aabbccdd".into(), 1, share("1")).await;
        assert_eq!(first.unwrap_err(), SubmitError::StaleJob);

        let second = pipeline.submit("w".into(), "aabbccdd".into(), 1, share("2")).await;
        assert_eq!(second.unwrap_err(), SubmitError::RateLimited);
    }
}
