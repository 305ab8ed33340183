//! `PoolCoordinator`: wires every component together, runs the accept
//! loop, a per-connection read/write task pair, the job broadcast
//! loop, and the idle-connection reaper.
//!
//! Grounded in the teacher's `StratumServer` (`stratum/server_v2.rs`):
//! a split-socket reader/writer task pair per connection, line-at-a-time
//! JSON-RPC dispatch, and a background interval loop refreshing the
//! current job — generalized here behind `TemplateProvider` instead of
//! the teacher's concrete `BlockTemplateManager`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, MinerRegistrar, UserDirectory};
use crate::config::Config;
use crate::connection::{ConnectionManager, ManagedConnection};
use crate::error::PoolError;
use crate::job::{Job, JobManager, SharedJobManager, TemplateProvider};
use crate::keepalive::KeepaliveSupervisor;
use crate::metrics;
use crate::protocol::messages::{mining_notify, StratumRequest};
use crate::protocol::Dispatcher;
use crate::share::{NullShareSink, ShareSink, SharePipeline};
use crate::share::pipeline::PipelineConfig;
use crate::share::validator::ShareValidator;

/// Regenerate the per-connection extranonce1 this many times on a
/// uniqueness collision before giving up and closing the connection.
const MAX_EXTRANONCE1_ATTEMPTS: u32 = 3;

/// Pool-wide counters exposed for status reporting and tests,
/// independent of the Prometheus metrics (which are process-global).
#[derive(Default)]
pub struct PoolStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub jobs_broadcast: AtomicU64,
    /// Miners that have completed `mining.authorize` successfully.
    pub authorized_miners: AtomicU64,
    pub shares_received: AtomicU64,
    pub shares_accepted: AtomicU64,
    pub shares_rejected: AtomicU64,
    pub shares_stale: AtomicU64,
    pub blocks_found: AtomicU64,
    last_block_time_unix_secs: AtomicU64,
    /// Exponential moving average of end-to-end submit latency, in
    /// microseconds, fixed-point scaled by 1000 for atomic storage.
    submit_latency_ema_micros_x1000: AtomicU64,
    submit_latency_max_micros: AtomicU64,
    /// Pool-wide hashrate (H/s), refreshed by the stats loop every
    /// `STATS_INTERVAL` by summing each connection's own rolling
    /// hashrate window (C2). Stored as a fixed-point `u64` (H/s, whole
    /// units) since `AtomicU64` has no floating-point counterpart.
    hashrate_hs: AtomicU64,
}

impl PoolStats {
    fn record_submit_latency(&self, micros: u64) {
        const ALPHA_NUM: u64 = 1;
        const ALPHA_DEN: u64 = 10;
        let sample = micros * 1000;
        let prev = self.submit_latency_ema_micros_x1000.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            prev + (sample.saturating_sub(prev)) * ALPHA_NUM / ALPHA_DEN
        };
        self.submit_latency_ema_micros_x1000.store(next, Ordering::Relaxed);
        self.submit_latency_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn submit_latency_ema_micros(&self) -> u64 {
        self.submit_latency_ema_micros_x1000.load(Ordering::Relaxed) / 1000
    }

    pub fn submit_latency_max_micros(&self) -> u64 {
        self.submit_latency_max_micros.load(Ordering::Relaxed)
    }

    pub fn hashrate_hs(&self) -> u64 {
        self.hashrate_hs.load(Ordering::Relaxed)
    }

    pub fn last_block_time_unix_secs(&self) -> u64 {
        self.last_block_time_unix_secs.load(Ordering::Relaxed)
    }

    /// Record a found block: bumps the counter and stamps the wall-clock
    /// time it happened, for `last_block_time` in a stats snapshot.
    pub fn record_block_found(&self) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_block_time_unix_secs.store(now, Ordering::Relaxed);
    }
}

/// How often the stats loop re-aggregates pool-wide hashrate (§4.9).
const STATS_INTERVAL: Duration = Duration::from_secs(10);

pub struct PoolCoordinator<D: UserDirectory + MinerRegistrar, T: TemplateProvider, S: ShareSink> {
    config: Config,
    connections: Arc<ConnectionManager>,
    jobs: SharedJobManager,
    dispatcher: Arc<Dispatcher<D>>,
    template_provider: Arc<T>,
    sink: Arc<S>,
    stats: Arc<PoolStats>,
    started: std::sync::atomic::AtomicBool,
    shutdown: CancellationToken,
}

impl<D: UserDirectory + MinerRegistrar, T: TemplateProvider> PoolCoordinator<D, T, NullShareSink> {
    pub fn new(config: Config, directory: Arc<D>, template_provider: Arc<T>) -> Arc<Self> {
        Self::with_sink(config, directory, template_provider, Arc::new(NullShareSink))
    }
}

impl<D: UserDirectory + MinerRegistrar, T: TemplateProvider, S: ShareSink> PoolCoordinator<D, T, S> {
    pub fn with_sink(config: Config, directory: Arc<D>, template_provider: Arc<T>, sink: Arc<S>) -> Arc<Self> {
        let connections = Arc::new(ConnectionManager::new(
            config.shard_count,
            config.max_total_connections,
            config.max_connections_per_ip,
        ));

        let jobs: SharedJobManager = Arc::new(RwLock::new(JobManager::new(16)));

        let authenticator = Arc::new(
            Authenticator::new(directory, config.auth_cache_ttl())
                .with_verify_password(config.verify_password),
        );
        authenticator.spawn_pruner();
        let validator = Arc::new(ShareValidator::new());
        validator.spawn_pruner();

        let pipeline = Arc::new(SharePipeline::new(
            PipelineConfig {
                queue_size: config.share_queue_size,
                workers: config.share_workers,
                batch_size: config.share_batch_size,
                batch_timeout: config.share_batch_timeout(),
            },
            validator,
            jobs.clone(),
            sink.clone(),
            config.max_shares_per_second.map(|n| {
                Arc::new(crate::share::pipeline::TokenBucket::new(n, n))
            }),
        ));

        let stats = Arc::new(PoolStats::default());

        let dispatcher = Arc::new(Dispatcher::with_stats(
            authenticator,
            pipeline,
            jobs.clone(),
            stats.clone(),
            config.submit_reply_timeout(),
        ));

        Arc::new(Self {
            config,
            connections,
            jobs,
            dispatcher,
            template_provider,
            sink,
            stats,
            started: std::sync::atomic::AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Bind the listener and run the accept loop, the job broadcast
    /// loop, and the idle reaper concurrently. Returns once `stop()` is
    /// called (cancelling `self.shutdown`) or the listener itself
    /// fails; individual connection errors never propagate out of this
    /// function.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::StartTwice);
        }

        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| PoolError::BindFailed {
                addr: self.config.listen_address.clone(),
                source: e,
            })?;
        tracing::info!(addr = %self.config.listen_address, "pool listening");

        let this = self.clone();
        tokio::spawn(async move { this.job_broadcast_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.idle_reaper_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.stats_loop().await });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("pool shutting down, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_connection(socket, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        self.drain(Duration::from_secs(10)).await;
        Ok(())
    }

    /// Request a graceful shutdown: stop accepting new connections, let
    /// every per-connection read loop notice `self.shutdown` and close
    /// up, then wait (bounded) for the share pipeline to finish
    /// whatever is already in flight. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown.cancel();
    }

    /// Poll the share pipeline's queue depth until it empties or
    /// `timeout` elapses, so in-flight submissions get a chance to be
    /// validated and replied to before the process exits.
    async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.dispatcher.pipeline.queue_depth() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.dispatcher.pipeline.queue_depth();
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown drain timed out with shares still queued");
        }
    }

    /// Generate an extranonce1 unique among currently-open connections,
    /// retrying a bounded number of times on collision. `None` means
    /// every attempt collided — the connection must be refused.
    fn reserve_extranonce1(&self) -> Option<String> {
        for _ in 0..MAX_EXTRANONCE1_ATTEMPTS {
            let candidate = format!("{:08x}", rand::random::<u32>());
            if self.connections.try_reserve_extranonce1(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    async fn handle_connection(self: &Arc<Self>, socket: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let extranonce1 = match self.reserve_extranonce1() {
            Some(e) => e,
            None => {
                tracing::warn!(%peer_addr, "extranonce1 exhaustion");
                metrics::inc_connections_rejected();
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let (conn, mut outbound_rx) = ManagedConnection::new(
            peer_addr.ip(),
            extranonce1,
            crate::vardiff::VarDiffConfig {
                target_share_time: self.config.target_share_time(),
                retarget_interval: self.config.retarget_interval(),
                min_shares: self.config.min_shares_for_retarget,
            },
        );
        let conn = Arc::new(conn);

        if self.connections.add_connection(conn.clone()).is_err() {
            metrics::inc_connections_rejected();
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::inc_connections();

        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);

        let writer_task = {
            let conn = conn.clone();
            let write_timeout = self.config.write_timeout();
            tokio::spawn(async move {
                while let Some(line) = outbound_rx.recv().await {
                    let write = async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.flush().await
                    };
                    match tokio::time::timeout(write_timeout, write).await {
                        Ok(Ok(())) => conn.record_bytes_sent(line.len() as u64),
                        _ => break,
                    }
                }
            })
        };

        // Ticks independently of the read loop's own timeout so a
        // connection that keeps its socket open but stops speaking
        // Stratum (no subscribe/submit activity) is still reaped.
        let keepalive = {
            let conn_for_timer = conn.clone();
            let conn_for_timeout = conn.clone();
            KeepaliveSupervisor::spawn(
                self.config.keepalive_interval(),
                self.config.keepalive_max_missed,
                move || conn_for_timer.idle_secs(),
                move || conn_for_timeout.request_close(),
            )
        };

        let handshake_timeout = self.config.handshake_timeout();
        let read_timeout = self.config.read_timeout();
        let mut line = String::new();
        let mut first_read = true;

        loop {
            line.clear();
            let timeout = if first_read { handshake_timeout } else { read_timeout.max(Duration::from_secs(1)) };

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(%peer_addr, "connection closed for pool shutdown");
                    break;
                }
                _ = conn.closed() => {
                    tracing::debug!(%peer_addr, "connection closed by keepalive supervisor");
                    break;
                }
                result = tokio::time::timeout(timeout, reader.read_line(&mut line)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            first_read = false;
                            conn.touch();
                            conn.record_bytes_received(n as u64);
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            self.process_line(&conn, trimmed).await;
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(error = %e, %peer_addr, "read error");
                            break;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "connection idle timeout");
                            break;
                        }
                    }
                }
            }
        }

        keepalive.stop();
        writer_task.abort();
        self.connections.remove_connection(conn.id);
        metrics::dec_connections();
    }

    async fn process_line(&self, conn: &Arc<ManagedConnection>, line: &str) {
        let start = std::time::Instant::now();
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request line");
                // Best-effort id: a line that doesn't even parse as an
                // object has no id to echo back, so reply with null
                // rather than dropping the line silently.
                let resp = crate::protocol::messages::StratumResponse::failure(
                    serde_json::Value::Null,
                    crate::protocol::messages::StratumError::new(20, "parse error"),
                );
                conn.try_send_line(resp.to_line());
                return;
            }
        };
        let is_submit = request.method == "mining.submit";

        let response = self.dispatcher.dispatch(conn, request).await;

        if is_submit {
            self.stats.record_submit_latency(start.elapsed().as_micros() as u64);
            self.stats.shares_received.fetch_add(1, Ordering::Relaxed);
            match &response.error {
                None => {
                    self.stats.shares_accepted.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_accepted();
                }
                Some(e) => {
                    self.stats.shares_rejected.fetch_add(1, Ordering::Relaxed);
                    if e.code == 21 {
                        self.stats.shares_stale.fetch_add(1, Ordering::Relaxed);
                    }
                    metrics::inc_rejected();
                }
            }
        }

        conn.try_send_line(response.to_line());
    }

    async fn job_broadcast_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.job_update_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let job_id = { self.jobs.write().await.next_job_id() };
            match self.template_provider.next_job(job_id).await {
                Ok(job) => self.broadcast_job(job).await,
                Err(e) => tracing::warn!(error = %e, "template fetch failed"),
            }
        }
    }

    async fn broadcast_job(&self, job: Job) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.set_current(job.clone());
        }
        let notification = mining_notify(&job);
        let sent = self.connections.broadcast_to_authorized(&notification.to_line());
        self.stats.jobs_broadcast.fetch_add(1, Ordering::Relaxed);
        metrics::inc_job_broadcasts();
        metrics::set_current_job_height(job.height);
        tracing::debug!(sent, job_id = %job.id, "job broadcast");
    }

    /// Every `STATS_INTERVAL`, sum each live connection's own rolling
    /// hashrate window (C2) into one pool-wide gauge, the way §4.9
    /// describes as equivalent to summing `class.baseline *
    /// difficulty_factor` across every tracked vardiff state.
    async fn stats_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let total: f64 = self
                .connections
                .snapshot()
                .iter()
                .map(|c| c.hashrate_hs())
                .sum();
            self.stats.hashrate_hs.store(total as u64, Ordering::Relaxed);
            metrics::set_pool_hashrate(total);
        }
    }

    async fn idle_reaper_loop(self: Arc<Self>) {
        let timeout = self.config.idle_timeout();
        let mut interval = tokio::time::interval(timeout.min(Duration::from_secs(30)).max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let reaped = self.connections.reap_idle(timeout);
            for conn in &reaped {
                conn.try_send_line(String::new());
                conn.request_close();
                metrics::dec_connections();
            }
            if !reaped.is_empty() {
                tracing::debug!(count = reaped.len(), "reaped idle connections");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ema_converges_toward_repeated_samples() {
        let stats = PoolStats::default();
        for _ in 0..200 {
            stats.record_submit_latency(1000);
        }
        let ema = stats.submit_latency_ema_micros();
        assert!(ema > 900 && ema < 1100, "ema={ema}");
    }

    #[test]
    fn latency_ema_starts_at_first_sample() {
        let stats = PoolStats::default();
        stats.record_submit_latency(500);
        assert_eq!(stats.submit_latency_ema_micros(), 500);
    }

    #[test]
    fn latency_max_tracks_largest_sample_seen() {
        let stats = PoolStats::default();
        stats.record_submit_latency(200);
        stats.record_submit_latency(900);
        stats.record_submit_latency(300);
        assert_eq!(stats.submit_latency_max_micros(), 900);
    }

    #[test]
    fn block_found_bumps_counter_and_stamps_time() {
        let stats = PoolStats::default();
        assert_eq!(stats.last_block_time_unix_secs(), 0);
        stats.record_block_found();
        assert_eq!(stats.blocks_found.load(Ordering::Relaxed), 1);
        assert!(stats.last_block_time_unix_secs() > 0);
    }
}
