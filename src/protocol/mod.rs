//! Request dispatch: the Connected → Subscribed → Authorized state
//! machine and the handlers for `mining.subscribe`, `mining.authorize`,
//! `mining.submit`, and `mining.extranonce.subscribe`.

pub mod messages;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::{Authenticator, MinerRegistrar, UserDirectory};
use crate::connection::{ConnectionState, ManagedConnection};
use crate::hardware::HardwareClass;
use crate::job::SharedJobManager;
use crate::share::{SharePipeline, SubmittedShare};

use messages::{mining_notify, mining_set_difficulty, StratumError, StratumRequest, StratumResponse};

/// Miners always send a 4-byte `extranonce2`, which this pool
/// concatenates after the per-connection `extranonce1` when building
/// the coinbase.
pub const EXTRANONCE2_SIZE: usize = 4;

pub struct Dispatcher<D: UserDirectory + MinerRegistrar> {
    pub authenticator: Arc<Authenticator<D>>,
    pub pipeline: Arc<SharePipeline>,
    pub jobs: SharedJobManager,
    stats: Arc<crate::pool::PoolStats>,
    submit_reply_timeout: std::time::Duration,
}

impl<D: UserDirectory + MinerRegistrar> Dispatcher<D> {
    pub fn new(
        authenticator: Arc<Authenticator<D>>,
        pipeline: Arc<SharePipeline>,
        jobs: SharedJobManager,
    ) -> Self {
        Self::with_stats(
            authenticator,
            pipeline,
            jobs,
            Arc::new(crate::pool::PoolStats::default()),
            std::time::Duration::from_secs(5),
        )
    }

    pub fn with_stats(
        authenticator: Arc<Authenticator<D>>,
        pipeline: Arc<SharePipeline>,
        jobs: SharedJobManager,
        stats: Arc<crate::pool::PoolStats>,
        submit_reply_timeout: std::time::Duration,
    ) -> Self {
        Self {
            authenticator,
            pipeline,
            jobs,
            stats,
            submit_reply_timeout,
        }
    }

    /// Dispatch one parsed request against a connection's state,
    /// returning the response line to write back (never `None` for a
    /// request with a non-null id; `mining.submit`'s happy path and
    /// every error path both produce a response).
    pub async fn dispatch(
        &self,
        conn: &Arc<ManagedConnection>,
        req: StratumRequest,
    ) -> StratumResponse {
        let id = req.id.clone().unwrap_or(Value::Null);
        match req.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(conn, id, &req.params).await,
            "mining.authorize" => self.handle_authorize(conn, id, &req.params).await,
            "mining.submit" => self.handle_submit(conn, id, &req.params).await,
            "mining.extranonce.subscribe" => {
                StratumResponse::success(id, Value::Bool(true))
            }
            other => StratumResponse::failure(
                id,
                StratumError::new(20, format!("unknown method: {other}")),
            ),
        }
    }

    async fn handle_subscribe(
        &self,
        conn: &Arc<ManagedConnection>,
        id: Value,
        params: &Value,
    ) -> StratumResponse {
        let user_agent = params
            .as_array()
            .and_then(|p| p.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let initial_difficulty = {
            let mut session = conn.session.lock();
            session.conn_state = ConnectionState::Subscribed;
            session.user_agent = user_agent.clone();
            let class = HardwareClass::classify(user_agent.as_deref().unwrap_or(""), None);
            session.hardware_class = class;
            session.vardiff = crate::vardiff::VarDiffState::new(class, conn.vardiff_cfg);
            session.vardiff.current_difficulty()
        };
        conn.subscribed.store(true, Ordering::Relaxed);

        // Initial difficulty and (if one already exists) the current job
        // are pushed immediately, ahead of the subscribe response itself
        // hitting the wire, so the miner never waits a full broadcast
        // interval for its first job.
        conn.try_send_line(mining_set_difficulty(initial_difficulty).to_line());
        if let Some(job) = self.jobs.read().await.current() {
            conn.try_send_line(mining_notify(job).to_line());
        }

        let subscription_id = conn.id.to_string();
        StratumResponse::success(
            id,
            json!([
                [["mining.set_difficulty", subscription_id], ["mining.notify", subscription_id]],
                conn.extranonce1,
                EXTRANONCE2_SIZE,
            ]),
        )
    }

    async fn handle_authorize(
        &self,
        conn: &Arc<ManagedConnection>,
        id: Value,
        params: &Value,
    ) -> StratumResponse {
        if !conn.subscribed.load(Ordering::Relaxed) {
            return StratumResponse::failure(id, StratumError::new(25, "not subscribed"));
        }

        let username = match params.as_array().and_then(|p| p.first()).and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return StratumResponse::failure(id, StratumError::new(20, "missing username")),
        };

        let class = conn.session.lock().hardware_class;
        match self.authenticator.authenticate(username, conn.remote_ip, class).await {
            Ok(identity) => {
                {
                    let mut session = conn.session.lock();
                    session.conn_state = ConnectionState::Authorized;
                    session.user_id = Some(identity.user.user_id);
                    session.miner_id = Some(identity.miner.miner_id);
                    session.worker_name = Some(identity.worker.full());
                }
                conn.authorized.store(true, Ordering::Relaxed);
                self.stats.authorized_miners.fetch_add(1, Ordering::Relaxed);
                StratumResponse::success(id, Value::Bool(true))
            }
            Err(_) => StratumResponse::success(id, Value::Bool(false)),
        }
    }

    async fn handle_submit(
        &self,
        conn: &Arc<ManagedConnection>,
        id: Value,
        params: &Value,
    ) -> StratumResponse {
        if !conn.authorized.load(Ordering::Relaxed) {
            return StratumResponse::failure(id, StratumError::new(24, "unauthorized"));
        }

        let arr = match params.as_array() {
            Some(a) if a.len() >= 5 => a,
            _ => return StratumResponse::failure(id, StratumError::new(20, "malformed submit params")),
        };

        let as_str = |v: &Value| v.as_str().unwrap_or("").to_string();
        let share = SubmittedShare {
            worker_name: as_str(&arr[0]),
            job_id: as_str(&arr[1]),
            extranonce2: as_str(&arr[2]),
            ntime: as_str(&arr[3]),
            nonce: as_str(&arr[4]),
        };

        let (worker_name, extranonce1, difficulty) = {
            let session = conn.session.lock();
            (
                session.worker_name.clone().unwrap_or_default(),
                conn.extranonce1.clone(),
                session.vardiff.current_difficulty(),
            )
        };

        let submit_result = match tokio::time::timeout(
            self.submit_reply_timeout,
            self.pipeline.submit(worker_name, extranonce1, difficulty, share),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(crate::error::SubmitError::Timeout),
        };

        match submit_result {
            Ok(outcome) => {
                conn.record_share(true, difficulty);
                let now = std::time::Instant::now();
                let (new_diff, changed) = {
                    let mut session = conn.session.lock();
                    session.vardiff.record_share(now, true, false)
                };
                if changed {
                    crate::metrics::inc_vardiff_retarget();
                    conn.try_send_line(mining_set_difficulty(new_diff).to_line());
                }
                if outcome.is_block {
                    self.stats.record_block_found();
                    tracing::info!(worker = %conn.worker_id().unwrap_or_default(), "block candidate found");
                }
                StratumResponse::success(id, Value::Bool(true))
            }
            Err(e) => {
                conn.record_share(false, difficulty);
                StratumResponse::failure(id, StratumError::from_submit_error(e))
            }
        }
    }
}
