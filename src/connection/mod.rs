//! Per-connection state and the sharded connection registry.

pub mod manager;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::hardware::HardwareClass;
use crate::hashrate::HashrateWindow;
use crate::vardiff::{VarDiffConfig, VarDiffState};

pub use manager::ConnectionManager;

/// Bounded outbound mailbox capacity. A miner that cannot keep up with
/// its own job/difficulty notifications is disconnected rather than
/// allowed to back up memory indefinitely.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Rolling window (C2) each connection's hashrate is computed over.
const HASHRATE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Authorized,
}

/// The part of a connection's state that only its own handling task
/// mutates, but that the rest of the pool (broadcast, metrics, the
/// idle reaper) still needs to read. Guarded by a `parking_lot::Mutex`
/// rather than split into atomics field-by-field, since most accesses
/// read or write several of these fields together.
#[derive(Debug)]
pub struct SessionState {
    pub conn_state: ConnectionState,
    pub user_agent: Option<String>,
    pub worker_name: Option<String>,
    pub user_id: Option<u64>,
    pub miner_id: Option<u64>,
    pub hardware_class: HardwareClass,
    pub vardiff: VarDiffState,
    pub current_job_id: Option<String>,
}

/// One miner's connection: identity, session state, and the outbound
/// line-writer channel. Held as an `Arc` shared between its shard in
/// `ConnectionManager` and the task reading its socket.
pub struct ManagedConnection {
    pub id: Uuid,
    pub remote_ip: IpAddr,
    pub extranonce1: String,
    pub session: Mutex<SessionState>,
    /// Retargeting parameters vardiff state is (re-)created with —
    /// kept alongside the connection so `mining.subscribe` can
    /// reinitialize `session.vardiff` for the now-known hardware class
    /// without threading config through the dispatcher.
    pub vardiff_cfg: VarDiffConfig,

    pub connected_at: Instant,
    last_activity: AtomicU64,

    pub shares_submitted: AtomicU64,
    pub shares_accepted: AtomicU64,
    pub shares_rejected: AtomicU64,

    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    pub subscribed: AtomicBool,
    pub authorized: AtomicBool,

    /// Difficulty-weighted accepted-share history (C2), used to publish
    /// this connection's contribution to the pool-wide hashrate gauge.
    hashrate: HashrateWindow,

    pub outbound: mpsc::Sender<String>,
    /// Signaled by the keepalive supervisor (C10) or any other owner
    /// that wants this connection's read loop to stop independently of
    /// a normal socket close or the idle reaper (C6).
    close_signal: Notify,
}

impl ManagedConnection {
    pub fn new(
        remote_ip: IpAddr,
        extranonce1: String,
        vardiff_cfg: VarDiffConfig,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let conn = Self {
            id: Uuid::new_v4(),
            remote_ip,
            extranonce1,
            session: Mutex::new(SessionState {
                conn_state: ConnectionState::Connected,
                user_agent: None,
                worker_name: None,
                user_id: None,
                miner_id: None,
                hardware_class: HardwareClass::Unknown,
                vardiff: VarDiffState::new(HardwareClass::Unknown, vardiff_cfg),
                current_job_id: None,
            }),
            vardiff_cfg,
            connected_at: Instant::now(),
            last_activity: AtomicU64::new(0),
            shares_submitted: AtomicU64::new(0),
            shares_accepted: AtomicU64::new(0),
            shares_rejected: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            subscribed: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            hashrate: HashrateWindow::new(HASHRATE_WINDOW),
            outbound: tx,
            close_signal: Notify::new(),
        };
        (conn, rx)
    }

    pub fn touch(&self) {
        self.last_activity
            .store(self.connected_at.elapsed().as_secs(), Ordering::Relaxed);
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        let last = self.last_activity.load(Ordering::Relaxed);
        self.connected_at.elapsed().as_secs().saturating_sub(last) > timeout.as_secs()
    }

    /// Seconds since the last complete frame was read from this
    /// connection's socket. Used by the keepalive supervisor (C10),
    /// independently of the idle reaper's own bookkeeping (C6).
    pub fn idle_secs(&self) -> u64 {
        let last = self.last_activity.load(Ordering::Relaxed);
        self.connected_at.elapsed().as_secs().saturating_sub(last)
    }

    /// Ask the owning read loop to stop. Idempotent and safe to call
    /// before the loop has started waiting on it — `Notify` remembers
    /// one permit.
    pub fn request_close(&self) {
        self.close_signal.notify_one();
    }

    pub async fn closed(&self) {
        self.close_signal.notified().await;
    }

    pub fn record_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a submit outcome. `difficulty` feeds the per-connection
    /// hashrate window (C2) on an accepted share; it's ignored otherwise.
    pub fn record_share(&self, accepted: bool, difficulty: u64) {
        self.shares_submitted.fetch_add(1, Ordering::Relaxed);
        if accepted {
            self.shares_accepted.fetch_add(1, Ordering::Relaxed);
            self.hashrate.add(difficulty, Instant::now());
        } else {
            self.shares_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// This connection's contribution to the pool-wide hashrate gauge,
    /// in H/s, over its rolling window (see `crate::hashrate`).
    pub fn hashrate_hs(&self) -> f64 {
        self.hashrate.hashrate()
    }

    /// Best-effort enqueue: a full outbound queue means the miner is
    /// unresponsive, so the line is dropped rather than blocking the
    /// caller (usually a pool-wide broadcast).
    pub fn try_send_line(&self, line: String) -> bool {
        self.outbound.try_send(line).is_ok()
    }

    pub fn worker_id(&self) -> Option<String> {
        self.session.lock().worker_name.clone()
    }

    pub fn current_difficulty(&self) -> u64 {
        self.session.lock().vardiff.current_difficulty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_shares_feed_the_hashrate_window_but_rejected_ones_dont() {
        let (conn, _rx) = ManagedConnection::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            "aabbccdd".into(),
            VarDiffConfig::default(),
        );
        assert_eq!(conn.hashrate_hs(), 0.0);

        conn.record_share(true, 1_000_000);
        assert!(conn.hashrate_hs() > 0.0);

        let after_accept = conn.hashrate_hs();
        conn.record_share(false, 1_000_000);
        assert_eq!(conn.hashrate_hs(), after_accept);
    }
}
