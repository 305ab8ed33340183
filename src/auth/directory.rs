//! The external user/miner directory collaborator.
//!
//! A deployment owns the actual account store (a database, a wallet
//! RPC, a remote API); this crate only ever sees it through
//! `UserDirectory`/`MinerRegistrar`, the same way `crate::job::TemplateProvider`
//! hides block-template construction.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AuthError;

/// One of the roles a `User` may carry. Only `is_active` is actually
/// consulted by the core; `role` is surfaced for callers layering
/// their own policy on top (an admin API, say).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Moderator,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: u64,
    pub username: String,
    pub is_active: bool,
    pub role: Role,
}

/// A named worker owned by a user. Composite uniqueness is
/// `(user_id, worker_name)`; created on first successful authorization
/// for a previously unseen pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miner {
    pub miner_id: u64,
    pub user_id: u64,
    pub worker_name: String,
    pub ip_address: IpAddr,
    pub is_active: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Resolve a username to a `User`. `AuthError::UserNotFound` for an
    /// unrecognized username, `AuthError::Directory` for transport or
    /// backend failures, so callers can tell "no such user" apart from
    /// "couldn't ask".
    async fn lookup_user(&self, username: &str) -> Result<User, AuthError>;

    /// Resolve `(user_id, worker_name)` to a previously registered
    /// `Miner`. `AuthError::UserNotFound` doubles as "no such miner"
    /// here — the caller (`Authenticator`) treats a miss as a signal
    /// to register a new one, not as a hard failure.
    async fn lookup_miner(&self, user_id: u64, worker_name: &str) -> Result<Miner, AuthError>;
}

/// Creates and touches miner rows. Kept as its own trait (rather than
/// folded into `UserDirectory`) since some deployments back reads and
/// writes with different stores (e.g. a read replica vs. the primary).
#[async_trait]
pub trait MinerRegistrar: Send + Sync + 'static {
    /// Create a new `(user_id, worker_name)` row, optionally enriched
    /// with geo-IP or other metadata opaque to this crate.
    async fn register_miner(&self, user_id: u64, worker_name: &str, ip: IpAddr) -> Result<Miner, AuthError>;

    /// Best-effort last-seen bump; failures here must never fail an
    /// otherwise-successful authorization.
    async fn touch_last_seen(&self, miner_id: u64);
}

/// An in-memory directory + registrar, useful as a test double and as
/// the default when no external store is configured.
pub struct InMemoryDirectory {
    users: Mutex<HashMap<String, User>>,
    miners: Mutex<HashMap<(u64, String), Miner>>,
    next_miner_id: AtomicU64,
    delay: Duration,
    user_lookups: AtomicUsize,
    miner_lookups: AtomicUsize,
    touches: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            miners: Mutex::new(HashMap::new()),
            next_miner_id: AtomicU64::new(1),
            delay: Duration::ZERO,
            user_lookups: AtomicUsize::new(0),
            miner_lookups: AtomicUsize::new(0),
            touches: AtomicUsize::new(0),
        }
    }

    /// An `InMemoryDirectory` that sleeps `delay` before each user
    /// lookup, used to exercise single-flight coalescing under
    /// contention.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().unwrap().insert(user.username.clone(), user);
    }

    pub fn user_lookup_count(&self) -> usize {
        self.user_lookups.load(Ordering::SeqCst)
    }

    pub fn miner_lookup_count(&self) -> usize {
        self.miner_lookups.load(Ordering::SeqCst)
    }

    pub fn touch_count(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn lookup_user(&self, username: &str) -> Result<User, AuthError> {
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.users
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or(AuthError::UserNotFound)
    }

    async fn lookup_miner(&self, user_id: u64, worker_name: &str) -> Result<Miner, AuthError> {
        self.miner_lookups.fetch_add(1, Ordering::SeqCst);
        self.miners
            .lock()
            .unwrap()
            .get(&(user_id, worker_name.to_string()))
            .cloned()
            .ok_or(AuthError::UserNotFound)
    }
}

#[async_trait]
impl MinerRegistrar for InMemoryDirectory {
    async fn register_miner(&self, user_id: u64, worker_name: &str, ip: IpAddr) -> Result<Miner, AuthError> {
        let miner_id = self.next_miner_id.fetch_add(1, Ordering::SeqCst);
        let miner = Miner {
            miner_id,
            user_id,
            worker_name: worker_name.to_string(),
            ip_address: ip,
            is_active: true,
        };
        self.miners
            .lock()
            .unwrap()
            .insert((user_id, worker_name.to_string()), miner.clone());
        Ok(miner)
    }

    async fn touch_last_seen(&self, _miner_id: u64) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }
}

/// Placeholder `ip_address` for synthetic tests that don't care which
/// address a miner appears to connect from.
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
