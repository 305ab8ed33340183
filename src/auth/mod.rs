//! Authentication and worker-name parsing for `mining.authorize`.
//!
//! The directory itself (where users/miners actually live) is opaque
//! to this crate — `UserDirectory`/`MinerRegistrar` are external
//! collaborator traits, implemented by whatever persistence layer a
//! deployment wires in. This module owns only the parsing, caching,
//! find-or-register flow, and single-flight coalescing around those
//! lookups.

pub mod directory;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};

pub use directory::{InMemoryDirectory, Miner, MinerRegistrar, Role, User, UserDirectory};

use crate::error::AuthError;
use crate::hardware::HardwareClass;

/// A worker identity, parsed from the `username` field of
/// `mining.authorize` as `username[.worker]`. `worker` always carries
/// a value — `"default"` when the caller supplied none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerName {
    pub username: String,
    pub worker: String,
}

impl WorkerName {
    /// Combined identifier used for display and logging, e.g. `"alice.rig1"`.
    pub fn full(&self) -> String {
        format!("{}.{}", self.username, self.worker)
    }
}

/// Split `username.worker` on the first `.`.
///
/// - Strip whitespace; empty input is rejected.
/// - First `.` splits: left = username (must be non-empty), right = worker.
/// - An empty or missing right side defaults the worker to `"default"`.
/// - Subsequent dots stay in the worker segment (`"a.b.c"` -> `("a", "b.c")`).
pub fn parse_worker_name(raw: &str) -> Result<WorkerName, AuthError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AuthError::InvalidWorkerName);
    }

    match raw.split_once('.') {
        Some((username, rest)) => {
            if username.is_empty() {
                return Err(AuthError::InvalidWorkerName);
            }
            let worker = if rest.is_empty() { "default".to_string() } else { rest.to_string() };
            Ok(WorkerName {
                username: username.to_string(),
                worker,
            })
        }
        None => Ok(WorkerName {
            username: raw.to_string(),
            worker: "default".to_string(),
        }),
    }
}

/// What an authorized connection is allowed to do. `min_difficulty`/
/// `max_difficulty` echo the hardware class's vardiff clamp bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_submit_shares: bool,
    pub can_receive_jobs: bool,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
}

impl Permissions {
    fn for_class(class: HardwareClass) -> Self {
        Self {
            can_submit_shares: true,
            can_receive_jobs: true,
            min_difficulty: class.min_difficulty(),
            max_difficulty: class.max_difficulty(),
        }
    }
}

/// Outcome of a successful `authenticate()` call.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub user: User,
    pub miner: Miner,
    pub worker: WorkerName,
    pub is_new_miner: bool,
    pub permissions: Permissions,
}

struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
}

/// TTL-cached, single-flight-coalesced front end to a `UserDirectory`
/// + `MinerRegistrar`.
///
/// Two independent TTL caches back this: one keyed by `username` (the
/// `User` lookup), one by `(user_id, worker_name)` (the `Miner`
/// lookup/registration). Concurrent `authenticate()` calls racing on
/// the same key wait on the first caller's result instead of issuing
/// duplicate directory calls. A cache hit never extends its own TTL.
pub struct Authenticator<D: UserDirectory + MinerRegistrar> {
    directory: Arc<D>,
    ttl: Duration,
    by_username: RwLock<HashMap<String, CacheEntry<User>>>,
    by_miner_key: RwLock<HashMap<(u64, String), CacheEntry<Miner>>>,
    user_flights: RwLock<HashMap<String, Arc<Notify>>>,
    miner_flights: RwLock<HashMap<(u64, String), Arc<Notify>>>,
    verify_password: bool,
}

impl<D: UserDirectory + MinerRegistrar> Authenticator<D> {
    pub fn new(directory: Arc<D>, ttl: Duration) -> Self {
        Self {
            directory,
            ttl,
            by_username: RwLock::new(HashMap::new()),
            by_miner_key: RwLock::new(HashMap::new()),
            user_flights: RwLock::new(HashMap::new()),
            miner_flights: RwLock::new(HashMap::new()),
            verify_password: false,
        }
    }

    /// Password verification is advisory-only in the source system;
    /// this flips it on as a policy knob once a deployment wires a
    /// real check into its `User` type. Default is `false`.
    pub fn with_verify_password(mut self, verify: bool) -> Self {
        self.verify_password = verify;
        self
    }

    /// Periodically drop entries past their TTL from both caches, so a
    /// directory that stops seeing a user/miner doesn't hold its last
    /// answer in memory forever. Mirrors `ShareValidator::spawn_pruner`.
    pub fn spawn_pruner(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.ttl);
            loop {
                interval.tick().await;
                let ttl = this.ttl;
                this.by_username.write().await.retain(|_, e| e.cached_at.elapsed() < ttl);
                this.by_miner_key.write().await.retain(|_, e| e.cached_at.elapsed() < ttl);
            }
        });
    }

    async fn cached_user(&self, username: &str) -> Option<User> {
        let cache = self.by_username.read().await;
        let entry = cache.get(username)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.value.clone())
    }

    async fn fetch_user(&self, username: &str) -> Result<User, AuthError> {
        if let Some(u) = self.cached_user(username).await {
            return Ok(u);
        }

        let (notify, is_leader) = {
            let mut flights = self.user_flights.write().await;
            match flights.get(username) {
                Some(n) => (n.clone(), false),
                None => {
                    let n = Arc::new(Notify::new());
                    flights.insert(username.to_string(), n.clone());
                    (n, true)
                }
            }
        };

        if !is_leader {
            notify.notified().await;
            return self.cached_user(username).await.ok_or(AuthError::UserNotFound);
        }

        let result = self.directory.lookup_user(username).await;
        if let Ok(user) = &result {
            self.by_username.write().await.insert(
                username.to_string(),
                CacheEntry {
                    value: user.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        self.user_flights.write().await.remove(username);
        notify.notify_waiters();
        result
    }

    async fn cached_miner(&self, key: &(u64, String)) -> Option<Miner> {
        let cache = self.by_miner_key.read().await;
        let entry = cache.get(key)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.value.clone())
    }

    /// Find-or-register a miner for `(user_id, worker_name)`. Returns
    /// the miner plus whether it was just created.
    async fn fetch_or_register_miner(
        &self,
        user_id: u64,
        worker_name: &str,
        ip: IpAddr,
    ) -> Result<(Miner, bool), AuthError> {
        let key = (user_id, worker_name.to_string());
        if let Some(m) = self.cached_miner(&key).await {
            return Ok((m, false));
        }

        let (notify, is_leader) = {
            let mut flights = self.miner_flights.write().await;
            match flights.get(&key) {
                Some(n) => (n.clone(), false),
                None => {
                    let n = Arc::new(Notify::new());
                    flights.insert(key.clone(), n.clone());
                    (n, true)
                }
            }
        };

        if !is_leader {
            notify.notified().await;
            return self
                .cached_miner(&key)
                .await
                .map(|m| (m, false))
                .ok_or(AuthError::Directory("miner lookup coalescing failed".into()));
        }

        let (miner, is_new) = match self.directory.lookup_miner(user_id, worker_name).await {
            Ok(m) => (m, false),
            Err(AuthError::UserNotFound) => {
                let m = self.directory.register_miner(user_id, worker_name, ip).await?;
                (m, true)
            }
            Err(e) => {
                self.miner_flights.write().await.remove(&key);
                notify.notify_waiters();
                return Err(e);
            }
        };

        self.by_miner_key.write().await.insert(
            key.clone(),
            CacheEntry {
                value: miner.clone(),
                cached_at: Instant::now(),
            },
        );
        self.miner_flights.write().await.remove(&key);
        notify.notify_waiters();

        if !is_new {
            // Best-effort; failures never reject an otherwise-valid authorization.
            self.directory.touch_last_seen(miner.miner_id).await;
        }

        Ok((miner, is_new))
    }

    /// Full `mining.authorize` flow: parse the worker name, resolve the
    /// user, find-or-register the miner, and reject disabled users.
    /// `class` feeds the returned permissions' difficulty clamp bounds.
    pub async fn authenticate(
        &self,
        raw_worker: &str,
        ip: IpAddr,
        class: HardwareClass,
    ) -> Result<AuthResult, AuthError> {
        let worker = parse_worker_name(raw_worker)?;
        let user = self.fetch_user(&worker.username).await?;

        if !user.is_active {
            return Err(AuthError::UserDisabled);
        }

        let (miner, is_new_miner) = self
            .fetch_or_register_miner(user.user_id, &worker.worker, ip)
            .await?;

        Ok(AuthResult {
            user,
            miner,
            worker,
            is_new_miner,
            permissions: Permissions::for_class(class),
        })
    }

    pub fn verify_password_enabled(&self) -> bool {
        self.verify_password
    }

    /// Drop any cached entries for `username`, forcing the next
    /// `authenticate()` call to re-resolve through the directory.
    pub async fn invalidate_user(&self, username: &str) {
        self.by_username.write().await.remove(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))
    }

    #[test]
    fn parses_username_and_worker() {
        let w = parse_worker_name("alice.rig1").unwrap();
        assert_eq!(w.username, "alice");
        assert_eq!(w.worker, "rig1");
        assert_eq!(w.full(), "alice.rig1");
    }

    #[test]
    fn parses_username_without_worker_as_default() {
        let w = parse_worker_name("alice").unwrap();
        assert_eq!(w.username, "alice");
        assert_eq!(w.worker, "default");
    }

    #[test]
    fn trailing_dot_yields_default_worker() {
        let w = parse_worker_name("alice.").unwrap();
        assert_eq!(w.username, "alice");
        assert_eq!(w.worker, "default");
    }

    #[test]
    fn rejects_empty_username() {
        assert!(parse_worker_name("").is_err());
        assert!(parse_worker_name(".rig1").is_err());
    }

    #[test]
    fn subsequent_dots_stay_in_worker_segment() {
        let w = parse_worker_name("a.b.c").unwrap();
        assert_eq!(w.username, "a");
        assert_eq!(w.worker, "b.c");
    }

    #[tokio::test]
    async fn authenticate_registers_a_new_miner_on_first_sight() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.insert_user(User {
            user_id: 1,
            username: "alice".into(),
            is_active: true,
            role: Role::User,
        });
        let auth = Authenticator::new(dir.clone(), Duration::from_secs(60));

        let result = auth.authenticate("alice.rig1", ip(), HardwareClass::Gpu).await.unwrap();
        assert_eq!(result.user.user_id, 1);
        assert_eq!(result.miner.worker_name, "rig1");
        assert!(result.is_new_miner);
        assert_eq!(result.permissions.min_difficulty, HardwareClass::Gpu.min_difficulty());

        // Same (user, worker) the second time is not new and hits the cache.
        let second = auth.authenticate("alice.rig1", ip(), HardwareClass::Gpu).await.unwrap();
        assert!(!second.is_new_miner);
        assert_eq!(second.miner.miner_id, result.miner.miner_id);
        assert_eq!(dir.user_lookup_count(), 1);
    }

    #[tokio::test]
    async fn distinct_workers_for_one_user_register_distinct_miners() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.insert_user(User {
            user_id: 7,
            username: "bob".into(),
            is_active: true,
            role: Role::User,
        });
        let auth = Authenticator::new(dir, Duration::from_secs(60));

        let rig1 = auth.authenticate("bob.rig1", ip(), HardwareClass::Asic).await.unwrap();
        let rig2 = auth.authenticate("bob.rig2", ip(), HardwareClass::Asic).await.unwrap();
        assert_ne!(rig1.miner.miner_id, rig2.miner.miner_id);
    }

    #[tokio::test]
    async fn disabled_user_is_rejected() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.insert_user(User {
            user_id: 2,
            username: "banned".into(),
            is_active: false,
            role: Role::User,
        });
        let auth = Authenticator::new(dir, Duration::from_secs(60));
        let err = auth.authenticate("banned.rig1", ip(), HardwareClass::Unknown).await.unwrap_err();
        assert_eq!(err, AuthError::UserDisabled);
    }

    #[tokio::test]
    async fn unknown_username_is_not_found() {
        let dir = Arc::new(InMemoryDirectory::new());
        let auth = Authenticator::new(dir, Duration::from_secs(60));
        let err = auth.authenticate("ghost.rig1", ip(), HardwareClass::Unknown).await.unwrap_err();
        assert_eq!(err, AuthError::UserNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_evicts_entries_past_ttl() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.insert_user(User {
            user_id: 4,
            username: "carol".into(),
            is_active: true,
            role: Role::User,
        });
        let auth = Arc::new(Authenticator::new(dir.clone(), Duration::from_millis(50)));
        auth.authenticate("carol.rig1", ip(), HardwareClass::Cpu).await.unwrap();
        assert!(auth.by_username.read().await.contains_key("carol"));

        auth.spawn_pruner();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
        }

        assert!(!auth.by_username.read().await.contains_key("carol"));
    }

    #[tokio::test]
    async fn concurrent_lookups_for_same_username_coalesce() {
        let dir = Arc::new(InMemoryDirectory::with_delay(Duration::from_millis(20)));
        dir.insert_user(User {
            user_id: 3,
            username: "busy".into(),
            is_active: true,
            role: Role::User,
        });
        let auth = Arc::new(Authenticator::new(dir.clone(), Duration::from_secs(60)));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let r = auth.authenticate("busy.rig1", ip(), HardwareClass::Cpu).await;
                calls.fetch_add(1, Ordering::SeqCst);
                r
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(dir.user_lookup_count(), 1);
    }
}
