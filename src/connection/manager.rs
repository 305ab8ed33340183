//! Sharded, lock-striped registry of `ManagedConnection`s.
//!
//! The teacher's session/connection maps (`stratum/server_v2.rs`,
//! `session.rs`) use one global `RwLock<HashMap<..>>` guarding every
//! connection. At pool scale (10^5 miners) a single lock serializes
//! every subscribe, submit, and broadcast; this manager stripes
//! connections across `shard_count` independently-locked shards keyed
//! by an FNV-1a hash of the connection id, so unrelated miners never
//! contend on the same lock.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::ManagedConnection;
use crate::error::ConnectionError;
use crate::vardiff::VarDiffConfig;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

type Shard = RwLock<HashMap<Uuid, Arc<ManagedConnection>>>;

pub struct ConnectionManager {
    shards: Vec<Shard>,
    shard_mask: u64,
    ip_counts: parking_lot::Mutex<HashMap<IpAddr, usize>>,
    /// Tracks extranonce1 values currently assigned to open connections
    /// so `mining.subscribe` can guarantee uniqueness (spec §4.8):
    /// regenerate on collision, give up after a bounded number of tries.
    extranonce1s: parking_lot::Mutex<HashSet<String>>,
    max_total_connections: usize,
    max_connections_per_ip: usize,
    total_connections: AtomicUsize,
}

impl ConnectionManager {
    /// `shard_count` is rounded up to the next power of two so shard
    /// selection can mask instead of mod.
    pub fn new(shard_count: usize, max_total_connections: usize, max_connections_per_ip: usize) -> Self {
        let shard_count = shard_count.next_power_of_two().max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            shard_mask: (shard_count - 1) as u64,
            ip_counts: parking_lot::Mutex::new(HashMap::new()),
            extranonce1s: parking_lot::Mutex::new(HashSet::new()),
            max_total_connections,
            max_connections_per_ip,
            total_connections: AtomicUsize::new(0),
        }
    }

    fn shard_for(&self, id: Uuid) -> &Shard {
        let h = fnv1a(id.as_bytes());
        &self.shards[(h & self.shard_mask) as usize]
    }

    /// Claim `candidate` as a connection's extranonce1 if no currently
    /// open connection already holds it. Must be paired with
    /// `release_extranonce1` when the connection closes.
    pub fn try_reserve_extranonce1(&self, candidate: &str) -> bool {
        self.extranonce1s.lock().insert(candidate.to_string())
    }

    fn release_extranonce1(&self, value: &str) {
        self.extranonce1s.lock().remove(value);
    }

    pub fn len(&self) -> usize {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new connection, enforcing the pool-wide and per-IP
    /// connection caps. On success the connection is inserted into its
    /// shard and the per-IP counter is incremented atomically with the
    /// insert (both under the per-IP lock) so a racing caller can never
    /// observe a count that doesn't match the registry.
    pub fn add_connection(
        &self,
        conn: Arc<ManagedConnection>,
    ) -> Result<(), ConnectionError> {
        if self.total_connections.load(Ordering::Relaxed) >= self.max_total_connections {
            return Err(ConnectionError::MaxConnectionsReached);
        }

        {
            let mut ip_counts = self.ip_counts.lock();
            let count = ip_counts.entry(conn.remote_ip).or_insert(0);
            if *count >= self.max_connections_per_ip {
                return Err(ConnectionError::IpLimitReached);
            }
            *count += 1;
        }

        let shard = self.shard_for(conn.id);
        shard.write().insert(conn.id, conn);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a connection by id, decrementing the per-IP and
    /// pool-wide counters. Returns the removed connection (if present)
    /// so the caller can run any close-notification logic — callbacks
    /// run after this function returns, never while a shard lock is held.
    pub fn remove_connection(&self, id: Uuid) -> Option<Arc<ManagedConnection>> {
        let shard = self.shard_for(id);
        let removed = shard.write().remove(&id)?;

        let mut ip_counts = self.ip_counts.lock();
        if let Some(count) = ip_counts.get_mut(&removed.remote_ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ip_counts.remove(&removed.remote_ip);
            }
        }
        drop(ip_counts);

        self.release_extranonce1(&removed.extranonce1);
        self.total_connections.fetch_sub(1, Ordering::Relaxed);
        Some(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ManagedConnection>> {
        self.shard_for(id).read().get(&id).cloned()
    }

    /// Snapshot every connection across all shards. Each shard is
    /// locked and released in turn, so the result is never a single
    /// atomic point-in-time view of the whole pool — acceptable for
    /// broadcast and reaping, which are inherently best-effort.
    pub fn snapshot(&self) -> Vec<Arc<ManagedConnection>> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }

    /// Send `line` to every connection's outbound queue, regardless of
    /// authorization state. Used for connection-level notices.
    pub fn broadcast(&self, line: &str) -> usize {
        let mut sent = 0;
        for conn in self.snapshot() {
            if conn.try_send_line(line.to_string()) {
                sent += 1;
            }
        }
        sent
    }

    /// Send `line` only to authorized connections — the normal path
    /// for `mining.notify` job broadcasts.
    pub fn broadcast_to_authorized(&self, line: &str) -> usize {
        let mut sent = 0;
        for conn in self.snapshot() {
            if conn.authorized.load(Ordering::Relaxed) && conn.try_send_line(line.to_string()) {
                sent += 1;
            }
        }
        sent
    }

    /// Remove every connection idle for longer than `timeout`.
    /// Candidates are collected under each shard's lock, but the locks
    /// are released before `remove_connection` (and any caller-side
    /// close callback) runs, so reaping a large shard never blocks
    /// unrelated subscribe/submit traffic on that shard for long.
    pub fn reap_idle(&self, timeout: Duration) -> Vec<Arc<ManagedConnection>> {
        let mut idle_ids = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            idle_ids.extend(
                guard
                    .values()
                    .filter(|c| c.is_idle(timeout))
                    .map(|c| c.id),
            );
        }

        idle_ids
            .into_iter()
            .filter_map(|id| self.remove_connection(id))
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    fn new_conn(ip_addr: IpAddr) -> Arc<ManagedConnection> {
        let (conn, _rx) = ManagedConnection::new(ip_addr, "00000000".into(), VarDiffConfig::default());
        Arc::new(conn)
    }

    #[test]
    fn add_and_remove_round_trips() {
        let mgr = ConnectionManager::new(8, 1000, 10);
        let conn = new_conn(ip(1));
        let id = conn.id;
        mgr.add_connection(conn).unwrap();
        assert_eq!(mgr.len(), 1);
        assert!(mgr.get(id).is_some());

        let removed = mgr.remove_connection(id).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(mgr.len(), 0);
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn shard_count_rounds_up_to_power_of_two() {
        let mgr = ConnectionManager::new(5, 1000, 10);
        assert_eq!(mgr.shards.len(), 8);
    }

    #[test]
    fn per_ip_cap_is_enforced() {
        let mgr = ConnectionManager::new(4, 1000, 2);
        mgr.add_connection(new_conn(ip(9))).unwrap();
        mgr.add_connection(new_conn(ip(9))).unwrap();
        let err = mgr.add_connection(new_conn(ip(9))).unwrap_err();
        assert_eq!(err, ConnectionError::IpLimitReached);
    }

    #[test]
    fn total_cap_is_enforced() {
        let mgr = ConnectionManager::new(4, 2, 100);
        mgr.add_connection(new_conn(ip(1))).unwrap();
        mgr.add_connection(new_conn(ip(2))).unwrap();
        let err = mgr.add_connection(new_conn(ip(3))).unwrap_err();
        assert_eq!(err, ConnectionError::MaxConnectionsReached);
    }

    #[test]
    fn removing_last_connection_for_an_ip_clears_its_counter_entry() {
        let mgr = ConnectionManager::new(4, 1000, 1);
        let conn = new_conn(ip(5));
        let id = conn.id;
        mgr.add_connection(conn).unwrap();
        mgr.remove_connection(id).unwrap();
        // A fresh connection from the same IP should be allowed again.
        mgr.add_connection(new_conn(ip(5))).unwrap();
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn extranonce1_reservation_prevents_duplicate_claims() {
        let mgr = ConnectionManager::new(4, 1000, 100);
        assert!(mgr.try_reserve_extranonce1("aabbccdd"));
        assert!(!mgr.try_reserve_extranonce1("aabbccdd"));
        assert!(mgr.try_reserve_extranonce1("11223344"));
    }

    #[test]
    fn removing_a_connection_frees_its_extranonce1() {
        let mgr = ConnectionManager::new(4, 1000, 100);
        let (conn, _rx) = ManagedConnection::new(ip(3), "aabbccdd".into(), VarDiffConfig::default());
        let conn = Arc::new(conn);
        let id = conn.id;
        mgr.add_connection(conn).unwrap();
        mgr.remove_connection(id).unwrap();
        assert!(mgr.try_reserve_extranonce1("aabbccdd"));
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let mgr = ConnectionManager::new(4, 1000, 100);
        for n in 0..10u8 {
            mgr.add_connection(new_conn(ip(n))).unwrap();
        }
        let sent = mgr.broadcast("hello\n");
        assert_eq!(sent, 10);
    }
}
