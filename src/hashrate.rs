//! Rolling hashrate window: a thread-safe, time-bounded accumulator
//! converting difficulty-weighted shares into H/s.
//!
//! Expired entries are pruned inline on every `add`/`hashrate` call
//! rather than by a background sweep, so there is no task to leak if
//! a miner's window stops being queried.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Silent sanity ceiling for computed hashrate. Miscomputed difficulty
/// upstream is common; clamping here prevents a single bad sample from
/// blowing up downstream dashboards.
const SANITY_CEILING_HS: f64 = 100_000_000_000_000.0; // 100 TH/s

pub struct HashrateWindow {
    window: Duration,
    entries: Mutex<VecDeque<(u64, Instant)>>,
}

impl HashrateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, entries: &mut VecDeque<(u64, Instant)>, now: Instant) {
        while let Some(&(_, ts)) = entries.front() {
            if now.saturating_duration_since(ts) > self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// O(1) amortized: prunes expired entries, then records `difficulty`
    /// at `timestamp`.
    pub fn add(&self, difficulty: u64, timestamp: Instant) {
        let mut entries = self.entries.lock();
        self.prune(&mut entries, timestamp);
        entries.push_back((difficulty, timestamp));
    }

    /// `sum(difficulty) * 2^32 / window.seconds()`, clamped at a 100 TH/s
    /// sanity ceiling (see module doc). The clamp is intentional and
    /// silent — a documented policy choice, not a bug.
    pub fn hashrate(&self) -> f64 {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);

        let sum: u128 = entries.iter().map(|&(d, _)| d as u128).sum();
        let secs = self.window.as_secs_f64().max(0.000_001);
        let hs = (sum as f64) * 4_294_967_296.0 / secs;
        hs.min(SANITY_CEILING_HS)
    }

    pub fn share_count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);
        entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Format a H/s value as SI-prefixed text, e.g. `"1.50 GH/s"` (base 1000).
pub fn format_hashrate(hs: f64) -> String {
    const UNITS: [&str; 6] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    if hs <= 0.0 {
        return "0.00 H/s".to_string();
    }
    let mut value = hs;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_count_is_monotonic_until_expiry() {
        let win = HashrateWindow::new(Duration::from_secs(60));
        let t0 = Instant::now();
        win.add(100, t0);
        win.add(100, t0 + Duration::from_secs(1));
        assert_eq!(win.share_count(), 2);
    }

    #[test]
    fn expired_entries_are_pruned() {
        let win = HashrateWindow::new(Duration::from_millis(10));
        let t0 = Instant::now();
        win.add(100, t0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(win.share_count(), 0);
    }

    #[test]
    fn hashrate_clamps_at_sanity_ceiling() {
        let win = HashrateWindow::new(Duration::from_secs(1));
        win.add(u64::MAX, Instant::now());
        assert_eq!(win.hashrate(), SANITY_CEILING_HS);
    }

    #[test]
    fn formatter_uses_si_k_bases() {
        assert_eq!(format_hashrate(1_500_000_000.0), "1.50 GH/s");
        assert_eq!(format_hashrate(0.0), "0.00 H/s");
    }
}
