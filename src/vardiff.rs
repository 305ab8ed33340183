//! Variable-difficulty engine: per-miner difficulty state machine
//! driven by share cadence. Shares are collected into a ring buffer;
//! once enough samples have accumulated and the retarget interval has
//! elapsed, the average inter-share time is compared against the
//! target and difficulty is stepped via a three-tier ratio ladder
//! (double/halve outside 2x, proportional adjustment outside the
//! tolerance band, unchanged within it).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::hardware::HardwareClass;

/// Ring capacity for the per-miner share-timing window.
const MAX_RING_SHARES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct VarDiffConfig {
    pub target_share_time: Duration,
    pub retarget_interval: Duration,
    pub min_shares: usize,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_share_time: Duration::from_secs(10),
            retarget_interval: Duration::from_secs(90),
            min_shares: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ShareRecord {
    timestamp: Instant,
    #[allow(dead_code)]
    was_valid: bool,
    #[allow(dead_code)]
    was_stale: bool,
}

/// Per-miner vardiff state, created on `mining.subscribe` and destroyed
/// on disconnect. One instance per connection; the pool-wide collection
/// (see `connection::manager`) keys these by connection id under a
/// striped lock so 10^5 miners don't contend on one mutex.
#[derive(Debug)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    class: HardwareClass,
    current_difficulty: u64,
    ring: VecDeque<ShareRecord>,
    last_adjustment: Instant,
}

impl VarDiffState {
    pub fn new(class: HardwareClass, cfg: VarDiffConfig) -> Self {
        Self {
            cfg,
            class,
            current_difficulty: class.base_difficulty(),
            ring: VecDeque::with_capacity(MAX_RING_SHARES),
            last_adjustment: Instant::now(),
        }
    }

    pub fn current_difficulty(&self) -> u64 {
        self.current_difficulty
    }

    fn clamp(&self, diff: f64) -> u64 {
        let lo = self.class.min_difficulty();
        let hi = self.class.max_difficulty();
        (diff.round() as i64).clamp(lo as i64, hi as i64) as u64
    }

    /// Record an accepted/rejected share and, if the retarget interval
    /// has elapsed and enough samples are present, compute a new
    /// difficulty. Returns `(current_difficulty, changed)` — a
    /// `changed=true` result obliges the caller to emit
    /// `mining.set_difficulty`.
    pub fn record_share(&mut self, now: Instant, was_valid: bool, was_stale: bool) -> (u64, bool) {
        self.ring.push_back(ShareRecord {
            timestamp: now,
            was_valid,
            was_stale,
        });
        if self.ring.len() > MAX_RING_SHARES {
            self.ring.pop_front();
        }

        if now.saturating_duration_since(self.last_adjustment) < self.cfg.retarget_interval {
            return (self.current_difficulty, false);
        }

        if self.ring.len() < self.cfg.min_shares {
            return (self.current_difficulty, false);
        }

        let first = self.ring.front().unwrap().timestamp;
        let last = self.ring.back().unwrap().timestamp;
        let span = last.saturating_duration_since(first).as_secs_f64();
        let avg_share_time = (span / ((self.ring.len() - 1).max(1) as f64)).max(0.000_001);

        let target = self.cfg.target_share_time.as_secs_f64().max(0.000_001);
        let ratio = avg_share_time / target;

        let new_diff = if ratio < 0.5 {
            self.current_difficulty as f64 * 2.0
        } else if ratio > 2.0 {
            self.current_difficulty as f64 / 2.0
        } else if ratio < 0.8 || ratio > 1.25 {
            let mult = (target / avg_share_time).clamp(0.5, 2.0);
            self.current_difficulty as f64 * mult
        } else {
            self.current_difficulty as f64
        };

        self.last_adjustment = now;
        self.ring.clear();

        let clamped = self.clamp(new_diff);
        if clamped == self.current_difficulty {
            (self.current_difficulty, false)
        } else {
            self.current_difficulty = clamped;
            (self.current_difficulty, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VarDiffConfig {
        VarDiffConfig {
            target_share_time: Duration::from_secs(10),
            retarget_interval: Duration::from_secs(90),
            min_shares: 3,
        }
    }

    #[test]
    fn no_retarget_before_interval_elapses() {
        let mut st = VarDiffState::new(HardwareClass::Gpu, cfg());
        let start = Instant::now();
        let (_, changed) = st.record_share(start, true, false);
        assert!(!changed);
    }

    #[test]
    fn doubles_when_shares_much_faster_than_target() {
        let mut st = VarDiffState::new(HardwareClass::Gpu, cfg());
        let start = Instant::now();
        // 30 shares at 2s spacing => avg 2s vs 10s target => ratio 0.2 < 0.5 => double.
        let mut retargeted = false;
        for i in 0..30u64 {
            let now = start + Duration::from_secs(2 * i) + Duration::from_secs(90);
            let (_, changed) = st.record_share(now, true, false);
            retargeted |= changed;
        }
        assert!(retargeted);
        assert!(st.current_difficulty() > HardwareClass::Gpu.base_difficulty());
    }

    #[test]
    fn halves_when_shares_much_slower_than_target() {
        let mut st = VarDiffState::new(HardwareClass::Gpu, cfg());
        let start = Instant::now();
        let mut retargeted = false;
        for i in 0..4u64 {
            let now = start + Duration::from_secs(25 * i) + Duration::from_secs(90);
            let (_, changed) = st.record_share(now, true, false);
            retargeted |= changed;
        }
        assert!(retargeted);
        assert!(st.current_difficulty() < HardwareClass::Gpu.base_difficulty());
    }

    #[test]
    fn bounds_hold_after_any_sequence() {
        let mut st = VarDiffState::new(HardwareClass::Cpu, cfg());
        let start = Instant::now();
        let mut t = start;
        for i in 0..500u64 {
            t += Duration::from_millis(if i % 2 == 0 { 50 } else { 40_000 });
            let (diff, _) = st.record_share(t, true, false);
            assert!(diff >= HardwareClass::Cpu.min_difficulty());
            assert!(diff <= HardwareClass::Cpu.max_difficulty());
        }
    }

    #[test]
    fn no_change_within_tolerance_band() {
        let mut st = VarDiffState::new(HardwareClass::Gpu, cfg());
        let start = Instant::now();
        // avg share time ~10s matches target exactly => ratio 1.0 => no change.
        for i in 0..4u64 {
            let now = start + Duration::from_secs(10 * i) + Duration::from_secs(90);
            st.record_share(now, true, false);
        }
        let (diff, changed) = st.record_share(
            start + Duration::from_secs(10 * 4) + Duration::from_secs(90),
            true,
            false,
        );
        assert!(!changed);
        assert_eq!(diff, HardwareClass::Gpu.base_difficulty());
    }
}
