//! Ambient Prometheus metrics, trimmed to this crate's own concerns
//! (shares, connections, vardiff, jobs) from the teacher's
//! `metrics/prometheus.rs` shape: one `OnceLock`-backed metric per
//! static, a `render()` that gathers them into exposition text.

use std::sync::OnceLock;

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static SHARES_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static CONNECTIONS_REJECTED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static CURRENT_JOB_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static POOL_HASHRATE: OnceLock<Gauge> = OnceLock::new();

static MINER_SHARES: OnceLock<IntCounterVec> = OnceLock::new();

fn shares_accepted() -> &'static IntCounter {
    SHARES_ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn shares_rejected() -> &'static IntCounter {
    SHARES_REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| IntCounter::new("blocks_found_total", "Total block candidates found").unwrap())
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS
        .get_or_init(|| IntCounter::new("vardiff_retargets_total", "Total VarDiff retarget events").unwrap())
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS
        .get_or_init(|| IntCounter::new("job_broadcasts_total", "Total mining.notify broadcasts sent").unwrap())
}

fn connections_rejected() -> &'static IntCounter {
    CONNECTIONS_REJECTED.get_or_init(|| {
        IntCounter::new(
            "connections_rejected_total",
            "Total connection attempts rejected (pool or per-IP cap)",
        )
        .unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| IntGauge::new("active_connections", "Current connected miners").unwrap())
}

fn current_job_height() -> &'static IntGauge {
    CURRENT_JOB_HEIGHT.get_or_init(|| IntGauge::new("current_job_height", "Height of the current job").unwrap())
}

fn pool_hashrate() -> &'static Gauge {
    POOL_HASHRATE.get_or_init(|| Gauge::new("pool_hashrate_hs", "Pool-wide hashrate in H/s, summed per-connection").unwrap())
}

fn miner_shares() -> &'static IntCounterVec {
    MINER_SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("miner_shares_total", "Per-worker share counts by outcome"),
            &["worker", "outcome"],
        )
        .unwrap()
    })
}

pub fn inc_accepted() {
    shares_accepted().inc();
}

pub fn inc_rejected() {
    shares_rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_connections_rejected() {
    connections_rejected().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_current_job_height(height: u64) {
    current_job_height().set(height as i64);
}

pub fn set_pool_hashrate(hs: f64) {
    pool_hashrate().set(hs);
}

pub fn inc_miner_share(worker: &str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    miner_shares().with_label_values(&[worker, outcome]).inc();
}

/// Render every registered metric as Prometheus exposition text.
pub fn render() -> String {
    use prometheus::core::Collector;

    let mut families = Vec::new();
    families.extend(shares_accepted().collect());
    families.extend(shares_rejected().collect());
    families.extend(blocks_found().collect());
    families.extend(vardiff_retargets().collect());
    families.extend(job_broadcasts().collect());
    families.extend(connections_rejected().collect());
    families.extend(active_connections().collect());
    families.extend(current_job_height().collect());
    families.extend(pool_hashrate().collect());
    families.extend(miner_shares().collect());

    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
