//! Pool-wide configuration, loaded from an optional JSON file with
//! environment-variable overrides.

use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: usize,

    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_share_workers")]
    pub share_workers: usize,

    #[serde(default = "default_share_queue_size")]
    pub share_queue_size: usize,

    #[serde(default = "default_share_batch_size")]
    pub share_batch_size: usize,

    #[serde(default = "default_share_batch_timeout_ms")]
    pub share_batch_timeout_ms: u64,

    #[serde(default = "default_target_share_time_secs")]
    pub target_share_time_secs: u64,

    #[serde(default = "default_retarget_interval_secs")]
    pub retarget_interval_secs: u64,

    #[serde(default = "default_min_shares_for_retarget")]
    pub min_shares_for_retarget: usize,

    #[serde(default = "default_job_update_interval_secs")]
    pub job_update_interval_secs: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// How long `mining.submit` waits on the share pipeline's reply
    /// channel before giving up and answering with error 20 (§4.7, §4.8).
    #[serde(default = "default_submit_reply_timeout_secs")]
    pub submit_reply_timeout_secs: u64,

    /// Optional global token-bucket rate limit (shares/sec). `None` disables it.
    #[serde(default)]
    pub max_shares_per_second: Option<u32>,

    /// Password verification is advisory-only by default: most pools
    /// treat the password field as a worker hint (e.g. `x`), not a secret.
    #[serde(default)]
    pub verify_password: bool,

    #[serde(default = "default_auth_cache_ttl_secs")]
    pub auth_cache_ttl_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_max_missed")]
    pub keepalive_max_missed: u32,

    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"`
    /// or `"stratum_pool_core=debug,info"`, used when `RUST_LOG` isn't
    /// set in the environment. `RUST_LOG` always takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Reserved for an operator-facing `/metrics` HTTP listener; this
    /// crate only exposes `metrics::render()` as a library call, so a
    /// deployment wires its own listener at this address and the field
    /// is otherwise unused here.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:3333".to_string()
}
fn default_shard_count() -> usize {
    64
}
fn default_max_total_connections() -> usize {
    100_000
}
fn default_max_connections_per_ip() -> usize {
    100
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_share_workers() -> usize {
    8
}
fn default_share_queue_size() -> usize {
    100_000
}
fn default_share_batch_size() -> usize {
    100
}
fn default_share_batch_timeout_ms() -> u64 {
    10
}
fn default_target_share_time_secs() -> u64 {
    10
}
fn default_retarget_interval_secs() -> u64 {
    90
}
fn default_min_shares_for_retarget() -> usize {
    3
}
fn default_job_update_interval_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    5
}
fn default_write_timeout_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_submit_reply_timeout_secs() -> u64 {
    5
}
fn default_auth_cache_ttl_secs() -> u64 {
    60
}
fn default_keepalive_interval_secs() -> u64 {
    30
}
fn default_keepalive_max_missed() -> u32 {
    3
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            shard_count: default_shard_count(),
            max_total_connections: default_max_total_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            idle_timeout_secs: default_idle_timeout_secs(),
            share_workers: default_share_workers(),
            share_queue_size: default_share_queue_size(),
            share_batch_size: default_share_batch_size(),
            share_batch_timeout_ms: default_share_batch_timeout_ms(),
            target_share_time_secs: default_target_share_time_secs(),
            retarget_interval_secs: default_retarget_interval_secs(),
            min_shares_for_retarget: default_min_shares_for_retarget(),
            job_update_interval_secs: default_job_update_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            submit_reply_timeout_secs: default_submit_reply_timeout_secs(),
            max_shares_per_second: None,
            verify_password: false,
            auth_cache_ttl_secs: default_auth_cache_ttl_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max_missed: default_keepalive_max_missed(),
            log_filter: default_log_filter(),
            metrics_listen: None,
        }
    }
}

impl Config {
    /// Load from `pool_config.json` in the working directory (if present),
    /// then apply `STRATUM_POOL_*` environment variable overrides.
    pub fn load() -> Self {
        let mut cfg = if let Ok(txt) = std::fs::read_to_string("pool_config.json") {
            match serde_json::from_str::<Config>(&txt) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("warning: failed to parse pool_config.json: {e}, using defaults");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        if let Ok(v) = std::env::var("STRATUM_POOL_LISTEN") {
            cfg.listen_address = v;
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_SHARD_COUNT") {
            if let Ok(n) = v.parse() {
                cfg.shard_count = n;
            }
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_total_connections = n;
            }
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_MAX_CONNECTIONS_PER_IP") {
            if let Ok(n) = v.parse() {
                cfg.max_connections_per_ip = n;
            }
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_SHARE_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.share_workers = n;
            }
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_VERIFY_PASSWORD") {
            cfg.verify_password = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("STRATUM_POOL_LOG_FILTER") {
            cfg.log_filter = v;
        }

        cfg.shard_count = cfg.shard_count.next_power_of_two().max(1);
        cfg
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
    pub fn submit_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_reply_timeout_secs)
    }
    pub fn share_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.share_batch_timeout_ms)
    }
    pub fn target_share_time(&self) -> Duration {
        Duration::from_secs(self.target_share_time_secs)
    }
    pub fn retarget_interval(&self) -> Duration {
        Duration::from_secs(self.retarget_interval_secs)
    }
    pub fn job_update_interval(&self) -> Duration {
        Duration::from_secs(self.job_update_interval_secs)
    }
    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_cache_ttl_secs)
    }
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_address, "0.0.0.0:3333");
        assert_eq!(cfg.shard_count, 64);
        assert_eq!(cfg.max_total_connections, 100_000);
        assert_eq!(cfg.max_connections_per_ip, 100);
        assert_eq!(cfg.share_workers, 8);
        assert_eq!(cfg.share_queue_size, 100_000);
        assert_eq!(cfg.share_batch_size, 100);
        assert_eq!(cfg.min_shares_for_retarget, 3);
        assert_eq!(cfg.log_filter, "info");
        assert!(cfg.metrics_listen.is_none());
    }

    #[test]
    fn shard_count_rounds_up_to_power_of_two() {
        std::env::set_var("STRATUM_POOL_SHARD_COUNT", "50");
        let cfg = Config::load();
        assert_eq!(cfg.shard_count, 64);
        std::env::remove_var("STRATUM_POOL_SHARD_COUNT");
    }
}
