//! Protocol tunables. Defaults match the wire constants; a TOML file
//! and environment variables can override them.
//! File: ~/.config/courier/config.toml or /etc/courier/config.toml.
//! Env overrides: COURIER_FRAGMENT_SIZE, COURIER_WINDOW_SIZE.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Payload bytes per fragment (default 1468; one datagram stays
    /// near the host MTU).
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,
    /// Max unacknowledged in-flight fragments per transfer.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Max concurrent transfers per connection.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
    /// Handshake SYN resend interval, milliseconds.
    #[serde(default = "default_conn_resend_ms")]
    pub conn_resend_ms: u64,
    /// Packet time-to-live, milliseconds. Stale handshake packets are
    /// dropped; in-flight fragments older than this are retransmitted.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Transfer-init resend and keep-alive heartbeat interval,
    /// milliseconds.
    #[serde(default = "default_resend_ms")]
    pub resend_ms: u64,
    /// Peer-silence window, milliseconds. Silence beyond this kills a
    /// connection or transfer.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

fn default_fragment_size() -> usize {
    1468
}
fn default_window_size() -> usize {
    15
}
fn default_max_transfers() -> usize {
    16
}
fn default_conn_resend_ms() -> u64 {
    1_000
}
fn default_ttl_ms() -> u64 {
    4_000
}
fn default_resend_ms() -> u64 {
    5_000
}
fn default_keepalive_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: default_fragment_size(),
            window_size: default_window_size(),
            max_transfers: default_max_transfers(),
            conn_resend_ms: default_conn_resend_ms(),
            ttl_ms: default_ttl_ms(),
            resend_ms: default_resend_ms(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}

impl Config {
    /// The timer set connections and transfers run on.
    pub fn timing(&self) -> Timing {
        Timing {
            conn_resend: Duration::from_millis(self.conn_resend_ms),
            ttl: Duration::from_millis(self.ttl_ms),
            resend: Duration::from_millis(self.resend_ms),
            keepalive: Duration::from_millis(self.keepalive_ms),
        }
    }
}

/// Resolved protocol timers.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub conn_resend: Duration,
    pub ttl: Duration,
    pub resend: Duration,
    pub keepalive: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Config::default().timing()
    }
}

/// Load config: defaults, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("COURIER_FRAGMENT_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.fragment_size = n;
        }
    }
    if let Ok(s) = std::env::var("COURIER_WINDOW_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.window_size = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/courier/config.toml"));
    }
    out.push(PathBuf::from("/etc/courier/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), %e, "bad config file"),
                }
            }
            break;
        }
    }
    None
}
