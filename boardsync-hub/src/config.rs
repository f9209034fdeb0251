//! Hub configuration.

use std::time::Duration;

/// Configuration for a hub instance.
///
/// Defaults match the deployed timings: transport keepalive 25s/60s,
/// presence TTL 30s, edit-lock lease 120s, 2s backing-store probe.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: String,
    /// Backing store connection URL.
    pub redis_url: String,
    /// Skip the backing-store probe and run single-instance.
    pub force_fallback: bool,
    /// If set, reject handshakes whose Origin header differs.
    pub allowed_origin: Option<String>,
    /// Presence records expire this long after the last heartbeat.
    pub presence_ttl: Duration,
    /// Edit locks expire this long after acquire/refresh.
    pub lock_ttl: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Interval between transport-level pings.
    pub ping_interval: Duration,
    /// Connections silent this long are dropped.
    pub idle_timeout: Duration,
    /// Bounded window for the startup backing-store probe.
    pub probe_timeout: Duration,
    /// Fan-out channel capacity (messages buffered per connection).
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            force_fallback: false,
            allowed_origin: None,
            presence_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
            broadcast_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Load overrides from the environment: `BIND_ADDR`, `REDIS_URL`,
    /// `FORCE_FALLBACK`, `ALLOWED_ORIGIN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(flag) = std::env::var("FORCE_FALLBACK") {
            config.force_fallback = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(origin) = std::env::var("ALLOWED_ORIGIN") {
            config.allowed_origin = Some(origin);
        }
        config
    }
}
