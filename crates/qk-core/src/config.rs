//! Configuration parsing for the QUIK bridge.
//!
//! All settings come from a single JSON config file: a `connect` block for
//! the dual-channel connection, an optional `status` block for the readiness
//! machine, and an optional `candles` list consumed by the market-data crate.
//!
//! # Example config
//!
//! ```json
//! {
//!   "connect": {
//!     "host": "127.0.0.1",
//!     "port_mn": 34130,
//!     "port_cb": 34131,
//!     "client_id": "qk-demo",
//!     "ping_interval_ms": 15000
//!   },
//!   "status": { "min_uptime_ms": 15000 },
//!   "candles": ["TQBR:AFLT:1m:[50,500,5000]:12000:10000:true"]
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Dual-channel connection settings.
    pub connect: ConnectConfig,

    /// Readiness-machine settings; defaults apply when absent.
    pub status: Option<StatusConfig>,

    /// Candle data-source entries, `CLASS:SEC:TF:[sizes]:trunc:target:callback`.
    pub candles: Option<Vec<String>>,
}

/// Settings for one dual-channel connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectConfig {
    /// Terminal host.
    pub host: String,

    /// Request (MN) channel port.
    pub port_mn: u16,

    /// Event (CB) channel port.
    pub port_cb: u16,

    /// Client identifier echoed in every request envelope.
    pub client_id: String,

    /// How long the coupled error state holds before a reconnect attempt
    /// (default: 60_000).
    pub error_timeout_ms: Option<u64>,

    /// Keepalive ping period per channel (default: 15_000).
    pub ping_interval_ms: Option<u64>,

    /// Loop sleep when no lines arrived this iteration (default: 10).
    pub idle_sleep_ms: Option<u64>,

    /// Loop sleep while the error state holds (default: 100).
    pub error_sleep_ms: Option<u64>,
}

impl ConnectConfig {
    pub fn error_timeout(&self) -> Duration {
        Duration::from_millis(self.error_timeout_ms.unwrap_or(60_000))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.unwrap_or(15_000))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms.unwrap_or(10))
    }

    pub fn error_sleep(&self) -> Duration {
        Duration::from_millis(self.error_sleep_ms.unwrap_or(100))
    }
}

/// Settings for the readiness machine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusConfig {
    /// Timeout for the subscribe and liveness requests (default: 5_000).
    pub response_timeout_ms: Option<u64>,

    /// Period between liveness polls (default: 5_000).
    pub check_connected_period_ms: Option<u64>,

    /// Retry delay after a failed subscribe attempt (default: 5_000).
    pub failed_subscription_retry_ms: Option<u64>,

    /// Minimum uptime before callers treat the link as ready (default: 0).
    pub min_uptime_ms: Option<u64>,
}

impl StatusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.unwrap_or(5_000))
    }

    pub fn check_connected_period(&self) -> Duration {
        Duration::from_millis(self.check_connected_period_ms.unwrap_or(5_000))
    }

    pub fn failed_subscription_retry(&self) -> Duration {
        Duration::from_millis(self.failed_subscription_retry_ms.unwrap_or(5_000))
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms.unwrap_or(0))
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}
