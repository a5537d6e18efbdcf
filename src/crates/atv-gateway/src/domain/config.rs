//! Gateway configuration.
//!
//! [`GatewayConfig`] is a plain struct: the binary fills it from CLI
//! arguments and environment variables, tests build it directly.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when none is given on the command line.
pub const DEFAULT_PORT: u16 = 8765;

/// Sentinel file whose appearance stops the process.
pub const DEFAULT_STOP_FILE: &str = "stopserver";

/// All runtime configuration for the gateway.
///
/// # Example
///
/// ```rust
/// use atv_gateway::domain::GatewayConfig;
///
/// let cfg = GatewayConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 8765);
/// assert!(cfg.filter_tv_devices);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to.  Loopback by default.
    pub bind_addr: SocketAddr,

    /// Path of the sentinel file polled for shutdown.
    pub stop_file: PathBuf,

    /// How often the sentinel file is checked.
    pub stop_poll_interval: Duration,

    /// Only offer devices whose model string carries the TV marker.
    pub filter_tv_devices: bool,

    /// Upper bound on one reconnection attempt's `connect` call.
    pub reconnect_timeout: Duration,
}

impl Default for GatewayConfig {
    /// | Field              | Default            |
    /// |--------------------|--------------------|
    /// | bind_addr          | `127.0.0.1:8765`   |
    /// | stop_file          | `stopserver`       |
    /// | stop_poll_interval | 500 ms             |
    /// | filter_tv_devices  | `true`             |
    /// | reconnect_timeout  | 30 seconds         |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            stop_file: PathBuf::from(DEFAULT_STOP_FILE),
            stop_poll_interval: Duration::from_millis(500),
            filter_tv_devices: true,
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
