//! ATV WebSocket gateway entry point.
//!
//! Exposes one streaming device to WebSocket clients as a JSON command/event
//! protocol: discovery, two-phase pairing, connecting, remote keys, and
//! on-screen keyboard text.
//!
//! # Usage
//!
//! ```text
//! atv-gateway [PORT] [OPTIONS]
//!
//! Arguments:
//!   [PORT]                     WebSocket port [default: 8765]
//!
//! Options:
//!   --bind <ADDR>              Listener address [default: 127.0.0.1]
//!   --stop-file <PATH>         Sentinel file that stops the process [default: stopserver]
//!   --stop-poll-ms <MS>        Sentinel poll interval [default: 500]
//!   --filter-devices <BOOL>    Only offer TV-class devices [default: true]
//!   --devices <PATH>           TOML device inventory for the simulated provider
//!   --reconnect-timeout <SECS> Bound on one reconnection attempt [default: 30]
//! ```
//!
//! `-h`, `--help`, `-?` or `/?` as the first argument prints this usage and
//! then starts the gateway on the default port.
//!
//! # Environment variable overrides
//!
//! | Variable                | Option                |
//! |-------------------------|-----------------------|
//! | `ATV_WS_BIND`           | `--bind`              |
//! | `ATV_STOP_FILE`         | `--stop-file`         |
//! | `ATV_DEVICE_FILTER`     | `--filter-devices`    |
//! | `ATV_DEVICES`           | `--devices`           |
//! | `ATV_RECONNECT_TIMEOUT` | `--reconnect-timeout` |
//!
//! # Shutdown
//!
//! The process stops on a `quit` command, on Ctrl+C, or when the stop file
//! appears.  All three clear the shared `running` flag; the accept loop
//! notices within 200 ms and the gateway task closes the device connection.

use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use atv_core::{SimulatedInventory, SimulatedProvider};
use clap::{ArgAction, CommandFactory, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use atv_gateway::application::Gateway;
use atv_gateway::domain::config::{DEFAULT_PORT, DEFAULT_STOP_FILE};
use atv_gateway::domain::GatewayConfig;
use atv_gateway::infrastructure::{clear_stop_file, run_server, watch_stop_file};

/// First-argument tokens that print usage without stopping startup.
const HELP_TOKENS: [&str; 4] = ["-h", "--help", "-?", "/?"];

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket gateway for a single ATV device session.
#[derive(Debug, Parser)]
#[command(
    name = "atv-gateway",
    about = "WebSocket gateway exposing one ATV device as a JSON command/event protocol",
    version
)]
struct Cli {
    /// TCP port for the WebSocket listener.
    port: Option<u16>,

    /// IP address to bind the WebSocket listener to.
    #[arg(long, default_value = "127.0.0.1", env = "ATV_WS_BIND")]
    bind: String,

    /// Sentinel file; creating it stops the gateway.
    #[arg(long, default_value = DEFAULT_STOP_FILE, env = "ATV_STOP_FILE")]
    stop_file: PathBuf,

    /// How often the sentinel file is checked, in milliseconds.
    #[arg(long, default_value_t = 500)]
    stop_poll_ms: u64,

    /// Only offer devices whose model string marks them as TVs.
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "ATV_DEVICE_FILTER"
    )]
    filter_devices: bool,

    /// TOML device inventory for the simulated provider.
    #[arg(long, env = "ATV_DEVICES")]
    devices: Option<PathBuf>,

    /// Upper bound on one reconnection attempt, in seconds.
    #[arg(long, default_value_t = 30, env = "ATV_RECONNECT_TIMEOUT")]
    reconnect_timeout: u64,
}

impl Cli {
    fn resolve_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Converts the parsed arguments into a [`GatewayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not an IP address.
    fn to_gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("invalid bind address: '{}'", self.bind))?;

        Ok(GatewayConfig {
            bind_addr: SocketAddr::new(ip, self.resolve_port()),
            stop_file: self.stop_file.clone(),
            stop_poll_interval: Duration::from_millis(self.stop_poll_ms),
            filter_tv_devices: self.filter_devices,
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout),
        })
    }
}

/// Removes a leading help token from `args`.
///
/// Returns whether one was found.  The token is dropped rather than handed
/// to clap, so asking for help never stops startup.
fn take_help_token(mut args: Vec<OsString>) -> (bool, Vec<OsString>) {
    let is_help = args
        .get(1)
        .and_then(|arg| arg.to_str())
        .is_some_and(|arg| HELP_TOKENS.contains(&arg));
    if is_help {
        args.remove(1);
    }
    (is_help, args)
}

/// Builds the simulated provider from `inventory`, or an empty one.
///
/// # Errors
///
/// Returns an error if the inventory file cannot be read or parsed.
fn load_provider(inventory: Option<&Path>) -> anyhow::Result<SimulatedProvider> {
    let Some(path) = inventory else {
        warn!("no device inventory given (--devices / ATV_DEVICES); scans will find nothing");
        return Ok(SimulatedProvider::new(SimulatedInventory::default()));
    };
    let inventory = SimulatedInventory::load(path)
        .with_context(|| format!("failed to load device inventory {}", path.display()))?;
    info!(
        "loaded {} device(s) from {}",
        inventory.devices.len(),
        path.display()
    );
    Ok(SimulatedProvider::new(inventory))
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// 1. Logging is initialised from `RUST_LOG` (default `info`).
/// 2. Arguments are parsed; a leading help token prints usage.
/// 3. A stale stop file is removed.
/// 4. The gateway task, the Ctrl+C handler, and the stop-file watcher are
///    spawned.
/// 5. [`run_server`] accepts clients until the `running` flag is cleared.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (help, args) = take_help_token(std::env::args_os().collect());
    let cli = Cli::parse_from(args);
    if help {
        println!("{}", Cli::command().render_help());
    }

    let config = cli.to_gateway_config()?;
    let provider = load_provider(cli.devices.as_deref())?;

    if clear_stop_file(&config.stop_file)
        .with_context(|| format!("failed to remove stop file {}", config.stop_file.display()))?
    {
        info!("removed stale stop file {}", config.stop_file.display());
    }

    info!("ATV gateway starting on ws://{}", config.bind_addr);

    let running = Arc::new(AtomicBool::new(true));
    let (gateway, events) = Gateway::new(Arc::new(provider), config.clone(), Arc::clone(&running))
        .context("failed to build the key table")?;
    let handle = gateway.handle();
    let gateway_task = tokio::spawn(gateway.run(events));

    // ── Ctrl+C ────────────────────────────────────────────────────────────────
    {
        let running = Arc::clone(&running);
        let handle = handle.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received Ctrl+C; shutting down");
                    running.store(false, Ordering::Relaxed);
                    handle.shutdown();
                }
                Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
            }
        });
    }

    // ── Stop file ─────────────────────────────────────────────────────────────
    {
        let running = Arc::clone(&running);
        let handle = handle.clone();
        let path = config.stop_file.clone();
        let poll = config.stop_poll_interval;
        tokio::spawn(async move {
            watch_stop_file(&path, poll, running, handle).await;
        });
    }

    let served = run_server(&config, handle.clone(), Arc::clone(&running)).await;

    running.store(false, Ordering::Relaxed);
    handle.shutdown();
    if let Err(e) = gateway_task.await {
        error!("gateway task failed: {e}");
    }

    served?;
    info!("ATV gateway stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_cli_defaults_use_port_8765_on_loopback() {
        // Arrange
        let cli = Cli::parse_from(["atv-gateway"]);

        // Act
        let config = cli.to_gateway_config().unwrap();

        // Assert
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8765");
        assert!(config.filter_tv_devices);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_positional_port_overrides_default() {
        let cli = Cli::parse_from(["atv-gateway", "9000"]);
        assert_eq!(cli.resolve_port(), 9000);
    }

    #[test]
    fn test_filter_can_be_disabled() {
        let cli = Cli::parse_from(["atv-gateway", "--filter-devices", "false"]);
        assert!(!cli.to_gateway_config().unwrap().filter_tv_devices);
    }

    #[test]
    fn test_invalid_bind_returns_error() {
        let cli = Cli::parse_from(["atv-gateway", "--bind", "not.an.ip"]);
        assert!(cli.to_gateway_config().is_err());
    }

    #[test]
    fn test_each_help_token_is_taken() {
        for token in HELP_TOKENS {
            // Act
            let (help, rest) = take_help_token(args(&["atv-gateway", token]));

            // Assert
            assert!(help, "{token} should be recognised");
            assert_eq!(rest, args(&["atv-gateway"]));
        }
    }

    #[test]
    fn test_help_token_then_default_port() {
        let (help, rest) = take_help_token(args(&["atv-gateway", "/?"]));
        let cli = Cli::parse_from(rest);
        assert!(help);
        assert_eq!(cli.resolve_port(), DEFAULT_PORT);
    }

    #[test]
    fn test_port_is_not_a_help_token() {
        let (help, rest) = take_help_token(args(&["atv-gateway", "9001"]));
        assert!(!help);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_load_provider_without_inventory_is_empty() {
        let provider = load_provider(None).unwrap();
        assert!(provider.devices().is_empty());
    }

    #[test]
    fn test_load_provider_missing_file_is_error() {
        let path = std::env::temp_dir().join(format!("atv-missing-{}.toml", uuid::Uuid::new_v4()));
        assert!(load_provider(Some(&path)).is_err());
    }
}
