//! Sentinel-file shutdown.
//!
//! An operator (or a service manager) stops the gateway by creating the stop
//! file, `stopserver` in the working directory unless configured otherwise.
//! A stale file is removed at startup; afterwards the file is polled and,
//! once it appears, removed again before the gateway is told to stop.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::GatewayHandle;

/// Removes the stop file if present.  Returns whether a file was removed.
///
/// # Errors
///
/// Returns any I/O error other than "not found".
pub fn clear_stop_file(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Polls `path` every `poll` until it appears or `running` is cleared.
///
/// On detection the file is deleted, `running` is cleared, and the gateway
/// receives a shutdown event.
pub async fn watch_stop_file(
    path: &Path,
    poll: Duration,
    running: Arc<AtomicBool>,
    gateway: GatewayHandle,
) {
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            debug!("stop-file watcher exiting");
            return;
        }
        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("cannot check stop file {}: {e}", path.display());
                continue;
            }
        }

        info!("stop file {} detected; shutting down", path.display());
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("failed to remove stop file {}: {e}", path.display());
        }
        running.store(false, Ordering::Relaxed);
        gateway.shutdown();
        return;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{Gateway, GatewayEvent};
    use crate::domain::GatewayConfig;
    use atv_core::SimulatedProvider;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("atv-stop-{}", Uuid::new_v4()))
    }

    #[test]
    fn test_clear_removes_existing_file() {
        // Arrange
        let path = temp_path();
        std::fs::write(&path, b"").unwrap();

        // Act
        let removed = clear_stop_file(&path).unwrap();

        // Assert
        assert!(removed);
        assert!(!path.exists());
    }

    #[test]
    fn test_clear_missing_file_is_ok() {
        assert!(!clear_stop_file(&temp_path()).unwrap());
    }

    #[tokio::test]
    async fn test_watcher_stops_gateway_when_file_appears() {
        // Arrange
        let path = temp_path();
        let running = Arc::new(AtomicBool::new(true));
        let provider = Arc::new(SimulatedProvider::with_devices(Vec::new()));
        let (gateway, mut events) =
            Gateway::new(provider, GatewayConfig::default(), Arc::clone(&running)).unwrap();
        std::fs::write(&path, b"").unwrap();

        // Act
        watch_stop_file(
            &path,
            Duration::from_millis(10),
            Arc::clone(&running),
            gateway.handle(),
        )
        .await;

        // Assert
        assert!(!running.load(Ordering::Relaxed));
        assert!(!path.exists());
        assert!(matches!(events.try_recv(), Ok(GatewayEvent::Shutdown)));
    }

    #[tokio::test]
    async fn test_watcher_exits_when_running_cleared() {
        let path = temp_path();
        let running = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(SimulatedProvider::with_devices(Vec::new()));
        let (gateway, mut events) =
            Gateway::new(provider, GatewayConfig::default(), Arc::clone(&running)).unwrap();

        watch_stop_file(&path, Duration::from_millis(10), running, gateway.handle()).await;

        assert!(events.try_recv().is_err());
    }
}
