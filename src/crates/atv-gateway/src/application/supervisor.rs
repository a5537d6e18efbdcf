//! Reconnection supervisor.
//!
//! Reacts to an unsolicited connection loss by running exactly one
//! reconnection cycle against the last good target:
//!
//! ```text
//! ConnectionLost(gen) ──► stale link taken out of the session
//!        │
//!        ├─ pairing active ──► no attempt
//!        │
//!        └─ spawn: close stale link ─► provider.connect(target) ─► ReconnectFinished
//!                                                                       │
//!                         gateway task: restore link / report failure ◄─┘
//! ```
//!
//! The provider calls run in their own task so the gateway keeps serving
//! commands meanwhile.  While an attempt is in flight the supervisor says so,
//! and `startPair` is refused.  There is no retry loop: a failed attempt
//! leaves the session disconnected with its target kept.

use std::sync::Arc;
use std::time::Duration;

use atv_core::{DeviceProvider, DeviceTarget, ProviderError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::gateway::GatewayEvent;
use super::session::{DeviceLink, Session};

/// What to do about a `ConnectionLost` event.
pub(super) enum LossDecision {
    /// The event came from a link that is no longer current.
    Stale,
    /// Pairing owns the device right now; drop the link, do not reconnect.
    SkipPairing { stale: DeviceLink },
    /// Nothing to reconnect to.
    NoTarget { stale: DeviceLink },
    /// Run one reconnection cycle.
    Reconnect {
        attempt: u64,
        target: DeviceTarget,
        stale: DeviceLink,
    },
}

/// Tracks the (at most one) reconnection attempt in flight.
#[derive(Debug, Default)]
pub struct ReconnectionSupervisor {
    in_flight: Option<u64>,
    attempts: u64,
}

impl ReconnectionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Total reconnection attempts started.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Decides how to handle a loss reported by link `generation`.
    ///
    /// Any current link is taken out of the session: it is dead either way.
    pub(super) fn on_connection_lost(
        &mut self,
        session: &mut Session,
        generation: u64,
    ) -> LossDecision {
        let Some(stale) = session.take_link_if(generation) else {
            return LossDecision::Stale;
        };
        if session.is_pairing() {
            return LossDecision::SkipPairing { stale };
        }
        let Some(target) = session.active_target().cloned() else {
            return LossDecision::NoTarget { stale };
        };
        // The link was current, so no earlier attempt can still be running.
        self.attempts += 1;
        self.in_flight = Some(self.attempts);
        LossDecision::Reconnect {
            attempt: self.attempts,
            target,
            stale,
        }
    }

    /// Marks `attempt` finished.  Returns `false` if it was not the attempt
    /// in flight.
    pub(super) fn on_finished(&mut self, attempt: u64) -> bool {
        if self.in_flight == Some(attempt) {
            self.in_flight = None;
            return true;
        }
        false
    }
}

/// Runs one reconnection cycle off the gateway task and posts the result
/// back as [`GatewayEvent::ReconnectFinished`].
pub(super) fn spawn_attempt(
    attempt: u64,
    target: DeviceTarget,
    stale: DeviceLink,
    provider: Arc<dyn DeviceProvider>,
    timeout: Duration,
    events: mpsc::UnboundedSender<GatewayEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = stale.close().await {
            debug!("reconnect #{attempt}: closing stale link: {e}");
        }
        info!("reconnect #{attempt}: connecting to {}", target.label());
        let result = match tokio::time::timeout(timeout, provider.connect(&target)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        if events
            .send(GatewayEvent::ReconnectFinished { attempt, result })
            .is_err()
        {
            debug!("reconnect #{attempt}: gateway gone, result dropped");
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
