//! Pairing orchestrator: the two-protocol handshake as an explicit state machine.
//!
//! # States (for beginners)
//!
//! ```text
//!            startPair                finishPair1(pin)
//!   Idle ─────────────► AirPlayPending ───────────► AirPlayPinEntered
//!                            │                            │ ok
//!                            │ finishPair(pin)            ▼
//!                            │ (AirPlay only)       CompanionPending
//!                            ▼                            │ finishPair2(pin)
//!                          Done                           ▼
//!                                                 CompanionPinEntered
//!                                                         │ ok
//!                                                         ▼
//!                                                        Done
//! ```
//!
//! Any failure (provider error, rejected PIN, missing credential) moves to
//! `Failed`.  `Done` and `Failed` are terminal and leave no pairing in the
//! session.  A wrong-phase command is rejected without touching the pairing.
//!
//! The AirPlay credential survives the gap between the two phases.  When the
//! Companion phase fails it is reported in the log only; no event is sent.

use atv_core::{
    CredentialSet, DeviceProvider, DeviceTarget, PairingHandshake, Protocol, ProviderError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::Session;
use crate::domain::PairingResult;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Where a pairing stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    AirPlayPending,
    AirPlayPinEntered,
    CompanionPending,
    CompanionPinEntered,
    Failed,
    Done,
}

/// Errors from the pairing orchestrator.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("no scanned device labelled {0:?}")]
    UnknownLabel(String),

    #[error("a pairing is already in progress")]
    AlreadyPairing,

    #[error("a reconnection is in flight")]
    ReconnectInFlight,

    #[error("no pairing is in progress")]
    NotPairing,

    #[error("pairing is in phase {actual:?}, expected {expected:?}")]
    WrongPhase {
        expected: PairingPhase,
        actual: PairingPhase,
    },

    #[error("{protocol} handshake failed: {source}")]
    Provider {
        protocol: Protocol,
        #[source]
        source: ProviderError,
    },

    #[error("{0} pairing was rejected")]
    Rejected(Protocol),

    #[error("{0} pairing produced no credential")]
    MissingCredential(Protocol),
}

/// An in-progress pairing.
pub struct PairingState {
    phase: PairingPhase,
    target: DeviceTarget,
    credentials: CredentialSet,
    handshake: Box<dyn PairingHandshake>,
}

impl PairingState {
    pub fn phase(&self) -> PairingPhase {
        self.phase
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Credentials obtained so far.
    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    fn advance(&mut self, to: PairingPhase) {
        debug!("pairing {:?} → {:?}", self.phase, to);
        self.phase = to;
    }

    pub(super) async fn close(mut self) {
        if let Err(e) = self.handshake.close().await {
            debug!("closing {} handshake: {e}", self.handshake.protocol());
        }
    }

    fn provider_error(&self, source: ProviderError) -> PairingError {
        PairingError::Provider {
            protocol: self.handshake.protocol(),
            source,
        }
    }

    /// Submits `pin`, finishes the current handshake and returns its
    /// credential.  The caller has already checked the phase.
    async fn complete_handshake(
        &mut self,
        pin: &str,
        entered: PairingPhase,
    ) -> Result<String, PairingError> {
        self.advance(entered);
        let protocol = self.handshake.protocol();
        self.handshake.pin(pin);
        if let Err(e) = self.handshake.finish().await {
            return Err(self.provider_error(e));
        }
        if !self.handshake.has_paired() {
            return Err(PairingError::Rejected(protocol));
        }
        let credential = self
            .handshake
            .credentials()
            .ok_or(PairingError::MissingCredential(protocol))?;
        info!("paired {protocol} with {}", self.target.identifier());
        Ok(credential)
    }
}

/// Opens and begins a handshake for `protocol`.
async fn open_handshake(
    provider: &dyn DeviceProvider,
    target: &DeviceTarget,
    protocol: Protocol,
) -> Result<Box<dyn PairingHandshake>, PairingError> {
    let as_pairing_error = |source| PairingError::Provider { protocol, source };
    let mut handshake = provider
        .pair(target, protocol)
        .await
        .map_err(as_pairing_error)?;
    if let Err(e) = handshake.begin().await {
        let _ = handshake.close().await;
        return Err(as_pairing_error(e));
    }
    Ok(handshake)
}

/// Takes the pairing out of the session if it is in `expected`; otherwise
/// leaves it untouched.
fn take_in_phase(
    session: &mut Session,
    expected: PairingPhase,
) -> Result<PairingState, PairingError> {
    let state = session.take_pairing().ok_or(PairingError::NotPairing)?;
    if state.phase != expected {
        let actual = state.phase;
        session.set_pairing(state);
        return Err(PairingError::WrongPhase { expected, actual });
    }
    Ok(state)
}

/// Terminal failure: log what was obtained, release the handshake.
async fn fail(mut state: PairingState, error: PairingError) -> PairingError {
    state.advance(PairingPhase::Failed);
    warn!(
        "pairing with {} failed: {error}; credentials obtained: {:?}",
        state.target.identifier(),
        state.credentials.protocols()
    );
    state.close().await;
    error
}

// ── Operations ────────────────────────────────────────────────────────────────

/// `startPair`: look up `label` and begin the AirPlay handshake.
///
/// On any error the session's pairing is left exactly as it was.
pub(super) async fn start(
    session: &mut Session,
    provider: &dyn DeviceProvider,
    label: &str,
    reconnecting: bool,
) -> Result<(), PairingError> {
    if session.is_pairing() {
        return Err(PairingError::AlreadyPairing);
    }
    if reconnecting {
        return Err(PairingError::ReconnectInFlight);
    }
    let target = session
        .scan_index()
        .get(label)
        .cloned()
        .ok_or_else(|| PairingError::UnknownLabel(label.to_string()))?;

    info!("starting pairing with {}", target.label());
    let handshake = open_handshake(provider, &target, Protocol::AirPlay).await?;
    session.set_pairing(PairingState {
        phase: PairingPhase::AirPlayPending,
        target,
        credentials: CredentialSet::new(),
        handshake,
    });
    Ok(())
}

/// `finishPair1`: finish AirPlay, keep its credential, begin Companion.
pub(super) async fn finish_airplay(
    session: &mut Session,
    provider: &dyn DeviceProvider,
    pin: &str,
) -> Result<(), PairingError> {
    let mut state = take_in_phase(session, PairingPhase::AirPlayPending)?;
    let credential = match state
        .complete_handshake(pin, PairingPhase::AirPlayPinEntered)
        .await
    {
        Ok(credential) => credential,
        Err(e) => return Err(fail(state, e).await),
    };
    state.credentials.insert(Protocol::AirPlay, credential);

    let companion = match open_handshake(provider, &state.target, Protocol::Companion).await {
        Ok(handshake) => handshake,
        Err(e) => return Err(fail(state, e).await),
    };
    let mut airplay = std::mem::replace(&mut state.handshake, companion);
    if let Err(e) = airplay.close().await {
        debug!("closing AirPlay handshake: {e}");
    }

    state.advance(PairingPhase::CompanionPending);
    session.set_pairing(state);
    Ok(())
}

/// `finishPair2`: finish Companion and return both credentials.
pub(super) async fn finish_companion(
    session: &mut Session,
    pin: &str,
) -> Result<PairingResult, PairingError> {
    let mut state = take_in_phase(session, PairingPhase::CompanionPending)?;
    let credential = match state
        .complete_handshake(pin, PairingPhase::CompanionPinEntered)
        .await
    {
        Ok(credential) => credential,
        Err(e) => return Err(fail(state, e).await),
    };
    state.credentials.insert(Protocol::Companion, credential);
    Ok(done(state).await)
}

/// `finishPair`: single-protocol flow, AirPlay only.
pub(super) async fn finish_single(
    session: &mut Session,
    pin: &str,
) -> Result<PairingResult, PairingError> {
    let mut state = take_in_phase(session, PairingPhase::AirPlayPending)?;
    let credential = match state
        .complete_handshake(pin, PairingPhase::AirPlayPinEntered)
        .await
    {
        Ok(credential) => credential,
        Err(e) => return Err(fail(state, e).await),
    };
    state.credentials.insert(Protocol::AirPlay, credential);
    Ok(done(state).await)
}

async fn done(mut state: PairingState) -> PairingResult {
    state.advance(PairingPhase::Done);
    let result = PairingResult {
        identifier: state.target.identifier().to_string(),
        credentials: state.credentials.clone(),
    };
    state.close().await;
    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────
