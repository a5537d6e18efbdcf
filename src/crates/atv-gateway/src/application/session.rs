//! Session state: what device the gateway is attached to, and how.
//!
//! # Shape
//!
//! ```text
//! Session
//!   ├── active_target   Option<DeviceTarget>   last good target (reconnection)
//!   ├── link            Option<DeviceLink>     connection + remote + subscription
//!   ├── pairing         Option<PairingState>   only during a handshake
//!   ├── active_client   Option<ClientId>       receives unsolicited events
//!   └── scan_index      ScanIndex              labels from the last scan
//! ```
//!
//! The connection and its remote-control capability travel together inside
//! [`DeviceLink`], so one can never be present without the other.
//!
//! Readers are public; mutators are visible to the `application` module only,
//! where the dispatcher and the reconnection logic live.

use atv_core::{
    DeviceConnection, DeviceListener, DeviceTarget, GenerationCounter, Keyboard, ProviderResult,
    RemoteControl, Subscription,
};
use tokio::sync::mpsc;

use super::clients::ClientId;
use super::gateway::GatewayEvent;
use super::pairing::{PairingPhase, PairingState};
use crate::domain::ScanIndex;

// ── DeviceLink ────────────────────────────────────────────────────────────────

/// A live connection plus the subscription feeding its events to the gateway.
pub struct DeviceLink {
    connection: Box<dyn DeviceConnection>,
    subscription: Subscription,
    generation: u64,
}

impl DeviceLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_control(&self) -> &dyn RemoteControl {
        self.connection.remote_control()
    }

    pub fn keyboard(&self) -> &dyn Keyboard {
        self.connection.keyboard()
    }

    /// Stops event delivery, then closes the connection.
    ///
    /// Detaching first means an intentional close never comes back to the
    /// gateway as a `ConnectionClosed` event.
    pub async fn close(self) -> ProviderResult<()> {
        self.subscription.detach();
        self.connection.close().await
    }
}

/// Wraps fresh connections into [`DeviceLink`]s.
///
/// Each link gets a new generation, and its listener posts every device
/// event onto the gateway queue tagged with that generation.
pub(super) struct LinkFactory {
    generations: GenerationCounter,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl LinkFactory {
    pub(super) fn new(events: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            generations: GenerationCounter::new(),
            events,
        }
    }

    pub(super) fn attach(&self, connection: Box<dyn DeviceConnection>) -> DeviceLink {
        let generation = self.generations.next();
        let events = self.events.clone();
        let listener: DeviceListener = std::sync::Arc::new(move |event| {
            // The gateway may already be gone during shutdown.
            let _ = events.send(GatewayEvent::Device { generation, event });
        });
        let subscription = connection.subscribe(listener);
        DeviceLink {
            connection,
            subscription,
            generation,
        }
    }

    pub(super) fn events(&self) -> mpsc::UnboundedSender<GatewayEvent> {
        self.events.clone()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// The single gateway-wide session record.
#[derive(Default)]
pub struct Session {
    active_target: Option<DeviceTarget>,
    link: Option<DeviceLink>,
    pairing: Option<PairingState>,
    active_client: Option<ClientId>,
    scan_index: ScanIndex,
}

/// Resources released by [`Session::reset`] that still need closing.
pub(super) struct Released {
    pub link: Option<DeviceLink>,
    pub pairing: Option<PairingState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single source of truth for connectivity.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn active_target(&self) -> Option<&DeviceTarget> {
        self.active_target.as_ref()
    }

    pub fn link(&self) -> Option<&DeviceLink> {
        self.link.as_ref()
    }

    pub fn pairing(&self) -> Option<&PairingState> {
        self.pairing.as_ref()
    }

    pub fn is_pairing(&self) -> bool {
        self.pairing.is_some()
    }

    /// Current pairing phase; `Idle` when no handshake is running.
    pub fn pairing_phase(&self) -> PairingPhase {
        self.pairing
            .as_ref()
            .map_or(PairingPhase::Idle, PairingState::phase)
    }

    pub fn active_client(&self) -> Option<ClientId> {
        self.active_client
    }

    pub fn scan_index(&self) -> &ScanIndex {
        &self.scan_index
    }

    // ── Mutators (application layer only) ─────────────────────────────────────

    pub(super) fn set_active_client(&mut self, client: ClientId) {
        self.active_client = Some(client);
    }

    /// Clears the active client only if it is `client`.
    pub(super) fn release_client(&mut self, client: ClientId) -> bool {
        if self.active_client == Some(client) {
            self.active_client = None;
            return true;
        }
        false
    }

    pub(super) fn set_scan_index(&mut self, index: ScanIndex) {
        self.scan_index = index;
    }

    /// Records a successful connection.  Returns the link it replaces.
    pub(super) fn install_link(
        &mut self,
        target: DeviceTarget,
        link: DeviceLink,
    ) -> Option<DeviceLink> {
        self.active_target = Some(target);
        self.link.replace(link)
    }

    /// Restores a link after reconnection; the target is unchanged.
    pub(super) fn restore_link(&mut self, link: DeviceLink) -> Option<DeviceLink> {
        self.link.replace(link)
    }

    pub(super) fn take_link(&mut self) -> Option<DeviceLink> {
        self.link.take()
    }

    /// Takes the link only if it carries `generation`.
    pub(super) fn take_link_if(&mut self, generation: u64) -> Option<DeviceLink> {
        if self.is_current(generation) {
            self.link.take()
        } else {
            None
        }
    }

    /// Whether `generation` names the current link.
    pub(super) fn is_current(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    pub(super) fn set_pairing(&mut self, pairing: PairingState) {
        self.pairing = Some(pairing);
    }

    pub(super) fn take_pairing(&mut self) -> Option<PairingState> {
        self.pairing.take()
    }

    /// Empties the session: target, link, pairing, active client, scan index.
    pub(super) fn reset(&mut self) -> Released {
        let released = Released {
            link: self.link.take(),
            pairing: self.pairing.take(),
        };
        self.active_target = None;
        self.active_client = None;
        self.scan_index = ScanIndex::default();
        released
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use atv_core::{CredentialSet, DeviceProvider, Protocol, SimulatedDevice, SimulatedProvider};
    use uuid::Uuid;

    async fn connected_link(
        provider: &SimulatedProvider,
        factory: &LinkFactory,
    ) -> (DeviceTarget, DeviceLink) {
        let device = provider.devices()[0].clone();
        let mut creds = CredentialSet::new();
        creds.insert(Protocol::AirPlay, device.credential(Protocol::AirPlay));
        let target = device.target().with_credentials(&creds);
        let conn = provider.connect(&target).await.unwrap();
        (target, factory.attach(conn))
    }

    fn provider() -> SimulatedProvider {
        SimulatedProvider::with_devices(vec![SimulatedDevice::new(
            "Living Room",
            "10.0.0.5".parse().unwrap(),
            "id-1",
        )])
    }

    #[tokio::test]
    async fn test_install_link_sets_target_and_connectivity() {
        // Arrange
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (target, link) = connected_link(&provider, &factory).await;
        let mut session = Session::new();

        // Act
        let previous = session.install_link(target, link);

        // Assert
        assert!(previous.is_none());
        assert!(session.is_connected());
        assert_eq!(session.active_target().unwrap().identifier(), "id-1");
    }

    #[tokio::test]
    async fn test_links_get_increasing_generations() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (_, first) = connected_link(&provider, &factory).await;
        let (_, second) = connected_link(&provider, &factory).await;
        assert!(second.generation() > first.generation());
    }

    #[tokio::test]
    async fn test_listener_posts_tagged_device_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (_, link) = connected_link(&provider, &factory).await;

        provider.lose_connection("gone");

        match rx.try_recv().unwrap() {
            GatewayEvent::Device { generation, event } => {
                assert_eq!(generation, link.generation());
                assert_eq!(event.kind(), "connection_lost");
            }
            _ => panic!("expected a device event"),
        }
    }

    #[tokio::test]
    async fn test_link_close_is_not_reported_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (_, link) = connected_link(&provider, &factory).await;

        link.close().await.unwrap();

        assert!(rx.try_recv().is_err());
        assert!(!provider.has_live_connection());
    }

    #[tokio::test]
    async fn test_take_link_if_ignores_other_generations() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (target, link) = connected_link(&provider, &factory).await;
        let generation = link.generation();
        let mut session = Session::new();
        session.install_link(target, link);

        assert!(session.take_link_if(generation + 1).is_none());
        assert!(session.is_current(generation));
        assert!(session.take_link_if(generation).is_some());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = LinkFactory::new(tx);
        let provider = provider();
        let (target, link) = connected_link(&provider, &factory).await;
        let mut session = Session::new();
        session.install_link(target, link);
        session.set_active_client(Uuid::new_v4());

        let released = session.reset();

        assert!(released.link.is_some());
        assert!(released.pairing.is_none());
        assert!(!session.is_connected());
        assert!(session.active_target().is_none());
        assert!(session.active_client().is_none());
    }

    #[test]
    fn test_release_client_only_clears_matching_client() {
        let mut session = Session::new();
        let active = Uuid::new_v4();
        session.set_active_client(active);

        assert!(!session.release_client(Uuid::new_v4()));
        assert_eq!(session.active_client(), Some(active));
        assert!(session.release_client(active));
        assert!(session.active_client().is_none());
    }
}
