//! Command dispatcher: one typed client command in, zero or more replies out.
//!
//! The dispatcher borrows everything it needs from the [`Gateway`](super::Gateway)
//! for the duration of one command.  It never talks to a socket; replies are
//! pushed into `out` and the gateway routes them to the requesting client.
//!
//! Provider failures are converted to reply events (or log lines) here and
//! never propagate further.

use std::ops::ControlFlow;

use atv_core::{DeviceProvider, InputAction, KeyTable, KeyboardFocusState};
use tracing::{debug, info, warn};

use super::pairing;
use super::session::{LinkFactory, Session};
use crate::domain::{ClientCommand, ConnectRequest, GatewayConfig, ScanIndex, ServerMessage};

/// Reply text for `key` without a connection.
const NOT_CONNECTED: &str = "not_connected";

pub(super) struct Dispatcher<'a> {
    pub provider: &'a dyn DeviceProvider,
    pub keys: &'a KeyTable,
    pub config: &'a GatewayConfig,
    pub session: &'a mut Session,
    pub links: &'a LinkFactory,
    /// Whether a reconnection attempt is in flight.
    pub reconnecting: bool,
}

impl Dispatcher<'_> {
    /// Runs `command` to completion.  `Break` means the client asked to quit.
    pub(super) async fn dispatch(
        self,
        command: ClientCommand,
        out: &mut Vec<ServerMessage>,
    ) -> ControlFlow<()> {
        match command {
            ClientCommand::Scan => out.push(self.scan().await),
            ClientCommand::StartPair { label } => self.start_pair(&label).await,
            ClientCommand::FinishPair1 { pin } => {
                match pairing::finish_airplay(self.session, self.provider, &pin).await {
                    Ok(()) => out.push(ServerMessage::StartPair2),
                    Err(e) => warn!("finishPair1: {e}"),
                }
            }
            ClientCommand::FinishPair2 { pin } => {
                match pairing::finish_companion(self.session, &pin).await {
                    Ok(result) => out.push(ServerMessage::PairCredentials(result)),
                    Err(e) => warn!("finishPair2: {e}"),
                }
            }
            ClientCommand::FinishPair { pin } => {
                match pairing::finish_single(self.session, &pin).await {
                    Ok(result) => out.push(ServerMessage::PairCredentials(result)),
                    Err(e) => warn!("finishPair: {e}"),
                }
            }
            ClientCommand::Connect(request) => out.push(self.connect(request).await),
            ClientCommand::Disconnect => {
                self.disconnect().await;
                out.push(ServerMessage::Disconnected);
            }
            ClientCommand::IsConnected => {
                out.push(ServerMessage::IsConnected(self.session.is_connected()));
            }
            ClientCommand::PingDevice => {
                out.push(ServerMessage::PingResult(self.session.is_connected()));
            }
            ClientCommand::Key(request) => {
                if let Some(reply) = self.key(&request.key, request.action).await {
                    out.push(reply);
                }
            }
            ClientCommand::KbFocus => {
                if let Some(link) = self.session.link() {
                    let focused = link.keyboard().focus_state() == KeyboardFocusState::Focused;
                    out.push(ServerMessage::KbFocusStatus(focused));
                } else {
                    debug!("kbfocus: not connected");
                }
            }
            ClientCommand::SetText { text } => self.set_text(&text).await,
            ClientCommand::GetText => {
                if let Some(reply) = self.get_text().await {
                    out.push(reply);
                }
            }
            ClientCommand::Quit => {
                info!("quit requested");
                if let Some(link) = self.session.take_link() {
                    if let Err(e) = link.close().await {
                        debug!("closing connection on quit: {e}");
                    }
                }
                return ControlFlow::Break(());
            }
            ClientCommand::Echo { data } => out.push(ServerMessage::EchoReply(data)),
        }
        ControlFlow::Continue(())
    }

    // ── Discovery and pairing ─────────────────────────────────────────────────

    async fn scan(self) -> ServerMessage {
        let index = match self.provider.scan(None).await {
            Ok(targets) => ScanIndex::build(targets, self.config.filter_tv_devices),
            Err(e) => {
                warn!("scan failed: {e}");
                ScanIndex::default()
            }
        };
        info!("scan found {} device(s)", index.len());
        let labels = index.labels().to_vec();
        self.session.set_scan_index(index);
        ServerMessage::ScanResult(labels)
    }

    async fn start_pair(self, label: &str) {
        if let Err(e) = pairing::start(self.session, self.provider, label, self.reconnecting).await
        {
            warn!("startPair: {e}");
        }
    }

    // ── Connection ────────────────────────────────────────────────────────────

    async fn connect(self, request: ConnectRequest) -> ServerMessage {
        let found = match self.provider.scan(Some(&request.identifier)).await {
            Ok(targets) => targets
                .into_iter()
                .find(|t| t.identifier() == request.identifier),
            Err(e) => {
                warn!("connect: discovery failed: {e}");
                return ServerMessage::ConnectionFailure;
            }
        };
        let Some(found) = found else {
            warn!("connect: no device with identifier {}", request.identifier);
            return ServerMessage::ConnectionFailure;
        };

        let target = found.with_credentials(&request.credential_set());
        let connection = match self.provider.connect(&target).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connect to {} failed: {e}", target.label());
                return ServerMessage::ConnectionFailure;
            }
        };

        let link = self.links.attach(connection);
        info!("connected to {} (link #{})", target.label(), link.generation());
        if let Some(previous) = self.session.install_link(target, link) {
            debug!("closing previous link #{}", previous.generation());
            if let Err(e) = previous.close().await {
                debug!("closing previous link: {e}");
            }
        }
        ServerMessage::Connected
    }

    async fn disconnect(self) {
        let released = self.session.reset();
        if let Some(link) = released.link {
            info!("disconnecting link #{}", link.generation());
            if let Err(e) = link.close().await {
                debug!("disconnect: {e}");
            }
        }
        if let Some(pairing) = released.pairing {
            debug!("abandoning pairing in phase {:?}", pairing.phase());
            pairing.close().await;
        }
    }

    // ── Remote and keyboard ───────────────────────────────────────────────────

    async fn key(self, key: &str, action: Option<InputAction>) -> Option<ServerMessage> {
        let Some(link) = self.session.link() else {
            return Some(ServerMessage::CommandFailed(NOT_CONNECTED.to_string()));
        };
        let Some(binding) = self.keys.get(key) else {
            debug!("key {key:?} is not an allowed key; ignored");
            return None;
        };
        match binding.press(link.remote_control(), action).await {
            Ok(()) => None,
            Err(e) => {
                warn!("key {key} failed: {e}");
                Some(ServerMessage::CommandFailed(e.to_string()))
            }
        }
    }

    async fn set_text(self, text: &str) {
        let Some(link) = self.session.link() else {
            debug!("settext: not connected");
            return;
        };
        let keyboard = link.keyboard();
        if keyboard.focus_state() != KeyboardFocusState::Focused {
            debug!("settext: keyboard not focused");
            return;
        }
        if let Err(e) = keyboard.text_set(text).await {
            warn!("settext failed: {e}");
        }
    }

    async fn get_text(self) -> Option<ServerMessage> {
        let link = self.session.link()?;
        let keyboard = link.keyboard();
        if keyboard.focus_state() != KeyboardFocusState::Focused {
            debug!("gettext: keyboard not focused");
            return None;
        }
        match keyboard.text_get().await {
            Ok(text) => Some(ServerMessage::CurrentText(text)),
            Err(e) => {
                warn!("gettext failed: {e}");
                None
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::gateway::GatewayEvent;
    use atv_core::{Protocol, SimulatedDevice, SimulatedProvider};
    use serde_json::json;
    use tokio::sync::mpsc;

    const LABEL: &str = "Living Room (10.0.0.5)";

    /// Owns everything a `Dispatcher` borrows.
    struct Harness {
        provider: SimulatedProvider,
        keys: KeyTable,
        config: GatewayConfig,
        session: Session,
        links: LinkFactory,
        _events: mpsc::UnboundedReceiver<GatewayEvent>,
    }

    impl Harness {
        fn new(devices: Vec<SimulatedDevice>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                provider: SimulatedProvider::with_devices(devices),
                keys: KeyTable::new().unwrap(),
                config: GatewayConfig::default(),
                session: Session::new(),
                links: LinkFactory::new(tx),
                _events: rx,
            }
        }

        fn living_room() -> Self {
            Self::new(vec![SimulatedDevice::new(
                "Living Room",
                "10.0.0.5".parse().unwrap(),
                "id-1",
            )])
        }

        async fn run(&mut self, command: ClientCommand) -> (Vec<ServerMessage>, ControlFlow<()>) {
            let mut out = Vec::new();
            let flow = Dispatcher {
                provider: &self.provider,
                keys: &self.keys,
                config: &self.config,
                session: &mut self.session,
                links: &self.links,
                reconnecting: false,
            }
            .dispatch(command, &mut out)
            .await;
            (out, flow)
        }

        async fn connect(&mut self) -> Vec<ServerMessage> {
            let request = ConnectRequest {
                identifier: "id-1".to_string(),
                credentials: "airplay:id-1".to_string(),
                companion: None,
            };
            self.run(ClientCommand::Connect(request)).await.0
        }
    }

    fn key(name: &str, action: Option<InputAction>) -> ClientCommand {
        ClientCommand::Key(crate::domain::KeyRequest {
            key: name.to_string(),
            action,
        })
    }

    #[tokio::test]
    async fn test_scan_replies_with_labels_and_fills_index() {
        // Arrange
        let mut h = Harness::living_room();

        // Act
        let (out, _) = h.run(ClientCommand::Scan).await;

        // Assert
        assert_eq!(out, vec![ServerMessage::ScanResult(vec![LABEL.to_string()])]);
        assert!(h.session.scan_index().get(LABEL).is_some());
    }

    #[tokio::test]
    async fn test_scan_filters_non_tv_models() {
        let mut h = Harness::new(vec![
            SimulatedDevice::new("Den", "10.0.0.6".parse().unwrap(), "id-2").with_model("HomePod"),
            SimulatedDevice::new("Living Room", "10.0.0.5".parse().unwrap(), "id-1"),
        ]);

        let (out, _) = h.run(ClientCommand::Scan).await;

        assert_eq!(out, vec![ServerMessage::ScanResult(vec![LABEL.to_string()])]);
    }

    #[tokio::test]
    async fn test_scan_then_start_pair_touches_no_connection_fields() {
        let mut h = Harness::living_room();
        h.run(ClientCommand::Scan).await;

        let (out, _) = h
            .run(ClientCommand::StartPair {
                label: LABEL.to_string(),
            })
            .await;

        assert!(out.is_empty());
        assert_eq!(h.session.pairing_phase(), crate::application::PairingPhase::AirPlayPending);
        assert!(!h.session.is_connected());
        assert!(h.session.active_target().is_none());
    }

    #[tokio::test]
    async fn test_two_phase_pairing_emits_start_pair2_then_credentials() {
        // Arrange
        let mut h = Harness::living_room();
        h.run(ClientCommand::Scan).await;
        h.run(ClientCommand::StartPair {
            label: LABEL.to_string(),
        })
        .await;

        // Act
        let (first, _) = h
            .run(ClientCommand::FinishPair1 {
                pin: "1234".to_string(),
            })
            .await;
        let (second, _) = h
            .run(ClientCommand::FinishPair2 {
                pin: "1234".to_string(),
            })
            .await;

        // Assert
        assert_eq!(first, vec![ServerMessage::StartPair2]);
        let [ServerMessage::PairCredentials(result)] = second.as_slice() else {
            panic!("expected pairCredentials, got {second:?}");
        };
        assert_eq!(result.identifier, "id-1");
        assert_eq!(result.credentials.get(Protocol::AirPlay), Some("airplay:id-1"));
        assert_eq!(result.credentials.get(Protocol::Companion), Some("companion:id-1"));
    }

    #[tokio::test]
    async fn test_rejected_pin_emits_nothing() {
        let mut h = Harness::living_room();
        h.run(ClientCommand::Scan).await;
        h.run(ClientCommand::StartPair {
            label: LABEL.to_string(),
        })
        .await;

        let (out, _) = h
            .run(ClientCommand::FinishPair1 {
                pin: "0000".to_string(),
            })
            .await;

        assert!(out.is_empty());
        assert!(!h.session.is_pairing());
    }

    #[tokio::test]
    async fn test_connect_sets_target_and_reports_connected() {
        let mut h = Harness::living_room();

        let out = h.connect().await;

        assert_eq!(out, vec![ServerMessage::Connected]);
        assert!(h.session.is_connected());
        assert_eq!(h.session.active_target().unwrap().identifier(), "id-1");
        assert_eq!(h.provider.live_listener_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_identifier_fails_without_mutation() {
        let mut h = Harness::living_room();
        let request = ConnectRequest {
            identifier: "missing".to_string(),
            credentials: "x".to_string(),
            companion: None,
        };

        let (out, _) = h.run(ClientCommand::Connect(request)).await;

        assert_eq!(out, vec![ServerMessage::ConnectionFailure]);
        assert!(h.session.active_target().is_none());
        assert!(!h.session.is_connected());
        assert_eq!(h.provider.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_with_bad_credentials_fails() {
        let mut h = Harness::living_room();
        let request = ConnectRequest {
            identifier: "id-1".to_string(),
            credentials: "stale".to_string(),
            companion: None,
        };

        let (out, _) = h.run(ClientCommand::Connect(request)).await;

        assert_eq!(out, vec![ServerMessage::ConnectionFailure]);
        assert!(h.session.active_target().is_none());
    }

    #[tokio::test]
    async fn test_reconnecting_replaces_previous_link() {
        let mut h = Harness::living_room();
        h.connect().await;
        let first = h.session.link().unwrap().generation();

        h.connect().await;

        assert!(h.session.link().unwrap().generation() > first);
        assert!(h.provider.has_live_connection());
    }

    #[tokio::test]
    async fn test_disconnect_resets_session() {
        let mut h = Harness::living_room();
        h.connect().await;

        let (out, _) = h.run(ClientCommand::Disconnect).await;

        assert_eq!(out, vec![ServerMessage::Disconnected]);
        assert!(!h.session.is_connected());
        assert!(h.session.active_target().is_none());
        assert!(!h.provider.has_live_connection());
    }

    #[tokio::test]
    async fn test_is_connected_and_ping_do_not_mutate() {
        let mut h = Harness::living_room();
        h.connect().await;
        let generation = h.session.link().unwrap().generation();

        for _ in 0..3 {
            let (out, _) = h.run(ClientCommand::IsConnected).await;
            assert_eq!(out, vec![ServerMessage::IsConnected(true)]);
        }
        let (out, _) = h.run(ClientCommand::PingDevice).await;

        assert_eq!(out, vec![ServerMessage::PingResult(true)]);
        assert_eq!(h.session.link().unwrap().generation(), generation);
        assert_eq!(h.provider.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_key_without_connection_reports_not_connected() {
        let mut h = Harness::living_room();

        let (out, _) = h.run(key("menu", None)).await;

        assert_eq!(out, vec![ServerMessage::CommandFailed("not_connected".to_string())]);
    }

    #[tokio::test]
    async fn test_bare_volume_up_is_pressed_without_qualifier() {
        let mut h = Harness::living_room();
        h.connect().await;

        let (out, _) = h.run(key("volume_up", None)).await;

        assert!(out.is_empty());
        assert_eq!(h.provider.presses(), vec![("volume_up".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_tapped_key_forwards_qualifier() {
        let mut h = Harness::living_room();
        h.connect().await;

        h.run(key("select", Some(InputAction::DoubleTap))).await;

        assert_eq!(
            h.provider.presses(),
            vec![("select".to_string(), Some(InputAction::DoubleTap))]
        );
    }

    #[tokio::test]
    async fn test_unknown_key_is_ignored() {
        let mut h = Harness::living_room();
        h.connect().await;

        let (out, _) = h.run(key("power_off", None)).await;

        assert!(out.is_empty());
        assert!(h.provider.presses().is_empty());
    }

    #[tokio::test]
    async fn test_key_provider_error_becomes_command_failed() {
        let mut h = Harness::living_room();
        h.connect().await;
        h.provider.set_key_failure(Some("device busy"));

        let (out, _) = h.run(key("menu", None)).await;

        assert_eq!(
            out,
            vec![ServerMessage::CommandFailed("command failed: device busy".to_string())]
        );
    }

    #[tokio::test]
    async fn test_text_commands_require_focus() {
        // Arrange
        let mut h = Harness::living_room();
        h.connect().await;
        h.provider.set_text(Some("old"));

        // Act: unfocused
        h.run(ClientCommand::SetText {
            text: "ignored".to_string(),
        })
        .await;
        let (unfocused, _) = h.run(ClientCommand::GetText).await;

        // Assert
        assert!(unfocused.is_empty());
        assert_eq!(h.provider.text().as_deref(), Some("old"));

        // Act: focused
        h.provider.set_focus(KeyboardFocusState::Focused);
        h.run(ClientCommand::SetText {
            text: "new".to_string(),
        })
        .await;
        let (focused, _) = h.run(ClientCommand::GetText).await;
        let (status, _) = h.run(ClientCommand::KbFocus).await;

        // Assert
        assert_eq!(focused, vec![ServerMessage::CurrentText(Some("new".to_string()))]);
        assert_eq!(status, vec![ServerMessage::KbFocusStatus(true)]);
    }

    #[tokio::test]
    async fn test_quit_closes_connection_and_breaks() {
        let mut h = Harness::living_room();
        h.connect().await;

        let (out, flow) = h.run(ClientCommand::Quit).await;

        assert!(out.is_empty());
        assert!(flow.is_break());
        assert!(!h.session.is_connected());
        assert!(!h.provider.has_live_connection());
    }

    #[tokio::test]
    async fn test_echo_returns_data() {
        let mut h = Harness::living_room();

        let (out, flow) = h.run(ClientCommand::Echo { data: json!({"a": 1}) }).await;

        assert_eq!(out, vec![ServerMessage::EchoReply(json!({"a": 1}))]);
        assert!(flow.is_continue());
    }
}
