//! JSON envelopes for the client-facing WebSocket protocol.
//!
//! # Message flow
//!
//! ```text
//! Client  → Gateway: {"cmd": "...", "data": ...}      → InboundEnvelope → ClientCommand
//! Gateway → Client:  ServerMessage → OutboundEnvelope → {"command": "...", "data": ...}
//! ```
//!
//! The inbound side is parsed in two steps.  [`InboundEnvelope`] only checks
//! that the message is an object with a string `cmd`; [`ClientCommand::parse`]
//! then checks the `data` shape for the named command.  An unknown `cmd` is
//! not an error: `parse` returns `Ok(None)` and the gateway ignores it.
//!
//! Outbound `data` always has a value; commands with nothing to say send an
//! empty list.

use atv_core::{CredentialSet, InputAction, KeyboardFocusState, PowerState, Protocol};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ── Inbound ───────────────────────────────────────────────────────────────────

/// A raw inbound message: a command name plus untyped data.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub cmd: String,
    /// `Value::Null` when the client sent no `data`.
    pub data: Value,
}

impl InboundEnvelope {
    /// Extracts the envelope from a parsed JSON value.
    ///
    /// Returns `None` unless `value` is an object whose `cmd` is a string.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };
        let Some(Value::String(cmd)) = map.remove("cmd") else {
            return None;
        };
        let data = map.remove("data").unwrap_or(Value::Null);
        Some(Self { cmd, data })
    }
}

/// Errors raised when a recognised command carries the wrong `data` shape.
#[derive(Debug, Error)]
pub enum CommandError {
    /// `data` did not have the shape the command requires.
    #[error("`{command}` expects {expected}")]
    InvalidData {
        command: &'static str,
        expected: &'static str,
    },

    /// `taction` named a tap action that does not exist.
    #[error("unknown tap action {0:?}")]
    UnknownAction(String),
}

/// `data` of a `connect` command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectRequest {
    pub identifier: String,
    /// The AirPlay credential.
    pub credentials: String,
    #[serde(rename = "Companion", default)]
    pub companion: Option<String>,
}

impl ConnectRequest {
    /// The credentials in per-protocol form.
    pub fn credential_set(&self) -> CredentialSet {
        let mut set = CredentialSet::new();
        set.insert(Protocol::AirPlay, self.credentials.clone());
        if let Some(companion) = &self.companion {
            set.insert(Protocol::Companion, companion.clone());
        }
        set
    }
}

/// `data` of a `key` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub key: String,
    /// `None` when the client sent a bare key name.
    pub action: Option<InputAction>,
}

impl KeyRequest {
    /// Accepts either `"menu"` or `{"key": "menu", "taction": "Hold"}`.
    pub fn from_data(data: &Value) -> Result<Self, CommandError> {
        const EXPECTED: &str = "a key name or {key, taction}";
        match data {
            Value::String(key) => Ok(Self {
                key: key.clone(),
                action: None,
            }),
            Value::Object(map) => {
                let key = map
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or(CommandError::InvalidData {
                        command: "key",
                        expected: EXPECTED,
                    })?;
                let action = match map.get("taction") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(name)) => Some(
                        name.parse::<InputAction>()
                            .map_err(|e| CommandError::UnknownAction(e.0))?,
                    ),
                    Some(_) => {
                        return Err(CommandError::InvalidData {
                            command: "key",
                            expected: EXPECTED,
                        })
                    }
                };
                Ok(Self {
                    key: key.to_string(),
                    action,
                })
            }
            _ => Err(CommandError::InvalidData {
                command: "key",
                expected: EXPECTED,
            }),
        }
    }
}

/// Every command the gateway understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Scan,
    StartPair { label: String },
    FinishPair1 { pin: String },
    FinishPair2 { pin: String },
    /// Single-protocol pairing: AirPlay only.
    FinishPair { pin: String },
    Connect(ConnectRequest),
    Disconnect,
    IsConnected,
    PingDevice,
    Key(KeyRequest),
    KbFocus,
    SetText { text: String },
    GetText,
    Quit,
    Echo { data: Value },
}

impl ClientCommand {
    /// Types the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when a known command has malformed `data`.
    /// An unknown command yields `Ok(None)`.
    pub fn parse(envelope: &InboundEnvelope) -> Result<Option<Self>, CommandError> {
        let data = &envelope.data;
        let command = match envelope.cmd.as_str() {
            "scan" => Self::Scan,
            "startPair" => Self::StartPair {
                label: expect_string("startPair", data)?,
            },
            "finishPair1" => Self::FinishPair1 {
                pin: expect_pin("finishPair1", data)?,
            },
            "finishPair2" => Self::FinishPair2 {
                pin: expect_pin("finishPair2", data)?,
            },
            "finishPair" => Self::FinishPair {
                pin: expect_pin("finishPair", data)?,
            },
            "connect" => Self::Connect(serde_json::from_value(data.clone()).map_err(|_| {
                CommandError::InvalidData {
                    command: "connect",
                    expected: "an object with string `identifier` and `credentials`",
                }
            })?),
            "disconnect" => Self::Disconnect,
            "is_connected" => Self::IsConnected,
            "ping_device" => Self::PingDevice,
            "key" => Self::Key(KeyRequest::from_data(data)?),
            "kbfocus" => Self::KbFocus,
            "settext" => Self::SetText {
                text: data
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or(CommandError::InvalidData {
                        command: "settext",
                        expected: "an object with a string `text`",
                    })?,
            },
            "gettext" => Self::GetText,
            "quit" => Self::Quit,
            "echo" => Self::Echo { data: data.clone() },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Wire name, safe for log lines (never includes `data`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::StartPair { .. } => "startPair",
            Self::FinishPair1 { .. } => "finishPair1",
            Self::FinishPair2 { .. } => "finishPair2",
            Self::FinishPair { .. } => "finishPair",
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
            Self::IsConnected => "is_connected",
            Self::PingDevice => "ping_device",
            Self::Key(_) => "key",
            Self::KbFocus => "kbfocus",
            Self::SetText { .. } => "settext",
            Self::GetText => "gettext",
            Self::Quit => "quit",
            Self::Echo { .. } => "echo",
        }
    }
}

fn expect_string(command: &'static str, data: &Value) -> Result<String, CommandError> {
    data.as_str()
        .map(str::to_string)
        .ok_or(CommandError::InvalidData {
            command,
            expected: "a string",
        })
}

/// PINs arrive as strings or as bare JSON numbers.
fn expect_pin(command: &'static str, data: &Value) -> Result<String, CommandError> {
    match data {
        Value::String(pin) => Ok(pin.clone()),
        Value::Number(pin) => Ok(pin.to_string()),
        _ => Err(CommandError::InvalidData {
            command,
            expected: "a PIN string or number",
        }),
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Result of a completed pairing, as sent in `pairCredentials`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResult {
    pub identifier: String,
    pub credentials: CredentialSet,
}

impl PairingResult {
    /// `{"credentials": <AirPlay>, "identifier": ..., "Companion"?: ...}`
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "credentials".to_string(),
            self.credentials
                .get(Protocol::AirPlay)
                .map_or(Value::Null, Value::from),
        );
        map.insert("identifier".to_string(), Value::from(self.identifier.as_str()));
        if let Some(companion) = self.credentials.get(Protocol::Companion) {
            map.insert("Companion".to_string(), Value::from(companion));
        }
        Value::Object(map)
    }
}

/// Every message the gateway sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ScanResult(Vec<String>),
    StartPair2,
    PairCredentials(PairingResult),
    Connected,
    ConnectionFailure,
    Disconnected,
    IsConnected(bool),
    PingResult(bool),
    CommandFailed(String),
    KbFocusStatus(bool),
    CurrentText(Option<String>),
    EchoReply(Value),
    ConnectionLost,
    ConnectionClosed,
    Reconnected,
    ReconnectionFailed,
    PowerStateChanged { old: PowerState, new: PowerState },
    KeyboardChangeState {
        old: KeyboardFocusState,
        new: KeyboardFocusState,
    },
}

impl ServerMessage {
    /// Wire name of the event.
    pub fn command(&self) -> &'static str {
        match self {
            Self::ScanResult(_) => "scanResult",
            Self::StartPair2 => "startPair2",
            Self::PairCredentials(_) => "pairCredentials",
            Self::Connected => "connected",
            Self::ConnectionFailure => "connection_failure",
            Self::Disconnected => "disconnected",
            Self::IsConnected(_) => "is_connected",
            Self::PingResult(_) => "ping_result",
            Self::CommandFailed(_) => "command_failed",
            Self::KbFocusStatus(_) => "kbfocus-status",
            Self::CurrentText(_) => "current-text",
            Self::EchoReply(_) => "echo_reply",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionClosed => "connection_closed",
            Self::Reconnected => "reconnected",
            Self::ReconnectionFailed => "reconnection_failed",
            Self::PowerStateChanged { .. } => "power_state_changed",
            Self::KeyboardChangeState { .. } => "keyboard_changestate",
        }
    }

    /// Wire `data` of the event.
    pub fn data(&self) -> Value {
        match self {
            Self::ScanResult(labels) => json!(labels),
            Self::PairCredentials(result) => result.to_json(),
            Self::IsConnected(connected) => json!(if *connected { "true" } else { "false" }),
            Self::PingResult(connected) => {
                json!(if *connected { "connected" } else { "not_connected" })
            }
            Self::CommandFailed(reason) => json!(reason),
            Self::KbFocusStatus(focused) => json!(focused),
            Self::CurrentText(text) => json!(text),
            Self::EchoReply(data) if data.is_null() => json!([]),
            Self::EchoReply(data) => data.clone(),
            Self::PowerStateChanged { old, new } => json!({
                "old_state": old.as_str(),
                "new_state": new.as_str(),
            }),
            Self::KeyboardChangeState { old, new } => json!([old.as_str(), new.as_str()]),
            Self::StartPair2
            | Self::Connected
            | Self::ConnectionFailure
            | Self::Disconnected
            | Self::ConnectionLost
            | Self::ConnectionClosed
            | Self::Reconnected
            | Self::ReconnectionFailed => json!([]),
        }
    }

    pub fn to_envelope(&self) -> OutboundEnvelope {
        OutboundEnvelope {
            command: self.command().to_string(),
            data: self.data(),
        }
    }
}

/// The outbound wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub command: String,
    pub data: Value,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(value: Value) -> InboundEnvelope {
        InboundEnvelope::from_value(value).expect("valid envelope")
    }

    fn parse(value: Value) -> Result<Option<ClientCommand>, CommandError> {
        ClientCommand::parse(&envelope(value))
    }

    // ── Envelope ──────────────────────────────────────────────────────────────

    #[test]
    fn test_envelope_without_data_defaults_to_null() {
        let env = envelope(json!({"cmd": "scan"}));
        assert_eq!(env.cmd, "scan");
        assert!(env.data.is_null());
    }

    #[test]
    fn test_envelope_requires_string_cmd() {
        assert!(InboundEnvelope::from_value(json!({"data": 1})).is_none());
        assert!(InboundEnvelope::from_value(json!({"cmd": 7})).is_none());
        assert!(InboundEnvelope::from_value(json!(["scan"])).is_none());
    }

    // ── Command parsing ───────────────────────────────────────────────────────

    #[test]
    fn test_unknown_command_is_none() {
        assert!(parse(json!({"cmd": "reboot"})).unwrap().is_none());
    }

    #[test]
    fn test_bare_key_has_no_action() {
        // Arrange / Act
        let cmd = parse(json!({"cmd": "key", "data": "volume_up"})).unwrap();

        // Assert
        assert_eq!(
            cmd,
            Some(ClientCommand::Key(KeyRequest {
                key: "volume_up".to_string(),
                action: None
            }))
        );
    }

    #[test]
    fn test_key_object_parses_taction() {
        let cmd = parse(json!({"cmd": "key", "data": {"key": "select", "taction": "Hold"}})).unwrap();
        assert_eq!(
            cmd,
            Some(ClientCommand::Key(KeyRequest {
                key: "select".to_string(),
                action: Some(InputAction::Hold)
            }))
        );
    }

    #[test]
    fn test_key_with_unknown_taction_is_error() {
        let err = parse(json!({"cmd": "key", "data": {"key": "select", "taction": "Triple"}}))
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownAction(name) if name == "Triple"));
    }

    #[test]
    fn test_key_without_data_is_error() {
        assert!(parse(json!({"cmd": "key"})).is_err());
    }

    #[test]
    fn test_pin_accepts_string_and_number() {
        assert_eq!(
            parse(json!({"cmd": "finishPair1", "data": "0042"})).unwrap(),
            Some(ClientCommand::FinishPair1 {
                pin: "0042".to_string()
            })
        );
        assert_eq!(
            parse(json!({"cmd": "finishPair2", "data": 1234})).unwrap(),
            Some(ClientCommand::FinishPair2 {
                pin: "1234".to_string()
            })
        );
    }

    #[test]
    fn test_pin_rejects_object() {
        assert!(parse(json!({"cmd": "finishPair", "data": {"pin": 1}})).is_err());
    }

    #[test]
    fn test_connect_parses_optional_companion() {
        let cmd = parse(json!({
            "cmd": "connect",
            "data": {"identifier": "id-1", "credentials": "ap", "Companion": "comp"}
        }))
        .unwrap();

        let Some(ClientCommand::Connect(req)) = cmd else {
            panic!("expected connect");
        };
        let set = req.credential_set();
        assert_eq!(set.get(Protocol::AirPlay), Some("ap"));
        assert_eq!(set.get(Protocol::Companion), Some("comp"));
    }

    #[test]
    fn test_connect_without_companion_has_airplay_only() {
        let cmd = parse(json!({
            "cmd": "connect",
            "data": {"identifier": "id-1", "credentials": "ap"}
        }))
        .unwrap();
        let Some(ClientCommand::Connect(req)) = cmd else {
            panic!("expected connect");
        };
        assert_eq!(req.credential_set().protocols(), vec![Protocol::AirPlay]);
    }

    #[test]
    fn test_connect_missing_credentials_is_error() {
        let err = parse(json!({"cmd": "connect", "data": {"identifier": "id-1"}})).unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidData {
                command: "connect",
                ..
            }
        ));
    }

    #[test]
    fn test_settext_reads_text_field() {
        assert_eq!(
            parse(json!({"cmd": "settext", "data": {"text": "hello"}})).unwrap(),
            Some(ClientCommand::SetText {
                text: "hello".to_string()
            })
        );
        assert!(parse(json!({"cmd": "settext", "data": "hello"})).is_err());
    }

    #[test]
    fn test_start_pair_requires_label_string() {
        assert!(parse(json!({"cmd": "startPair", "data": 3})).is_err());
    }

    #[test]
    fn test_command_name_matches_wire_name() {
        let cmd = parse(json!({"cmd": "ping_device"})).unwrap().unwrap();
        assert_eq!(cmd.name(), "ping_device");
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    #[test]
    fn test_empty_events_send_empty_list() {
        let env = ServerMessage::Connected.to_envelope();
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"command": "connected", "data": []})
        );
    }

    #[test]
    fn test_connectivity_replies_use_string_data() {
        assert_eq!(ServerMessage::IsConnected(true).data(), json!("true"));
        assert_eq!(ServerMessage::IsConnected(false).data(), json!("false"));
        assert_eq!(ServerMessage::PingResult(false).data(), json!("not_connected"));
    }

    #[test]
    fn test_echo_without_data_replies_empty_list() {
        assert_eq!(ServerMessage::EchoReply(Value::Null).data(), json!([]));
        assert_eq!(ServerMessage::EchoReply(json!({"a": 1})).data(), json!({"a": 1}));
    }

    #[test]
    fn test_pair_credentials_shape() {
        // Arrange
        let mut creds = CredentialSet::new();
        creds.insert(Protocol::AirPlay, "ap");
        creds.insert(Protocol::Companion, "comp");
        let msg = ServerMessage::PairCredentials(PairingResult {
            identifier: "id-1".to_string(),
            credentials: creds,
        });

        // Act
        let data = msg.data();

        // Assert
        assert_eq!(
            data,
            json!({"credentials": "ap", "identifier": "id-1", "Companion": "comp"})
        );
    }

    #[test]
    fn test_pair_credentials_without_companion_omits_key() {
        let mut creds = CredentialSet::new();
        creds.insert(Protocol::AirPlay, "ap");
        let result = PairingResult {
            identifier: "id-1".to_string(),
            credentials: creds,
        };
        assert_eq!(result.to_json(), json!({"credentials": "ap", "identifier": "id-1"}));
    }

    #[test]
    fn test_state_change_payloads() {
        let power = ServerMessage::PowerStateChanged {
            old: PowerState::Off,
            new: PowerState::On,
        };
        assert_eq!(power.data(), json!({"old_state": "off", "new_state": "on"}));

        let focus = ServerMessage::KeyboardChangeState {
            old: KeyboardFocusState::Unfocused,
            new: KeyboardFocusState::Focused,
        };
        assert_eq!(focus.command(), "keyboard_changestate");
        assert_eq!(focus.data(), json!(["unfocused", "focused"]));
    }

    #[test]
    fn test_current_text_none_is_null() {
        assert_eq!(ServerMessage::CurrentText(None).data(), Value::Null);
        assert_eq!(
            ServerMessage::CurrentText(Some("hi".to_string())).data(),
            json!("hi")
        );
    }
}
