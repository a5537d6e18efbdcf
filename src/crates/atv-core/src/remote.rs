//! Remote-control and keyboard capabilities, and the wire key table.
//!
//! A client names keys by string (`"menu"`, `"volume_up"`, ...).  Rather than
//! resolving those names dynamically against whatever the connection happens
//! to expose, the gateway consults a fixed [`KeyTable`]: an explicit map from
//! each allowed key name to a function pointer over the [`RemoteControl`]
//! trait.  The table is checked against [`ALLOWED_KEYS`] and
//! [`NO_ACTION_KEYS`] when it is built, so a missing or misclassified key is
//! a startup error, not a runtime surprise.
//!
//! # Key classes
//!
//! | Class          | Keys                                          | Tap qualifier |
//! |----------------|-----------------------------------------------|---------------|
//! | tapped         | navigation, `menu`, `home`, `skip_*`, ...     | optional      |
//! | no-qualifier   | `volume_up`, `volume_down`, `play_pause`, `home_hold` | never  |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::provider::ProviderResult;

/// Every key name a client may send.
pub const ALLOWED_KEYS: [&str; 14] = [
    "play_pause",
    "left",
    "right",
    "down",
    "up",
    "select",
    "menu",
    "top_menu",
    "home",
    "home_hold",
    "skip_backward",
    "skip_forward",
    "volume_up",
    "volume_down",
];

/// Keys that never take a tap qualifier, even when the client supplies one.
pub const NO_ACTION_KEYS: [&str; 4] = ["volume_up", "volume_down", "play_pause", "home_hold"];

// ── Value types ───────────────────────────────────────────────────────────────

/// How a tapped key is pressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InputAction {
    #[default]
    SingleTap,
    DoubleTap,
    Hold,
}

/// Returned when a client names a tap qualifier that does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown input action: {0:?}")]
pub struct UnknownInputAction(pub String);

impl FromStr for InputAction {
    type Err = UnknownInputAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SingleTap" => Ok(InputAction::SingleTap),
            "DoubleTap" => Ok(InputAction::DoubleTap),
            "Hold" => Ok(InputAction::Hold),
            other => Err(UnknownInputAction(other.to_string())),
        }
    }
}

/// Device power state as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PowerState {
    #[default]
    Unknown,
    Off,
    On,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Unknown => "unknown",
            PowerState::Off => "off",
            PowerState::On => "on",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a text field on the device currently has keyboard focus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KeyboardFocusState {
    #[default]
    Unknown,
    Unfocused,
    Focused,
}

impl KeyboardFocusState {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyboardFocusState::Unknown => "unknown",
            KeyboardFocusState::Unfocused => "unfocused",
            KeyboardFocusState::Focused => "focused",
        }
    }
}

impl fmt::Display for KeyboardFocusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capability traits ─────────────────────────────────────────────────────────

/// Remote-control actions on a live connection.
#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn up(&self, action: InputAction) -> ProviderResult<()>;
    async fn down(&self, action: InputAction) -> ProviderResult<()>;
    async fn left(&self, action: InputAction) -> ProviderResult<()>;
    async fn right(&self, action: InputAction) -> ProviderResult<()>;
    async fn select(&self, action: InputAction) -> ProviderResult<()>;
    async fn menu(&self, action: InputAction) -> ProviderResult<()>;
    async fn top_menu(&self, action: InputAction) -> ProviderResult<()>;
    async fn home(&self, action: InputAction) -> ProviderResult<()>;
    async fn skip_backward(&self, action: InputAction) -> ProviderResult<()>;
    async fn skip_forward(&self, action: InputAction) -> ProviderResult<()>;
    async fn home_hold(&self) -> ProviderResult<()>;
    async fn play_pause(&self) -> ProviderResult<()>;
    async fn volume_up(&self) -> ProviderResult<()>;
    async fn volume_down(&self) -> ProviderResult<()>;
}

/// On-device text entry.
#[async_trait]
pub trait Keyboard: Send + Sync {
    /// Current focus state of the on-screen keyboard.
    fn focus_state(&self) -> KeyboardFocusState;

    /// Reads the text currently in the focused field.
    async fn text_get(&self) -> ProviderResult<Option<String>>;

    /// Replaces the text in the focused field.
    async fn text_set(&self, text: &str) -> ProviderResult<()>;
}

// ── Key table ─────────────────────────────────────────────────────────────────

/// Function pointer that performs one key press.
pub type KeyPress =
    for<'a> fn(&'a dyn RemoteControl, InputAction) -> BoxFuture<'a, ProviderResult<()>>;

/// One entry of the [`KeyTable`].
#[derive(Clone, Copy)]
pub struct KeyBinding {
    name: &'static str,
    takes_action: bool,
    press: KeyPress,
}

impl KeyBinding {
    fn tapped(name: &'static str, press: KeyPress) -> Self {
        Self {
            name,
            takes_action: true,
            press,
        }
    }

    fn plain(name: &'static str, press: KeyPress) -> Self {
        Self {
            name,
            takes_action: false,
            press,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this key honours a tap qualifier.
    pub fn takes_action(&self) -> bool {
        self.takes_action
    }

    /// Presses the key on `remote`.
    ///
    /// For tapped keys a missing qualifier means [`InputAction::SingleTap`];
    /// for no-qualifier keys `action` is ignored.
    pub fn press<'a>(
        &self,
        remote: &'a dyn RemoteControl,
        action: Option<InputAction>,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        let action = if self.takes_action {
            action.unwrap_or_default()
        } else {
            InputAction::default()
        };
        (self.press)(remote, action)
    }
}

impl fmt::Debug for KeyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBinding")
            .field("name", &self.name)
            .field("takes_action", &self.takes_action)
            .finish()
    }
}

/// Raised when the built-in bindings disagree with the allowed-key lists.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyTableError {
    #[error("allowed key {0:?} has no binding")]
    Missing(&'static str),
    #[error("binding {0:?} is not an allowed key")]
    Unexpected(&'static str),
    #[error("binding {0:?} has the wrong qualifier class")]
    QualifierMismatch(&'static str),
}

fn bindings() -> Vec<KeyBinding> {
    vec![
        KeyBinding::tapped("up", |remote, action| remote.up(action)),
        KeyBinding::tapped("down", |remote, action| remote.down(action)),
        KeyBinding::tapped("left", |remote, action| remote.left(action)),
        KeyBinding::tapped("right", |remote, action| remote.right(action)),
        KeyBinding::tapped("select", |remote, action| remote.select(action)),
        KeyBinding::tapped("menu", |remote, action| remote.menu(action)),
        KeyBinding::tapped("top_menu", |remote, action| remote.top_menu(action)),
        KeyBinding::tapped("home", |remote, action| remote.home(action)),
        KeyBinding::tapped("skip_backward", |remote, action| remote.skip_backward(action)),
        KeyBinding::tapped("skip_forward", |remote, action| remote.skip_forward(action)),
        KeyBinding::plain("home_hold", |remote, _| remote.home_hold()),
        KeyBinding::plain("play_pause", |remote, _| remote.play_pause()),
        KeyBinding::plain("volume_up", |remote, _| remote.volume_up()),
        KeyBinding::plain("volume_down", |remote, _| remote.volume_down()),
    ]
}

/// Validated map from wire key name to [`KeyBinding`].
#[derive(Debug, Clone)]
pub struct KeyTable {
    bindings: HashMap<&'static str, KeyBinding>,
}

impl KeyTable {
    /// Builds the table and checks it against [`ALLOWED_KEYS`] and
    /// [`NO_ACTION_KEYS`].
    ///
    /// # Errors
    ///
    /// Returns [`KeyTableError`] if a key is missing, unexpected, or in the
    /// wrong qualifier class.
    pub fn new() -> Result<Self, KeyTableError> {
        Self::from_bindings(bindings())
    }

    fn from_bindings(list: Vec<KeyBinding>) -> Result<Self, KeyTableError> {
        let mut map = HashMap::with_capacity(list.len());
        for binding in list {
            if !ALLOWED_KEYS.contains(&binding.name) {
                return Err(KeyTableError::Unexpected(binding.name));
            }
            if binding.takes_action == NO_ACTION_KEYS.contains(&binding.name) {
                return Err(KeyTableError::QualifierMismatch(binding.name));
            }
            map.insert(binding.name, binding);
        }
        if let Some(missing) = ALLOWED_KEYS.iter().find(|k| !map.contains_key(*k)) {
            return Err(KeyTableError::Missing(missing));
        }
        Ok(Self { bindings: map })
    }

    /// Looks up a key by wire name; `None` for anything outside the allowed set.
    pub fn get(&self, name: &str) -> Option<&KeyBinding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
