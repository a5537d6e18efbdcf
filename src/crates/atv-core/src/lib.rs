//! # atv-core
//!
//! Shared foundation for the ATV WebSocket gateway: the device model, the
//! provider traits the gateway orchestrates, and the remote key table.
//!
//! This crate has no dependency on sockets, WebSockets, or an async runtime.
//! Everything that actually talks to a streaming device lives behind the
//! [`provider::DeviceProvider`] trait.
//!
//! # Architecture overview
//!
//! The gateway (in the `atv-gateway` crate) owns exactly one device session
//! at a time and drives it through a provider:
//!
//! - **`device`** – What a discovered device looks like: [`DeviceTarget`],
//!   the transport [`Protocol`]s it speaks, and the [`CredentialSet`] that
//!   pairing produces.
//!
//! - **`provider`** – The seam to the outside world.  Discovery, the two
//!   pairing handshakes, connecting, and lifecycle callbacks
//!   ([`DeviceEvent`]) delivered through a detachable [`Subscription`].
//!
//! - **`remote`** – The remote-control and keyboard capabilities of a live
//!   connection, plus the [`KeyTable`] that maps wire key names to actions.
//!
//! - **`generation`** – Monotonic link numbering so callbacks from a replaced
//!   connection can be told apart from the live one.
//!
//! - **`simulated`** – An in-memory provider driven by a TOML inventory, used
//!   for local development and throughout the test suites.

pub mod device;
pub mod generation;
pub mod provider;
pub mod remote;
pub mod simulated;

// Re-export the most-used types at the crate root so callers can write
// `atv_core::DeviceTarget` instead of `atv_core::device::DeviceTarget`.
pub use device::{CredentialSet, DeviceTarget, Protocol};
pub use generation::GenerationCounter;
pub use provider::{
    DeviceConnection, DeviceEvent, DeviceListener, DeviceProvider, ListenerSet, PairingHandshake,
    ProviderError, ProviderResult, Subscription,
};
pub use remote::{
    InputAction, KeyBinding, KeyTable, KeyTableError, Keyboard, KeyboardFocusState, PowerState,
    RemoteControl,
};
pub use simulated::{SimulatedDevice, SimulatedInventory, SimulatedProvider};
