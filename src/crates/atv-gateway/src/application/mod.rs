//! Application layer for atv-gateway.
//!
//! Everything that decides what happens to the device session lives here:
//!
//! - [`gateway`] – the single task that drains the event queue and owns the
//!   [`Session`].
//! - [`dispatcher`] – one handler per client command.
//! - [`pairing`] – the AirPlay → Companion handshake state machine.
//! - [`supervisor`] – the one-shot reconnection after an unsolicited drop.
//! - [`session`] – the session record and the [`DeviceLink`] wrapper.
//! - [`clients`] – outbox channels of the connected WebSocket clients.
//!
//! Nothing in this layer touches a socket or a file.

pub mod clients;
mod dispatcher;
pub mod gateway;
pub mod pairing;
pub mod session;
pub mod supervisor;

pub use clients::{ClientId, ClientOutbox, ClientRegistry};
pub use gateway::{Gateway, GatewayEvent, GatewayHandle};
pub use pairing::{PairingError, PairingPhase, PairingState};
pub use session::{DeviceLink, Session};
pub use supervisor::ReconnectionSupervisor;
