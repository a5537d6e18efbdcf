//! Domain layer for atv-gateway.
//!
//! Pure types with no dependencies on I/O or the async runtime: the JSON
//! envelopes and the typed commands parsed from them, the scan index, and
//! the gateway configuration.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - Calls into a device provider
//! - File I/O or environment variable reading

pub mod config;
pub mod messages;
pub mod scan_index;

pub use config::GatewayConfig;
pub use messages::{
    ClientCommand, CommandError, ConnectRequest, InboundEnvelope, KeyRequest, OutboundEnvelope,
    PairingResult, ServerMessage,
};
pub use scan_index::ScanIndex;
