//! atv-gateway library crate.
//!
//! This crate exposes a single streaming-device session to WebSocket clients
//! as a JSON command/event protocol.  It owns exactly one device connection
//! at a time, runs the two-phase (AirPlay, then Companion) pairing handshake,
//! and reconnects automatically after an unsolicited drop.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser / script (JSON over WebSocket)
//!         ↕
//! [atv-gateway]
//!   ├── domain/           Pure types: envelopes, commands, ScanIndex, GatewayConfig
//!   ├── application/      Gateway task: Session, pairing, reconnection, dispatch
//!   └── infrastructure/
//!         ├── ws_server/  WebSocket accept loop (tokio-tungstenite)
//!         └── stop_file/  Sentinel-file shutdown watcher
//!         ↕
//! DeviceProvider (atv-core trait; simulated or real)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `atv-core`; it never touches a socket.
//! - `infrastructure` turns sockets and files into [`application::GatewayEvent`]s.
//!
//! # For beginners: why one gateway task?
//!
//! Every client socket and every device callback posts an event onto one
//! queue, and a single task drains it.  Only that task ever touches the
//! session, so the session needs no lock and no two commands can interleave
//! their half-finished updates.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: the gateway task and its state machines.
pub mod application;

/// Infrastructure layer: WebSocket server and process control.
pub mod infrastructure;
