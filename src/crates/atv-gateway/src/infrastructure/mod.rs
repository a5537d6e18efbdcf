//! Infrastructure layer for atv-gateway.
//!
//! The infrastructure layer handles all I/O that is not a device call:
//!
//! - Binding the WebSocket listener and running one task per client
//!   ([`ws_server`])
//! - Watching the sentinel stop file ([`stop_file`])
//!
//! Both only translate what they see into gateway events through a
//! [`GatewayHandle`](crate::application::GatewayHandle).  Session decisions
//! belong to the application layer.

pub mod stop_file;
pub mod ws_server;

pub use stop_file::{clear_stop_file, watch_stop_file};
pub use ws_server::{run_server, serve};
