//! Real-time board collaboration over WebSocket.
//!
//! Clients connect to one board at a time. A single hub coordinator owns the
//! board registry and fans events out to per-connection outbound queues; each
//! connection runs its own reader and writer task.

pub mod events;
pub mod handler;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;

pub use hub::{DisconnectReason, Hub, HubError};
