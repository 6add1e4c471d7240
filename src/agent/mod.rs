//! Client side of the remote duplex speech service.
//!
//! [`protocol`] defines the JSON control messages and decodes server frames;
//! [`connection`] owns the WebSocket and its keep-alive timer.

pub mod connection;
pub mod protocol;

pub use connection::AgentConnection;
pub use protocol::{ClientMessage, Settings};
