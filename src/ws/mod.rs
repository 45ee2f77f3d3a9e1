//! The gateway channel and the transports it runs on.
//!
//! # Architecture
//!
//! - [`Channel`]: one authenticated duplex connection at a time, with request correlation and
//!   heartbeat supervision
//! - [`Connector`]: opens the physical link. [`memory::MemoryConnector`] runs in-process;
//!   `tungstenite::WebSocketConnector` (feature `ws`) speaks WebSocket
//! - [`message::Envelope`]: the JSON frame every message travels in
//!
//! The channel never reconnects by itself. Reconnection belongs to
//! [`Recovery`](crate::recovery::Recovery).

pub mod channel;
pub mod config;
pub mod error;
pub(crate) mod heartbeat;
pub mod memory;
pub mod message;
pub(crate) mod pending;
pub mod transport;
#[cfg(feature = "ws")]
pub mod tungstenite;
pub mod types;

pub use channel::{Channel, ChannelEvent, Identity};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use transport::{Connector, Duplex, Frame, Handshake};
