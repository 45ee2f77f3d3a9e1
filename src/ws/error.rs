#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::{Error, Kind};

/// Gateway channel error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the gateway
    Connection(Box<dyn StdError + Send + Sync + 'static>),
    /// Error parsing a gateway frame
    MessageParse(serde_json::Error),
    /// The gateway refused the handshake credentials
    AuthenticationFailed(String),
    /// The gateway revoked this device identity
    DeviceIdInvalidated(String),
    /// The handshake produced something other than a `connected` reply
    HandshakeRejected(String),
    /// The channel was closed, locally or by the peer
    ConnectionClosed {
        code: u16,
        reason: String,
    },
    /// Too many consecutive heartbeat echoes were missed
    Stalled {
        missed: u32,
    },
    /// Received an invalid or unexpected message
    InvalidMessage(String),
    /// Subscription stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Gateway connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse gateway message: {e}"),
            Self::AuthenticationFailed(reason) => {
                write!(f, "Gateway authentication failed: {reason}")
            }
            Self::DeviceIdInvalidated(reason) => write!(f, "Device id invalidated: {reason}"),
            Self::HandshakeRejected(reason) => write!(f, "Handshake rejected: {reason}"),
            Self::ConnectionClosed { code, reason } => {
                write!(f, "Gateway connection closed ({code}): {reason}")
            }
            Self::Stalled { missed } => write!(f, "Heartbeat stalled after {missed} missed echoes"),
            Self::InvalidMessage(msg) => write!(f, "Invalid gateway message: {msg}"),
            Self::Lagged { count } => write!(f, "Subscription lagged, missed {count} messages"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e.as_ref()),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

impl WsError {
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::AuthenticationFailed(_) | Self::DeviceIdInvalidated(_) => Kind::Authentication,
            Self::MessageParse(_) | Self::InvalidMessage(_) | Self::Lagged { .. } => Kind::Internal,
            Self::Connection(_)
            | Self::HandshakeRejected(_)
            | Self::ConnectionClosed { .. }
            | Self::Stalled { .. } => Kind::Transport,
        }
    }
}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(e.kind(), e)
    }
}

#[cfg(feature = "ws")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, WsError::Connection(Box::new(e)))
    }
}
