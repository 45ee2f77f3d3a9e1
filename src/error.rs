use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to invalid input or invalid state within the client
    Validation,
    /// Internal error from dependencies
    Internal,
    /// Error related to the duplex channel to the gateway
    Transport,
    /// The gateway or token provider refused our credentials; the host must re-authenticate
    Authentication,
    /// A domain operation was attempted while the connection was not established
    NotConnected,
    /// The circuit breaker rejected a connection attempt without touching the network
    CircuitOpen,
    /// A bounded wait (handshake, heartbeat echo, correlated request) elapsed
    Timeout,
    /// The operation was abandoned because the connection went away or was superseded
    Cancelled,
    /// Error creating, validating or resuming the backing session
    Session,
    /// Error related to non-successful HTTP call
    Status,
    /// Automatic recovery gave up; only a manual reconnect restarts it
    RecoveryExhausted,
    /// The gateway answered a correlated request with an error
    Rejected,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    #[cfg(feature = "http")]
    pub fn status<S: Into<String>>(
        status_code: reqwest::StatusCode,
        method: reqwest::Method,
        path: String,
        message: S,
    ) -> Self {
        Status {
            status_code: status_code.as_u16(),
            method: method.to_string(),
            path,
            message: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn not_connected() -> Self {
        NotConnected.into()
    }

    #[must_use]
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Timeout { operation, after }.into()
    }

    #[must_use]
    pub fn recovery_exhausted(attempts: u32) -> Self {
        RecoveryExhausted { attempts }.into()
    }

    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Cancelled {
            reason: reason.into(),
        }
        .into()
    }

    /// Whether this error should count against the circuit breaker.
    ///
    /// Authentication problems and cancellations say nothing about the health of the gateway.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        !matches!(
            self.kind,
            Kind::Authentication | Kind::Cancelled | Kind::CircuitOpen | Kind::Validation
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Non-2xx answer from one of the REST collaborators.
#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: u16,
    pub method: String,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} with {}",
            self.status_code, self.method, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct NotConnected;

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not connected")
    }
}

impl StdError for NotConnected {}

/// Automatic recovery used up its attempt budget.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct RecoveryExhausted {
    pub attempts: u32,
}

impl fmt::Display for RecoveryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recovery gave up after {} attempts, reconnect manually",
            self.attempts
        )
    }
}

impl StdError for RecoveryExhausted {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct CircuitOpen {
    /// Time left before the breaker allows a trial attempt, if known
    pub retry_in: Option<Duration>,
}

impl fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_in {
            Some(retry_in) => write!(f, "circuit open, retry in {retry_in:?}"),
            None => f.write_str("circuit open"),
        }
    }
}

impl StdError for CircuitOpen {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    pub operation: &'static str,
    pub after: Duration,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} timed out after {:?}", self.operation, self.after)
    }
}

impl StdError for Timeout {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub reason: String,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled: {}", self.reason)
    }
}

impl StdError for Cancelled {}

/// The gateway answered a correlated request with an `error` field.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Rejected {
    pub request_id: String,
    pub message: String,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} rejected: {}", self.request_id, self.message)
    }
}

impl StdError for Rejected {}

/// Why a connect or recovery attempt did not reach CONNECTED.
///
/// This is [`Clone`] so that one in-flight attempt can hand the same outcome to every caller that
/// joined it.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The token provider had no access token to offer
    NoCredential,
    /// The gateway rejected the handshake credentials
    Authentication(String),
    /// The gateway revoked this device identity during the handshake
    DeviceInvalidated(String),
    /// The handshake did not complete within the configured bound
    HandshakeTimeout(Duration),
    /// The transport failed to open or closed during the handshake
    Transport(String),
    /// A newer connect, disconnect or desired-state change overtook this attempt
    Superseded,
    /// The circuit breaker refused the attempt
    CircuitOpen,
    /// Creating or resuming the backing session failed
    Session(String),
    /// The backing session never reported ready
    SessionNotReady { attempts: u32 },
}

impl ConnectError {
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::NoCredential | Self::Authentication(_) | Self::DeviceInvalidated(_) => {
                Kind::Authentication
            }
            Self::HandshakeTimeout(_) => Kind::Timeout,
            Self::Transport(_) => Kind::Transport,
            Self::Superseded => Kind::Cancelled,
            Self::CircuitOpen => Kind::CircuitOpen,
            Self::Session(_) | Self::SessionNotReady { .. } => Kind::Session,
        }
    }

    /// Terminal failures must not be retried automatically.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoCredential | Self::Authentication(_) | Self::DeviceInvalidated(_)
        )
    }

    /// Whether this failure says something about the health of the gateway.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout(_)
                | Self::Transport(_)
                | Self::Session(_)
                | Self::SessionNotReady { .. }
        )
    }
}

impl From<CircuitOpen> for ConnectError {
    fn from(_: CircuitOpen) -> Self {
        Self::CircuitOpen
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredential => f.write_str("no access token available"),
            Self::Authentication(reason) => write!(f, "authentication failed: {reason}"),
            Self::DeviceInvalidated(reason) => write!(f, "device id invalidated: {reason}"),
            Self::HandshakeTimeout(after) => write!(f, "handshake timed out after {after:?}"),
            Self::Transport(reason) => write!(f, "transport failure: {reason}"),
            Self::Superseded => f.write_str("superseded by a newer connection request"),
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::Session(reason) => write!(f, "session error: {reason}"),
            Self::SessionNotReady { attempts } => {
                write!(f, "session not ready after {attempts} checks")
            }
        }
    }
}

impl StdError for ConnectError {}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::with_source(err.kind(), err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Status, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::NotConnected, err)
    }
}

impl From<CircuitOpen> for Error {
    fn from(err: CircuitOpen) -> Self {
        Error::with_source(Kind::CircuitOpen, err)
    }
}

impl From<RecoveryExhausted> for Error {
    fn from(err: RecoveryExhausted) -> Self {
        Error::with_source(Kind::RecoveryExhausted, err)
    }
}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Error::with_source(Kind::Timeout, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancelled, err)
    }
}

impl From<Rejected> for Error {
    fn from(err: Rejected) -> Self {
        Error::with_source(Kind::Rejected, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(feature = "http")]
impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(e: reqwest::header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(any(feature = "http", feature = "ws"))]
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}
