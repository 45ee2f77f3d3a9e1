//! REST collaborators consumed by the connection layer.
//!
//! The facade only needs the two traits below. [`http::HttpApi`] (feature `http`) implements both
//! against the gateway's REST endpoints; tests and embedders can supply their own.

#[cfg(feature = "http")]
pub mod http;
pub mod types;

use async_trait::async_trait;

use self::types::{OrderAck, OrderRequest, SessionInfo};
use crate::Result;

/// Creates and resumes the backing trading session.
#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    async fn create_session(&self) -> Result<SessionInfo>;

    /// Whether the session is ready to accept a channel.
    async fn check_session_ready(&self, session_id: &str) -> Result<bool>;

    /// Asks the backend to resume `session_id` after a connection loss. `attempt` is 1-based.
    async fn reconnect_session(&self, session_id: &str, attempt: u32) -> Result<SessionInfo>;

    async fn session_state(&self, session_id: &str) -> Result<SessionInfo>;
}

/// Order entry. Implementations must not retry on their own.
#[async_trait]
pub trait OrderApi: Send + Sync + 'static {
    /// Submits `order`. The backend deduplicates on `request_id`.
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, session_id: &str, order_id: &str) -> Result<OrderAck>;
}
