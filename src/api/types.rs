use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::state::SimulatorStatus;
use crate::types::{Decimal, Uuid};
use crate::ws::types::OrderStatus;

#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Pending,
    Ready,
    Expired,
    /// Unknown session status from the backend (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

/// The backing session as reported by the REST API.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[builder(into)]
    pub session_id: String,
    #[serde(default)]
    #[builder(default)]
    pub status: SessionStatus,
    #[serde(default)]
    #[builder(into)]
    pub simulator_id: Option<String>,
    #[serde(default)]
    pub simulator_status: Option<SimulatorStatus>,
}

#[cfg(feature = "http")]
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ReadyResponse {
    pub(crate) ready: bool,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

/// An order to submit.
///
/// `request_id` is the idempotency key; it is generated once when the request is built and reused
/// if the caller chooses to resubmit the same value.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[builder(default = Uuid::new_v4().to_string(), into)]
    pub request_id: String,
    /// Filled in by the client from the current session when left empty
    #[builder(into)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[builder(into)]
    pub symbol: String,
    pub side: Side,
    #[builder(default)]
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// Acknowledgement of a submitted or cancelled order.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
