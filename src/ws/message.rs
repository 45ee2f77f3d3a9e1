//! Wire envelope exchanged with the gateway.
//!
//! Every frame in either direction is one JSON [`Envelope`]. The `type` field ([`Envelope::kind`])
//! selects the meaning; payloads travel in `data` and are decoded lazily by whoever consumes the
//! message.

use bon::Builder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Result;
use crate::auth::{ExposeSecret as _, SecretString};
use crate::state::SimulatorStatus;
use crate::types::TimestampMillis;
use crate::ws::error::WsError;

/// Value of the envelope `type` field.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageType {
    Authenticate,
    Connected,
    AuthenticationFailed,
    DeviceIdInvalidated,
    Heartbeat,
    StartSimulator,
    StopSimulator,
    SubscribeMarketData,
    Response,
    MarketData,
    OrderUpdate,
    PortfolioUpdate,
    SimulatorUpdate,
    Error,
    /// Unknown message type from the gateway (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

impl MessageType {
    /// Whether the client sends this type as a correlated request.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::StartSimulator | Self::StopSimulator | Self::SubscribeMarketData
        )
    }
}

/// One frame on the gateway channel.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator_status: Option<SimulatorStatus>,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Envelope {
    /// Parse a text frame.
    pub fn parse(text: &str) -> std::result::Result<Self, WsError> {
        serde_json::from_str(text).map_err(WsError::MessageParse)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The first frame of every connection.
    #[must_use]
    pub fn authenticate(token: &SecretString, session_id: &str, device_id: &str) -> Self {
        Self::builder()
            .kind(MessageType::Authenticate)
            .data(json!({
                "token": token.expose_secret(),
                "sessionId": session_id,
                "deviceId": device_id,
            }))
            .build()
    }

    #[must_use]
    pub fn heartbeat(timestamp: TimestampMillis, device_id: &str) -> Self {
        Self::builder()
            .kind(MessageType::Heartbeat)
            .timestamp(timestamp)
            .device_id(device_id)
            .build()
    }

    /// A request without correlation id; the channel assigns one when it is sent with a response.
    #[must_use]
    pub fn request(kind: MessageType, data: Option<Value>) -> Self {
        Self {
            kind,
            request_id: None,
            timestamp: None,
            data,
            error: None,
            simulator_status: None,
            device_id: None,
        }
    }

    /// Decodes `data` into `T`, warning about unknown fields when tracing is enabled.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let Some(data) = self.data.clone() else {
            return Err(WsError::InvalidMessage(format!("{} without data", self.kind)).into());
        };

        crate::serde_helpers::deserialize_with_warnings(data)
    }

    /// Gateway-reported failure text, if any. Empty strings do not count.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|error| !error.is_empty())
    }

    /// Human-readable reason carried by handshake rejections, falling back to `default`.
    #[must_use]
    pub fn reason_or(&self, default: &str) -> String {
        self.error_message()
            .map(str::to_owned)
            .or_else(|| {
                self.data
                    .as_ref()
                    .and_then(|data| data.get("reason").or_else(|| data.get("message")))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| default.to_owned())
    }
}
