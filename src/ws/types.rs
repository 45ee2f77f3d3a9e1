//! Payloads carried in the `data` field of gateway envelopes.

use std::collections::HashMap;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::state::SimulatorStatus;
use crate::types::{Decimal, TimestampMillis};

/// Either a single item or a batch; the gateway sends both shapes for streamed updates.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Latest quote for one symbol.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    #[builder(into)]
    pub symbol: String,
    /// Last traded price
    pub price: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<TimestampMillis>,
}

#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    /// Unknown order status from the gateway (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

impl OrderStatus {
    /// Whether no further updates are expected for the order.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Status change of one order.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    #[builder(into)]
    pub order_id: String,
    pub status: OrderStatus,
    #[builder(into)]
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub filled_quantity: Option<Decimal>,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<TimestampMillis>,
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[builder(into)]
    pub symbol: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub market_value: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
}

/// Portfolio refresh. Every present field replaces the cached value for that key wholesale.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioUpdate {
    #[serde(default)]
    pub cash: Option<Decimal>,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub buying_power: Option<Decimal>,
    #[serde(default)]
    pub positions: Option<HashMap<String, Position>>,
}

/// Last-known portfolio projection.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub cash: Option<Decimal>,
    pub equity: Option<Decimal>,
    pub buying_power: Option<Decimal>,
    pub positions: HashMap<String, Position>,
}

impl Portfolio {
    /// Returns a new projection with every key present in `update` replaced.
    #[must_use]
    pub fn apply(&self, update: PortfolioUpdate) -> Self {
        Self {
            cash: update.cash.or(self.cash),
            equity: update.equity.or(self.equity),
            buying_power: update.buying_power.or(self.buying_power),
            positions: update
                .positions
                .unwrap_or_else(|| self.positions.clone()),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorUpdate {
    #[serde(default)]
    pub simulator_id: Option<String>,
    pub status: SimulatorStatus,
}

/// Payload of `subscribe_market_data`.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MarketDataSubscription {
    pub symbols: Vec<String>,
}

impl MarketDataSubscription {
    #[must_use]
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn quotes_accept_single_and_batch() {
        let one: OneOrMany<Quote> =
            serde_json::from_str(r#"{"symbol":"AAPL","price":"190.5"}"#).expect("single");
        assert_eq!(one.into_vec().len(), 1);

        let many: OneOrMany<Quote> = serde_json::from_str(
            r#"[{"symbol":"AAPL","price":190.5},{"symbol":"MSFT","price":"410","bid":"409.9"}]"#,
        )
        .expect("batch");
        let quotes = many.into_vec();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[1].bid, Some(dec!(409.9)));
    }

    #[test]
    fn order_status_keeps_unknown_values() {
        let update: OrderUpdate =
            serde_json::from_str(r#"{"orderId":"o-1","status":"partially_filled"}"#)
                .expect("decode");
        assert_eq!(update.status, OrderStatus::PartiallyFilled);
        assert!(!update.status.is_final());

        let update: OrderUpdate =
            serde_json::from_str(r#"{"orderId":"o-2","status":"expired"}"#).expect("decode");
        assert_eq!(update.status, OrderStatus::Unknown("expired".to_owned()));
    }

    #[test]
    fn portfolio_update_replaces_present_keys_only() {
        let current = Portfolio {
            cash: Some(dec!(1000)),
            equity: Some(dec!(1500)),
            ..Portfolio::default()
        };
        let update = PortfolioUpdate::builder()
            .cash(dec!(900))
            .positions(HashMap::from([(
                "AAPL".to_owned(),
                Position::builder().symbol("AAPL").quantity(dec!(1)).build(),
            )]))
            .build();

        let next = current.apply(update);

        assert_eq!(next.cash, Some(dec!(900)));
        assert_eq!(next.equity, Some(dec!(1500)));
        assert_eq!(next.positions.len(), 1);
        assert_eq!(current.cash, Some(dec!(1000)));
    }

    #[test]
    fn subscription_serializes_symbols() {
        let json =
            serde_json::to_string(&MarketDataSubscription::new(["AAPL", "MSFT"])).expect("json");
        assert_eq!(json, r#"{"symbols":["AAPL","MSFT"]}"#);
    }
}
