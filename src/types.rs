//! Re-exported types from external crates for convenience.
//!
//! These types are commonly used in this crate's public API and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for timestamps in snapshots and session records.
pub use chrono::{DateTime, Utc};
/// Arbitrary precision decimal type for prices, quantities and balances.
pub use rust_decimal::Decimal;
/// Macro for creating [`Decimal`] literals at compile time.
///
/// # Example
/// ```
/// use trading_gateway_client::types::dec;
/// let price = dec!(101.25);
/// ```
pub use rust_decimal_macros::dec;
/// UUID type used for request ids and device ids.
pub use uuid::Uuid;

/// Milliseconds since [`std::time::UNIX_EPOCH`], as carried on the wire.
pub type TimestampMillis = i64;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> TimestampMillis {
    Utc::now().timestamp_millis()
}
