//! Core type definitions

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Number of decimal places every derived price carries
pub const PRICE_SCALE: u32 = 2;

/// Default number of samples kept per instrument
pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// Raw upstream observation. Not validated until it reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub name: String,
    pub price: f64,
}

impl Tick {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }
}

/// Derived per-instrument state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentState {
    pub price: Decimal,
    /// Percentage change against the immediately preceding price
    pub change: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl InstrumentState {
    /// State for the first sighting of an instrument
    pub fn first(price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            price,
            change: Decimal::new(0, PRICE_SCALE),
            high: price,
            low: price,
            updated_at: now,
        }
    }

    /// Derive the successor state from this one
    pub fn next(&self, price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            price,
            change: percent_change(self.price, price),
            high: self.high.max(price),
            low: self.low.min(price),
            updated_at: now,
        }
    }
}

/// One point of an instrument's rolling history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySample {
    pub price: Decimal,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

/// Per-tick record produced by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentUpdate {
    pub name: String,
    pub state: InstrumentState,
}

/// Full current state, ordered by instrument name
pub type Snapshot = BTreeMap<String, InstrumentState>;

/// Opaque handle for one connected consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Round a raw price to two decimals (half away from zero).
///
/// Returns `None` for NaN, infinities and anything outside the decimal range.
pub fn round2(raw: f64) -> Option<Decimal> {
    if !raw.is_finite() {
        return None;
    }
    let mut value = Decimal::from_f64(raw)?
        .round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(PRICE_SCALE);
    Some(value)
}

/// `(curr - prev) / prev * 100`, rounded to two decimals.
///
/// A zero previous price yields zero rather than an infinite change.
pub fn percent_change(prev: Decimal, curr: Decimal) -> Decimal {
    let change = curr
        .checked_sub(prev)
        .and_then(|delta| delta.checked_div(prev))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO);

    let mut change =
        change.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero);
    change.rescale(PRICE_SCALE);
    change
}
