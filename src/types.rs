// =============================================================================
// Shared types used across the MEP engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side as the venue spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status from an execution report.
///
/// `FILLED`, `CANCELED` and `REJECTED` are terminal for a given order id.
/// Statuses the venue may add later land in `Other` and never mutate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Other(String),
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "NEW" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELLED" | "CANCELED" => Self::Canceled,
            "REJECTED" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only these statuses carry executed quantity.
    pub fn is_fill(&self) -> bool {
        matches!(self, Self::Filled | Self::PartiallyFilled)
    }
}

/// Time-in-force for outbound orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    Day,
    Ioc,
}

impl Tif {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Ioc => "IOC",
        }
    }
}

/// Best bid and best ask with their displayed sizes.
///
/// A symbol transitions atomically from "no quote" to a full top-of-book;
/// partially populated entries are never exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopOfBook {
    pub ts: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

/// Venue-generated lifecycle event for an order.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Option<Side>,
    pub price: f64,
    pub qty: f64,
    pub status: OrderStatus,
    pub order_id: String,
    pub client_order_id: String,
}

/// One dual-listed bond: the ARS leg and its hard-dollar sibling.
///
/// Invariant: `usd_symbol == ars_symbol + "D"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pair {
    pub ars_symbol: String,
    pub usd_symbol: String,
}

impl Pair {
    pub fn new(ars_symbol: impl Into<String>, usd_symbol: impl Into<String>) -> Self {
        Self {
            ars_symbol: ars_symbol.into(),
            usd_symbol: usd_symbol.into(),
        }
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ars_symbol, self.usd_symbol)
    }
}

/// Available cash per currency. May go transiently negative when derived
/// from fills alone; the periodic account refresh corrects the drift.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Cash {
    pub ars: f64,
    pub usd: f64,
}
