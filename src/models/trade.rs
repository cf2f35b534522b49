//! Trade execution models.
//!
//! Covers the `tradeTransaction` request, the trade records returned by
//! `getTrades` / `getTradesHistory`, and the position and closed-trade
//! records the lifecycle hands around.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price sent with market transactions; the broker fills at market and
/// ignores it.
pub const MARKET_ORDER_PRICE: f64 = 1.4;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the wire `cmd` code (`0` = buy, `1` = sell).
    #[must_use]
    pub fn cmd(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    /// Parses a wire `cmd` code. Pending-order codes return `None`.
    #[must_use]
    pub fn from_cmd(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// `type` field of a trade transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Open,
    Pending,
    Close,
    Modify,
    Delete,
}

impl TransactionType {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            TransactionType::Open => 0,
            TransactionType::Pending => 1,
            TransactionType::Close => 2,
            TransactionType::Modify => 3,
            TransactionType::Delete => 4,
        }
    }
}

/// `tradeTransInfo` argument of `tradeTransaction`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTransInfo {
    pub cmd: u8,
    pub custom_comment: String,
    pub expiration: i64,
    /// Position number to act on; `0` when opening.
    pub order: i64,
    pub price: f64,
    pub sl: f64,
    pub tp: f64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub trans_type: u8,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
}

impl TradeTransInfo {
    /// Builds a market transaction opening a new position.
    #[must_use]
    pub fn open(symbol: &str, side: Side, volume: Decimal) -> Self {
        Self {
            cmd: side.cmd(),
            custom_comment: String::new(),
            expiration: 0,
            order: 0,
            price: MARKET_ORDER_PRICE,
            sl: 0.0,
            tp: 0.0,
            symbol: symbol.to_string(),
            trans_type: TransactionType::Open.code(),
            volume,
        }
    }

    /// Builds a market transaction closing an existing position.
    #[must_use]
    pub fn close(symbol: &str, side: Side, position: i64, volume: Decimal) -> Self {
        Self {
            order: position,
            trans_type: TransactionType::Close.code(),
            ..Self::open(symbol, side, volume)
        }
    }
}

/// `returnData` of `tradeTransaction`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TradeTransactionResult {
    pub order: i64,
}

/// `returnData` of `getMarginTrade`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MarginResult {
    pub margin: f64,
}

/// A trade record from `getTrades` or `getTradesHistory`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub order: i64,
    /// Order number of the transaction that opened the position.
    pub order2: i64,
    pub position: i64,
    pub cmd: u8,
    pub volume: f64,
    pub open_price: f64,
    pub open_time: i64,
    #[serde(default)]
    pub close_price: f64,
    #[serde(default)]
    pub close_time: Option<i64>,
    #[serde(default)]
    pub profit: Option<f64>,
}

/// Lifecycle stage of a [`Position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// A live position owned by one slot.
#[derive(Debug, Clone)]
pub struct Position {
    /// Order number returned by the opening transaction (`order2` in pushes).
    pub order_id: i64,
    /// Position number used to close the trade.
    pub position_id: i64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: f64,
    pub open_time: i64,
    pub margin: f64,
    pub status: PositionStatus,
}

/// A completed position as reported by the broker's trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub order: i64,
    pub position: i64,
    pub side: Side,
    pub volume: Decimal,
    pub profit: f64,
    pub open_price: f64,
    pub open_time: i64,
    pub close_price: f64,
    pub close_time: i64,
}

impl ClosedTrade {
    /// Combines the position being closed with its trade-history record.
    #[must_use]
    pub fn from_history(position: &Position, record: &TradeRecord) -> Self {
        Self {
            symbol: record.symbol.clone(),
            order: position.order_id,
            position: record.position,
            side: position.side,
            volume: position.volume,
            profit: record.profit.unwrap_or_default(),
            open_price: record.open_price,
            open_time: record.open_time,
            close_price: record.close_price,
            close_time: record.close_time.unwrap_or_default(),
        }
    }
}
