//! Tick price models (`tickPrices` push).

use serde::Deserialize;

/// Payload of a `tickPrices` push.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickData {
    pub symbol: String,
    pub ask: f64,
    pub bid: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub ask_volume: Option<f64>,
    #[serde(default)]
    pub bid_volume: Option<f64>,
    pub timestamp: i64,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub quote_id: i64,
    #[serde(default)]
    pub spread_table: f64,
    #[serde(default)]
    pub spread_raw: f64,
}

impl TickData {
    /// Drops the symbol, keeping only the numeric quote.
    #[must_use]
    pub fn price(&self) -> TickPrice {
        TickPrice {
            ask: self.ask,
            bid: self.bid,
            high: self.high,
            low: self.low,
            ask_volume: self.ask_volume.unwrap_or(0.0),
            bid_volume: self.bid_volume.unwrap_or(0.0),
            timestamp: self.timestamp,
            level: self.level,
            quote_id: self.quote_id,
            spread_table: self.spread_table,
            spread_raw: self.spread_raw,
        }
    }
}

/// Latest bid/ask snapshot for a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickPrice {
    pub ask: f64,
    pub bid: f64,
    pub high: f64,
    pub low: f64,
    pub ask_volume: f64,
    pub bid_volume: f64,
    pub timestamp: i64,
    pub level: i32,
    pub quote_id: i64,
    pub spread_table: f64,
    pub spread_raw: f64,
}

impl TickPrice {
    /// Number of numeric fields in a tick snapshot.
    pub const FIELDS: usize = 11;

    /// Returns the numeric snapshot in push-document field order:
    /// `ask, bid, high, low, askVolume, bidVolume, timestamp, level,
    /// quoteId, spreadTable, spreadRaw`.
    #[must_use]
    pub fn to_array(&self) -> [f64; Self::FIELDS] {
        [
            self.ask,
            self.bid,
            self.high,
            self.low,
            self.ask_volume,
            self.bid_volume,
            self.timestamp as f64,
            f64::from(self.level),
            self.quote_id as f64,
            self.spread_table,
            self.spread_raw,
        ]
    }
}
