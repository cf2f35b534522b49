//! OHLCV candle models.

use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
///
/// 1-minute candles come straight from the `candle` push; 5- and 15-minute
/// candles are derived by [`CandleAggregator`](crate::market::CandleAggregator).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the bucket in milliseconds since the Unix epoch.
    pub open_time_ms: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub quote_id: i64,
}

impl Candle {
    /// Number of numeric fields in a candle snapshot.
    pub const FIELDS: usize = 7;

    /// Halfway point between open and close, used as a reversal threshold.
    #[must_use]
    pub fn midpoint(&self) -> f64 {
        self.open + (self.close - self.open) / 2.0
    }

    /// Returns the numeric snapshot in push-document field order:
    /// `ctm, open, close, high, low, vol, quoteId`.
    #[must_use]
    pub fn to_array(&self) -> [f64; Self::FIELDS] {
        [
            self.open_time_ms as f64,
            self.open,
            self.close,
            self.high,
            self.low,
            self.volume,
            self.quote_id as f64,
        ]
    }
}

/// Payload of a `candle` push.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleData {
    pub symbol: String,
    pub ctm: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub vol: f64,
    #[serde(default)]
    pub quote_id: i64,
}

impl CandleData {
    /// Drops the symbol and display-only fields, keeping the bar itself.
    #[must_use]
    pub fn candle(&self) -> Candle {
        Candle {
            open_time_ms: self.ctm,
            open: self.open,
            close: self.close,
            high: self.high,
            low: self.low,
            volume: self.vol,
            quote_id: self.quote_id,
        }
    }
}

/// `info` argument of `getChartLastRequest`.
#[derive(Debug, Clone, Serialize)]
pub struct ChartLastInfo {
    /// Bar period in minutes.
    pub period: u32,
    /// Start time in milliseconds since the Unix epoch.
    pub start: i64,
    pub symbol: String,
}

/// `returnData` of `getChartLastRequest`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartResponse {
    /// Decimal places the integer prices are scaled by.
    pub digits: u32,
    pub rate_infos: Vec<RateInfo>,
}

/// A historical bar with integer prices: `open` is absolute, the others are
/// deltas from `open`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateInfo {
    pub ctm: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub vol: f64,
}

impl RateInfo {
    /// Converts the digit-scaled delta encoding into an absolute candle.
    #[must_use]
    pub fn to_candle(&self, digits: u32) -> Candle {
        let scale = 10f64.powi(digits as i32);
        Candle {
            open_time_ms: self.ctm,
            open: self.open / scale,
            close: (self.open + self.close) / scale,
            high: (self.open + self.high) / scale,
            low: (self.open + self.low) / scale,
            volume: self.vol,
            quote_id: 0,
        }
    }
}

impl ChartResponse {
    /// Converts every rate info into an absolute candle, oldest first.
    #[must_use]
    pub fn candles(&self) -> Vec<Candle> {
        self.rate_infos
            .iter()
            .map(|info| info.to_candle(self.digits))
            .collect()
    }
}
