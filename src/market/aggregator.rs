//! Multi-resolution candle roll-up.
//!
//! Five 1-minute candles make one 5-minute candle; three 5-minute candles
//! make one 15-minute candle. Buffers are cleared after every roll-up, so a
//! derived candle never shares a source bar with its predecessor.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::candle::Candle;

/// Candle resolutions the aggregator tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
}

impl Resolution {
    /// Finest to coarsest.
    pub const ALL: [Resolution; 3] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::FifteenMinutes,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::FifteenMinutes => "15m",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merges consecutive bars into one: first open, last close, extreme
/// high/low, summed volume. The time and quote id are the last bar's.
///
/// Returns `None` for an empty slice.
#[must_use]
pub fn roll_up(bars: &[Candle]) -> Option<Candle> {
    let first = bars.first()?;
    let last = bars.last()?;
    Some(Candle {
        open_time_ms: last.open_time_ms,
        open: first.open,
        close: last.close,
        high: bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
        low: bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
        volume: bars.iter().map(|b| b.volume).sum(),
        quote_id: last.quote_id,
    })
}

/// Which resolutions a [`CandleAggregator::push`] updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollUp {
    pub five_minutes: bool,
    pub fifteen_minutes: bool,
}

/// Rolls 1-minute candles up into 5- and 15-minute candles.
#[derive(Debug, Clone, Default)]
pub struct CandleAggregator {
    one_to_five: Vec<Candle>,
    five_to_fifteen: Vec<Candle>,
    latest_one: Option<Candle>,
    latest_five: Option<Candle>,
    latest_fifteen: Option<Candle>,
}

impl CandleAggregator {
    /// 1-minute candles per 5-minute candle.
    pub const ONE_TO_FIVE: usize = 5;
    /// 5-minute candles per 15-minute candle.
    pub const FIVE_TO_FIFTEEN: usize = 3;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one 1-minute candle.
    pub fn push(&mut self, candle: Candle) -> RollUp {
        let mut rolled = RollUp::default();
        self.latest_one = Some(candle);
        self.one_to_five.push(candle);

        if self.one_to_five.len() == Self::ONE_TO_FIVE {
            if let Some(five) = roll_up(&self.one_to_five) {
                debug!(time = five.open_time_ms, close = five.close, "5m candle");
                self.latest_five = Some(five);
                self.five_to_fifteen.push(five);
                rolled.five_minutes = true;
            }
            self.one_to_five.clear();
        }

        if self.five_to_fifteen.len() == Self::FIVE_TO_FIFTEEN {
            if let Some(fifteen) = roll_up(&self.five_to_fifteen) {
                debug!(time = fifteen.open_time_ms, close = fifteen.close, "15m candle");
                self.latest_fifteen = Some(fifteen);
                rolled.fifteen_minutes = true;
            }
            self.five_to_fifteen.clear();
        }

        rolled
    }

    /// Latest candle at `resolution`, if one has been seen or derived.
    #[must_use]
    pub fn latest(&self, resolution: Resolution) -> Option<&Candle> {
        match resolution {
            Resolution::OneMinute => self.latest_one.as_ref(),
            Resolution::FiveMinutes => self.latest_five.as_ref(),
            Resolution::FifteenMinutes => self.latest_fifteen.as_ref(),
        }
    }

    /// Coarsest available candle, preferring 15m over 5m over 1m.
    #[must_use]
    pub fn best_available(&self) -> Option<(Resolution, Candle)> {
        Resolution::ALL
            .iter()
            .rev()
            .find_map(|&res| self.latest(res).map(|candle| (res, *candle)))
    }

    /// 1-minute candles waiting for the next 5-minute roll-up.
    #[must_use]
    pub fn pending_one_minute(&self) -> &[Candle] {
        &self.one_to_five
    }

    /// 5-minute candles waiting for the next 15-minute roll-up.
    #[must_use]
    pub fn pending_five_minute(&self) -> &[Candle] {
        &self.five_to_fifteen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(minute: i64, open: f64, close: f64, high: f64, low: f64, volume: f64) -> Candle {
        Candle {
            open_time_ms: minute * 60_000,
            open,
            close,
            high,
            low,
            volume,
            quote_id: minute,
        }
    }

    fn flat(minute: i64) -> Candle {
        let price = 1.0 + minute as f64 / 1000.0;
        bar(minute, price, price + 0.0005, price + 0.001, price - 0.001, 1.0)
    }

    #[test]
    fn five_one_minute_candles_make_one_five_minute_candle() {
        let mut agg = CandleAggregator::new();
        let bars = [
            bar(0, 1.10, 1.11, 1.12, 1.09, 1.0),
            bar(1, 1.11, 1.13, 1.15, 1.10, 2.0),
            bar(2, 1.13, 1.12, 1.14, 1.08, 3.0),
            bar(3, 1.12, 1.14, 1.16, 1.11, 4.0),
            bar(4, 1.14, 1.15, 1.15, 1.13, 5.0),
        ];

        for candle in &bars[..4] {
            assert_eq!(agg.push(*candle), RollUp::default());
        }
        assert!(agg.latest(Resolution::FiveMinutes).is_none());

        let rolled = agg.push(bars[4]);
        assert!(rolled.five_minutes);
        assert!(!rolled.fifteen_minutes);

        let five = agg.latest(Resolution::FiveMinutes).unwrap();
        assert_eq!(five.open, 1.10);
        assert_eq!(five.close, 1.15);
        assert_eq!(five.high, 1.16);
        assert_eq!(five.low, 1.08);
        assert_eq!(five.volume, 15.0);
        assert_eq!(five.open_time_ms, 4 * 60_000);
        assert!(agg.pending_one_minute().is_empty());
        assert_eq!(agg.pending_five_minute().len(), 1);
    }

    #[test]
    fn fifteen_one_minute_candles_make_one_fifteen_minute_candle() {
        let mut agg = CandleAggregator::new();
        let mut fifteen_count = 0;
        let mut five_count = 0;
        for minute in 0..15 {
            let rolled = agg.push(flat(minute));
            five_count += usize::from(rolled.five_minutes);
            fifteen_count += usize::from(rolled.fifteen_minutes);
        }
        assert_eq!(five_count, 3);
        assert_eq!(fifteen_count, 1);

        let fifteen = agg.latest(Resolution::FifteenMinutes).unwrap();
        assert_eq!(fifteen.open, flat(0).open);
        assert_eq!(fifteen.close, flat(14).close);
        assert_eq!(fifteen.high, flat(14).high);
        assert_eq!(fifteen.low, flat(0).low);
        assert_eq!(fifteen.volume, 15.0);
        assert!(agg.pending_five_minute().is_empty());
    }

    #[test]
    fn buffers_restart_after_roll_up() {
        let mut agg = CandleAggregator::new();
        for minute in 0..7 {
            agg.push(flat(minute));
        }
        assert_eq!(agg.pending_one_minute().len(), 2);
        assert_eq!(agg.pending_one_minute()[0].open_time_ms, 5 * 60_000);
    }

    #[test]
    fn best_available_prefers_coarsest() {
        let mut agg = CandleAggregator::new();
        assert!(agg.best_available().is_none());

        agg.push(flat(0));
        assert_eq!(agg.best_available().unwrap().0, Resolution::OneMinute);

        for minute in 1..5 {
            agg.push(flat(minute));
        }
        assert_eq!(agg.best_available().unwrap().0, Resolution::FiveMinutes);

        for minute in 5..15 {
            agg.push(flat(minute));
        }
        let (resolution, candle) = agg.best_available().unwrap();
        assert_eq!(resolution, Resolution::FifteenMinutes);
        assert_eq!(candle.open, flat(0).open);
    }

    #[test]
    fn roll_up_of_nothing_is_none() {
        assert!(roll_up(&[]).is_none());
    }

    #[test]
    fn resolution_ordering_and_names() {
        assert!(Resolution::OneMinute < Resolution::FiveMinutes);
        assert!(Resolution::FiveMinutes < Resolution::FifteenMinutes);
        let parsed: Resolution = serde_json::from_str("\"5m\"").unwrap();
        assert_eq!(parsed, Resolution::FiveMinutes);
        assert_eq!(Resolution::FifteenMinutes.to_string(), "15m");
    }
}
