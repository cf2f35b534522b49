//! Close-signal evaluation for an open position.
//!
//! Two rules decide when a position is closed:
//! - **stop-loss**: the return on margin falls to `-stop_loss_pct` or lower;
//! - **reversal**: the position is in profit and the live price crosses
//!   back over the midpoint of the coarsest available candle (ask for a buy
//!   position, bid for a sell position).
//!
//! The earnings stage only ever moves up over a position's life, even when
//! the return later drops back to zero or below.

pub mod config;

use std::fmt;

use tracing::{debug, info};

use crate::market::{ObservatorSnapshot, Resolution};
use crate::models::trade::Side;

/// Thresholds the engine evaluates against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub stop_loss_pct: f64,
    pub asymmetric_take_profit_ratio: f64,
    pub reversal_min_resolution: Resolution,
}

/// How far a profitable position has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EarningsStage {
    /// Never been in profit.
    None,
    /// In profit.
    Stage0,
    /// Profit above `stop_loss_pct * asymmetric_take_profit_ratio`.
    Stage05,
    /// A 1-minute candle exists.
    Stage1,
    /// A 5-minute candle exists.
    Stage5,
    /// A 15-minute candle exists.
    Stage15,
}

/// Reported state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// Return on margin is zero or negative.
    NotEarning,
    Earning(EarningsStage),
    /// A close was decided; waiting for the broker.
    Closing,
    Closed,
}

/// Why a close was decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseReason {
    StopLoss {
        percentage: f64,
    },
    Reversal {
        resolution: Resolution,
        price: f64,
        midpoint: f64,
    },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::StopLoss { percentage } => write!(f, "stop-loss at {percentage:.3}%"),
            CloseReason::Reversal {
                resolution,
                price,
                midpoint,
            } => write!(f, "{resolution} reversal: price {price} crossed midpoint {midpoint}"),
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Hold,
    Close(CloseReason),
}

/// Return on margin in percent, or `None` when it cannot be computed.
#[must_use]
pub fn current_percentage(profit: Option<f64>, margin: f64) -> Option<f64> {
    let profit = profit?;
    if margin == 0.0 || !margin.is_finite() || !profit.is_finite() {
        return None;
    }
    Some(profit / margin * 100.0)
}

/// Decides when a single position should be closed.
#[derive(Debug, Clone)]
pub struct CloseSignalEngine {
    side: Side,
    margin: f64,
    thresholds: Thresholds,
    stage: EarningsStage,
    state: SignalState,
}

impl CloseSignalEngine {
    #[must_use]
    pub fn new(side: Side, margin: f64, thresholds: Thresholds) -> Self {
        Self {
            side,
            margin,
            thresholds,
            stage: EarningsStage::None,
            state: SignalState::NotEarning,
        }
    }

    /// Highest stage reached so far.
    #[must_use]
    pub fn stage(&self) -> EarningsStage {
        self.stage
    }

    #[must_use]
    pub fn state(&self) -> SignalState {
        self.state
    }

    pub fn mark_closing(&mut self) {
        self.state = SignalState::Closing;
    }

    pub fn mark_closed(&mut self) {
        self.state = SignalState::Closed;
    }

    /// Evaluates one consistent snapshot. Missing data means hold.
    pub fn evaluate(&mut self, snapshot: &ObservatorSnapshot) -> Decision {
        if matches!(self.state, SignalState::Closing | SignalState::Closed) {
            return Decision::Hold;
        }

        let Some(percentage) = current_percentage(snapshot.profit, self.margin) else {
            return Decision::Hold;
        };

        if percentage <= 0.0 {
            self.state = SignalState::NotEarning;
            if percentage <= -self.thresholds.stop_loss_pct {
                return Decision::Close(CloseReason::StopLoss { percentage });
            }
            return Decision::Hold;
        }

        self.advance(percentage, snapshot);
        self.state = SignalState::Earning(self.stage);

        let Some(price) = snapshot.price else {
            return Decision::Hold;
        };
        let Some((resolution, candle)) = snapshot.candles.best_available() else {
            return Decision::Hold;
        };
        if resolution < self.thresholds.reversal_min_resolution {
            return Decision::Hold;
        }

        let midpoint = candle.midpoint();
        let (quote, reversed) = match self.side {
            Side::Buy => (price.ask, price.ask < midpoint),
            Side::Sell => (price.bid, price.bid > midpoint),
        };
        if reversed {
            Decision::Close(CloseReason::Reversal {
                resolution,
                price: quote,
                midpoint,
            })
        } else {
            Decision::Hold
        }
    }

    fn advance(&mut self, percentage: f64, snapshot: &ObservatorSnapshot) {
        let mut reached = EarningsStage::Stage0;
        let take_profit =
            self.thresholds.stop_loss_pct * self.thresholds.asymmetric_take_profit_ratio;
        if percentage > take_profit {
            reached = EarningsStage::Stage05;
        }
        let candles = &snapshot.candles;
        if candles.latest(Resolution::OneMinute).is_some() {
            reached = reached.max(EarningsStage::Stage1);
        }
        if candles.latest(Resolution::FiveMinutes).is_some() {
            reached = reached.max(EarningsStage::Stage5);
        }
        if candles.latest(Resolution::FifteenMinutes).is_some() {
            reached = reached.max(EarningsStage::Stage15);
        }

        if reached > self.stage {
            info!(from = ?self.stage, to = ?reached, percentage, "Earnings stage advanced");
            self.stage = reached;
        } else {
            debug!(stage = ?self.stage, percentage, "Earning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::CandleAggregator;
    use crate::models::candle::Candle;
    use crate::models::tick::TickPrice;

    fn thresholds() -> Thresholds {
        Thresholds {
            stop_loss_pct: 1.5,
            asymmetric_take_profit_ratio: 0.5,
            reversal_min_resolution: Resolution::OneMinute,
        }
    }

    fn tick(ask: f64, bid: f64) -> TickPrice {
        TickPrice {
            ask,
            bid,
            high: ask,
            low: bid,
            ask_volume: 0.0,
            bid_volume: 0.0,
            timestamp: 0,
            level: 0,
            quote_id: 0,
            spread_table: 0.0,
            spread_raw: 0.0,
        }
    }

    fn candle(minute: i64, open: f64, close: f64) -> Candle {
        Candle {
            open_time_ms: minute * 60_000,
            open,
            close,
            high: open.max(close),
            low: open.min(close),
            volume: 1.0,
            quote_id: 0,
        }
    }

    /// Aggregator holding a 15m candle spanning `open` to `close`.
    fn fifteen_minute(open: f64, close: f64) -> CandleAggregator {
        let mut agg = CandleAggregator::new();
        for minute in 0..15 {
            let o = if minute == 0 { open } else { close };
            agg.push(candle(minute, o, close));
        }
        agg
    }

    fn snapshot(profit: Option<f64>, price: Option<TickPrice>, candles: CandleAggregator) -> ObservatorSnapshot {
        ObservatorSnapshot {
            price,
            profit,
            candles,
        }
    }

    #[test]
    fn stop_loss_triggers_at_threshold() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        let decision = engine.evaluate(&snapshot(Some(-16.0), None, CandleAggregator::new()));
        assert!(matches!(
            decision,
            Decision::Close(CloseReason::StopLoss { percentage }) if (percentage + 1.6).abs() < 1e-9
        ));
    }

    #[test]
    fn loss_inside_threshold_holds() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        let decision = engine.evaluate(&snapshot(Some(-14.0), None, CandleAggregator::new()));
        assert_eq!(decision, Decision::Hold);
        assert_eq!(engine.state(), SignalState::NotEarning);
    }

    #[test]
    fn missing_profit_or_zero_margin_holds() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        assert_eq!(
            engine.evaluate(&snapshot(None, Some(tick(1.0, 1.0)), CandleAggregator::new())),
            Decision::Hold
        );

        let mut engine = CloseSignalEngine::new(Side::Buy, 0.0, thresholds());
        assert_eq!(
            engine.evaluate(&snapshot(Some(-500.0), None, CandleAggregator::new())),
            Decision::Hold
        );
    }

    #[test]
    fn buy_closes_when_ask_falls_below_midpoint() {
        let candles = fifteen_minute(1.1000, 1.1010);
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());

        let hold = engine.evaluate(&snapshot(Some(5.0), Some(tick(1.1007, 1.1005)), candles.clone()));
        assert_eq!(hold, Decision::Hold);
        assert_eq!(engine.stage(), EarningsStage::Stage15);

        let close = engine.evaluate(&snapshot(Some(5.0), Some(tick(1.1003, 1.1001)), candles));
        assert!(matches!(
            close,
            Decision::Close(CloseReason::Reversal {
                resolution: Resolution::FifteenMinutes,
                ..
            })
        ));
    }

    #[test]
    fn sell_uses_bid_against_midpoint() {
        let candles = fifteen_minute(1.1010, 1.1000);
        let mut engine = CloseSignalEngine::new(Side::Sell, 1000.0, thresholds());

        let hold = engine.evaluate(&snapshot(Some(5.0), Some(tick(1.1006, 1.1003)), candles.clone()));
        assert_eq!(hold, Decision::Hold);

        let close = engine.evaluate(&snapshot(Some(5.0), Some(tick(1.1009, 1.1007)), candles));
        assert!(matches!(close, Decision::Close(CloseReason::Reversal { price, .. }) if price == 1.1007));
    }

    #[test]
    fn stage_never_moves_down() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        let mut candles = CandleAggregator::new();
        candles.push(candle(0, 1.0, 1.0));

        engine.evaluate(&snapshot(Some(10.0), None, candles.clone()));
        assert_eq!(engine.stage(), EarningsStage::Stage1);

        engine.evaluate(&snapshot(Some(-1.0), None, candles.clone()));
        assert_eq!(engine.stage(), EarningsStage::Stage1);
        assert_eq!(engine.state(), SignalState::NotEarning);

        engine.evaluate(&snapshot(Some(1.0), None, CandleAggregator::new()));
        assert_eq!(engine.stage(), EarningsStage::Stage1);
        assert_eq!(engine.state(), SignalState::Earning(EarningsStage::Stage1));
    }

    #[test]
    fn small_gain_reaches_stage_zero_only() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        engine.evaluate(&snapshot(Some(5.0), None, CandleAggregator::new()));
        assert_eq!(engine.stage(), EarningsStage::Stage0);

        engine.evaluate(&snapshot(Some(8.0), None, CandleAggregator::new()));
        assert_eq!(engine.stage(), EarningsStage::Stage05);
    }

    #[test]
    fn minimum_resolution_blocks_finer_candles() {
        let mut candles = CandleAggregator::new();
        candles.push(candle(0, 1.1000, 1.1010));
        let mut engine = CloseSignalEngine::new(
            Side::Buy,
            1000.0,
            Thresholds {
                reversal_min_resolution: Resolution::FiveMinutes,
                ..thresholds()
            },
        );
        let decision = engine.evaluate(&snapshot(Some(5.0), Some(tick(1.0, 1.0)), candles));
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn closing_engine_holds() {
        let mut engine = CloseSignalEngine::new(Side::Buy, 1000.0, thresholds());
        engine.mark_closing();
        let decision = engine.evaluate(&snapshot(Some(-100.0), None, CandleAggregator::new()));
        assert_eq!(decision, Decision::Hold);
        assert_eq!(engine.state(), SignalState::Closing);
    }
}
