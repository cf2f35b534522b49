//! Per-position view of the market.
//!
//! A [`PriceObservator`] watches one symbol and one position: it keeps the
//! latest tick, the latest profit of its position, and the candle roll-up.
//! Each stream event is applied under a single write lock and readers take
//! a [`snapshot`](PriceObservator::snapshot), so a decision never sees a
//! half-applied update.

use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use super::CandleAggregator;
use crate::models::tick::TickPrice;
use crate::xapi::{StreamEvent, StreamObserver};

/// Consistent copy of an observator's state.
#[derive(Debug, Clone, Default)]
pub struct ObservatorSnapshot {
    pub price: Option<TickPrice>,
    pub profit: Option<f64>,
    pub candles: CandleAggregator,
}

/// Tracks the market for one open position.
#[derive(Debug)]
pub struct PriceObservator {
    symbol: String,
    /// Opening order number; matched against `order2` of profit pushes.
    order_id: i64,
    state: RwLock<ObservatorSnapshot>,
}

impl PriceObservator {
    #[must_use]
    pub fn new(symbol: impl Into<String>, order_id: i64) -> Self {
        Self {
            symbol: symbol.into(),
            order_id,
            state: RwLock::new(ObservatorSnapshot::default()),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Applies one event. Returns `false` if it concerns another symbol or
    /// position.
    pub fn apply(&self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Tick { symbol, price } if *symbol == self.symbol => {
                self.write().price = Some(*price);
                trace!(symbol = %self.symbol, snapshot = ?price.to_array(), "Tick");
                true
            }
            StreamEvent::Candle { symbol, candle } if *symbol == self.symbol => {
                let rolled = self.write().candles.push(*candle);
                debug!(
                    symbol = %self.symbol,
                    time = candle.open_time_ms,
                    close = candle.close,
                    five_minutes = rolled.five_minutes,
                    fifteen_minutes = rolled.fifteen_minutes,
                    "Candle"
                );
                trace!(symbol = %self.symbol, snapshot = ?candle.to_array(), "Candle");
                true
            }
            StreamEvent::Profit(profit) if profit.order2 == self.order_id => {
                self.write().profit = Some(profit.profit);
                trace!(order = self.order_id, profit = profit.profit, "Profit");
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ObservatorSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ObservatorSnapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamObserver for PriceObservator {
    fn on_event(&self, event: &StreamEvent) {
        self.apply(event);
    }
}
