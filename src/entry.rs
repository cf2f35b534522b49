//! Entry signals: when a slot should open its next position, and in which
//! direction.
//!
//! The bundled [`MovingAverageSignal`] compares a fast and a slow mean of
//! recent 1-minute closes. It is deliberately simple; any model can be
//! plugged in through [`EntrySignal`].

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::Result;
use crate::models::candle::Candle;
use crate::models::trade::Side;
use crate::xapi::{Session, StreamEvent, StreamObserver, historical_candles};

/// Source of entry decisions. Implementations receive every stream event
/// of their slot through [`StreamObserver`].
#[async_trait]
pub trait EntrySignal: StreamObserver {
    /// Called once per session before the first [`signal`](Self::signal).
    ///
    /// # Errors
    ///
    /// Implementations may fail if backfill data cannot be fetched.
    async fn prepare(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Direction to open now, or `None` to keep waiting.
    fn signal(&self) -> Option<Side>;
}

/// Fast-over-slow moving-average crossover on 1-minute closes.
#[derive(Debug)]
pub struct MovingAverageSignal {
    symbol: String,
    candles: RwLock<VecDeque<Candle>>,
}

impl MovingAverageSignal {
    /// Most recent 1-minute candles kept.
    pub const WINDOW: usize = 60;
    pub const FAST: usize = 5;
    pub const SLOW: usize = 15;

    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            candles: RwLock::new(VecDeque::with_capacity(Self::WINDOW)),
        }
    }

    /// Appends candles oldest first. A candle with the same open time as the
    /// newest one replaces it.
    pub fn seed(&self, candles: &[Candle]) {
        let mut window = self.candles.write().unwrap_or_else(PoisonError::into_inner);
        for candle in candles {
            if window
                .back()
                .is_some_and(|last| last.open_time_ms == candle.open_time_ms)
            {
                window.pop_back();
            }
            window.push_back(*candle);
            while window.len() > Self::WINDOW {
                window.pop_front();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn mean_close(window: &VecDeque<Candle>, count: usize) -> Option<f64> {
    if count == 0 || window.len() < count {
        return None;
    }
    let sum: f64 = window.iter().rev().take(count).map(|c| c.close).sum();
    Some(sum / count as f64)
}

impl StreamObserver for MovingAverageSignal {
    fn on_event(&self, event: &StreamEvent) {
        if let StreamEvent::Candle { symbol, candle } = event
            && *symbol == self.symbol
        {
            self.seed(std::slice::from_ref(candle));
        }
    }
}

#[async_trait]
impl EntrySignal for MovingAverageSignal {
    async fn prepare(&self, session: &Session) -> Result<()> {
        let candles = historical_candles(session, &self.symbol, Self::WINDOW as u32).await?;
        self.seed(&candles);
        info!(symbol = %self.symbol, candles = self.len(), "Moving-average window seeded");
        Ok(())
    }

    fn signal(&self) -> Option<Side> {
        let window = self.candles.read().unwrap_or_else(PoisonError::into_inner);
        let fast = mean_close(&window, Self::FAST)?;
        let slow = mean_close(&window, Self::SLOW)?;
        let side = if fast > slow {
            Side::Buy
        } else if fast < slow {
            Side::Sell
        } else {
            return None;
        };
        debug!(symbol = %self.symbol, fast, slow, %side, "Entry signal");
        Some(side)
    }
}
