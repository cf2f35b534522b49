//! Trading slots and their scheduler.
//!
//! A slot owns one session and trades one symbol: it waits for an entry
//! signal, opens a position, watches it until the close signal fires,
//! closes it, records the closed trade, and starts over. Slots run side by
//! side under a [`SlotScheduler`]; a fatal error in any slot stops them all.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, TradingConfig};
use crate::entry::{EntrySignal, MovingAverageSignal};
use crate::market::PriceObservator;
use crate::models::trade::{ClosedTrade, Position, PositionStatus, Side};
use crate::signal::config::{SignalConfig, SignalParams};
use crate::signal::{CloseSignalEngine, Decision};
use crate::store::TradeStore;
use crate::xapi::{
    Connector, ObserverRegistry, Session, StreamEvent, StreamObserver, StreamRouter,
    close_position, open_position, symbol_channels,
};
use crate::{Result, XapiError};

/// Runs one position from open to closed.
///
/// The position being watched stays readable through
/// [`active_position`](Self::active_position), including after a
/// [`run`](Self::run) future was dropped mid-flight.
pub struct PositionLifecycle {
    session: Arc<Session>,
    registry: ObserverRegistry,
    params: SignalParams,
    trading: TradingConfig,
    active: Mutex<Option<Position>>,
}

impl PositionLifecycle {
    /// `registry` must be the one the session's [`StreamRouter`] dispatches to.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        registry: ObserverRegistry,
        params: SignalParams,
        trading: TradingConfig,
    ) -> Self {
        Self {
            session,
            registry,
            params,
            trading,
            active: Mutex::new(None),
        }
    }

    /// The position opened by the last [`run`](Self::run) that has not
    /// finished closing.
    #[must_use]
    pub fn active_position(&self) -> Option<Position> {
        self.active_lock().clone()
    }

    fn active_lock(&self) -> MutexGuard<'_, Option<Position>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, position: &Position) {
        *self.active_lock() = Some(position.clone());
    }

    /// Closes whatever position a dropped [`run`](Self::run) left open.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Cancelled`] if `cancel` fires first, or a fatal
    /// session error; the position stays tracked in both cases.
    pub async fn close_active(&self, cancel: &CancellationToken) -> Result<Option<ClosedTrade>> {
        let Some(mut position) = self.active_position() else {
            return Ok(None);
        };
        position.status = PositionStatus::Closing;
        self.track(&position);

        let closed = close_position(&self.session, &position, &self.trading, cancel).await?;
        *self.active_lock() = None;
        Ok(Some(closed))
    }

    /// Opens a `side` position on `symbol`, closes it once the close signal
    /// fires, and returns the broker's record of the closed trade.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Cancelled`] if `cancel` fires first (an open
    /// position is left at the broker), the open transaction's rejection,
    /// or a fatal session error.
    pub async fn run(
        &self,
        symbol: &str,
        side: Side,
        cancel: &CancellationToken,
    ) -> Result<ClosedTrade> {
        let mut position = open_position(
            &self.session,
            symbol,
            side,
            self.params.volume,
            &self.trading,
            cancel,
        )
        .await?;
        self.track(&position);

        let observator = Arc::new(PriceObservator::new(symbol, position.order_id));
        let observer_id = self.registry.register(observator.clone());
        let outcome = self.watch_and_close(&mut position, &observator, cancel).await;
        self.registry.unregister(observer_id);
        *self.active_lock() = None;
        outcome
    }

    async fn watch_and_close(
        &self,
        position: &mut Position,
        observator: &PriceObservator,
        cancel: &CancellationToken,
    ) -> Result<ClosedTrade> {
        let mut engine =
            CloseSignalEngine::new(position.side, position.margin, self.params.thresholds());
        let mut ticker = tokio::time::interval(self.params.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    warn!(
                        symbol = %position.symbol,
                        position = position.position_id,
                        "Cancelled while position is open"
                    );
                    return Err(XapiError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            if let Decision::Close(reason) = engine.evaluate(&observator.snapshot()) {
                break reason;
            }
        };

        info!(
            symbol = %position.symbol,
            position = position.position_id,
            stage = ?engine.stage(),
            %reason,
            "Close signal"
        );
        engine.mark_closing();
        position.status = PositionStatus::Closing;
        self.track(position);

        let closed = close_position(&self.session, position, &self.trading, cancel).await?;
        position.status = PositionStatus::Closed;
        engine.mark_closed();
        Ok(closed)
    }
}

/// Something the scheduler can run until cancelled.
#[async_trait]
pub trait SlotRunner: Send + 'static {
    fn symbol(&self) -> &str;

    /// Runs until `cancel` fires or the slot fails.
    ///
    /// # Errors
    ///
    /// Fatal errors ([`XapiError::is_fatal`]) stop every slot.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

/// Forwards router events to a slot's entry signal.
struct EntryFeed(Arc<dyn EntrySignal>);

impl StreamObserver for EntryFeed {
    fn on_event(&self, event: &StreamEvent) {
        self.0.on_event(event);
    }
}

/// One symbol, one session, one position at a time.
pub struct TradingSlot {
    symbol: String,
    session: Arc<Session>,
    entry: Arc<dyn EntrySignal>,
    store: Arc<dyn TradeStore>,
    params: SignalParams,
    trading: TradingConfig,
}

impl TradingSlot {
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        session: Arc<Session>,
        entry: Arc<dyn EntrySignal>,
        store: Arc<dyn TradeStore>,
        params: SignalParams,
        trading: TradingConfig,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            session,
            entry,
            store,
            params,
            trading,
        }
    }

    async fn run_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.open().await?;

        let registry = ObserverRegistry::new();
        registry.register(Arc::new(EntryFeed(Arc::clone(&self.entry))));

        let mut router = StreamRouter::new(Arc::clone(&self.session), registry.clone());
        for channel in symbol_channels(&self.symbol) {
            router.subscribe(channel).await?;
        }

        let router_cancel = cancel.child_token();
        let mut router_task = tokio::spawn(router.run(router_cancel.clone()));

        if let Err(e) = self.entry.prepare(&self.session).await {
            if e.is_fatal() {
                router_cancel.cancel();
                return Err(e);
            }
            warn!(symbol = %self.symbol, error = %e, "Entry signal backfill failed");
        }

        let lifecycle = PositionLifecycle::new(
            Arc::clone(&self.session),
            registry,
            self.params.clone(),
            self.trading,
        );

        let mut router_finished = false;
        let outcome = tokio::select! {
            joined = &mut router_task => {
                router_finished = true;
                match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(XapiError::StreamLost(format!("router task failed: {e}"))),
                }
            }
            traded = self.trade_loop(&lifecycle, cancel) => traded,
        };

        router_cancel.cancel();
        if !router_finished && let Err(e) = router_task.await {
            warn!(symbol = %self.symbol, error = %e, "Router task did not stop cleanly");
        }

        if router_finished && let Err(e) = &outcome {
            self.close_orphaned(&lifecycle, e, cancel).await;
        }
        outcome
    }

    /// Closes a position whose price feed ended with `cause`. The command
    /// socket does not depend on the stream, so the close is still sent.
    async fn close_orphaned(
        &self,
        lifecycle: &PositionLifecycle,
        cause: &XapiError,
        cancel: &CancellationToken,
    ) {
        let Some(position) = lifecycle.active_position() else {
            return;
        };
        if cause.is_fatal() {
            error!(
                symbol = %self.symbol,
                position = position.position_id,
                error = %cause,
                "Session failed with position open; position left at the broker"
            );
            return;
        }

        error!(
            symbol = %self.symbol,
            position = position.position_id,
            error = %cause,
            "Stream lost with position open; closing it"
        );
        match lifecycle.close_active(cancel).await {
            Ok(Some(trade)) => {
                if let Err(e) = self.store.record(&trade).await {
                    error!(symbol = %self.symbol, position = trade.position, error = %e, "Closed trade not recorded");
                }
            }
            Ok(None) => {}
            Err(e) => error!(
                symbol = %self.symbol,
                position = position.position_id,
                error = %e,
                "Position left at the broker"
            ),
        }
    }

    async fn trade_loop(&self, lifecycle: &PositionLifecycle, cancel: &CancellationToken) -> Result<()> {
        loop {
            let Some(side) = self.wait_for_entry(cancel).await else {
                return Ok(());
            };
            info!(symbol = %self.symbol, %side, "Entry signal");

            match lifecycle.run(&self.symbol, side, cancel).await {
                Ok(trade) => {
                    if let Err(e) = self.store.record(&trade).await {
                        error!(symbol = %self.symbol, position = trade.position, error = %e, "Closed trade not recorded");
                    }
                }
                Err(XapiError::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "Position attempt failed");
                    if !self.pause(self.trading.close_retry_interval, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Polls the entry signal until it fires. `None` once cancelled.
    async fn wait_for_entry(&self, cancel: &CancellationToken) -> Option<Side> {
        let mut ticker = tokio::time::interval(self.trading.trade_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }
            if let Some(side) = self.entry.signal() {
                return Some(side);
            }
        }
    }

    /// Sleeps unless cancelled first. Returns `false` when cancelled.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[async_trait]
impl SlotRunner for TradingSlot {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        info!(symbol = %self.symbol, "Slot started");
        let outcome = self.run_session(&cancel).await;
        self.session.close().await;
        info!(symbol = %self.symbol, "Slot stopped");
        outcome
    }
}

/// Builds one moving-average slot per configured symbol, each with its own
/// session.
#[must_use]
pub fn build_slots(
    config: &AppConfig,
    signal: &SignalConfig,
    connector: &Arc<dyn Connector>,
    store: &Arc<dyn TradeStore>,
) -> Vec<Box<dyn SlotRunner>> {
    config
        .symbols
        .iter()
        .map(|symbol| {
            let session = Arc::new(Session::new(
                &config.xapi,
                Arc::clone(connector),
                config.session,
            ));
            Box::new(TradingSlot::new(
                symbol.clone(),
                session,
                Arc::new(MovingAverageSignal::new(symbol.clone())),
                Arc::clone(store),
                signal.params_for(symbol),
                config.trading,
            )) as Box<dyn SlotRunner>
        })
        .collect()
}

/// Runs slots concurrently and propagates fatal failures.
pub struct SlotScheduler {
    slots: Vec<Box<dyn SlotRunner>>,
}

impl SlotScheduler {
    #[must_use]
    pub fn new(slots: Vec<Box<dyn SlotRunner>>) -> Self {
        Self { slots }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Runs every slot until `shutdown` fires or all slots have ended.
    ///
    /// A non-fatal slot failure is logged and the other slots keep running.
    /// A fatal failure cancels `shutdown` and is returned once every slot
    /// has stopped.
    ///
    /// # Errors
    ///
    /// Returns the first fatal slot error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();
        for slot in self.slots {
            let symbol = slot.symbol().to_string();
            let token = shutdown.child_token();
            set.spawn(async move { (symbol, slot.run(token).await) });
        }
        info!(slots = set.len(), "Scheduler started");

        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((symbol, Ok(()))) => info!(%symbol, "Slot finished"),
                Ok((symbol, Err(e))) if e.is_fatal() => {
                    error!(%symbol, error = %e, "Fatal slot failure; stopping all slots");
                    shutdown.cancel();
                    fatal.get_or_insert(e);
                }
                Ok((symbol, Err(e))) => {
                    warn!(%symbol, error = %e, "Slot failed; other slots keep running");
                }
                Err(e) => error!(error = %e, "Slot task panicked"),
            }
        }

        fatal.map_or(Ok(()), Err)
    }
}
