//! Incoming stream push processing.
//!
//! [`parse_stream_message`] classifies a raw push into a [`StreamEvent`];
//! [`StreamRouter`] reads pushes off the stream socket and fans them out to
//! every [`StreamObserver`] in an [`ObserverRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::Session;
use super::session::StreamReader;
use crate::models::balance::BalanceData;
use crate::models::candle::{Candle, CandleData};
use crate::models::profit::ProfitData;
use crate::models::tick::{TickData, TickPrice};
use crate::models::{StreamPush, StreamSubscription};
use crate::{Result, XapiError};

/// A classified stream push.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Candle { symbol: String, candle: Candle },
    Tick { symbol: String, price: TickPrice },
    Profit(ProfitData),
    Balance(BalanceData),
    KeepAlive { timestamp: i64 },
}

impl StreamEvent {
    /// Returns the wire push kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Candle { .. } => "candle",
            StreamEvent::Tick { .. } => "tickPrices",
            StreamEvent::Profit(_) => "profit",
            StreamEvent::Balance(_) => "balance",
            StreamEvent::KeepAlive { .. } => "keepAlive",
        }
    }
}

#[derive(Deserialize)]
struct KeepAliveData {
    timestamp: i64,
}

fn decode<T: DeserializeOwned>(kind: &str, data: serde_json::Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(kind, error = %e, "Dropping malformed push");
            None
        }
    }
}

/// Classifies a raw push. Unknown kinds and malformed payloads yield `None`.
#[must_use]
pub fn parse_stream_message(value: serde_json::Value) -> Option<StreamEvent> {
    let push: StreamPush = match serde_json::from_value(value) {
        Ok(push) => push,
        Err(e) => {
            warn!(error = %e, "Push without a command field");
            return None;
        }
    };

    let kind = push.command.as_str();
    match kind {
        "candle" => decode::<CandleData>(kind, push.data).map(|data| StreamEvent::Candle {
            candle: data.candle(),
            symbol: data.symbol,
        }),
        "tickPrices" => decode::<TickData>(kind, push.data).map(|data| StreamEvent::Tick {
            price: data.price(),
            symbol: data.symbol,
        }),
        "profit" => decode::<ProfitData>(kind, push.data).map(StreamEvent::Profit),
        "balance" => decode::<BalanceData>(kind, push.data).map(StreamEvent::Balance),
        "keepAlive" => decode::<KeepAliveData>(kind, push.data)
            .map(|data| StreamEvent::KeepAlive {
                timestamp: data.timestamp,
            }),
        other => {
            debug!(kind = other, "Ignoring unknown push kind");
            None
        }
    }
}

/// Receives every event the router reads.
pub trait StreamObserver: Send + Sync {
    fn on_event(&self, event: &StreamEvent);
}

/// Handle returned by [`ObserverRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observers = Vec<(ObserverId, Arc<dyn StreamObserver>)>;

/// Shared, cloneable set of observers.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<RwLock<Observers>>,
    next_id: Arc<AtomicU64>,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn StreamObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Removes an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every registered observer.
    pub fn dispatch(&self, event: &StreamEvent) {
        let observers: Vec<Arc<dyn StreamObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer.on_event(event);
        }
    }
}

/// Owns the read half of a session's stream socket and feeds observers.
///
/// When the session establishes a new stream socket (after a reconnect) the
/// router picks up the new reader and re-sends its subscriptions.
pub struct StreamRouter {
    session: Arc<Session>,
    registry: ObserverRegistry,
    subscriptions: Vec<StreamSubscription>,
    /// Stream generation the subscriptions were last sent on.
    subscribed_generation: u64,
    reader: Option<StreamReader>,
    generation: u64,
}

impl StreamRouter {
    #[must_use]
    pub fn new(session: Arc<Session>, registry: ObserverRegistry) -> Self {
        Self {
            session,
            registry,
            subscriptions: Vec::new(),
            subscribed_generation: 0,
            reader: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[StreamSubscription] {
        &self.subscriptions
    }

    /// Subscribes and remembers the channel for later re-subscription.
    ///
    /// # Errors
    ///
    /// See [`Session::subscribe`].
    pub async fn subscribe(&mut self, subscription: StreamSubscription) -> Result<()> {
        let generation = self.session.stream_generation();
        self.session.subscribe(&subscription).await?;
        self.subscribed_generation = generation;
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// See [`Session::subscribe`].
    pub async fn subscribe_candles(&mut self, symbol: &str) -> Result<()> {
        self.subscribe(StreamSubscription::Candles(symbol.to_string()))
            .await
    }

    /// # Errors
    ///
    /// See [`Session::subscribe`].
    pub async fn subscribe_ticks(&mut self, symbol: &str) -> Result<()> {
        self.subscribe(StreamSubscription::TickPrices(symbol.to_string()))
            .await
    }

    /// # Errors
    ///
    /// See [`Session::subscribe`].
    pub async fn subscribe_profits(&mut self) -> Result<()> {
        self.subscribe(StreamSubscription::Profits).await
    }

    /// Picks up the session's current reader if it changed, re-subscribing
    /// on a socket that has not seen the subscriptions yet.
    async fn sync_reader(&mut self) -> Result<()> {
        if self.reader.is_some() && self.session.stream_generation() == self.generation {
            return Ok(());
        }

        match self.session.take_stream_reader() {
            Some((reader, generation)) => {
                self.reader = Some(reader);
                self.generation = generation;
                if !self.subscriptions.is_empty() && self.subscribed_generation != generation {
                    info!(
                        generation,
                        count = self.subscriptions.len(),
                        "Re-subscribing on new stream socket"
                    );
                    super::subscribe(&self.session, &self.subscriptions).await?;
                    self.subscribed_generation = generation;
                }
                Ok(())
            }
            None if self.reader.is_some() => Ok(()),
            None => Err(XapiError::NotConnected("stream")),
        }
    }

    /// Reads until the next recognised push. Unknown kinds are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Timeout`] if nothing arrives within the read
    /// timeout, and connection or framing errors from the socket. On any
    /// such error the reader is dropped, and the stream is marked down
    /// unless the session has already replaced that socket.
    pub async fn read_next(&mut self) -> Result<StreamEvent> {
        loop {
            self.sync_reader().await?;
            let Some(reader) = self.reader.as_mut() else {
                return Err(XapiError::NotConnected("stream"));
            };

            let read_timeout = self.session.read_timeout();
            let received = match tokio::time::timeout(read_timeout, reader.receive()).await {
                Ok(received) => received,
                Err(_) => Err(XapiError::Timeout(read_timeout)),
            };

            let value = match received {
                Ok(value) => value,
                Err(e) => {
                    self.reader = None;
                    if self.generation == self.session.stream_generation() {
                        self.session.mark_stream_down();
                    }
                    return Err(e);
                }
            };

            if let Some(event) = parse_stream_message(value) {
                trace!(kind = event.kind(), "Stream push");
                return Ok(event);
            }
        }
    }

    /// Dispatches pushes until cancelled, reconnecting the stream socket on
    /// read failures.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::StreamLost`] once the stream cannot be restored,
    /// or [`XapiError::AuthFailure`] if re-login is rejected.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            subscriptions = self.subscriptions.len(),
            "Stream router started"
        );

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    info!("Stream router stopped");
                    return Ok(());
                }
                next = self.read_next() => next,
            };

            match next {
                Ok(event) => self.registry.dispatch(&event),
                Err(e) if e.is_connection_broken() => {
                    warn!(error = %e, "Stream read failed; reconnecting");
                    let recovered = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        recovered = self.session.reconnect_stream(self.generation) => recovered,
                    };
                    match recovered {
                        Ok(()) => {}
                        Err(e @ XapiError::AuthFailure(_)) => return Err(e),
                        Err(e) => {
                            error!(error = %e, "Stream could not be restored");
                            return Err(XapiError::StreamLost(e.to_string()));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
