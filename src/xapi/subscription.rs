//! Stream channel subscribe operations.
//!
//! Subscriptions are written to the stream socket and bound to the stream
//! session id issued by the last login. The broker keeps no memory of them
//! across sockets, so a new stream socket must be subscribed again.

use tracing::debug;

use super::Session;
use crate::Result;
use crate::models::StreamSubscription;

/// Sends every subscription in order, stopping at the first failure.
///
/// # Errors
///
/// Returns [`XapiError::MissingStreamSession`](crate::XapiError::MissingStreamSession)
/// before login, or a connection error if the stream socket fails.
pub async fn subscribe(session: &Session, subscriptions: &[StreamSubscription]) -> Result<()> {
    for subscription in subscriptions {
        session.subscribe(subscription).await?;
    }
    debug!(count = subscriptions.len(), "Stream subscriptions sent");
    Ok(())
}

/// The channel set a trading slot needs for `symbol`: its candles and
/// ticks, the account-wide profit feed, and keep-alives.
#[must_use]
pub fn symbol_channels(symbol: &str) -> Vec<StreamSubscription> {
    vec![
        StreamSubscription::Candles(symbol.to_string()),
        StreamSubscription::TickPrices(symbol.to_string()),
        StreamSubscription::Profits,
        StreamSubscription::KeepAlive,
    ]
}
