//! Position open/close and history RPC operations.
//!
//! The broker confirms a transaction before the position exists, so opening
//! polls the open-trade list and closing polls the trade history until the
//! matching record appears.

use std::future::Future;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Session;
use crate::config::TradingConfig;
use crate::models::candle::{Candle, ChartLastInfo, ChartResponse};
use crate::models::trade::{
    ClosedTrade, MarginResult, Position, PositionStatus, Side, TradeRecord, TradeTransInfo,
    TradeTransactionResult,
};
use crate::models::{Command, ServerTime};
use crate::{Result, XapiError};

/// Calls `attempt` every `interval` until it yields a value.
///
/// Non-fatal errors are logged and retried; fatal errors and cancellation
/// end the loop.
async fn poll<T, F, Fut>(
    what: &'static str,
    interval: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut tries: u32 = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!(what, tries, "Not available yet"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(what, tries, error = %e, "Attempt failed; retrying"),
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(XapiError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }
}

/// Returns the broker's clock in milliseconds since the Unix epoch.
///
/// # Errors
///
/// Returns a connection or command error if the request fails.
pub async fn server_time(session: &Session) -> Result<i64> {
    let time: ServerTime = session.request(&Command::GetServerTime).await?;
    Ok(time.time)
}

/// Returns the margin the broker requires for `volume` lots of `symbol`.
///
/// # Errors
///
/// Returns a connection or command error if the request fails.
pub async fn margin(session: &Session, symbol: &str, volume: Decimal) -> Result<f64> {
    let result: MarginResult = session
        .request(&Command::GetMarginTrade {
            symbol: symbol.to_string(),
            volume,
        })
        .await?;
    Ok(result.margin)
}

/// Polls the open-trade list until the trade opened by `order_id` shows up.
///
/// # Errors
///
/// Returns [`XapiError::Cancelled`] if `cancel` fires first, or a fatal
/// session error.
pub async fn wait_for_open_trade(
    session: &Session,
    order_id: i64,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<TradeRecord> {
    let command = &Command::GetTrades { opened_only: true };
    poll("open trade", interval, cancel, || async move {
        let trades: Vec<TradeRecord> = session.request(command).await?;
        Ok(trades.into_iter().find(|trade| trade.order2 == order_id))
    })
    .await
}

/// Polls the trade history from `since_ms` until `position_id` shows up.
///
/// # Errors
///
/// Returns [`XapiError::Cancelled`] if `cancel` fires first, or a fatal
/// session error.
pub async fn wait_for_closed_trade(
    session: &Session,
    position_id: i64,
    since_ms: i64,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<TradeRecord> {
    let command = &Command::GetTradesHistory {
        start: since_ms,
        end: 0,
    };
    poll("closed trade", interval, cancel, || async move {
        let trades: Vec<TradeRecord> = session.request(command).await?;
        Ok(trades.into_iter().find(|trade| trade.position == position_id))
    })
    .await
}

/// Opens a market position and waits until the broker lists it.
///
/// # Errors
///
/// Returns [`XapiError::CommandFailure`] if the open transaction is
/// rejected, [`XapiError::Cancelled`] if `cancel` fires while waiting, or a
/// fatal session error.
pub async fn open_position(
    session: &Session,
    symbol: &str,
    side: Side,
    volume: Decimal,
    timing: &TradingConfig,
    cancel: &CancellationToken,
) -> Result<Position> {
    let command = Command::TradeTransaction {
        trade_trans_info: TradeTransInfo::open(symbol, side, volume),
    };
    let TradeTransactionResult { order } = session.request(&command).await?;
    info!(symbol, %side, %volume, order, "Open transaction accepted");

    let required_margin = poll("margin", timing.trade_poll_interval, cancel, || async move {
        margin(session, symbol, volume).await.map(Some)
    })
    .await?;

    let record = wait_for_open_trade(session, order, timing.trade_poll_interval, cancel).await?;

    let position = Position {
        order_id: order,
        position_id: record.position,
        symbol: symbol.to_string(),
        side,
        volume,
        open_price: record.open_price,
        open_time: record.open_time,
        margin: required_margin,
        status: PositionStatus::Open,
    };
    info!(
        symbol,
        order,
        position = position.position_id,
        open_price = position.open_price,
        margin = required_margin,
        "Position opened"
    );
    Ok(position)
}

/// Closes `position`, re-sending the close transaction until the broker
/// accepts it, then waits for the closed trade in the history.
///
/// # Errors
///
/// Returns [`XapiError::Cancelled`] if `cancel` fires first, or a fatal
/// session error.
pub async fn close_position(
    session: &Session,
    position: &Position,
    timing: &TradingConfig,
    cancel: &CancellationToken,
) -> Result<ClosedTrade> {
    let command = &Command::TradeTransaction {
        trade_trans_info: TradeTransInfo::close(
            &position.symbol,
            position.side,
            position.position_id,
            position.volume,
        ),
    };

    let accepted = poll(
        "close transaction",
        timing.close_retry_interval,
        cancel,
        || async move {
            session
                .request::<TradeTransactionResult>(command)
                .await
                .map(Some)
        },
    )
    .await?;
    info!(
        symbol = %position.symbol,
        position = position.position_id,
        close_order = accepted.order,
        "Close transaction accepted"
    );

    let now = poll("server time", timing.trade_poll_interval, cancel, || async move {
        server_time(session).await.map(Some)
    })
    .await?;
    let lookback_ms = i64::try_from(timing.history_lookback.as_millis()).unwrap_or(i64::MAX);
    let since = now.saturating_sub(lookback_ms);

    let record = wait_for_closed_trade(
        session,
        position.position_id,
        since,
        timing.trade_poll_interval,
        cancel,
    )
    .await?;

    let closed = ClosedTrade::from_history(position, &record);
    info!(
        symbol = %closed.symbol,
        position = closed.position,
        profit = closed.profit,
        close_price = closed.close_price,
        "Position closed"
    );
    Ok(closed)
}

/// Fetches the last `minutes` of 1-minute candles, oldest first.
///
/// # Errors
///
/// Returns a connection or command error if a request fails.
pub async fn historical_candles(session: &Session, symbol: &str, minutes: u32) -> Result<Vec<Candle>> {
    let now = server_time(session).await?;
    let start = now - i64::from(minutes) * 60_000;
    let chart: ChartResponse = session
        .request(&Command::GetChartLastRequest {
            info: ChartLastInfo {
                period: 1,
                start,
                symbol: symbol.to_string(),
            },
        })
        .await?;

    let candles = chart.candles();
    debug!(symbol, count = candles.len(), "Fetched historical candles");
    Ok(candles)
}
