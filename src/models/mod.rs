//! Typed models for xAPI requests, responses, and streaming pushes.
//!
//! Requests are built from the [`Command`] and [`StreamSubscription`] enums,
//! which serialize to the broker's `{"command": ..., "arguments": ...}` and
//! `{"command": ..., "streamSessionId": ...}` shapes. Responses arrive as a
//! [`Response`] envelope whose `returnData` is decoded into one of the
//! per-command payload types.

pub mod balance;
pub mod candle;
pub mod profit;
pub mod tick;
pub mod trade;

use std::fmt;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::{Result, XapiError};
use candle::ChartLastInfo;
use trade::TradeTransInfo;

/// A password or token that is zeroed on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

/// A request sent on the command socket.
///
/// Serializes as `{"command": "<name>", "arguments": {...}}`; argument-less
/// commands omit the `arguments` key.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "command",
    content = "arguments",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    Login {
        user_id: String,
        password: Secret,
    },
    Logout,
    Ping,
    GetServerTime,
    GetMarginTrade {
        symbol: String,
        #[serde(with = "rust_decimal::serde::float")]
        volume: Decimal,
    },
    GetTrades {
        opened_only: bool,
    },
    GetTradesHistory {
        start: i64,
        end: i64,
    },
    TradeTransaction {
        trade_trans_info: TradeTransInfo,
    },
    GetChartLastRequest {
        info: ChartLastInfo,
    },
    GetSymbol {
        symbol: String,
    },
}

impl Command {
    /// Returns the wire-format command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login { .. } => "login",
            Command::Logout => "logout",
            Command::Ping => "ping",
            Command::GetServerTime => "getServerTime",
            Command::GetMarginTrade { .. } => "getMarginTrade",
            Command::GetTrades { .. } => "getTrades",
            Command::GetTradesHistory { .. } => "getTradesHistory",
            Command::TradeTransaction { .. } => "tradeTransaction",
            Command::GetChartLastRequest { .. } => "getChartLastRequest",
            Command::GetSymbol { .. } => "getSymbol",
        }
    }
}

/// Push channels available on the stream socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamSubscription {
    /// 1-minute candles for one symbol (push kind `candle`).
    Candles(String),
    /// Bid/ask ticks for one symbol (push kind `tickPrices`).
    TickPrices(String),
    /// Live profit of every open position (push kind `profit`).
    Profits,
    /// Account balance (push kind `balance`).
    Balance,
    /// Periodic liveness message (push kind `keepAlive`).
    KeepAlive,
}

impl StreamSubscription {
    /// Returns the wire-format subscribe command name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSubscription::Candles(_) => "getCandles",
            StreamSubscription::TickPrices(_) => "getTickPrices",
            StreamSubscription::Profits => "getProfits",
            StreamSubscription::Balance => "getBalance",
            StreamSubscription::KeepAlive => "getKeepAlive",
        }
    }

    /// Returns the symbol for symbol-scoped channels.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            StreamSubscription::Candles(symbol) | StreamSubscription::TickPrices(symbol) => {
                Some(symbol)
            }
            _ => None,
        }
    }

    /// Builds the wire request, binding it to a stream session id.
    #[must_use]
    pub fn request<'a>(&'a self, stream_session_id: &'a str) -> StreamRequest<'a> {
        StreamRequest {
            command: self.as_str(),
            stream_session_id,
            symbol: self.symbol(),
        }
    }
}

/// A subscribe request as written to the stream socket.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest<'a> {
    pub command: &'static str,
    pub stream_session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<&'a str>,
}

/// Envelope of every command-socket response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: bool,
    #[serde(default)]
    pub return_data: Option<serde_json::Value>,
    #[serde(default)]
    pub stream_session_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_descr: Option<String>,
}

impl Response {
    /// Decodes `returnData` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::DataUnavailable`] if `returnData` is absent and
    /// [`XapiError::Json`] if it does not match `T`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .return_data
            .clone()
            .ok_or_else(|| XapiError::DataUnavailable("response has no returnData".into()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Converts a `status: false` response into [`XapiError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::CommandFailure`] when the broker rejected the command.
    pub fn into_result(self, command: &'static str) -> Result<Self> {
        if self.status {
            Ok(self)
        } else {
            Err(XapiError::CommandFailure {
                command,
                code: self.error_code.unwrap_or_default(),
                description: self.error_descr.unwrap_or_default(),
            })
        }
    }
}

/// Server time as returned by `getServerTime`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ServerTime {
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

/// A raw push from the stream socket before it is classified.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamPush {
    pub command: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
