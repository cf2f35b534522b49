//! Shared test utilities: an in-process fake broker and fast timing presets.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use slotrader::config::{RetryPolicy, SessionConfig, TradingConfig, XapiConfig};
use slotrader::models::Secret;
use slotrader::xapi::{BoxedStream, Connector, Endpoint, FramedConnection, Session};
use slotrader::{Result, XapiError};

/// Stream session id handed out by [`login_ok`].
pub const STREAM_SESSION_ID: &str = "8469308861804289383";

/// How often the fake stream socket repeats its feed.
const FEED_INTERVAL: Duration = Duration::from_millis(5);

type Handler = dyn Fn(&Value) -> Value + Send + Sync;

struct BrokerState {
    handler: Box<Handler>,
    commands: Mutex<Vec<Value>>,
    subscriptions: Mutex<Vec<Value>>,
    feed: Mutex<Vec<Value>>,
    command_connects: AtomicU32,
    stream_connects: AtomicU32,
    refuse: AtomicBool,
    command_sockets: Mutex<Vec<CancellationToken>>,
    stream_sockets: Mutex<Vec<CancellationToken>>,
}

/// Answers command-socket requests through a handler closure and repeats a
/// push feed on every stream socket.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub fn new(handler: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(BrokerState {
                handler: Box::new(handler),
                commands: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                feed: Mutex::new(Vec::new()),
                command_connects: AtomicU32::new(0),
                stream_connects: AtomicU32::new(0),
                refuse: AtomicBool::new(false),
                command_sockets: Mutex::new(Vec::new()),
                stream_sockets: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Replaces the pushes written on every stream socket.
    pub fn set_feed(&self, pushes: Vec<Value>) {
        *self.state.feed.lock().unwrap() = pushes;
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<Value> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Value> {
        self.commands()
            .into_iter()
            .filter(|c| c["command"] == name)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Value> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    pub fn connects(&self, endpoint: Endpoint) -> u32 {
        match endpoint {
            Endpoint::Command => self.state.command_connects.load(Ordering::SeqCst),
            Endpoint::Stream => self.state.stream_connects.load(Ordering::SeqCst),
        }
    }

    /// Closes every open command socket from the broker side.
    pub fn drop_command_sockets(&self) {
        for token in self.state.command_sockets.lock().unwrap().drain(..) {
            token.cancel();
        }
    }

    /// Closes the longest-lived stream socket still open from the broker side.
    pub fn drop_oldest_stream_socket(&self) {
        let mut sockets = self.state.stream_sockets.lock().unwrap();
        if !sockets.is_empty() {
            sockets.remove(0).cancel();
        }
    }

    /// Closes every open stream socket from the broker side.
    pub fn drop_stream_sockets(&self) {
        for token in self.state.stream_sockets.lock().unwrap().drain(..) {
            token.cancel();
        }
    }
}

/// Polls until `condition` holds, failing the test after two seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(XapiError::ConnectionFailure {
                endpoint: endpoint.as_str(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let stop = CancellationToken::new();
        let state = Arc::clone(&self.state);
        match endpoint {
            Endpoint::Command => {
                state.command_connects.fetch_add(1, Ordering::SeqCst);
                state.command_sockets.lock().unwrap().push(stop.clone());
                tokio::spawn(serve_commands(state, server, stop));
            }
            Endpoint::Stream => {
                state.stream_connects.fetch_add(1, Ordering::SeqCst);
                state.stream_sockets.lock().unwrap().push(stop.clone());
                tokio::spawn(serve_stream(state, server, stop));
            }
        }
        Ok(Box::new(client))
    }
}

async fn serve_commands(state: Arc<BrokerState>, socket: DuplexStream, stop: CancellationToken) {
    let mut connection = FramedConnection::new(socket);
    loop {
        let request = tokio::select! {
            () = stop.cancelled() => return,
            request = connection.receive() => match request {
                Ok(request) => request,
                Err(_) => return,
            },
        };
        state.commands.lock().unwrap().push(request.clone());
        let response = (state.handler)(&request);
        if connection.send(&response).await.is_err() {
            return;
        }
    }
}

async fn serve_stream(state: Arc<BrokerState>, socket: DuplexStream, stop: CancellationToken) {
    let (mut reader, mut writer) = FramedConnection::new(socket).split();

    let recorder_state = Arc::clone(&state);
    let recorder_stop = stop.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = recorder_stop.cancelled() => return,
                request = reader.receive() => match request {
                    Ok(request) => recorder_state.subscriptions.lock().unwrap().push(request),
                    Err(_) => return,
                },
            }
        }
    });

    let mut ticker = tokio::time::interval(FEED_INTERVAL);
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let feed = state.feed.lock().unwrap().clone();
        for push in &feed {
            if writer.send(push).await.is_err() {
                stop.cancel();
                return;
            }
        }
    }
}

/// Name of a recorded request.
pub fn command_name(request: &Value) -> &str {
    request["command"].as_str().unwrap_or_default()
}

pub fn ok(return_data: Value) -> Value {
    json!({"status": true, "returnData": return_data})
}

pub fn ok_empty() -> Value {
    json!({"status": true})
}

pub fn rejected(code: &str, description: &str) -> Value {
    json!({"status": false, "errorCode": code, "errorDescr": description})
}

pub fn login_ok() -> Value {
    json!({"status": true, "streamSessionId": STREAM_SESSION_ID})
}

pub fn xapi_config() -> XapiConfig {
    XapiConfig {
        host: "broker.test".to_string(),
        command_port: 5124,
        stream_port: 5125,
        login: "1000".to_string(),
        password: Secret::new("hunter2"),
        ca_pem: None,
    }
}

/// Retry and timeout settings short enough for tests.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        connect: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        },
        reconnect: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        },
        read_timeout: Duration::from_secs(2),
    }
}

pub fn fast_trading_config() -> TradingConfig {
    TradingConfig {
        trade_poll_interval: Duration::from_millis(10),
        close_retry_interval: Duration::from_millis(10),
        history_lookback: Duration::from_secs(10),
    }
}

pub fn session(broker: &FakeBroker) -> Arc<Session> {
    Arc::new(Session::new(
        &xapi_config(),
        broker.connector(),
        fast_session_config(),
    ))
}

/// Broker clock used by [`trading_handler`].
pub const SERVER_TIME: i64 = 1_700_000_100_000;
pub const OPEN_ORDER: i64 = 101;
pub const CLOSE_ORDER: i64 = 202;
pub const POSITION: i64 = 555;

fn trade_record(profit: Option<f64>) -> Value {
    json!({
        "symbol": "EURUSD",
        "order": POSITION,
        "order2": OPEN_ORDER,
        "position": POSITION,
        "cmd": 0,
        "volume": 0.01,
        "open_price": 1.1,
        "open_time": SERVER_TIME - 60_000,
        "close_price": 1.0984,
        "close_time": profit.map(|_| SERVER_TIME),
        "profit": profit,
    })
}

/// A broker that fills every open as order 101 / position 555 with a
/// 1000 margin and reports it closed at a profit of -16.
pub fn trading_handler(request: &Value) -> Value {
    match command_name(request) {
        "login" => login_ok(),
        "logout" | "ping" => ok_empty(),
        "getServerTime" => ok(json!({"time": SERVER_TIME, "timeString": ""})),
        "getMarginTrade" => ok(json!({"margin": 1000.0})),
        "tradeTransaction" => {
            let order = if request["arguments"]["tradeTransInfo"]["type"] == 2 {
                CLOSE_ORDER
            } else {
                OPEN_ORDER
            };
            ok(json!({"order": order}))
        }
        "getTrades" => ok(json!([trade_record(None)])),
        "getTradesHistory" => ok(json!([trade_record(Some(-16.0))])),
        "getChartLastRequest" => ok(json!({"digits": 5, "rateInfos": []})),
        other => rejected("EX000", &format!("unexpected command {other}")),
    }
}

pub fn profit_push(order2: i64, profit: f64) -> Value {
    json!({
        "command": "profit",
        "data": {"order": POSITION, "order2": order2, "position": POSITION, "profit": profit}
    })
}

pub fn tick_push(symbol: &str, ask: f64, bid: f64) -> Value {
    json!({
        "command": "tickPrices",
        "data": {
            "symbol": symbol, "ask": ask, "bid": bid, "high": ask, "low": bid,
            "askVolume": 1000, "bidVolume": 1000, "timestamp": SERVER_TIME,
            "level": 0, "quoteId": 1, "spreadTable": 0.0, "spreadRaw": 0.0
        }
    })
}
