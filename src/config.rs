//! Application configuration loaded from environment variables.
//!
//! Credentials **must** be provided via environment variables (or the
//! keychain, see [`crate::credentials`]):
//! - `XAPI_LOGIN`: account number used as the login `userId`
//! - `XAPI_PASSWORD`: account password
//!
//! Optional overrides:
//! - `XAPI_HOST`, `XAPI_COMMAND_PORT`, `XAPI_STREAM_PORT`: broker endpoint
//! - `XAPI_CA_PEM`: PEM bundle to trust instead of the bundled web roots
//! - `XAPI_SYMBOLS`: comma separated symbols, one slot each
//! - `XAPI_SIGNAL_CONFIG`: JSON file with signal thresholds
//! - `XAPI_TRADES_LOG`: where closed trades are appended

use std::path::PathBuf;
use std::time::Duration;

use crate::models::Secret;
use crate::{Result, XapiError};

/// Default broker host (real-money server).
const DEFAULT_HOST: &str = "xapi.xtb.com";

/// Default command socket port.
const DEFAULT_COMMAND_PORT: u16 = 5124;

/// Default stream socket port.
const DEFAULT_STREAM_PORT: u16 = 5125;

/// Default symbol traded when `XAPI_SYMBOLS` is unset.
const DEFAULT_SYMBOL: &str = "EURUSD";

/// Default closed-trade log file.
const DEFAULT_TRADES_LOG: &str = "trades.jsonl";

/// Top-level application configuration.
#[derive(Debug)]
pub struct AppConfig {
    pub xapi: XapiConfig,
    pub session: SessionConfig,
    pub trading: TradingConfig,
    /// One trading slot is run per symbol.
    pub symbols: Vec<String>,
    pub signal_config: Option<PathBuf>,
    pub trades_log: PathBuf,
}

/// Broker endpoint and account credentials.
#[derive(Debug, Clone)]
pub struct XapiConfig {
    pub host: String,
    pub command_port: u16,
    pub stream_port: u16,
    pub login: String,
    pub password: Secret,
    pub ca_pem: Option<PathBuf>,
}

/// A bounded retry loop: at most `attempts` tries, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Connection and timeout tuning for a [`Session`](crate::xapi::Session).
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Used by the initial connect of each socket.
    pub connect: RetryPolicy,
    /// Used when re-establishing a dropped session.
    pub reconnect: RetryPolicy,
    /// Longest wait for a command response or stream push.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: RetryPolicy {
                attempts: 6,
                delay: Duration::from_secs(10),
            },
            reconnect: RetryPolicy {
                attempts: 10,
                delay: Duration::from_secs(5),
            },
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Polling intervals used while opening and closing positions.
#[derive(Debug, Clone, Copy)]
pub struct TradingConfig {
    /// Delay between `getTrades` / `getTradesHistory` polls.
    pub trade_poll_interval: Duration,
    /// Delay before re-sending a rejected close transaction.
    pub close_retry_interval: Duration,
    /// How far before the server time the trade-history search starts.
    pub history_lookback: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            trade_poll_interval: Duration::from_secs(1),
            close_retry_interval: Duration::from_secs(1),
            history_lookback: Duration::from_secs(10),
        }
    }
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`XapiError::Config`] if a credential is missing or a port is
/// not a valid number.
pub fn fetch_config() -> Result<AppConfig> {
    let login = non_empty_var("XAPI_LOGIN")
        .ok_or_else(|| XapiError::Config("XAPI_LOGIN is not set".to_string()))?;
    let password = non_empty_var("XAPI_PASSWORD")
        .ok_or_else(|| XapiError::Config("XAPI_PASSWORD is not set".to_string()))?;

    let host = non_empty_var("XAPI_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
    let command_port = port_var("XAPI_COMMAND_PORT", DEFAULT_COMMAND_PORT)?;
    let stream_port = port_var("XAPI_STREAM_PORT", DEFAULT_STREAM_PORT)?;

    let symbols = parse_symbols(non_empty_var("XAPI_SYMBOLS").as_deref());
    if symbols.is_empty() {
        return Err(XapiError::Config(
            "XAPI_SYMBOLS contains no symbols".to_string(),
        ));
    }

    Ok(AppConfig {
        xapi: XapiConfig {
            host,
            command_port,
            stream_port,
            login,
            password: Secret::new(password),
            ca_pem: non_empty_var("XAPI_CA_PEM").map(PathBuf::from),
        },
        session: SessionConfig::default(),
        trading: TradingConfig::default(),
        symbols,
        signal_config: non_empty_var("XAPI_SIGNAL_CONFIG").map(PathBuf::from),
        trades_log: non_empty_var("XAPI_TRADES_LOG")
            .map_or_else(|| PathBuf::from(DEFAULT_TRADES_LOG), PathBuf::from),
    })
}

/// Splits a comma separated symbol list, dropping blanks and duplicates.
fn parse_symbols(raw: Option<&str>) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in raw.unwrap_or(DEFAULT_SYMBOL).split(',') {
        let symbol = symbol.trim();
        if !symbol.is_empty() && !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}

fn port_var(name: &str, default: u16) -> Result<u16> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| XapiError::Config(format!("{name} is not a valid port: {e}"))),
        None => Ok(default),
    }
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes every test that touches the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 9] = [
        "XAPI_LOGIN",
        "XAPI_PASSWORD",
        "XAPI_HOST",
        "XAPI_COMMAND_PORT",
        "XAPI_STREAM_PORT",
        "XAPI_CA_PEM",
        "XAPI_SYMBOLS",
        "XAPI_SIGNAL_CONFIG",
        "XAPI_TRADES_LOG",
    ];

    /// Helper that temporarily sets env vars, runs `f`, then restores originals.
    /// Variables not listed in `vars` are cleared for the duration.
    fn with_env<F: FnOnce()>(vars: &[(&str, Option<&str>)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let originals: Vec<(&str, Option<String>)> = ALL_VARS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in ALL_VARS {
            let value = vars.iter().find(|(name, _)| *name == k).and_then(|(_, v)| *v);
            // SAFETY: every env-mutating test holds ENV_LOCK.
            unsafe {
                match value {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }

        f();

        for (k, original) in originals {
            // SAFETY: restoring original values while still holding ENV_LOCK.
            unsafe {
                match original {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn defaults_with_only_credentials() {
        with_env(
            &[("XAPI_LOGIN", Some("12345")), ("XAPI_PASSWORD", Some("pw"))],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.xapi.host, DEFAULT_HOST);
                assert_eq!(config.xapi.command_port, 5124);
                assert_eq!(config.xapi.stream_port, 5125);
                assert_eq!(config.xapi.login, "12345");
                assert_eq!(config.xapi.password.expose(), "pw");
                assert!(config.xapi.ca_pem.is_none());
                assert_eq!(config.symbols, vec!["EURUSD".to_string()]);
                assert_eq!(config.trades_log, PathBuf::from("trades.jsonl"));
                assert_eq!(config.session.connect.attempts, 6);
                assert_eq!(config.session.reconnect.attempts, 10);
            },
        );
    }

    #[test]
    fn overrides_from_env() {
        with_env(
            &[
                ("XAPI_LOGIN", Some("12345")),
                ("XAPI_PASSWORD", Some("pw")),
                ("XAPI_HOST", Some("xapi.demo.example")),
                ("XAPI_COMMAND_PORT", Some("5112")),
                ("XAPI_STREAM_PORT", Some("5113")),
                ("XAPI_SYMBOLS", Some("EURUSD, GBPUSD,,EURUSD")),
                ("XAPI_SIGNAL_CONFIG", Some("signal.json")),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.xapi.host, "xapi.demo.example");
                assert_eq!(config.xapi.command_port, 5112);
                assert_eq!(config.xapi.stream_port, 5113);
                assert_eq!(config.symbols, vec!["EURUSD", "GBPUSD"]);
                assert_eq!(config.signal_config, Some(PathBuf::from("signal.json")));
            },
        );
    }

    #[test]
    fn rejects_missing_login() {
        with_env(&[("XAPI_PASSWORD", Some("pw"))], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("XAPI_LOGIN"));
        });
    }

    #[test]
    fn empty_values_treated_as_absent() {
        with_env(
            &[
                ("XAPI_LOGIN", Some("12345")),
                ("XAPI_PASSWORD", Some("")),
            ],
            || {
                let err = fetch_config().unwrap_err();
                assert!(err.to_string().contains("XAPI_PASSWORD"));
            },
        );
    }

    #[test]
    fn rejects_non_numeric_port() {
        with_env(
            &[
                ("XAPI_LOGIN", Some("12345")),
                ("XAPI_PASSWORD", Some("pw")),
                ("XAPI_STREAM_PORT", Some("stream")),
            ],
            || {
                let err = fetch_config().unwrap_err();
                assert!(err.to_string().contains("XAPI_STREAM_PORT"));
            },
        );
    }

    #[test]
    fn debug_output_hides_password() {
        with_env(
            &[("XAPI_LOGIN", Some("12345")), ("XAPI_PASSWORD", Some("hunter2"))],
            || {
                let config = fetch_config().unwrap();
                assert!(!format!("{config:?}").contains("hunter2"));
            },
        );
    }
}
