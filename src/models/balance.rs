//! Account balance models (`balance` push).

use serde::Deserialize;

/// Payload of a `balance` push.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceData {
    pub balance: f64,
    pub margin: f64,
    #[serde(rename = "equityFX", default)]
    pub equity_fx: f64,
    pub equity: f64,
    pub margin_level: f64,
    pub margin_free: f64,
    #[serde(default)]
    pub credit: f64,
    #[serde(default)]
    pub stock_value: f64,
    #[serde(default)]
    pub stock_lock: f64,
    #[serde(default)]
    pub cash_stock_value: f64,
}
