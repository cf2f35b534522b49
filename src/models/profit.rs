//! Position profit models (`profit` push).

use serde::Deserialize;

/// Payload of a `profit` push.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfitData {
    /// Order number of the position.
    pub order: i64,
    /// Order number of the transaction that opened the position.
    pub order2: i64,
    pub position: i64,
    pub profit: f64,
}
