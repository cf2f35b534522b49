//! Slot-based position trader for the xStation xAPI.
//!
//! Each configured symbol runs in its own slot: a logged-in command
//! session, a stream subscription for candles, ticks, and profits, and a
//! lifecycle that opens one position at a time and closes it on a
//! stop-loss or candle-midpoint reversal.

pub mod config;
pub mod credentials;
pub mod entry;
pub mod error;
pub mod market;
pub mod models;
pub mod signal;
pub mod slot;
pub mod store;
pub mod tls;
pub mod xapi;

pub use error::{Result, XapiError};
