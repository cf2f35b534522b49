//! Market data derived from stream pushes.

mod aggregator;
mod observator;

pub use aggregator::{CandleAggregator, Resolution, RollUp, roll_up};
pub use observator::{ObservatorSnapshot, PriceObservator};
