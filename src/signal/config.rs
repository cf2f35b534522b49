//! Signal threshold configuration types and loading.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::Thresholds;
use crate::market::Resolution;

/// Signal configuration loaded from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalConfig {
    /// Default parameters applied to all symbols unless overridden.
    #[serde(default)]
    pub defaults: SignalParams,
    /// Per-symbol overrides. Missing fields inherit from `defaults`.
    #[serde(default)]
    pub symbols: HashMap<String, SignalOverrides>,
}

/// Complete set of per-slot parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SignalParams {
    /// Loss, in percent of margin, at which a position is closed.
    pub stop_loss_pct: f64,
    /// Fraction of the stop-loss a gain must exceed to reach stage 0.5.
    pub asymmetric_take_profit_ratio: f64,
    /// Lots traded per position.
    pub volume: Decimal,
    /// Delay between close-signal evaluations; `0` is treated as 1 ms.
    pub poll_interval_ms: u64,
    /// Finest candle the reversal check may use.
    pub reversal_min_resolution: Resolution,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: 1.5,
            asymmetric_take_profit_ratio: 0.5,
            volume: Decimal::new(1, 2),
            poll_interval_ms: 10,
            reversal_min_resolution: Resolution::OneMinute,
        }
    }
}

impl SignalParams {
    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            stop_loss_pct: self.stop_loss_pct,
            asymmetric_take_profit_ratio: self.asymmetric_take_profit_ratio,
            reversal_min_resolution: self.reversal_min_resolution,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Per-symbol overrides. Every field optional; missing inherits from defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalOverrides {
    pub stop_loss_pct: Option<f64>,
    pub asymmetric_take_profit_ratio: Option<f64>,
    pub volume: Option<Decimal>,
    pub poll_interval_ms: Option<u64>,
    pub reversal_min_resolution: Option<Resolution>,
}

impl SignalConfig {
    /// Loads signal configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// threshold is out of range.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::XapiError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every effective parameter set.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Config`](crate::XapiError::Config) naming the
    /// first out-of-range value.
    pub fn validate(&self) -> crate::Result<()> {
        let symbols = self.symbols.keys().map(String::as_str);
        for (name, params) in std::iter::once(("defaults", self.defaults.clone()))
            .chain(symbols.map(|symbol| (symbol, self.params_for(symbol))))
        {
            if params.stop_loss_pct.is_nan() || params.stop_loss_pct <= 0.0 {
                return Err(crate::XapiError::Config(format!(
                    "{name}: stop_loss_pct must be positive"
                )));
            }
            if params.asymmetric_take_profit_ratio < 0.0 {
                return Err(crate::XapiError::Config(format!(
                    "{name}: asymmetric_take_profit_ratio must not be negative"
                )));
            }
            if params.volume <= Decimal::ZERO {
                return Err(crate::XapiError::Config(format!(
                    "{name}: volume must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Returns the effective parameters for a symbol, merging overrides with defaults.
    #[must_use]
    pub fn params_for(&self, symbol: &str) -> SignalParams {
        match self.symbols.get(symbol) {
            Some(overrides) => SignalParams {
                stop_loss_pct: overrides
                    .stop_loss_pct
                    .unwrap_or(self.defaults.stop_loss_pct),
                asymmetric_take_profit_ratio: overrides
                    .asymmetric_take_profit_ratio
                    .unwrap_or(self.defaults.asymmetric_take_profit_ratio),
                volume: overrides.volume.unwrap_or(self.defaults.volume),
                poll_interval_ms: overrides
                    .poll_interval_ms
                    .unwrap_or(self.defaults.poll_interval_ms),
                reversal_min_resolution: overrides
                    .reversal_min_resolution
                    .unwrap_or(self.defaults.reversal_min_resolution),
            },
            None => self.defaults.clone(),
        }
    }

    /// Returns a human-readable summary for the startup log.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::from("Signal parameters:\n");
        let _ = writeln!(out, "  Defaults:");
        write_params(&mut out, &self.defaults);

        let mut symbols: Vec<&String> = self.symbols.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let _ = writeln!(out, "  {symbol}:");
            write_params(&mut out, &self.params_for(symbol));
        }
        out
    }
}

fn write_params(out: &mut String, params: &SignalParams) {
    let _ = writeln!(out, "    stop_loss_pct: {}", params.stop_loss_pct);
    let _ = writeln!(
        out,
        "    asymmetric_take_profit_ratio: {}",
        params.asymmetric_take_profit_ratio
    );
    let _ = writeln!(out, "    volume: {}", params.volume);
    let _ = writeln!(out, "    poll_interval_ms: {}", params.poll_interval_ms);
    let _ = writeln!(
        out,
        "    reversal_min_resolution: {}",
        params.reversal_min_resolution
    );
}
