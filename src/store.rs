//! Closed-trade persistence.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::trade::ClosedTrade;
use crate::{Result, XapiError};

/// Where closed trades are recorded.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Persists one closed trade.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Store`] if the record cannot be written.
    async fn record(&self, trade: &ClosedTrade) -> Result<()>;
}

/// Appends one JSON document per closed trade to a file.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record back, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::Store`] if the file cannot be read or a line is
    /// not a closed trade.
    pub async fn load(&self) -> Result<Vec<ClosedTrade>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.store_error(e)),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| self.store_error(e)))
            .collect()
    }

    fn store_error(&self, e: impl std::fmt::Display) -> XapiError {
        XapiError::Store(format!("{}: {e}", self.path.display()))
    }
}

#[async_trait]
impl TradeStore for JsonLinesStore {
    async fn record(&self, trade: &ClosedTrade) -> Result<()> {
        let mut line = serde_json::to_vec(trade)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.store_error(e))?;
        file.write_all(&line)
            .await
            .map_err(|e| self.store_error(e))?;
        file.flush().await.map_err(|e| self.store_error(e))?;

        debug!(path = %self.path.display(), position = trade.position, "Closed trade recorded");
        Ok(())
    }
}

/// Keeps closed trades in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trades: Mutex<Vec<ClosedTrade>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.trades
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn record(&self, trade: &ClosedTrade) -> Result<()> {
        self.trades
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trade.clone());
        Ok(())
    }
}
