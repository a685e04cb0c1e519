use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::types::Candle;

use super::BarProvider;

/// CSV row shape: `timestamp,open,high,low,close,volume` with a header.
/// Timestamps are Unix milliseconds.
#[derive(Debug, Deserialize)]
struct CandleRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// File-backed OHLCV provider reading a single CSV file per symbol.
#[derive(Debug, Clone)]
pub struct CsvBars {
    path: PathBuf,
}

impl CsvBars {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Result<Vec<Candle>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut candles = Vec::new();
        for row in reader.deserialize() {
            let row: CandleRow = row.context("malformed OHLCV row")?;
            candles.push(Candle {
                timestamp: row.timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok(candles)
    }
}

#[async_trait]
impl BarProvider for CsvBars {
    async fn get_bars(&self, _symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let path = self.path.clone();
        let this = self.clone();
        let candles = tokio::task::spawn_blocking(move || this.read_all())
            .await
            .with_context(|| format!("CSV read task failed for {}", path.display()))??;

        Ok(candles
            .into_iter()
            .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
            .collect())
    }
}
