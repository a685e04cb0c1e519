use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use polars::prelude::*;

use crate::engine::types::Candle;

use super::BarProvider;

/// Parquet-backed OHLCV provider. Expects `timestamp` (Int64 milliseconds
/// or a Datetime column) plus `open`/`high`/`low`/`close`/`volume` floats.
#[derive(Debug, Clone)]
pub struct ParquetBars {
    path: PathBuf,
}

impl ParquetBars {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let path_str = self.path.to_string_lossy().to_string();
        let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
            .collect()
            .with_context(|| format!("failed to read Parquet file {}", self.path.display()))?;

        let timestamps = df.column("timestamp")?;
        let opens = df.column("open")?.f64()?;
        let highs = df.column("high")?.f64()?;
        let lows = df.column("low")?.f64()?;
        let closes = df.column("close")?.f64()?;
        let volumes = df.column("volume")?.f64()?;

        let mut candles = Vec::new();
        for i in 0..df.height() {
            let ts = timestamp_ms(timestamps, i)?;
            if ts < start_ms || ts > end_ms {
                continue;
            }
            candles.push(Candle {
                timestamp: ts,
                open: opens.get(i).unwrap_or(0.0),
                high: highs.get(i).unwrap_or(0.0),
                low: lows.get(i).unwrap_or(0.0),
                close: closes.get(i).unwrap_or(0.0),
                volume: volumes.get(i).unwrap_or(0.0),
            });
        }
        Ok(candles)
    }
}

/// Extract a millisecond timestamp from an Int64 or Datetime column.
fn timestamp_ms(col: &Column, idx: usize) -> Result<i64> {
    match col.dtype() {
        DataType::Int64 => col
            .i64()?
            .get(idx)
            .ok_or_else(|| anyhow::anyhow!("null timestamp at row {idx}")),
        DataType::Datetime(tu, _) => {
            let val = col
                .datetime()?
                .phys
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("null timestamp at row {idx}"))?;
            Ok(match tu {
                TimeUnit::Milliseconds => val,
                TimeUnit::Microseconds => val / 1_000,
                TimeUnit::Nanoseconds => val / 1_000_000,
            })
        }
        other => bail!("unsupported timestamp column type: {other:?}"),
    }
}

#[async_trait]
impl BarProvider for ParquetBars {
    async fn get_bars(&self, _symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_range(start_ms, end_ms))
            .await
            .context("Parquet read task failed")?
    }
}
