pub mod csv;
pub mod parquet;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::Candle;

/// Abstract OHLCV source. The engine never cares where bars come from —
/// database, file or memory — only that they arrive in this shape.
/// Implementations return bars with `start_ms <= timestamp <= end_ms`;
/// ordering and cleaning are the replay source's job.
#[async_trait]
pub trait BarProvider: Send + Sync {
    async fn get_bars(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>>;
}

/// In-memory provider, used by tests and by the sweep layers to replay the
/// same preloaded series across many runs without re-reading files.
#[derive(Debug, Clone, Default)]
pub struct MemoryBars {
    candles: Vec<Candle>,
}

impl MemoryBars {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[async_trait]
impl BarProvider for MemoryBars {
    async fn get_bars(&self, _symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .iter()
            .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
            .copied()
            .collect())
    }
}
