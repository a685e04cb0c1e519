use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::data::BarProvider;

use super::types::Candle;

/// Owns the validated base OHLCV series and replays it candle by candle.
///
/// Each iteration yields the current bar together with a view over the
/// trailing history window — prior bars only, so the strategy can never
/// observe the future.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    symbol: String,
    candles: Vec<Candle>,
    lookback: usize,
    dropped: usize,
}

impl ReplaySource {
    /// Fetch bars from a provider and clean them. An empty range is not an
    /// error; the caller short-circuits on `bar_count() == 0`.
    pub async fn load(
        provider: &dyn BarProvider,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback: usize,
    ) -> Result<Self> {
        let raw = provider
            .get_bars(symbol, start.timestamp_millis(), end.timestamp_millis())
            .await?;
        Ok(Self::from_candles(symbol, raw, lookback))
    }

    /// Build a source from an in-memory series, applying the same cleaning
    /// rules as `load`.
    pub fn from_candles(symbol: &str, raw: Vec<Candle>, lookback: usize) -> Self {
        let initial = raw.len();
        let candles = clean(raw);
        let dropped = initial - candles.len();

        if dropped > 0 {
            warn!(symbol, dropped, "dropped invalid bars during load");
        }
        info!(symbol, bars = candles.len(), lookback, "replay source ready");

        Self {
            symbol: symbol.to_string(),
            candles,
            lookback,
            dropped,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bar_count(&self) -> usize {
        self.candles.len()
    }

    /// Number of bars rejected by validation on load.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Number of bars the replay iterator will actually emit.
    pub fn replay_len(&self) -> usize {
        self.candles.len().saturating_sub(self.lookback)
    }

    /// Iterate `(index, bar, history)` in ascending time order, starting at
    /// `index = lookback` so the first emitted bar has a full window. The
    /// history slice ends *before* the current bar.
    pub fn replay_iter(&self) -> ReplayIter<'_> {
        ReplayIter {
            candles: &self.candles,
            lookback: self.lookback,
            index: self.lookback,
        }
    }
}

/// Drop exact duplicate timestamps (first wins), non-positive prices and
/// bars with high < low, then sort ascending by timestamp.
fn clean(mut raw: Vec<Candle>) -> Vec<Candle> {
    raw.retain(|c| {
        c.open > 0.0 && c.high > 0.0 && c.low > 0.0 && c.close > 0.0 && c.high >= c.low
    });
    raw.sort_by_key(|c| c.timestamp);
    raw.dedup_by_key(|c| c.timestamp);
    raw
}

pub struct ReplayIter<'a> {
    candles: &'a [Candle],
    lookback: usize,
    index: usize,
}

impl<'a> Iterator for ReplayIter<'a> {
    type Item = (usize, Candle, &'a [Candle]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.candles.len() {
            return None;
        }
        let k = self.index;
        let bar = self.candles[k];
        let history = &self.candles[k.saturating_sub(self.lookback)..k];
        self.index += 1;
        Some((k, bar, history))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.candles.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}
