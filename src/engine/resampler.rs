use anyhow::{Context, Result};

use super::config::Timeframe;
use super::types::Candle;

/// Default cap on complete higher-timeframe bars kept visible per timeframe.
pub const DEFAULT_HISTORY_BARS_PER_TF: usize = 100;

/// One precomputed higher-timeframe series plus its visibility cursor.
#[derive(Debug, Clone)]
struct TfFrame {
    label: String,
    /// Complete resampled bars, timestamps floor-aligned to the timeframe.
    bars: Vec<Candle>,
    /// Base timestamp from which each bar may be observed.
    visible_from: Vec<i64>,
    /// Bars `[0, cursor)` are complete and visible at the current base bar.
    cursor: usize,
    history: usize,
}

/// Derives higher-timeframe bar streams from the base series.
///
/// All frames are aggregated once up front; during replay only a cursor per
/// timeframe advances, so exposing a snapshot allocates nothing. A resampled
/// bar becomes visible strictly after its last contributing base bar has
/// elapsed — in-progress buckets are never observable.
#[derive(Debug, Clone)]
pub struct MtfResampler {
    frames: Vec<TfFrame>,
}

impl MtfResampler {
    pub fn new(timeframes: &[String], history_bars_per_tf: usize) -> Result<Self> {
        let mut frames = Vec::with_capacity(timeframes.len());
        for label in timeframes {
            label
                .parse::<Timeframe>()
                .with_context(|| format!("invalid MTF timeframe '{label}'"))?;
            frames.push(TfFrame {
                label: label.clone(),
                bars: Vec::new(),
                visible_from: Vec::new(),
                cursor: 0,
                history: history_bars_per_tf,
            });
        }
        Ok(Self { frames })
    }

    /// Aggregate the base series into every configured timeframe and reset
    /// the visibility cursors.
    pub fn prepare(&mut self, base: &[Candle], base_tf: Timeframe) {
        for frame in &mut self.frames {
            let tf: Timeframe = frame.label.parse().expect("validated in new()");
            let (bars, visible_from) = resample(base, base_tf, tf);
            frame.bars = bars;
            frame.visible_from = visible_from;
            frame.cursor = 0;
        }
    }

    /// Advance visibility to the given base-bar timestamp. Timestamps must
    /// be fed in ascending order.
    pub fn advance(&mut self, now_ts: i64) {
        for frame in &mut self.frames {
            while frame.cursor < frame.bars.len() && frame.visible_from[frame.cursor] <= now_ts {
                frame.cursor += 1;
            }
        }
    }

    /// Current view: per timeframe, the most recent complete bars.
    pub fn snapshot(&self) -> MtfSnapshot<'_> {
        MtfSnapshot {
            frames: &self.frames,
        }
    }
}

/// Read-only multi-timeframe view handed to the strategy callback.
#[derive(Debug, Clone, Copy)]
pub struct MtfSnapshot<'a> {
    frames: &'a [TfFrame],
}

impl<'a> MtfSnapshot<'a> {
    /// Complete bars for a timeframe label, oldest first, at most the
    /// configured history cap. `None` if the timeframe was not declared.
    pub fn frame(&self, label: &str) -> Option<&'a [Candle]> {
        self.frames.iter().find(|f| f.label == label).map(|f| {
            let start = f.cursor.saturating_sub(f.history);
            &f.bars[start..f.cursor]
        })
    }

    pub fn labels(&self) -> impl Iterator<Item = &'a str> {
        self.frames.iter().map(|f| f.label.as_str())
    }
}

/// Aggregate base bars into floor-aligned buckets of the target timeframe.
///
/// Returns the complete bars and, per bar, the base timestamp from which it
/// may be observed: `max(bucket_end, last_contributing_ts + base_interval)`,
/// which also covers bases that do not divide the target evenly. The
/// trailing bucket is dropped — whether it is complete cannot be known from
/// the series alone.
fn resample(base: &[Candle], base_tf: Timeframe, target: Timeframe) -> (Vec<Candle>, Vec<i64>) {
    let tf_ms = target.millis();
    let base_ms = base_tf.millis();

    let mut bars = Vec::new();
    let mut visible_from = Vec::new();

    let mut current: Option<(i64, Candle, i64)> = None; // (bucket, agg, last contributing ts)

    for c in base {
        let bucket = c.timestamp - c.timestamp.rem_euclid(tf_ms);

        match &mut current {
            Some((b, agg, last_ts)) if *b == bucket => {
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
                agg.volume += c.volume;
                *last_ts = c.timestamp;
            }
            _ => {
                if let Some((b, agg, last_ts)) = current.take() {
                    bars.push(agg);
                    visible_from.push((b + tf_ms).max(last_ts + base_ms));
                }
                current = Some((
                    bucket,
                    Candle {
                        timestamp: bucket,
                        open: c.open,
                        high: c.high,
                        low: c.low,
                        close: c.close,
                        volume: c.volume,
                    },
                    c.timestamp,
                ));
            }
        }
    }

    // The last bucket is still in progress at series end.
    (bars, visible_from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn candle(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn one_minute_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let p = 100.0 + i as f64;
                candle(i as i64 * MIN, p, p + 2.0, p - 2.0, p + 1.0, 10.0)
            })
            .collect()
    }

    fn tf(label: &str) -> Timeframe {
        label.parse().unwrap()
    }

    #[test]
    fn five_minute_aggregation_semantics() {
        let base = one_minute_series(11);
        let (bars, _) = resample(&base, tf("1m"), tf("5m"));

        // 11 one-minute bars → buckets [0,5), [5,10) complete, [10,..) partial
        assert_eq!(bars.len(), 2);
        let first = &bars[0];
        assert_eq!(first.timestamp, 0);
        assert!((first.open - 100.0).abs() < f64::EPSILON); // first open
        assert!((first.high - 106.0).abs() < f64::EPSILON); // max(high) = 104 + 2
        assert!((first.low - 98.0).abs() < f64::EPSILON); // min(low) = 100 - 2
        assert!((first.close - 105.0).abs() < f64::EPSILON); // last close = 104 + 1
        assert!((first.volume - 50.0).abs() < f64::EPSILON); // sum
    }

    #[test]
    fn bucket_timestamps_floor_to_timeframe() {
        // series starting mid-bucket at minute 3
        let base: Vec<Candle> = (3..12)
            .map(|i| candle(i * MIN, 100.0, 101.0, 99.0, 100.5, 1.0))
            .collect();
        let (bars, _) = resample(&base, tf("1m"), tf("5m"));
        assert_eq!(bars[0].timestamp, 0);
        assert_eq!(bars[1].timestamp, 5 * MIN);
    }

    #[test]
    fn partial_trailing_bucket_is_dropped() {
        let base = one_minute_series(7); // [0,5) complete, [5,7) partial
        let (bars, _) = resample(&base, tf("1m"), tf("5m"));
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn identity_resample_to_base_timeframe() {
        let base = one_minute_series(10);
        let (bars, _) = resample(&base, tf("1m"), tf("1m"));
        // identity modulo the dropped in-progress trailing bar
        assert_eq!(bars.len(), 9);
        for (a, b) in bars.iter().zip(base.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn non_divisible_base_groups_by_close_alignment() {
        // 3m base into 5m target: bars at 0, 3, 6, 9, 12 minutes
        let base: Vec<Candle> = (0..5)
            .map(|i| candle(i * 3 * MIN, 100.0, 101.0, 99.0, 100.5, 1.0))
            .collect();
        let (bars, visible) = resample(&base, tf("3m"), tf("5m"));

        // buckets: [0,5) ← {0,3}; [5,10) ← {6,9}; [10,15) ← {12} partial
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 0);
        assert!((bars[0].volume - 2.0).abs() < f64::EPSILON);
        // the 3m bar opening at minute 3 runs until minute 6 > bucket end 5
        assert_eq!(visible[0], 6 * MIN);
    }

    #[test]
    fn visibility_waits_for_last_contributing_bar() {
        let base = one_minute_series(15);
        let mut resampler = MtfResampler::new(&["5m".to_string()], 100).unwrap();
        resampler.prepare(&base, tf("1m"));

        // at minute 4 the first 5m bucket has not elapsed yet
        resampler.advance(4 * MIN);
        assert_eq!(resampler.snapshot().frame("5m").unwrap().len(), 0);

        // at minute 5 the [0,5) bucket is complete
        resampler.advance(5 * MIN);
        assert_eq!(resampler.snapshot().frame("5m").unwrap().len(), 1);

        resampler.advance(10 * MIN);
        assert_eq!(resampler.snapshot().frame("5m").unwrap().len(), 2);
    }

    #[test]
    fn no_lookahead_in_visible_frames() {
        let base = one_minute_series(120);
        let labels: Vec<String> = ["5m", "15m", "1h"].iter().map(ToString::to_string).collect();
        let mut resampler = MtfResampler::new(&labels, 100).unwrap();
        resampler.prepare(&base, tf("1m"));

        for c in &base {
            resampler.advance(c.timestamp);
            let snap = resampler.snapshot();
            for label in ["5m", "15m", "1h"] {
                let frame = snap.frame(label).unwrap();
                if let Some(last) = frame.last() {
                    let tf_ms = tf(label).millis();
                    // everything contributing to the last visible bar closed
                    // at or before the current base bar
                    assert!(last.timestamp + tf_ms <= c.timestamp);
                }
            }
        }
    }

    #[test]
    fn history_ring_is_bounded() {
        let base = one_minute_series(600);
        let mut resampler = MtfResampler::new(&["5m".to_string()], 20).unwrap();
        resampler.prepare(&base, tf("1m"));
        resampler.advance(599 * MIN);

        let frame = resampler.snapshot().frame("5m").unwrap();
        assert_eq!(frame.len(), 20);
        // the window holds the most recent complete bars
        assert_eq!(frame.last().unwrap().timestamp, 590 * MIN);
    }

    #[test]
    fn unknown_label_yields_none() {
        let resampler = MtfResampler::new(&["5m".to_string()], 100).unwrap();
        assert!(resampler.snapshot().frame("4h").is_none());
    }

    #[test]
    fn invalid_timeframe_rejected_at_construction() {
        assert!(MtfResampler::new(&["banana".to_string()], 100).is_err());
    }

    #[test]
    fn prepare_resets_cursor_between_runs() {
        let base = one_minute_series(30);
        let mut resampler = MtfResampler::new(&["5m".to_string()], 100).unwrap();
        resampler.prepare(&base, tf("1m"));
        resampler.advance(29 * MIN);
        assert!(!resampler.snapshot().frame("5m").unwrap().is_empty());

        resampler.prepare(&base, tf("1m"));
        assert!(resampler.snapshot().frame("5m").unwrap().is_empty());
    }
}
