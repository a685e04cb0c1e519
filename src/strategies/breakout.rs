use std::collections::BTreeMap;

use anyhow::Result;

use crate::engine::resampler::MtfSnapshot;
use crate::engine::types::{Candle, OrderSide, Signal};

use super::{param_f64, param_u32, param_usize, Strategy};

/// Channel breakout. Buys when the close clears the highest high of the
/// trailing channel, sells when it breaks the lowest low; the stop sits at
/// the channel midpoint.
///
/// Parameters: `channel_period` (20), `tp_rr` (1.5, 0 disables the target),
/// `leverage` (2).
pub struct Breakout {
    channel_period: usize,
    tp_rr: f64,
    leverage: u32,
}

impl Breakout {
    pub fn from_params(params: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let channel_period = param_usize(params, "channel_period", 20)?;
        anyhow::ensure!(channel_period >= 2, "channel_period must be at least 2");
        Ok(Self {
            channel_period,
            tp_rr: param_f64(params, "tp_rr", 1.5)?,
            leverage: param_u32(params, "leverage", 2)?,
        })
    }
}

impl Strategy for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn on_bar(
        &mut self,
        candle: &Candle,
        history: &[Candle],
        _mtf: &MtfSnapshot<'_>,
    ) -> Result<Option<Signal>> {
        if history.len() < self.channel_period {
            return Ok(None);
        }

        let channel = &history[history.len() - self.channel_period..];
        let upper = channel.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lower = channel.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let mid = f64::midpoint(upper, lower);

        let side = if candle.close > upper {
            OrderSide::Buy
        } else if candle.close < lower {
            OrderSide::Sell
        } else {
            return Ok(None);
        };

        let distance = (candle.close - mid).abs();
        if distance <= 0.0 {
            return Ok(None);
        }

        let mut signal = Signal::new(side);
        signal.stop_loss = Some(mid);
        signal.sl_distance = Some(distance);
        signal.leverage = self.leverage;
        if self.tp_rr > 0.0 {
            let target = distance * self.tp_rr;
            signal.take_profit = Some(match side {
                OrderSide::Buy => candle.close + target,
                OrderSide::Sell => candle.close - target,
            });
        }
        signal.reason = format!(
            "close {:.2} broke {}-bar channel [{lower:.2}, {upper:.2}]",
            candle.close, self.channel_period
        );

        Ok(Some(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resampler::MtfResampler;

    fn candle(i: usize, close: f64, high: f64, low: f64) -> Candle {
        Candle {
            timestamp: i as i64 * 60_000,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn ranging_history(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0, 101.0, 99.0)).collect()
    }

    fn strategy(period: usize) -> Breakout {
        let mut params = BTreeMap::new();
        params.insert("channel_period".to_string(), serde_json::json!(period));
        Breakout::from_params(&params).unwrap()
    }

    fn on(strategy: &mut Breakout, candle: &Candle, history: &[Candle]) -> Option<Signal> {
        let resampler = MtfResampler::new(&[], 100).unwrap();
        let snap = resampler.snapshot();
        strategy.on_bar(candle, history, &snap).unwrap()
    }

    #[test]
    fn buys_above_channel_high() {
        let mut s = strategy(10);
        let history = ranging_history(15);
        let breakout_bar = candle(15, 102.0, 102.5, 100.5);

        let signal = on(&mut s, &breakout_bar, &history).expect("breakout should fire");
        assert_eq!(signal.action, OrderSide::Buy);
        // stop at channel mid (100), distance 2
        assert_eq!(signal.stop_loss, Some(100.0));
        assert!((signal.sl_distance.unwrap() - 2.0).abs() < 1e-10);
        // tp = close + 1.5 * 2
        assert!((signal.take_profit.unwrap() - 105.0).abs() < 1e-10);
    }

    #[test]
    fn sells_below_channel_low() {
        let mut s = strategy(10);
        let history = ranging_history(15);
        let breakdown_bar = candle(15, 98.0, 99.5, 97.5);

        let signal = on(&mut s, &breakdown_bar, &history).expect("breakdown should fire");
        assert_eq!(signal.action, OrderSide::Sell);
        assert!(signal.take_profit.unwrap() < 98.0);
    }

    #[test]
    fn silent_inside_the_channel() {
        let mut s = strategy(10);
        let history = ranging_history(15);
        let inside_bar = candle(15, 100.5, 100.9, 99.1);
        assert!(on(&mut s, &inside_bar, &history).is_none());
    }

    #[test]
    fn silent_with_short_history() {
        let mut s = strategy(10);
        let history = ranging_history(5);
        let bar = candle(5, 105.0, 105.0, 104.0);
        assert!(on(&mut s, &bar, &history).is_none());
    }

    #[test]
    fn rejects_degenerate_period() {
        let mut params = BTreeMap::new();
        params.insert("channel_period".to_string(), serde_json::json!(1));
        assert!(Breakout::from_params(&params).is_err());
    }
}
