use std::collections::BTreeMap;

use anyhow::Result;

use crate::engine::resampler::MtfSnapshot;
use crate::engine::signals::{trailing_atr, ATR_PERIOD};
use crate::engine::types::{Candle, OrderSide, Signal};

use super::{param_f64, param_u32, param_usize, Strategy};

/// Moving-average crossover. Goes long when the fast SMA crosses above the
/// slow one, short on the opposite cross. The stop distance is derived from
/// ATR; the target is a risk-multiple of that distance.
///
/// Parameters: `fast_period` (20), `slow_period` (50), `atr_mult_sl` (1.5),
/// `tp_rr` (2.0, 0 disables the target), `leverage` (2).
pub struct SmaCross {
    fast_period: usize,
    slow_period: usize,
    atr_mult_sl: f64,
    tp_rr: f64,
    leverage: u32,
}

impl SmaCross {
    pub fn from_params(params: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let fast_period = param_usize(params, "fast_period", 20)?;
        let slow_period = param_usize(params, "slow_period", 50)?;
        anyhow::ensure!(
            fast_period > 0 && slow_period > fast_period,
            "slow_period ({slow_period}) must exceed fast_period ({fast_period})"
        );
        Ok(Self {
            fast_period,
            slow_period,
            atr_mult_sl: param_f64(params, "atr_mult_sl", 1.5)?,
            tp_rr: param_f64(params, "tp_rr", 2.0)?,
            leverage: param_u32(params, "leverage", 2)?,
        })
    }

    fn stop_distance(&self, candle: &Candle, history: &[Candle]) -> f64 {
        trailing_atr(history, ATR_PERIOD)
            .map_or(candle.close * 0.01, |atr| atr * self.atr_mult_sl)
    }
}

fn sma(closes: &[f64]) -> f64 {
    closes.iter().sum::<f64>() / closes.len() as f64
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn on_bar(
        &mut self,
        candle: &Candle,
        history: &[Candle],
        _mtf: &MtfSnapshot<'_>,
    ) -> Result<Option<Signal>> {
        // one extra bar so the previous-bar averages exist
        if history.len() < self.slow_period + 1 {
            return Ok(None);
        }

        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();
        let n = closes.len();

        let fast_now = sma(&closes[n - self.fast_period..]);
        let slow_now = sma(&closes[n - self.slow_period..]);
        let fast_prev = sma(&closes[n - self.fast_period - 1..n - 1]);
        let slow_prev = sma(&closes[n - self.slow_period - 1..n - 1]);

        let crossed_up = fast_prev <= slow_prev && fast_now > slow_now;
        let crossed_down = fast_prev >= slow_prev && fast_now < slow_now;
        if !crossed_up && !crossed_down {
            return Ok(None);
        }

        let side = if crossed_up {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let distance = self.stop_distance(candle, history);

        let mut signal = Signal::new(side);
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
            "SMA({}) crossed {} SMA({})",
            self.fast_period,
            if crossed_up { "above" } else { "below" },
            self.slow_period
        );

        Ok(Some(signal))
    }
}
