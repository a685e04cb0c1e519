mod breakout;
mod sma_cross;

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::engine::resampler::MtfSnapshot;
use crate::engine::types::{Candle, Signal};

pub use breakout::Breakout;
pub use sma_cross::SmaCross;

/// The engine's sole extension point. Called at most once per bar and only
/// when no position is open; returning `Ok(None)` means stay flat.
///
/// Implementations may read the bar, the trailing history window and the
/// multi-timeframe snapshot, but own no engine state. Errors are treated as
/// "no signal this bar" by the runner.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn on_bar(
        &mut self,
        candle: &Candle,
        history: &[Candle],
        mtf: &MtfSnapshot<'_>,
    ) -> Result<Option<Signal>>;
}

/// Closure adapter, mainly for tests and embedding users.
pub struct FnStrategy {
    name: String,
    #[allow(clippy::type_complexity)]
    f: Box<dyn FnMut(&Candle, &[Candle], &MtfSnapshot<'_>) -> Result<Option<Signal>> + Send>,
}

impl FnStrategy {
    pub fn boxed<F>(name: &str, f: F) -> Box<Self>
    where
        F: FnMut(&Candle, &[Candle], &MtfSnapshot<'_>) -> Result<Option<Signal>> + Send + 'static,
    {
        Box::new(Self {
            name: name.to_string(),
            f: Box::new(f),
        })
    }
}

impl Strategy for FnStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_bar(
        &mut self,
        candle: &Candle,
        history: &[Candle],
        mtf: &MtfSnapshot<'_>,
    ) -> Result<Option<Signal>> {
        (self.f)(candle, history, mtf)
    }
}

/// Resolve a strategy preset by name, configured from the run's parameter
/// overrides. Unknown parameters are ignored by presets that do not read
/// them, so one parameter space can sweep engine and strategy knobs at once.
pub fn find_strategy(
    preset: &str,
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<Box<dyn Strategy>> {
    match preset {
        "default" | "sma_cross" => Ok(Box::new(SmaCross::from_params(params)?)),
        "breakout" => Ok(Box::new(Breakout::from_params(params)?)),
        other => bail!("Unknown strategy preset: {other}"),
    }
}

/// Parameter lookup helpers shared by the presets.
pub(crate) fn param_usize(
    params: &BTreeMap<String, serde_json::Value>,
    key: &str,
    default: usize,
) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow::anyhow!("strategy parameter '{key}' must be a positive integer")),
    }
}

pub(crate) fn param_f64(
    params: &BTreeMap<String, serde_json::Value>,
    key: &str,
    default: f64,
) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("strategy parameter '{key}' must be numeric")),
    }
}

pub(crate) fn param_u32(
    params: &BTreeMap<String, serde_json::Value>,
    key: &str,
    default: u32,
) -> Result<u32> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| anyhow::anyhow!("strategy parameter '{key}' must be a positive integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resampler::MtfResampler;
    use crate::engine::types::OrderSide;

    #[test]
    fn registry_resolves_presets() {
        let params = BTreeMap::new();
        assert_eq!(find_strategy("default", &params).unwrap().name(), "sma_cross");
        assert_eq!(
            find_strategy("sma_cross", &params).unwrap().name(),
            "sma_cross"
        );
        assert_eq!(find_strategy("breakout", &params).unwrap().name(), "breakout");
    }

    #[test]
    fn registry_rejects_unknown_preset() {
        let err = match find_strategy("galaxy_brain", &BTreeMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected unknown preset error"),
        };
        assert!(err.to_string().contains("galaxy_brain"));
    }

    #[test]
    fn fn_strategy_passes_through() {
        let mut strategy = FnStrategy::boxed("probe", |candle, _, _| {
            let mut s = Signal::new(OrderSide::Buy);
            s.reason = format!("ts={}", candle.timestamp);
            Ok(Some(s))
        });

        let resampler = MtfResampler::new(&[], 100).unwrap();
        let snap = resampler.snapshot();
        let candle = Candle {
            timestamp: 42,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        let signal = strategy.on_bar(&candle, &[], &snap).unwrap().unwrap();
        assert_eq!(signal.reason, "ts=42");
        assert_eq!(strategy.name(), "probe");
    }

    #[test]
    fn param_helpers_validate_types() {
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), serde_json::json!("twenty"));
        assert!(param_usize(&params, "period", 20).is_err());
        assert_eq!(param_usize(&params, "missing", 20).unwrap(), 20);
    }
}
