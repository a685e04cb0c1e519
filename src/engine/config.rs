use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bar interval, stored in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeframe {
    minutes: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized timeframe '{0}'")]
pub struct TimeframeParseError(String);

impl Timeframe {
    pub fn from_minutes(minutes: u32) -> Self {
        Self { minutes }
    }

    pub fn minutes(self) -> u32 {
        self.minutes
    }

    pub fn millis(self) -> i64 {
        i64::from(self.minutes) * 60_000
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeframeParseError(s.to_string());
        let (num, unit) = s.split_at(s.len().saturating_sub(1));
        let n: u32 = num.parse().map_err(|_| err())?;
        if n == 0 {
            return Err(err());
        }
        let minutes = match unit {
            "m" => n,
            "h" => n * 60,
            "d" | "D" => n * 1440,
            _ => return Err(err()),
        };
        Ok(Self { minutes })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minutes % 1440 == 0 {
            write!(f, "{}D", self.minutes / 1440)
        } else if self.minutes % 60 == 0 {
            write!(f, "{}h", self.minutes / 60)
        } else {
            write!(f, "{}m", self.minutes)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageMethod {
    #[default]
    FixedBps,
    AtrBased,
    VolumeAdjusted,
}

/// Execution realism knobs: fees, slippage, leverage, liquidation.
/// Fee rates are expressed in percent (0.02 = 2 bps).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ExecutionConfig {
    #[garde(range(min = 0.0))]
    pub fee_rate_maker: f64,
    #[garde(range(min = 0.0))]
    pub fee_rate_taker: f64,
    #[garde(skip)]
    pub slippage_method: SlippageMethod,
    #[garde(range(min = 0.0))]
    pub slippage_bps: f64,
    #[garde(range(min = 0.0))]
    pub slippage_atr_mult: f64,
    #[garde(range(min = 1))]
    pub max_leverage: u32,
    #[garde(range(min = 0.0, max = 100.0))]
    pub liquidation_buffer_pct: f64,
    /// Constant 8h funding rate for perpetuals. Part of the documented
    /// schema; the simulator does not accrue it.
    #[garde(skip)]
    pub funding_rate_8h: f64,
    /// Market orders always pay taker; when set, limit fills do too.
    #[garde(skip)]
    pub assume_taker: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate_maker: 0.02,
            fee_rate_taker: 0.06,
            slippage_method: SlippageMethod::FixedBps,
            slippage_bps: 5.0,
            slippage_atr_mult: 0.1,
            max_leverage: 20,
            liquidation_buffer_pct: 5.0,
            funding_rate_8h: 0.01,
            assume_taker: true,
        }
    }
}

/// Per-run risk limits enforced by the strategy host's gate.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RiskConfig {
    #[garde(range(min = 0.01))]
    pub risk_per_trade_pct: f64,
    #[garde(range(min = 0.0))]
    pub max_daily_loss_pct: f64,
    #[garde(range(min = 1))]
    pub max_trades_per_day: u32,
    #[garde(range(min = 1))]
    pub max_loss_streak: u32,
    /// Schema knob; the gate arms a fixed 24h cooldown from the last seen
    /// bar time.
    #[garde(skip)]
    pub cooldown_after_streak_min: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 1.0,
            max_daily_loss_pct: 3.0,
            max_trades_per_day: 10,
            max_loss_streak: 3,
            cooldown_after_streak_min: 60,
        }
    }
}

fn validate_end_after_start(
    start: &DateTime<Utc>,
) -> impl FnOnce(&DateTime<Utc>, &()) -> garde::Result + '_ {
    move |end: &DateTime<Utc>, (): &()| {
        if end <= start {
            return Err(garde::Error::new(format!(
                "end_date ({end}) must be after start_date ({start})"
            )));
        }
        Ok(())
    }
}

/// Configuration for a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunConfig {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(skip)]
    pub start_date: DateTime<Utc>,
    #[garde(custom(validate_end_after_start(&self.start_date)))]
    pub end_date: DateTime<Utc>,
    #[serde(default = "default_initial_capital")]
    #[garde(range(min = 0.01))]
    pub initial_capital: f64,
    #[serde(default = "default_base_timeframe")]
    #[garde(length(min = 1))]
    pub base_timeframe: String,
    #[serde(default = "default_mtf_timeframes")]
    #[garde(skip)]
    pub mtf_timeframes: Vec<String>,
    /// Maximum number of prior bars exposed to the strategy per bar.
    #[serde(default = "default_lookback")]
    #[garde(range(min = 1))]
    pub lookback: usize,
    #[serde(default)]
    #[garde(dive)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    #[garde(dive)]
    pub risk: RiskConfig,
    #[serde(default = "default_strategy_preset")]
    #[garde(length(min = 1))]
    pub strategy_preset: String,
    #[serde(default)]
    #[garde(skip)]
    pub parameter_overrides: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    #[garde(skip)]
    pub seed: Option<u64>,
    #[serde(default)]
    #[garde(skip)]
    pub run_id: String,
}

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_base_timeframe() -> String {
    "1m".to_string()
}

fn default_mtf_timeframes() -> Vec<String> {
    ["5m", "15m", "1h", "4h", "1D"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_lookback() -> usize {
    200
}

fn default_strategy_preset() -> String {
    "default".to_string()
}

impl RunConfig {
    pub fn new(symbol: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            start_date: start,
            end_date: end,
            initial_capital: default_initial_capital(),
            base_timeframe: default_base_timeframe(),
            mtf_timeframes: default_mtf_timeframes(),
            lookback: default_lookback(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            strategy_preset: default_strategy_preset(),
            parameter_overrides: BTreeMap::new(),
            seed: None,
            run_id: String::new(),
        }
    }

    pub fn base_tf(&self) -> Result<Timeframe> {
        Ok(self.base_timeframe.parse::<Timeframe>()?)
    }

    /// Run id, generating a fresh one if the config left it empty.
    pub fn run_id_or_new(&self) -> String {
        if self.run_id.is_empty() {
            format!("bt_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        } else {
            self.run_id.clone()
        }
    }
}

/// Numeric parameter helpers for override application.
fn as_f64(key: &str, v: &serde_json::Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| anyhow::anyhow!("parameter '{key}' must be numeric, got {v}"))
}

fn as_u32(key: &str, v: &serde_json::Value) -> Result<u32> {
    let n = v
        .as_u64()
        .ok_or_else(|| anyhow::anyhow!("parameter '{key}' must be a positive integer, got {v}"))?;
    Ok(u32::try_from(n)?)
}

/// Apply a parameter-override map onto a run config.
///
/// Recognized engine keys update the corresponding config field; everything
/// else is left for the strategy to interpret. The full map is merged into
/// `parameter_overrides` either way so the run result records what was swept.
pub fn apply_overrides(
    base: &RunConfig,
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<RunConfig> {
    let mut cfg = base.clone();
    for (key, value) in params {
        match key.as_str() {
            "initial_capital" => cfg.initial_capital = as_f64(key, value)?,
            "lookback" => cfg.lookback = as_u32(key, value)? as usize,
            "risk_per_trade_pct" => cfg.risk.risk_per_trade_pct = as_f64(key, value)?,
            "max_daily_loss_pct" => cfg.risk.max_daily_loss_pct = as_f64(key, value)?,
            "max_trades_per_day" => cfg.risk.max_trades_per_day = as_u32(key, value)?,
            "max_loss_streak" => cfg.risk.max_loss_streak = as_u32(key, value)?,
            "cooldown_after_streak_min" => {
                cfg.risk.cooldown_after_streak_min = as_u32(key, value)?;
            }
            "fee_rate_maker" => cfg.execution.fee_rate_maker = as_f64(key, value)?,
            "fee_rate_taker" => cfg.execution.fee_rate_taker = as_f64(key, value)?,
            "slippage_bps" => cfg.execution.slippage_bps = as_f64(key, value)?,
            "slippage_atr_mult" => cfg.execution.slippage_atr_mult = as_f64(key, value)?,
            "max_leverage" => cfg.execution.max_leverage = as_u32(key, value)?,
            "liquidation_buffer_pct" => {
                cfg.execution.liquidation_buffer_pct = as_f64(key, value)?;
            }
            "assume_taker" => {
                cfg.execution.assume_taker = value
                    .as_bool()
                    .ok_or_else(|| anyhow::anyhow!("parameter 'assume_taker' must be a bool"))?;
            }
            "slippage_method" => {
                let Some(s) = value.as_str() else {
                    bail!("parameter 'slippage_method' must be a string");
                };
                cfg.execution.slippage_method =
                    serde_json::from_value(serde_json::Value::String(s.to_string()))?;
            }
            _ => {} // strategy-level parameter
        }
        cfg.parameter_overrides.insert(key.clone(), value.clone());
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn timeframe_parses_common_labels() {
        assert_eq!("1m".parse::<Timeframe>().unwrap().minutes(), 1);
        assert_eq!("5m".parse::<Timeframe>().unwrap().minutes(), 5);
        assert_eq!("15m".parse::<Timeframe>().unwrap().minutes(), 15);
        assert_eq!("1h".parse::<Timeframe>().unwrap().minutes(), 60);
        assert_eq!("4h".parse::<Timeframe>().unwrap().minutes(), 240);
        assert_eq!("1D".parse::<Timeframe>().unwrap().minutes(), 1440);
        assert_eq!("1d".parse::<Timeframe>().unwrap().minutes(), 1440);
    }

    #[test]
    fn timeframe_rejects_garbage() {
        assert!("".parse::<Timeframe>().is_err());
        assert!("m".parse::<Timeframe>().is_err());
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("5x".parse::<Timeframe>().is_err());
        assert!("-5m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_roundtrips_display() {
        for label in ["1m", "5m", "15m", "30m", "1h", "4h", "1D"] {
            let tf: Timeframe = label.parse().unwrap();
            assert_eq!(tf.to_string(), label);
        }
    }

    #[test]
    fn timeframe_millis() {
        assert_eq!("1m".parse::<Timeframe>().unwrap().millis(), 60_000);
        assert_eq!("1h".parse::<Timeframe>().unwrap().millis(), 3_600_000);
    }

    #[test]
    fn run_config_defaults() {
        let cfg = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        assert!((cfg.initial_capital - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.base_timeframe, "1m");
        assert_eq!(cfg.lookback, 200);
        assert_eq!(cfg.mtf_timeframes.len(), 5);
        assert_eq!(cfg.risk.max_trades_per_day, 10);
        assert_eq!(cfg.execution.max_leverage, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn run_config_rejects_inverted_dates() {
        let cfg = RunConfig::new("BTCUSDT", utc(2024, 2, 1), utc(2024, 1, 1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_config_rejects_equal_dates() {
        let cfg = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 1, 1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_config_rejects_negative_capital() {
        let mut cfg = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        cfg.initial_capital = -100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_config_rejects_empty_symbol() {
        let cfg = RunConfig::new("", utc(2024, 1, 1), utc(2024, 2, 1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn execution_config_rejects_zero_leverage_cap() {
        let mut exec = ExecutionConfig::default();
        exec.max_leverage = 0;
        assert!(exec.validate().is_err());
    }

    #[test]
    fn run_id_generated_when_empty() {
        let cfg = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        let id = cfg.run_id_or_new();
        assert!(id.starts_with("bt_"));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn run_id_preserved_when_set() {
        let mut cfg = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        cfg.run_id = "my_run".to_string();
        assert_eq!(cfg.run_id_or_new(), "my_run");
    }

    #[test]
    fn overrides_update_known_engine_keys() {
        let base = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        let mut params = BTreeMap::new();
        params.insert("risk_per_trade_pct".to_string(), serde_json::json!(2.5));
        params.insert("max_leverage".to_string(), serde_json::json!(5));
        params.insert("slippage_bps".to_string(), serde_json::json!(10.0));

        let cfg = apply_overrides(&base, &params).unwrap();
        assert!((cfg.risk.risk_per_trade_pct - 2.5).abs() < f64::EPSILON);
        assert_eq!(cfg.execution.max_leverage, 5);
        assert!((cfg.execution.slippage_bps - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_keep_unknown_keys_for_strategy() {
        let base = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        let mut params = BTreeMap::new();
        params.insert("fast_period".to_string(), serde_json::json!(10));

        let cfg = apply_overrides(&base, &params).unwrap();
        assert_eq!(
            cfg.parameter_overrides.get("fast_period"),
            Some(&serde_json::json!(10))
        );
    }

    #[test]
    fn overrides_reject_wrong_types() {
        let base = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        let mut params = BTreeMap::new();
        params.insert("max_leverage".to_string(), serde_json::json!("ten"));
        assert!(apply_overrides(&base, &params).is_err());
    }

    #[test]
    fn overrides_switch_slippage_method() {
        let base = RunConfig::new("BTCUSDT", utc(2024, 1, 1), utc(2024, 2, 1));
        let mut params = BTreeMap::new();
        params.insert(
            "slippage_method".to_string(),
            serde_json::json!("atr_based"),
        );
        let cfg = apply_overrides(&base, &params).unwrap();
        assert_eq!(cfg.execution.slippage_method, SlippageMethod::AtrBased);
    }

    #[test]
    fn config_deserializes_with_sparse_fields() {
        let json = r#"{
            "symbol": "ETHUSDT",
            "start_date": "2024-01-01T00:00:00Z",
            "end_date": "2024-03-01T00:00:00Z"
        }"#;
        let cfg: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert!((cfg.initial_capital - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_preset, "default");
    }
}
