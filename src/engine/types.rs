use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn trade_side(self) -> TradeSide {
        match self {
            OrderSide::Buy => TradeSide::Long,
            OrderSide::Sell => TradeSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStatus {
    Filled,
    Partial,
    Rejected,
    Liquidated,
}

/// A single OHLCV bar. Timestamps are Unix milliseconds, UTC.
/// Bars are created once at load time and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }
}

/// An order intent. Created by the strategy host, consumed once by the
/// execution simulator, never reused.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub leverage: u32,
    pub timestamp: i64,
}

/// Outcome of attempting to execute an order. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_id: String,
    pub status: FillStatus,
    pub fill_price: f64,
    pub fill_quantity: f64,
    /// Absolute fee charged on the fill.
    pub fee: f64,
    /// Applied fee rate, in percent.
    pub fee_rate: f64,
    /// Absolute slippage in price units.
    pub slippage: f64,
    pub slippage_bps: f64,
    pub notional_value: f64,
    pub margin_used: f64,
    /// Set on leveraged entry fills; `None` for exits and rejections.
    pub liquidation_price: Option<f64>,
    pub side: OrderSide,
    pub leverage: u32,
    pub timestamp: i64,
    pub reason: String,
}

/// P&L breakdown for a completed entry/exit pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlBreakdown {
    pub raw_pnl: f64,
    pub leveraged_pnl: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    /// Return in percent, relative to margin used (not notional).
    pub return_pct: f64,
    pub entry_notional: f64,
    pub exit_notional: f64,
    pub margin_used: f64,
}

/// Strategy output for a single bar.
#[derive(Debug, Clone)]
pub struct Signal {
    pub action: OrderSide,
    pub stop_loss: Option<f64>,
    /// Absolute distance from fill to stop. Used for sizing; defaults to
    /// 1% of the decision close when neither this nor `stop_loss` is given.
    pub sl_distance: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: u32,
    pub reason: String,
}

impl Signal {
    pub fn new(action: OrderSide) -> Self {
        Self {
            action,
            stop_loss: None,
            sl_distance: None,
            take_profit: None,
            leverage: 1,
            reason: String::new(),
        }
    }
}

/// An open position. Mutated only by the position manager; the liquidation
/// price is fixed at entry.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub entry_time: i64,
    pub size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: u32,
    pub margin_used: f64,
    pub entry_fee: f64,
    pub entry_slippage: f64,
    pub entry_reason: String,
    /// 0.0 means the position cannot be liquidated (leverage 1).
    pub liquidation_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

/// Immutable record of a completed trade lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub size: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_reason: String,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Net of both legs' fees.
    pub realized_pnl: f64,
    /// Relative to margin used, in percent.
    pub realized_pnl_pct: f64,
    pub commission: f64,
    pub slippage: f64,
    pub duration_secs: f64,
    /// Net P&L in units of initial risk (`|entry − SL| · size`); undefined
    /// when the position carried no stop.
    pub r_multiple: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: f64,
}

/// OHLCV bar as reported in a run result (hourly sample of the base series).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn from_candle(c: &Candle) -> Self {
        Self {
            time: c.datetime(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_days: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub avg_r_multiple: Option<f64>,
    pub best_r_multiple: Option<f64>,
    pub worst_r_multiple: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub total_return_pct: f64,
    pub avg_trade_duration_minutes: Option<f64>,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

impl Default for BacktestMetrics {
    fn default() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            profit_factor: 0.0,
            expectancy: 0.0,
            max_drawdown_pct: 0.0,
            max_drawdown_duration_days: None,
            sharpe_ratio: None,
            avg_r_multiple: None,
            best_r_multiple: None,
            worst_r_multiple: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            total_return_pct: 0.0,
            avg_trade_duration_minutes: None,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
        }
    }
}

/// Complete result of a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub symbol: String,
    pub timeframe: String,
    pub mode: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub bars: Vec<Bar>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: BacktestMetrics,
    pub strategy_name: String,
    pub strategy_params: BTreeMap<String, serde_json::Value>,
}
