use anyhow::Result;
use tracing::{debug, warn};

use super::config::RunConfig;
use super::sim::ExecutionSimulator;
use super::state::BacktestState;
use super::types::{Candle, FillStatus, OpenPosition, Order, OrderSide, OrderType, Signal};

/// ATR window used for slippage estimation on entries.
pub const ATR_PERIOD: usize = 14;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

/// Risk gate, evaluated before the signal callback is consulted. Blocked
/// bars still run position management; they only skip signal generation.
///
/// Hitting the loss-streak limit arms a cooldown of 24 hours from the last
/// seen bar time; the cooldown stays armed until a non-losing trade clears
/// it or the clock passes it.
pub fn risk_gate_allows(state: &mut BacktestState, config: &RunConfig, now_ts: i64) -> bool {
    let daily_loss_cap = config.risk.max_daily_loss_pct / 100.0 * config.initial_capital;
    if state.daily_pnl < -daily_loss_cap {
        return false;
    }

    if state.trades_today >= config.risk.max_trades_per_day {
        return false;
    }

    if state.loss_streak >= config.risk.max_loss_streak {
        let until = *state.cooldown_until.get_or_insert_with(|| {
            warn!(
                streak = state.loss_streak,
                "loss streak limit hit, cooling down for 24h"
            );
            now_ts + DAY_MS
        });
        if now_ts < until {
            return false;
        }
    }

    true
}

/// Translate a signal into an open position: size it from equity and the
/// stop distance, execute a market entry with the current cash as available
/// margin, and record the position on an accepted fill. A rejected fill is
/// a logged no-op.
pub fn execute_signal(
    state: &mut BacktestState,
    sim: &ExecutionSimulator,
    config: &RunConfig,
    signal: &Signal,
    candle: &Candle,
    history: &[Candle],
) -> Result<()> {
    let mut sl_distance = signal
        .sl_distance
        .or_else(|| signal.stop_loss.map(|sl| (candle.close - sl).abs()))
        .unwrap_or(candle.close * 0.01);
    if sl_distance <= 0.0 {
        sl_distance = candle.close * 0.01;
    }

    let leverage = signal.leverage.max(1).min(config.execution.max_leverage);
    let risk_amount = state.current_equity() * (config.risk.risk_per_trade_pct / 100.0);
    let size = risk_amount * f64::from(leverage) / sl_distance;

    let order = Order {
        id: state.next_position_id(),
        symbol: config.symbol.clone(),
        side: signal.action,
        order_type: OrderType::Market,
        quantity: size,
        price: None,
        stop_price: None,
        leverage,
        timestamp: candle.timestamp,
    };

    let atr = trailing_atr(history, ATR_PERIOD);
    let fill = sim.execute(&order, candle.close, atr, Some(state.cash), 1.0);

    if fill.status != FillStatus::Filled {
        warn!(reason = %fill.reason, "entry order rejected");
        return Ok(());
    }

    let stop_loss = signal.stop_loss.or(Some(match signal.action {
        OrderSide::Buy => fill.fill_price - sl_distance,
        OrderSide::Sell => fill.fill_price + sl_distance,
    }));

    let position = OpenPosition {
        id: order.id,
        symbol: config.symbol.clone(),
        side: signal.action,
        entry_price: fill.fill_price,
        entry_time: candle.timestamp,
        size: fill.fill_quantity,
        stop_loss,
        take_profit: signal.take_profit,
        leverage,
        margin_used: fill.margin_used,
        entry_fee: fill.fee,
        entry_slippage: fill.slippage,
        entry_reason: signal.reason.clone(),
        liquidation_price: fill.liquidation_price.unwrap_or(0.0),
        unrealized_pnl: 0.0,
        unrealized_pnl_pct: 0.0,
    };

    debug!(
        side = ?position.side,
        size = position.size,
        entry = position.entry_price,
        sl = ?position.stop_loss,
        tp = ?position.take_profit,
        "position opened"
    );

    state.cash -= fill.margin_used;
    state.open_positions.push(position);
    state.trades_today += 1;

    Ok(())
}

/// Average true range over the trailing `period` bars of the history
/// window. `None` when the window is too short.
pub fn trailing_atr(history: &[Candle], period: usize) -> Option<f64> {
    if history.len() < period || period == 0 {
        return None;
    }
    let tail = &history[history.len() - period..];
    let close: Vec<f64> = tail.iter().map(|c| c.close).collect();
    let high: Vec<f64> = tail.iter().map(|c| c.high).collect();
    let low: Vec<f64> = tail.iter().map(|c| c.low).collect();

    Some(rust_ti::other_indicators::single::average_true_range(
        &close,
        &high,
        &low,
        rust_ti::ConstantModelType::SimpleMovingAverage,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::ExecutionConfig;
    use chrono::{TimeZone, Utc};

    fn config() -> RunConfig {
        let mut cfg = RunConfig::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        );
        cfg.execution = ExecutionConfig {
            fee_rate_maker: 0.0,
            fee_rate_taker: 0.0,
            slippage_bps: 0.0,
            ..ExecutionConfig::default()
        };
        cfg
    }

    fn sim(cfg: &RunConfig) -> ExecutionSimulator {
        ExecutionSimulator::new(&cfg.execution)
    }

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: 3_600_000,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn gate_blocks_on_daily_loss_cap() {
        let cfg = config();
        let mut state = BacktestState::new(10_000.0);
        // cap is 3% of 10k = 300
        state.daily_pnl = -301.0;
        assert!(!risk_gate_allows(&mut state, &cfg, 0));

        state.daily_pnl = -299.0;
        assert!(risk_gate_allows(&mut state, &cfg, 0));
    }

    #[test]
    fn gate_blocks_on_trade_count() {
        let cfg = config();
        let mut state = BacktestState::new(10_000.0);
        state.trades_today = 10;
        assert!(!risk_gate_allows(&mut state, &cfg, 0));
    }

    #[test]
    fn gate_arms_cooldown_on_streak_and_expires() {
        let cfg = config();
        let mut state = BacktestState::new(10_000.0);
        state.loss_streak = 3;

        assert!(!risk_gate_allows(&mut state, &cfg, 1_000));
        assert_eq!(state.cooldown_until, Some(1_000 + DAY_MS));

        // still inside the cooldown window
        assert!(!risk_gate_allows(&mut state, &cfg, 1_000 + DAY_MS - 1));
        // past it
        assert!(risk_gate_allows(&mut state, &cfg, 1_000 + DAY_MS));
    }

    #[test]
    fn signal_sizing_follows_risk_formula() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let mut signal = Signal::new(OrderSide::Buy);
        signal.sl_distance = Some(2.0);
        signal.leverage = 4;

        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        // size = 10000 * 1% * 4 / 2 = 200
        let pos = &state.open_positions[0];
        assert!((pos.size - 200.0).abs() < 1e-10);
        assert_eq!(pos.leverage, 4);
        assert_eq!(state.trades_today, 1);
        // margin deducted: 200 * 100 / 4 = 5000
        assert!((state.cash - 5_000.0).abs() < 1e-10);
    }

    #[test]
    fn sl_distance_defaults_to_one_percent() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let signal = Signal::new(OrderSide::Buy);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        // distance = 1.0 → size = 100 * 1 / 1.0 = 100
        let pos = &state.open_positions[0];
        assert!((pos.size - 100.0).abs() < 1e-10);
        // derived stop sits one distance below the fill
        assert!((pos.stop_loss.unwrap() - 99.0).abs() < 1e-10);
    }

    #[test]
    fn explicit_stop_loss_is_kept() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let mut signal = Signal::new(OrderSide::Buy);
        signal.stop_loss = Some(97.0);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        assert_eq!(state.open_positions[0].stop_loss, Some(97.0));
    }

    #[test]
    fn short_signal_derives_stop_above_fill() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let mut signal = Signal::new(OrderSide::Sell);
        signal.sl_distance = Some(3.0);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        assert!((state.open_positions[0].stop_loss.unwrap() - 103.0).abs() < 1e-10);
    }

    #[test]
    fn leverage_is_capped_by_config() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let mut signal = Signal::new(OrderSide::Buy);
        signal.leverage = 500;
        signal.sl_distance = Some(50.0);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        assert_eq!(state.open_positions[0].leverage, 20);
    }

    #[test]
    fn rejected_fill_is_a_no_op() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);
        state.cash = 1.0; // margin check will reject

        let mut signal = Signal::new(OrderSide::Buy);
        signal.sl_distance = Some(0.5);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        assert!(state.open_positions.is_empty());
        assert_eq!(state.trades_today, 0);
        assert!((state.cash - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn atr_needs_a_full_window() {
        let bars: Vec<Candle> = (0..10).map(|_| candle(100.0)).collect();
        assert!(trailing_atr(&bars, 14).is_none());
        let bars: Vec<Candle> = (0..14).map(|_| candle(100.0)).collect();
        let atr = trailing_atr(&bars, 14).unwrap();
        // flat series with constant 1.0 range
        assert!((atr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_sl_distance_falls_back() {
        let cfg = config();
        let s = sim(&cfg);
        let mut state = BacktestState::new(10_000.0);

        let mut signal = Signal::new(OrderSide::Buy);
        signal.sl_distance = Some(0.0);
        execute_signal(&mut state, &s, &cfg, &signal, &candle(100.0), &[]).unwrap();

        // fell back to 1% of close
        assert!((state.open_positions[0].size - 100.0).abs() < 1e-10);
    }
}
