use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::sim::ExecutionSimulator;
use super::state::BacktestState;
use super::types::{Candle, OpenPosition, Order, OrderSide, OrderType, Trade};

pub const REASON_LIQUIDATION: &str = "Liquidation";
pub const REASON_STOP_LOSS: &str = "Stop Loss";
pub const REASON_TAKE_PROFIT: &str = "Take Profit";
pub const REASON_END_OF_BACKTEST: &str = "End of Backtest";

/// Advance every open position by one bar: refresh unrealized P&L, then run
/// the exit checks in priority order — liquidation first, stop loss second,
/// take profit last. A position closes at most once per bar; when both SL
/// and TP fall inside the bar's range, the stop wins (conservative).
pub fn manage_bar(
    state: &mut BacktestState,
    sim: &ExecutionSimulator,
    candle: &Candle,
) -> Result<()> {
    let mut i = 0;
    while i < state.open_positions.len() {
        {
            let pos = &mut state.open_positions[i];
            let (pnl, pnl_pct) = unrealized(pos, candle.close);
            pos.unrealized_pnl = pnl;
            pos.unrealized_pnl_pct = pnl_pct;
        }

        let pos = &state.open_positions[i];
        let exit = exit_trigger(pos, candle);

        if let Some((price, reason)) = exit {
            let position = state.open_positions.remove(i);
            close_position(state, sim, position, price, candle.timestamp, reason)?;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Unrealized P&L for a position at the given price: absolute, and percent
/// of the entry move multiplied by leverage (margin basis).
fn unrealized(pos: &OpenPosition, price: f64) -> (f64, f64) {
    let lev = f64::from(pos.leverage);
    let (pnl, move_pct) = match pos.side {
        OrderSide::Buy => (
            (price - pos.entry_price) * pos.size * lev,
            (price - pos.entry_price) / pos.entry_price * 100.0,
        ),
        OrderSide::Sell => (
            (pos.entry_price - price) * pos.size * lev,
            (pos.entry_price - price) / pos.entry_price * 100.0,
        ),
    };
    (pnl, move_pct * lev)
}

/// Intrabar exit decision: `(exit_price, reason)` of the highest-priority
/// trigger hit by this bar's range, if any.
fn exit_trigger(pos: &OpenPosition, candle: &Candle) -> Option<(f64, &'static str)> {
    let liq = pos.liquidation_price;
    if pos.leverage > 1 && liq > 0.0 {
        let hit = match pos.side {
            OrderSide::Buy => candle.low <= liq,
            OrderSide::Sell => candle.high >= liq,
        };
        if hit {
            return Some((liq, REASON_LIQUIDATION));
        }
    }

    if let Some(sl) = pos.stop_loss {
        let hit = match pos.side {
            OrderSide::Buy => candle.low <= sl,
            OrderSide::Sell => candle.high >= sl,
        };
        if hit {
            return Some((sl, REASON_STOP_LOSS));
        }
    }

    if let Some(tp) = pos.take_profit {
        let hit = match pos.side {
            OrderSide::Buy => candle.high >= tp,
            OrderSide::Sell => candle.low <= tp,
        };
        if hit {
            return Some((tp, REASON_TAKE_PROFIT));
        }
    }

    None
}

/// Close a position at the given exit price: route the exit leg through the
/// simulator for its fee, record the trade, and return the posted margin
/// plus net P&L to cash. Updates the daily P&L and the loss streak — any
/// non-losing close resets the streak and clears an armed cooldown.
pub fn close_position(
    state: &mut BacktestState,
    sim: &ExecutionSimulator,
    position: OpenPosition,
    exit_price: f64,
    exit_ts: i64,
    exit_reason: &str,
) -> Result<()> {
    let order = Order {
        id: format!("exit_{}", position.id),
        symbol: position.symbol.clone(),
        side: position.side.opposite(),
        order_type: OrderType::Market,
        quantity: position.size,
        price: None,
        stop_price: None,
        leverage: position.leverage,
        timestamp: exit_ts,
    };

    let fill = sim.execute_close(&order, exit_price);
    let pnl = sim.compute_pnl(
        position.entry_price,
        fill.fill_price,
        position.size,
        position.side,
        position.leverage,
        position.entry_fee,
        fill.fee,
    );

    let r_multiple = position.stop_loss.and_then(|sl| {
        let risk = (position.entry_price - sl).abs() * position.size;
        (risk > 0.0).then(|| pnl.net_pnl / risk)
    });

    let entry_time = to_datetime(position.entry_time);
    let exit_time = to_datetime(exit_ts);

    let trade = Trade {
        id: position.id,
        symbol: position.symbol,
        side: position.side.trade_side(),
        size: position.size,
        entry_time,
        entry_price: position.entry_price,
        entry_reason: position.entry_reason,
        exit_time,
        exit_price: fill.fill_price,
        exit_reason: exit_reason.to_string(),
        stop_loss: position.stop_loss,
        take_profit: position.take_profit,
        realized_pnl: pnl.net_pnl,
        realized_pnl_pct: pnl.return_pct,
        commission: position.entry_fee + fill.fee,
        slippage: position.entry_slippage + fill.slippage,
        duration_secs: (exit_time - entry_time).num_milliseconds() as f64 / 1_000.0,
        r_multiple,
    };

    debug!(
        side = ?trade.side,
        exit_price = fill.fill_price,
        net_pnl = pnl.net_pnl,
        reason = exit_reason,
        "position closed"
    );

    state.closed_trades.push(trade);
    state.cash += position.margin_used + pnl.net_pnl;
    state.daily_pnl += pnl.net_pnl;

    if pnl.net_pnl < 0.0 {
        state.loss_streak += 1;
    } else {
        state.loss_streak = 0;
        state.cooldown_until = None;
    }

    Ok(())
}

/// Close every still-open position at the given price (the last base-bar
/// close at the end of a run, or the current close on cancellation).
pub fn close_all(
    state: &mut BacktestState,
    sim: &ExecutionSimulator,
    exit_price: f64,
    exit_ts: i64,
    reason: &str,
) -> Result<()> {
    while !state.open_positions.is_empty() {
        let position = state.open_positions.remove(0);
        close_position(state, sim, position, exit_price, exit_ts, reason)?;
    }
    Ok(())
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}
