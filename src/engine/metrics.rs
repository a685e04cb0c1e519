use super::types::{BacktestMetrics, EquityPoint, Trade};

/// Equity points per day assumed by the Sharpe annualization. The factor
/// encodes a 15-minute sampling convention; replace it if the equity curve
/// is sampled at a different cadence.
pub const EQUITY_POINTS_PER_DAY: f64 = 96.0;

/// Minimum equity-curve length for a meaningful Sharpe ratio.
const MIN_POINTS_FOR_SHARPE: usize = 30;

const SECS_PER_DAY: f64 = 86_400.0;

/// Aggregate performance metrics from the closed trades and the equity
/// curve of a finished run.
pub fn calculate_metrics(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    initial_capital: f64,
    final_equity: f64,
) -> BacktestMetrics {
    if trades.is_empty() {
        return BacktestMetrics::default();
    }

    let total_trades = trades.len();
    let winners: Vec<&Trade> = trades.iter().filter(|t| t.realized_pnl > 0.0).collect();
    let losers: Vec<&Trade> = trades.iter().filter(|t| t.realized_pnl <= 0.0).collect();

    let winning_trades = winners.len();
    let losing_trades = losers.len();
    let win_rate = winning_trades as f64 / total_trades as f64;
    let loss_rate = losing_trades as f64 / total_trades as f64;

    let gross_profit: f64 = winners.iter().map(|t| t.realized_pnl).sum();
    let gross_loss: f64 = losers.iter().map(|t| t.realized_pnl).sum::<f64>().abs();

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = if winning_trades > 0 {
        gross_profit / winning_trades as f64
    } else {
        0.0
    };
    let avg_loss = if losing_trades > 0 {
        -gross_loss / losing_trades as f64
    } else {
        0.0
    };
    let expectancy = win_rate * avg_win + loss_rate * avg_loss;

    let r_multiples: Vec<f64> = trades.iter().filter_map(|t| t.r_multiple).collect();
    let (avg_r, best_r, worst_r) = if r_multiples.is_empty() {
        (None, None, None)
    } else {
        (
            Some(r_multiples.iter().sum::<f64>() / r_multiples.len() as f64),
            r_multiples.iter().copied().reduce(f64::max),
            r_multiples.iter().copied().reduce(f64::min),
        )
    };

    let (max_drawdown_pct, max_drawdown_duration_days) = drawdown(equity_curve);
    let (max_consecutive_wins, max_consecutive_losses) = streaks(trades);

    let total_return_pct = if initial_capital > 0.0 {
        (final_equity / initial_capital - 1.0) * 100.0
    } else {
        0.0
    };

    let avg_trade_duration_minutes =
        Some(trades.iter().map(|t| t.duration_secs).sum::<f64>() / total_trades as f64 / 60.0);

    BacktestMetrics {
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        profit_factor,
        expectancy,
        max_drawdown_pct,
        max_drawdown_duration_days,
        sharpe_ratio: sharpe(equity_curve),
        avg_r_multiple: avg_r,
        best_r_multiple: best_r,
        worst_r_multiple: worst_r,
        avg_win,
        avg_loss,
        largest_win: winners
            .iter()
            .map(|t| t.realized_pnl)
            .fold(0.0, f64::max),
        largest_loss: losers.iter().map(|t| t.realized_pnl).fold(0.0, f64::min),
        total_return_pct,
        avg_trade_duration_minutes,
        max_consecutive_wins,
        max_consecutive_losses,
    }
}

/// Max drawdown in percent off the running peak, and the longest span in
/// days between a peak and its recovery (or the end of the series when the
/// drawdown never recovers).
fn drawdown(curve: &[EquityPoint]) -> (f64, Option<f64>) {
    if curve.len() < 2 {
        return (0.0, None);
    }

    let mut peak = curve[0].equity;
    let mut peak_time = curve[0].time;
    let mut in_drawdown = false;
    let mut max_dd = 0.0;
    let mut max_duration_days = 0.0_f64;

    for point in curve {
        if point.equity > peak {
            if in_drawdown {
                let days = (point.time - peak_time).num_seconds() as f64 / SECS_PER_DAY;
                max_duration_days = max_duration_days.max(days);
                in_drawdown = false;
            }
            peak = point.equity;
            peak_time = point.time;
        } else if point.equity < peak {
            in_drawdown = true;
            let dd = (peak - point.equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    if in_drawdown {
        let last = curve.last().expect("len checked above");
        let days = (last.time - peak_time).num_seconds() as f64 / SECS_PER_DAY;
        max_duration_days = max_duration_days.max(days);
    }

    let duration = (max_duration_days > 0.0).then_some(max_duration_days);
    (max_dd, duration)
}

/// Longest winning and losing streaks across the trade sequence.
fn streaks(trades: &[Trade]) -> (usize, usize) {
    let mut max_wins = 0;
    let mut max_losses = 0;
    let mut wins = 0;
    let mut losses = 0;

    for trade in trades {
        if trade.realized_pnl > 0.0 {
            wins += 1;
            losses = 0;
            max_wins = max_wins.max(wins);
        } else {
            losses += 1;
            wins = 0;
            max_losses = max_losses.max(losses);
        }
    }

    (max_wins, max_losses)
}

/// Annualized Sharpe over per-point equity returns. Undefined for fewer
/// than 30 points or a flat curve.
fn sharpe(curve: &[EquityPoint]) -> Option<f64> {
    if curve.len() < MIN_POINTS_FOR_SHARPE {
        return None;
    }

    let returns: Vec<f64> = curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return None;
    }

    Some(mean / std * (EQUITY_POINTS_PER_DAY * 365.0).sqrt())
}
