use chrono::NaiveDate;

use super::types::{EquityPoint, OpenPosition, Trade};

/// Mutable state of one backtest run. Initialized per run; every component
/// that needs to change it receives it by mutable reference.
#[derive(Debug, Clone)]
pub struct BacktestState {
    pub cash: f64,
    pub equity: f64,
    pub open_positions: Vec<OpenPosition>,
    pub closed_trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub daily_pnl: f64,
    pub trades_today: u32,
    pub loss_streak: u32,
    /// Millisecond timestamp until which the loss-streak cooldown blocks
    /// new entries.
    pub cooldown_until: Option<i64>,
    /// UTC calendar date of the last daily reset.
    pub last_reset_date: Option<NaiveDate>,
    /// Sequence for deterministic position/trade ids.
    pub next_position_seq: u64,
}

impl BacktestState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            equity: initial_capital,
            open_positions: Vec::new(),
            closed_trades: Vec::new(),
            equity_curve: Vec::new(),
            daily_pnl: 0.0,
            trades_today: 0,
            loss_streak: 0,
            cooldown_until: None,
            last_reset_date: None,
            next_position_seq: 1,
        }
    }

    pub fn next_position_id(&mut self) -> String {
        let id = format!("pos_{}", self.next_position_seq);
        self.next_position_seq += 1;
        id
    }

    /// Equity definition: cash plus, per open position, its posted margin
    /// and current unrealized P&L.
    pub fn current_equity(&self) -> f64 {
        self.cash
            + self
                .open_positions
                .iter()
                .map(|p| p.margin_used + p.unrealized_pnl)
                .sum::<f64>()
    }

    /// Zero the daily accumulators when the bar's UTC calendar date moves
    /// past the last reset date.
    pub fn check_daily_reset(&mut self, date: NaiveDate) {
        match self.last_reset_date {
            None => self.last_reset_date = Some(date),
            Some(last) if date > last => {
                tracing::debug!(%date, daily_pnl = self.daily_pnl, "daily reset");
                self.daily_pnl = 0.0;
                self.trades_today = 0;
                self.last_reset_date = Some(date);
            }
            Some(_) => {}
        }
    }
}
