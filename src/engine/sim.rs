use tracing::debug;

use super::config::{ExecutionConfig, SlippageMethod};
use super::types::{Fill, FillStatus, Order, OrderSide, OrderType, PnlBreakdown};

/// Maker/taker fee computation. Rates arrive as percent and are stored as
/// fractions.
#[derive(Debug, Clone, Copy)]
struct FeeModel {
    maker_rate: f64,
    taker_rate: f64,
}

impl FeeModel {
    fn new(maker_pct: f64, taker_pct: f64) -> Self {
        Self {
            maker_rate: maker_pct / 100.0,
            taker_rate: taker_pct / 100.0,
        }
    }

    /// Returns `(fee_absolute, fee_rate_fraction)`.
    fn fee(&self, notional: f64, is_taker: bool) -> (f64, f64) {
        let rate = if is_taker {
            self.taker_rate
        } else {
            self.maker_rate
        };
        (notional * rate, rate)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlippageModel {
    method: SlippageMethod,
    fixed_bps: f64,
    atr_mult: f64,
}

impl SlippageModel {
    /// Returns `(slippage_absolute, slippage_bps)`. The absolute value is
    /// signed: buys pay up, sells receive down.
    fn slippage(&self, price: f64, side: OrderSide, atr: Option<f64>, volume_ratio: f64) -> (f64, f64) {
        let bps = match self.method {
            SlippageMethod::FixedBps => self.fixed_bps,
            SlippageMethod::AtrBased => match atr {
                Some(atr) if atr > 0.0 => (atr * self.atr_mult / price) * 10_000.0,
                _ => self.fixed_bps,
            },
            SlippageMethod::VolumeAdjusted => self.fixed_bps * (2.0 - volume_ratio.min(1.0)),
        };

        let mut abs = price * (bps / 10_000.0);
        if side == OrderSide::Sell {
            abs = -abs;
        }
        (abs, bps)
    }
}

/// Simulates order execution: fees, slippage, margin checks and liquidation
/// pricing. Carries configuration but no market state, so one instance can
/// serve any number of runs; identical inputs produce identical fills.
#[derive(Debug, Clone)]
pub struct ExecutionSimulator {
    fees: FeeModel,
    slippage: SlippageModel,
    max_leverage: u32,
    liquidation_buffer_pct: f64,
    assume_taker: bool,
}

impl ExecutionSimulator {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            fees: FeeModel::new(config.fee_rate_maker, config.fee_rate_taker),
            slippage: SlippageModel {
                method: config.slippage_method,
                fixed_bps: config.slippage_bps,
                atr_mult: config.slippage_atr_mult,
            },
            max_leverage: config.max_leverage,
            liquidation_buffer_pct: config.liquidation_buffer_pct,
            assume_taker: config.assume_taker,
        }
    }

    /// Execute an entry order against the given market price.
    ///
    /// Limit and take-profit orders fill at `order.price` whenever one is
    /// set, without checking whether the bar traded through that level — a
    /// known simplification. Stop-market orders fill at `order.stop_price`.
    /// When `available_margin` is given and the required margin exceeds it,
    /// the order is rejected with no side effects.
    pub fn execute(
        &self,
        order: &Order,
        market_price: f64,
        atr: Option<f64>,
        available_margin: Option<f64>,
        volume_ratio: f64,
    ) -> Fill {
        let base_price = match (order.order_type, order.price, order.stop_price) {
            (OrderType::Limit | OrderType::TakeProfit, Some(p), _) => p,
            (OrderType::StopMarket, _, Some(p)) => p,
            _ => market_price,
        };

        let (slippage_abs, slippage_bps) =
            self.slippage
                .slippage(base_price, order.side, atr, volume_ratio);
        let fill_price = base_price + slippage_abs;
        let notional = fill_price * order.quantity;

        let effective_leverage = order.leverage.min(self.max_leverage);
        let margin_required = notional / f64::from(effective_leverage);

        if let Some(available) = available_margin {
            if margin_required > available {
                return Fill {
                    order_id: order.id.clone(),
                    status: FillStatus::Rejected,
                    fill_price: 0.0,
                    fill_quantity: 0.0,
                    fee: 0.0,
                    fee_rate: 0.0,
                    slippage: 0.0,
                    slippage_bps: 0.0,
                    notional_value: 0.0,
                    margin_used: 0.0,
                    liquidation_price: None,
                    side: order.side,
                    leverage: effective_leverage,
                    timestamp: order.timestamp,
                    reason: format!(
                        "Insufficient margin: required {margin_required:.2}, available {available:.2}"
                    ),
                };
            }
        }

        let is_taker = order.order_type == OrderType::Market || self.assume_taker;
        let (fee, fee_rate) = self.fees.fee(notional, is_taker);

        let liquidation_price =
            self.liquidation_price(fill_price, order.side, effective_leverage);

        debug!(
            side = ?order.side,
            qty = order.quantity,
            fill_price,
            slippage_bps,
            fee,
            "order executed"
        );

        Fill {
            order_id: order.id.clone(),
            status: FillStatus::Filled,
            fill_price,
            fill_quantity: order.quantity,
            fee,
            fee_rate: fee_rate * 100.0,
            slippage: slippage_abs.abs(),
            slippage_bps,
            notional_value: notional,
            margin_used: margin_required,
            liquidation_price: Some(liquidation_price),
            side: order.side,
            leverage: effective_leverage,
            timestamp: order.timestamp,
            reason: String::new(),
        }
    }

    /// Fill an exit leg exactly at the trigger price.
    ///
    /// Stop, take-profit and end-of-run closes fill at the triggered level
    /// with no slippage (a documented simplification that under-models
    /// stress); the exit fee is still charged on the exit notional.
    pub fn execute_close(&self, order: &Order, exit_price: f64) -> Fill {
        let notional = exit_price * order.quantity;
        let is_taker = order.order_type == OrderType::Market || self.assume_taker;
        let (fee, fee_rate) = self.fees.fee(notional, is_taker);

        Fill {
            order_id: order.id.clone(),
            status: FillStatus::Filled,
            fill_price: exit_price,
            fill_quantity: order.quantity,
            fee,
            fee_rate: fee_rate * 100.0,
            slippage: 0.0,
            slippage_bps: 0.0,
            notional_value: notional,
            margin_used: 0.0,
            liquidation_price: None,
            side: order.side,
            leverage: order.leverage,
            timestamp: order.timestamp,
            reason: String::new(),
        }
    }

    /// Price at which a position's margin (minus the safety buffer) is
    /// consumed. Leverage 1 returns the 0.0 sentinel: never liquidates.
    pub fn liquidation_price(&self, entry_price: f64, side: OrderSide, leverage: u32) -> f64 {
        if leverage <= 1 {
            return 0.0;
        }

        let buffer = self.liquidation_buffer_pct / 100.0;
        let margin_ratio = 1.0 / f64::from(leverage);

        match side {
            OrderSide::Buy => entry_price * (1.0 - margin_ratio * (1.0 - buffer)),
            OrderSide::Sell => entry_price * (1.0 + margin_ratio * (1.0 - buffer)),
        }
    }

    /// Returns `(is_liquidated, unrealized_pnl_pct)` for a hypothetical
    /// position at the given current price.
    pub fn check_liquidation(
        &self,
        side: OrderSide,
        entry_price: f64,
        current_price: f64,
        leverage: u32,
    ) -> (bool, f64) {
        if leverage <= 1 {
            return (false, 0.0);
        }

        let liq = self.liquidation_price(entry_price, side, leverage);
        let lev = f64::from(leverage);

        match side {
            OrderSide::Buy => (
                current_price <= liq,
                (current_price - entry_price) / entry_price * 100.0 * lev,
            ),
            OrderSide::Sell => (
                current_price >= liq,
                (entry_price - current_price) / entry_price * 100.0 * lev,
            ),
        }
    }

    /// Full P&L breakdown for an entry/exit pair. Return percent is relative
    /// to the margin posted, not the notional.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_pnl(
        &self,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        side: OrderSide,
        leverage: u32,
        entry_fee: f64,
        exit_fee: f64,
    ) -> PnlBreakdown {
        let raw_pnl = match side {
            OrderSide::Buy => (exit_price - entry_price) * quantity,
            OrderSide::Sell => (entry_price - exit_price) * quantity,
        };

        let lev = f64::from(leverage);
        let leveraged_pnl = raw_pnl * lev;
        let total_fees = entry_fee + exit_fee;
        let net_pnl = leveraged_pnl - total_fees;

        let entry_notional = entry_price * quantity;
        let exit_notional = exit_price * quantity;
        let margin_used = entry_notional / lev;
        let return_pct = if margin_used > 0.0 {
            net_pnl / margin_used * 100.0
        } else {
            0.0
        };

        PnlBreakdown {
            raw_pnl,
            leveraged_pnl,
            total_fees,
            net_pnl,
            return_pct,
            entry_notional,
            exit_notional,
            margin_used,
        }
    }
}
