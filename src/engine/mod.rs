pub mod config;
pub mod metrics;
pub mod positions;
pub mod resampler;
pub mod runner;
pub mod signals;
pub mod sim;
pub mod source;
pub mod state;
pub mod types;

pub use config::{ExecutionConfig, RiskConfig, RunConfig, SlippageMethod, Timeframe};
pub use resampler::{MtfResampler, MtfSnapshot};
pub use runner::{BacktestRunner, ProgressSink};
pub use sim::ExecutionSimulator;
pub use source::ReplaySource;
pub use state::BacktestState;
pub use types::{
    BacktestMetrics, Bar, Candle, EquityPoint, Fill, FillStatus, OpenPosition, Order, OrderSide,
    OrderType, PnlBreakdown, RunResult, Signal, Trade, TradeSide,
};
