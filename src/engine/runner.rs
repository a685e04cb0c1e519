use std::sync::Arc;

use anyhow::{anyhow, Result};
use garde::Validate;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::data::BarProvider;
use crate::strategies::Strategy;

use super::config::RunConfig;
use super::metrics::calculate_metrics;
use super::positions::{self, REASON_END_OF_BACKTEST};
use super::resampler::{MtfResampler, DEFAULT_HISTORY_BARS_PER_TF};
use super::signals;
use super::sim::ExecutionSimulator;
use super::source::ReplaySource;
use super::state::BacktestState;
use super::types::{Bar, Candle, EquityPoint, RunResult};

/// Progress sink: percentage 0–100 plus a status message.
pub type ProgressSink = dyn Fn(u8, &str) + Send + Sync;

/// Emit a progress tuple every this many bars.
const PROGRESS_EVERY: usize = 100;
/// Yield to the scheduler every this many bars so the host stays responsive.
const YIELD_EVERY: usize = 200;

const MS_PER_HOUR: i64 = 3_600_000;

/// Drives one backtest run: replays the base series bar by bar, manages
/// positions, consults the strategy when flat, and assembles the result.
///
/// The engine is single-threaded within a run; the only suspension points
/// are the initial data load and periodic cooperative yields.
pub struct BacktestRunner {
    config: RunConfig,
    provider: Arc<dyn BarProvider>,
    strategy: Box<dyn Strategy>,
    progress: Option<Arc<ProgressSink>>,
    cancel: CancellationToken,
}

impl BacktestRunner {
    pub fn new(
        config: RunConfig,
        provider: Arc<dyn BarProvider>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        Self {
            config,
            provider,
            strategy,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, sink: Arc<ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Token for requesting a clean stop from another task. The loop exits
    /// after the current bar; end-of-run closure still happens and a
    /// partial result is returned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, pct: u8, message: &str) {
        if let Some(sink) = &self.progress {
            sink(pct, message);
        }
    }

    pub async fn run(mut self) -> Result<RunResult> {
        self.config
            .validate()
            .map_err(|e| anyhow!("invalid run configuration: {e}"))?;

        let run_id = self.config.run_id_or_new();
        let base_tf = self.config.base_tf()?;
        info!(
            run_id,
            symbol = %self.config.symbol,
            start = %self.config.start_date,
            end = %self.config.end_date,
            "backtest starting"
        );

        self.emit(0, "Initialisiere...");
        let mut state = BacktestState::new(self.config.initial_capital);
        let sim = ExecutionSimulator::new(&self.config.execution);

        self.emit(10, "Lade Daten...");
        let source = ReplaySource::load(
            self.provider.as_ref(),
            &self.config.symbol,
            self.config.start_date,
            self.config.end_date,
            self.config.lookback,
        )
        .await?;

        if source.bar_count() == 0 {
            warn!(run_id, "no bars in range, returning empty result");
            self.emit(100, "Backtest abgeschlossen");
            return Ok(self.build_result(&state, &source));
        }

        let mut resampler =
            MtfResampler::new(&self.config.mtf_timeframes, DEFAULT_HISTORY_BARS_PER_TF)?;
        resampler.prepare(source.candles(), base_tf);

        let bar_total = source.replay_len().max(1);
        self.emit(20, &format!("Verarbeite {bar_total} Bars..."));

        let mut processed = 0usize;
        let mut cancelled = false;
        let mut last_close: Option<Candle> = None;

        for (_, candle, history) in source.replay_iter() {
            if self.cancel.is_cancelled() {
                info!(run_id, processed, "backtest stopped by user");
                cancelled = true;
                break;
            }

            state.check_daily_reset(candle.datetime().date_naive());
            resampler.advance(candle.timestamp);

            positions::manage_bar(&mut state, &sim, &candle)?;

            if state.open_positions.is_empty()
                && signals::risk_gate_allows(&mut state, &self.config, candle.timestamp)
            {
                let mtf = resampler.snapshot();
                match self.strategy.on_bar(&candle, history, &mtf) {
                    Ok(Some(signal)) => {
                        signals::execute_signal(
                            &mut state,
                            &sim,
                            &self.config,
                            &signal,
                            &candle,
                            history,
                        )?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // transient strategy failures must not abort a long run
                        warn!(run_id, error = %e, ts = candle.timestamp, "signal callback failed");
                    }
                }
            }

            state.equity = state.current_equity();
            state.equity_curve.push(EquityPoint {
                time: candle.datetime(),
                equity: state.equity,
            });

            last_close = Some(candle);
            processed += 1;
            if processed % PROGRESS_EVERY == 0 {
                let pct = 20 + ((processed as f64 / bar_total as f64) * 70.0) as u8;
                self.emit(pct.min(90), &format!("{processed}/{bar_total} Bars"));
            }
            if processed % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.emit(95, "Schließe offene Positionen...");
        // cancellation closes at the last processed bar, natural termination
        // at the final bar of the series
        let final_bar = if cancelled {
            last_close
        } else {
            source.last().copied()
        };
        if let Some(bar) = final_bar {
            positions::close_all(&mut state, &sim, bar.close, bar.timestamp, REASON_END_OF_BACKTEST)?;
        }
        state.equity = state.current_equity();

        self.emit(98, "Berechne Metriken...");
        let result = self.build_result(&state, &source);

        self.emit(100, "Backtest abgeschlossen");
        info!(
            run_id,
            trades = result.metrics.total_trades,
            return_pct = result.metrics.total_return_pct,
            "backtest finished"
        );

        Ok(result)
    }

    fn build_result(&self, state: &BacktestState, source: &ReplaySource) -> RunResult {
        let metrics = calculate_metrics(
            &state.closed_trades,
            &state.equity_curve,
            self.config.initial_capital,
            state.equity,
        );

        RunResult {
            symbol: self.config.symbol.clone(),
            timeframe: self.config.base_timeframe.clone(),
            mode: "backtest".to_string(),
            start: self.config.start_date,
            end: self.config.end_date,
            initial_capital: self.config.initial_capital,
            final_capital: state.equity,
            bars: sample_hourly(source.candles()),
            trades: state.closed_trades.clone(),
            equity_curve: state.equity_curve.clone(),
            metrics,
            strategy_name: self.config.strategy_preset.clone(),
            strategy_params: self.config.parameter_overrides.clone(),
        }
    }
}

/// Downsample the base series to the first bar of each hour for reporting.
fn sample_hourly(candles: &[Candle]) -> Vec<Bar> {
    let mut bars = Vec::new();
    let mut last_hour = i64::MIN;
    for c in candles {
        let hour = c.timestamp.div_euclid(MS_PER_HOUR);
        if hour != last_hour {
            bars.push(Bar::from_candle(c));
            last_hour = hour;
        }
    }
    bars
}
