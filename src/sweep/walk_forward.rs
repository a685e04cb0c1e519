use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::data::BarProvider;
use crate::engine::config::{apply_overrides, RunConfig};
use crate::engine::runner::{BacktestRunner, ProgressSink};
use crate::engine::types::BacktestMetrics;
use crate::strategies::find_strategy;

use super::batch::{metric_value, BatchConfig, BatchRunner};

/// Configuration for rolling out-of-sample validation: optimize on a train
/// window, evaluate on the following test window, step forward, repeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub base: RunConfig,
    pub batch: BatchConfig,
    pub train_window_days: i64,
    pub test_window_days: i64,
    pub step_size_days: i64,
    pub min_folds: usize,
    pub reoptimize_each_fold: bool,
}

impl WalkForwardConfig {
    pub fn new(base: RunConfig, batch: BatchConfig) -> Self {
        Self {
            base,
            batch,
            train_window_days: 90,
            test_window_days: 30,
            step_size_days: 30,
            min_folds: 4,
            reoptimize_each_fold: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FoldWindow {
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoldResult {
    pub fold_index: usize,
    pub window: FoldWindow,
    pub best_params: BTreeMap<String, serde_json::Value>,
    pub train_metrics: Option<BacktestMetrics>,
    /// Out-of-sample metrics from the test window.
    pub test_metrics: Option<BacktestMetrics>,
    pub optimization_runs: usize,
    pub error: Option<String>,
}

impl FoldResult {
    pub fn is_successful(&self) -> bool {
        self.error.is_none() && self.test_metrics.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardSummary {
    pub wf_id: String,
    pub total_folds: usize,
    pub successful_folds: usize,
    pub folds: Vec<FoldResult>,
    /// Means of the out-of-sample metrics across successful folds.
    pub aggregated_metrics: BTreeMap<String, f64>,
    /// Dispersion measures across folds; low values mean the edge holds up
    /// out of sample.
    pub stability_metrics: BTreeMap<String, f64>,
    pub duration_seconds: f64,
}

/// Partitions the date range into rolling train/test folds and, per fold,
/// optimizes on the train window (or reuses the base overrides) before
/// scoring the winner once on the unseen test window.
pub struct WalkForwardRunner {
    config: WalkForwardConfig,
    provider: Arc<dyn BarProvider>,
    progress: Option<Arc<ProgressSink>>,
    cancel: CancellationToken,
    wf_id: String,
}

impl WalkForwardRunner {
    pub fn new(config: WalkForwardConfig, provider: Arc<dyn BarProvider>) -> Self {
        Self {
            config,
            provider,
            progress: None,
            cancel: CancellationToken::new(),
            wf_id: format!("wf_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_progress(mut self, sink: Arc<ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn wf_id(&self) -> &str {
        &self.wf_id
    }

    fn emit(&self, pct: u8, message: &str) {
        if let Some(sink) = &self.progress {
            sink(pct, message);
        }
    }

    /// Rolling fold windows over the base config's date range.
    pub fn calculate_folds(&self) -> Vec<FoldWindow> {
        let train = Duration::days(self.config.train_window_days);
        let test = Duration::days(self.config.test_window_days);
        let step = Duration::days(self.config.step_size_days);

        let mut folds = Vec::new();
        let mut cursor = self.config.base.start_date;
        loop {
            let train_end = cursor + train;
            let test_end = train_end + test;
            if test_end > self.config.base.end_date {
                break;
            }
            folds.push(FoldWindow {
                train_start: cursor,
                train_end,
                test_start: train_end,
                test_end,
            });
            cursor += step;
        }
        folds
    }

    pub async fn run(&self) -> Result<WalkForwardSummary> {
        if self.config.train_window_days <= 0
            || self.config.test_window_days <= 0
            || self.config.step_size_days <= 0
        {
            bail!("walk-forward windows must be positive");
        }

        let started = Instant::now();
        self.emit(0, "Berechne Folds...");
        let windows = self.calculate_folds();
        let total_folds = windows.len();

        if total_folds < self.config.min_folds {
            bail!(
                "date range yields {total_folds} folds, below the minimum of {}",
                self.config.min_folds
            );
        }
        info!(wf_id = %self.wf_id, total_folds, "walk-forward starting");

        let mut folds = Vec::with_capacity(total_folds);
        for (i, window) in windows.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(wf_id = %self.wf_id, "walk-forward stopped by user");
                break;
            }
            let pct = 5 + ((i as f64 / total_folds as f64) * 90.0) as u8;
            self.emit(
                pct,
                &format!(
                    "Fold {}/{total_folds}: Train {} - {}",
                    i + 1,
                    window.train_start.date_naive(),
                    window.train_end.date_naive()
                ),
            );

            folds.push(self.run_fold(i, window).await);
        }

        self.emit(95, "Berechne aggregierte Metriken...");
        let aggregated_metrics = aggregate(&folds);
        let stability_metrics = stability(&folds);
        let successful_folds = folds.iter().filter(|f| f.is_successful()).count();
        let duration_seconds = started.elapsed().as_secs_f64();

        self.emit(100, "Walk-Forward abgeschlossen");
        info!(
            wf_id = %self.wf_id,
            successful_folds,
            total_folds,
            duration_seconds,
            "walk-forward finished"
        );

        Ok(WalkForwardSummary {
            wf_id: self.wf_id.clone(),
            total_folds,
            successful_folds,
            folds,
            aggregated_metrics,
            stability_metrics,
            duration_seconds,
        })
    }

    async fn run_fold(&self, fold_index: usize, window: FoldWindow) -> FoldResult {
        match self.try_run_fold(fold_index, window).await {
            Ok(fold) => fold,
            Err(e) => {
                warn!(wf_id = %self.wf_id, fold_index, error = %e, "fold failed");
                FoldResult {
                    fold_index,
                    window,
                    best_params: BTreeMap::new(),
                    train_metrics: None,
                    test_metrics: None,
                    optimization_runs: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_run_fold(&self, fold_index: usize, window: FoldWindow) -> Result<FoldResult> {
        let mut best_params = self.config.base.parameter_overrides.clone();
        let mut train_metrics = None;
        let mut optimization_runs = 0;

        if self.config.reoptimize_each_fold {
            let mut batch_config = self.config.batch.clone();
            batch_config.base = self.config.base.clone();
            batch_config.base.start_date = window.train_start;
            batch_config.base.end_date = window.train_end;

            let batch = BatchRunner::new(batch_config, self.provider.clone());
            let summary = batch.run().await?;
            optimization_runs = summary.total_runs;

            match summary.best_run.filter(|r| r.metrics.is_some()) {
                Some(best) => {
                    best_params = best.parameters;
                    train_metrics = best.metrics;
                }
                None => {
                    warn!(
                        wf_id = %self.wf_id,
                        fold_index,
                        "no successful optimization run, using defaults"
                    );
                    best_params = BTreeMap::new();
                }
            }
        }

        let mut test_config = apply_overrides(&self.config.base, &best_params)?;
        test_config.start_date = window.test_start;
        test_config.end_date = window.test_end;
        test_config.run_id = format!("{}_fold{fold_index}_test", self.wf_id);

        let strategy = find_strategy(
            &test_config.strategy_preset,
            &test_config.parameter_overrides,
        )?;
        let test_result = BacktestRunner::new(test_config, self.provider.clone(), strategy)
            .run()
            .await?;

        Ok(FoldResult {
            fold_index,
            window,
            best_params,
            train_metrics,
            test_metrics: Some(test_result.metrics),
            optimization_runs,
            error: None,
        })
    }
}

const AGGREGATED_KEYS: [&str; 6] = [
    "expectancy",
    "profit_factor",
    "win_rate",
    "total_return_pct",
    "max_drawdown_pct",
    "total_trades",
];

/// Mean of each out-of-sample metric across successful folds; infinite
/// values (profit factor without losses) are excluded from their mean.
fn aggregate(folds: &[FoldResult]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for key in AGGREGATED_KEYS {
        let values: Vec<f64> = folds
            .iter()
            .filter_map(|f| f.test_metrics.as_ref())
            .filter_map(|m| metric_value(m, key))
            .filter(|v| v.is_finite())
            .collect();
        if !values.is_empty() {
            out.insert(
                key.to_string(),
                values.iter().sum::<f64>() / values.len() as f64,
            );
        }
    }
    out
}

/// Coefficient of variation of out-of-sample expectancy plus the standard
/// deviation of the win rate across folds.
fn stability(folds: &[FoldResult]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();

    let expectancies: Vec<f64> = folds
        .iter()
        .filter_map(|f| f.test_metrics.as_ref())
        .map(|m| m.expectancy)
        .collect();
    if expectancies.len() >= 2 {
        let (mean, std) = mean_std(&expectancies);
        let cv = if mean.abs() > f64::EPSILON {
            std / mean.abs()
        } else {
            0.0
        };
        out.insert("expectancy_cv".to_string(), cv);
    }

    let win_rates: Vec<f64> = folds
        .iter()
        .filter_map(|f| f.test_metrics.as_ref())
        .map(|m| m.win_rate)
        .collect();
    if win_rates.len() >= 2 {
        let (_, std) = mean_std(&win_rates);
        out.insert("win_rate_std".to_string(), std);
    }

    out
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryBars;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn wf_config(start: DateTime<Utc>, end: DateTime<Utc>) -> WalkForwardConfig {
        let base = RunConfig::new("BTCUSDT", start, end);
        let batch = BatchConfig::new(base.clone());
        WalkForwardConfig::new(base, batch)
    }

    fn provider() -> Arc<MemoryBars> {
        Arc::new(MemoryBars::new(vec![]))
    }

    #[test]
    fn twelve_months_yields_nine_folds() {
        let config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        let runner = WalkForwardRunner::new(config, provider());
        let folds = runner.calculate_folds();

        // first test window ends at day 120, rolling by 30 up to day 365
        assert_eq!(folds.len(), 9);
        let first = &folds[0];
        assert_eq!(first.train_start, utc(2023, 1, 1));
        assert_eq!(first.train_end, utc(2023, 4, 1));
        assert_eq!(first.test_start, utc(2023, 4, 1));
        assert_eq!(first.test_end, utc(2023, 5, 1));
    }

    #[test]
    fn folds_roll_by_step_size() {
        let config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        let runner = WalkForwardRunner::new(config, provider());
        let folds = runner.calculate_folds();
        for w in folds.windows(2) {
            assert_eq!(w[1].train_start - w[0].train_start, Duration::days(30));
        }
        // test follows train with no gap
        for f in &folds {
            assert_eq!(f.test_start, f.train_end);
        }
    }

    #[test]
    fn last_fold_stays_inside_range() {
        let config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        let runner = WalkForwardRunner::new(config, provider());
        let folds = runner.calculate_folds();
        assert!(folds.last().unwrap().test_end <= utc(2024, 1, 1));
    }

    #[tokio::test]
    async fn too_few_folds_is_an_input_error() {
        // 5 months supports only 2 folds; min_folds defaults to 4
        let config = wf_config(utc(2023, 1, 1), utc(2023, 6, 1));
        let runner = WalkForwardRunner::new(config, provider());
        let err = runner.run().await.unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[tokio::test]
    async fn non_positive_windows_rejected() {
        let mut config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        config.step_size_days = 0;
        let runner = WalkForwardRunner::new(config, provider());
        assert!(runner.run().await.is_err());
    }

    #[tokio::test]
    async fn folds_run_with_empty_data_as_empty_results() {
        let mut config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        config.reoptimize_each_fold = false;
        let runner = WalkForwardRunner::new(config, provider());
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.total_folds, 9);
        assert_eq!(summary.successful_folds, 9);
        for fold in &summary.folds {
            assert_eq!(fold.optimization_runs, 0);
            assert_eq!(fold.test_metrics.as_ref().unwrap().total_trades, 0);
        }
    }

    #[tokio::test]
    async fn reoptimization_records_train_runs() {
        let mut config = wf_config(utc(2023, 1, 1), utc(2024, 1, 1));
        config.batch.parameter_space.insert(
            "risk_per_trade_pct".to_string(),
            vec![serde_json::json!(0.5), serde_json::json!(1.0)],
        );
        let runner = WalkForwardRunner::new(config, provider());
        let summary = runner.run().await.unwrap();

        for fold in &summary.folds {
            assert_eq!(fold.optimization_runs, 2);
            assert!(fold.best_params.contains_key("risk_per_trade_pct"));
        }
    }

    #[test]
    fn aggregation_means_out_of_sample_metrics() {
        let window = FoldWindow {
            train_start: utc(2023, 1, 1),
            train_end: utc(2023, 4, 1),
            test_start: utc(2023, 4, 1),
            test_end: utc(2023, 5, 1),
        };
        let fold = |expectancy: f64, win_rate: f64| FoldResult {
            fold_index: 0,
            window,
            best_params: BTreeMap::new(),
            train_metrics: None,
            test_metrics: Some(BacktestMetrics {
                expectancy,
                win_rate,
                total_trades: 10,
                ..BacktestMetrics::default()
            }),
            optimization_runs: 0,
            error: None,
        };

        let folds = vec![fold(10.0, 0.5), fold(20.0, 0.7)];
        let agg = aggregate(&folds);
        assert!((agg["expectancy"] - 15.0).abs() < 1e-10);
        assert!((agg["win_rate"] - 0.6).abs() < 1e-10);
        assert!((agg["total_trades"] - 10.0).abs() < 1e-10);

        let stab = stability(&folds);
        // mean 15, std 5 → cv = 1/3
        assert!((stab["expectancy_cv"] - 5.0 / 15.0).abs() < 1e-10);
        assert!((stab["win_rate_std"] - 0.1).abs() < 1e-10);
    }

    #[test]
    fn stability_cv_zero_for_zero_mean() {
        let window = FoldWindow {
            train_start: utc(2023, 1, 1),
            train_end: utc(2023, 4, 1),
            test_start: utc(2023, 4, 1),
            test_end: utc(2023, 5, 1),
        };
        let fold = |expectancy: f64| FoldResult {
            fold_index: 0,
            window,
            best_params: BTreeMap::new(),
            train_metrics: None,
            test_metrics: Some(BacktestMetrics {
                expectancy,
                ..BacktestMetrics::default()
            }),
            optimization_runs: 0,
            error: None,
        };
        let stab = stability(&[fold(5.0), fold(-5.0)]);
        assert!((stab["expectancy_cv"] - 0.0).abs() < f64::EPSILON);
    }
}
