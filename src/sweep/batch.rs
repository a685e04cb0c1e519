use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::data::BarProvider;
use crate::engine::config::{apply_overrides, RunConfig};
use crate::engine::runner::{BacktestRunner, ProgressSink};
use crate::engine::types::BacktestMetrics;
use crate::strategies::find_strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Grid,
    Random,
    /// Placeholder: currently sampled like `Random`.
    Bayesian,
}

pub type ParameterSpace = BTreeMap<String, Vec<serde_json::Value>>;

/// Configuration for a parameter sweep over the single-run engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub base: RunConfig,
    pub search_method: SearchMethod,
    pub parameter_space: ParameterSpace,
    pub max_iterations: usize,
    pub n_jobs: usize,
    pub seed: u64,
    pub target_metric: String,
    pub minimize: bool,
}

impl BatchConfig {
    pub fn new(base: RunConfig) -> Self {
        Self {
            base,
            search_method: SearchMethod::Grid,
            parameter_space: BTreeMap::new(),
            max_iterations: 100,
            n_jobs: 1,
            seed: 42,
            target_metric: "expectancy".to_string(),
            minimize: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRunResult {
    pub run_id: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub metrics: Option<BacktestMetrics>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub search_method: SearchMethod,
    pub target_metric: String,
    pub seed: u64,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub best_run: Option<BatchRunResult>,
    pub top_runs: Vec<BatchRunResult>,
    pub duration_seconds: f64,
    /// All results, ranked best first. Excluded from the summary JSON; the
    /// CSV export carries the full table.
    #[serde(skip)]
    pub results: Vec<BatchRunResult>,
}

/// Expands a parameter space into concrete configurations, runs the engine
/// once per point and ranks the outcomes by the target metric. Each run
/// owns fresh state; per-run failures are recorded, never fatal.
pub struct BatchRunner {
    config: BatchConfig,
    provider: Arc<dyn BarProvider>,
    progress: Option<Arc<ProgressSink>>,
    cancel: CancellationToken,
    batch_id: String,
}

impl BatchRunner {
    pub fn new(config: BatchConfig, provider: Arc<dyn BarProvider>) -> Self {
        Self {
            config,
            provider,
            progress: None,
            cancel: CancellationToken::new(),
            batch_id: format!("batch_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_progress(mut self, sink: Arc<ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    fn emit(&self, pct: u8, message: &str) {
        if let Some(sink) = &self.progress {
            sink(pct, message);
        }
    }

    /// Expand the parameter space per the configured search method. An
    /// empty space yields exactly one defaults-only configuration.
    pub fn generate_combinations(&self) -> Vec<BTreeMap<String, serde_json::Value>> {
        let space = &self.config.parameter_space;
        if space.is_empty() {
            return vec![BTreeMap::new()];
        }

        match self.config.search_method {
            SearchMethod::Grid => self.grid_combinations(space),
            // bayesian search is not implemented; seeded random sampling
            // stands in so the config remains usable
            SearchMethod::Random | SearchMethod::Bayesian => self.random_combinations(space),
        }
    }

    fn grid_combinations(&self, space: &ParameterSpace) -> Vec<BTreeMap<String, serde_json::Value>> {
        let keys: Vec<&String> = space.keys().collect();
        let values: Vec<&Vec<serde_json::Value>> = space.values().collect();

        let theoretical: u128 = values.iter().map(|v| v.len() as u128).product();
        let cap = self.config.max_iterations as u128;
        info!(
            params = keys.len(),
            theoretical = theoretical as u64,
            cap = self.config.max_iterations,
            "grid expansion"
        );

        // a full grid this large would not fit the iteration budget anyway;
        // sample it reproducibly instead
        if theoretical > cap.saturating_mul(10) {
            warn!(
                theoretical = theoretical as u64,
                "grid too large, falling back to seeded random sampling"
            );
            return self.random_combinations(space);
        }

        let mut combos = Vec::new();
        let mut odometer = vec![0usize; keys.len()];
        loop {
            combos.push(
                keys.iter()
                    .enumerate()
                    .map(|(j, k)| ((*k).clone(), values[j][odometer[j]].clone()))
                    .collect(),
            );
            if combos.len() >= self.config.max_iterations {
                break;
            }

            let mut pos = keys.len();
            loop {
                if pos == 0 {
                    return combos;
                }
                pos -= 1;
                odometer[pos] += 1;
                if odometer[pos] < values[pos].len() {
                    break;
                }
                odometer[pos] = 0;
            }
        }
        combos
    }

    fn random_combinations(
        &self,
        space: &ParameterSpace,
    ) -> Vec<BTreeMap<String, serde_json::Value>> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        (0..self.config.max_iterations)
            .map(|_| {
                space
                    .iter()
                    .map(|(k, vals)| (k.clone(), vals[rng.random_range(0..vals.len())].clone()))
                    .collect()
            })
            .collect()
    }

    pub async fn run(&self) -> Result<BatchSummary> {
        for (key, values) in &self.config.parameter_space {
            if values.is_empty() {
                bail!("parameter '{key}' has an empty value list");
            }
        }

        let started = Instant::now();
        self.emit(0, "Generiere Parameter-Kombinationen...");
        let combos = self.generate_combinations();
        let total = combos.len();
        info!(batch_id = %self.batch_id, total, "batch starting");

        let mut results = if self.config.n_jobs > 1 {
            self.run_parallel(combos).await
        } else {
            self.run_sequential(combos).await
        };

        self.emit(95, "Erstelle Ranking...");
        rank_results(
            &mut results,
            &self.config.target_metric,
            self.config.minimize,
        );

        let successful_runs = results.iter().filter(|r| r.error.is_none()).count();
        let failed_runs = results.len() - successful_runs;
        let duration_seconds = started.elapsed().as_secs_f64();

        self.emit(100, "Batch abgeschlossen");
        info!(
            batch_id = %self.batch_id,
            successful_runs,
            failed_runs,
            duration_seconds,
            "batch finished"
        );

        Ok(BatchSummary {
            batch_id: self.batch_id.clone(),
            search_method: self.config.search_method,
            target_metric: self.config.target_metric.clone(),
            seed: self.config.seed,
            total_runs: results.len(),
            successful_runs,
            failed_runs,
            best_run: results.first().cloned(),
            top_runs: results.iter().take(10).cloned().collect(),
            duration_seconds,
            results,
        })
    }

    async fn run_sequential(
        &self,
        combos: Vec<BTreeMap<String, serde_json::Value>>,
    ) -> Vec<BatchRunResult> {
        let total = combos.len().max(1);
        let mut results = Vec::with_capacity(total);

        for (i, params) in combos.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(batch_id = %self.batch_id, "batch stopped by user");
                break;
            }
            let pct = 5 + ((i as f64 / total as f64) * 90.0) as u8;
            self.emit(
                pct,
                &format!("Run {}/{total}: {}", i + 1, params_label(&params)),
            );

            let run_id = format!("{}_run_{i:04}", self.batch_id);
            results.push(run_single(self.provider.clone(), &self.config.base, params, run_id).await);
        }
        results
    }

    async fn run_parallel(
        &self,
        combos: Vec<BTreeMap<String, serde_json::Value>>,
    ) -> Vec<BatchRunResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.n_jobs));
        let mut set: JoinSet<(usize, BatchRunResult)> = JoinSet::new();

        for (i, params) in combos.into_iter().enumerate() {
            let provider = self.provider.clone();
            let base = self.config.base.clone();
            let run_id = format!("{}_run_{i:04}", self.batch_id);
            let semaphore = semaphore.clone();
            let cancel = self.cancel.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if cancel.is_cancelled() {
                    return (
                        i,
                        BatchRunResult {
                            run_id,
                            parameters: params,
                            metrics: None,
                            error: Some("cancelled".to_string()),
                        },
                    );
                }
                (i, run_single(provider, &base, params, run_id).await)
            });
        }

        let mut indexed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                Err(e) => warn!(error = %e, "batch worker panicked"),
            }
        }
        // ranking must not depend on completion timing
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, r)| r).collect()
    }
}

async fn run_single(
    provider: Arc<dyn BarProvider>,
    base: &RunConfig,
    params: BTreeMap<String, serde_json::Value>,
    run_id: String,
) -> BatchRunResult {
    let outcome = async {
        let mut cfg = apply_overrides(base, &params)?;
        cfg.run_id = run_id.clone();
        let strategy = find_strategy(&cfg.strategy_preset, &cfg.parameter_overrides)?;
        BacktestRunner::new(cfg, provider, strategy).run().await
    }
    .await;

    match outcome {
        Ok(result) => BatchRunResult {
            run_id,
            parameters: params,
            metrics: Some(result.metrics),
            error: None,
        },
        Err(e) => {
            warn!(run_id, error = %e, "batch run failed");
            BatchRunResult {
                run_id,
                parameters: params,
                metrics: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Pull a named metric out of the record; `None` for unknown names or
/// undefined optional metrics, which rank as worst.
pub fn metric_value(metrics: &BacktestMetrics, name: &str) -> Option<f64> {
    match name {
        "expectancy" => Some(metrics.expectancy),
        "profit_factor" => Some(metrics.profit_factor),
        "win_rate" => Some(metrics.win_rate),
        "total_return_pct" => Some(metrics.total_return_pct),
        "max_drawdown_pct" => Some(metrics.max_drawdown_pct),
        "total_trades" => Some(metrics.total_trades as f64),
        "sharpe_ratio" => metrics.sharpe_ratio,
        "avg_r_multiple" => metrics.avg_r_multiple,
        _ => None,
    }
}

fn rank_results(results: &mut [BatchRunResult], target: &str, minimize: bool) {
    let worst = if minimize {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    };
    let score = |r: &BatchRunResult| {
        r.metrics
            .as_ref()
            .and_then(|m| metric_value(m, target))
            .unwrap_or(worst)
    };

    results.sort_by(|a, b| {
        let (sa, sb) = (score(a), score(b));
        let ord = if minimize {
            sa.total_cmp(&sb)
        } else {
            sb.total_cmp(&sa)
        };
        ord.then_with(|| a.run_id.cmp(&b.run_id))
    });
}

fn params_label(params: &BTreeMap<String, serde_json::Value>) -> String {
    if params.is_empty() {
        return "default".to_string();
    }
    params
        .iter()
        .take(3)
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
