use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::batch::{BatchRunResult, BatchSummary};
use super::walk_forward::WalkForwardSummary;

/// Number of ranked rows written to the results CSV by default.
const CSV_TOP_N: usize = 20;
/// Parameter sets included in the top-params JSON.
const TOP_PARAMS_N: usize = 5;

/// Write a batch run to `<batch_id>_summary.json`, `<batch_id>_results.csv`
/// and `<batch_id>_top_params.json` under `output_dir`. Returns the paths
/// keyed by artifact name.
pub fn export_batch(
    summary: &BatchSummary,
    output_dir: &Path,
    export_all_runs: bool,
) -> Result<BTreeMap<String, PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut exports = BTreeMap::new();

    let summary_path = output_dir.join(format!("{}_summary.json", summary.batch_id));
    write_json(&summary_path, summary)?;
    exports.insert("summary".to_string(), summary_path);

    let results_path = output_dir.join(format!("{}_results.csv", summary.batch_id));
    let rows = if export_all_runs {
        &summary.results[..]
    } else {
        &summary.results[..summary.results.len().min(CSV_TOP_N)]
    };
    write_results_csv(&results_path, rows)?;
    exports.insert("results".to_string(), results_path);

    let top_path = output_dir.join(format!("{}_top_params.json", summary.batch_id));
    let top: Vec<TopParams> = summary
        .results
        .iter()
        .filter(|r| r.metrics.is_some())
        .take(TOP_PARAMS_N)
        .map(TopParams::from)
        .collect();
    write_json(&top_path, &top)?;
    exports.insert("top_params".to_string(), top_path);

    info!(batch_id = %summary.batch_id, dir = %output_dir.display(), "batch results exported");
    Ok(exports)
}

/// Write a walk-forward run to `<wf_id>_summary.json` plus one JSON per
/// fold.
pub fn export_walk_forward(
    summary: &WalkForwardSummary,
    output_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut exports = BTreeMap::new();

    let summary_path = output_dir.join(format!("{}_summary.json", summary.wf_id));
    write_json(&summary_path, summary)?;
    exports.insert("summary".to_string(), summary_path);

    for fold in &summary.folds {
        let fold_path =
            output_dir.join(format!("{}_fold_{:02}.json", summary.wf_id, fold.fold_index));
        write_json(&fold_path, fold)?;
        exports.insert(format!("fold_{:02}", fold.fold_index), fold_path);
    }

    info!(wf_id = %summary.wf_id, dir = %output_dir.display(), "walk-forward results exported");
    Ok(exports)
}

#[derive(Serialize)]
struct TopParams {
    parameters: BTreeMap<String, serde_json::Value>,
    expectancy: f64,
    profit_factor: f64,
    win_rate: f64,
    total_return_pct: f64,
}

impl From<&BatchRunResult> for TopParams {
    fn from(run: &BatchRunResult) -> Self {
        let m = run.metrics.as_ref().expect("filtered to runs with metrics");
        Self {
            parameters: run.parameters.clone(),
            expectancy: m.expectancy,
            profit_factor: m.profit_factor,
            win_rate: m.win_rate,
            total_return_pct: m.total_return_pct,
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    Ok(())
}

/// Ranked results table: one row per run, parameter columns taken from the
/// first row's keys (all combinations share one key set per batch).
fn write_results_csv(path: &Path, rows: &[BatchRunResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let param_keys: Vec<String> = rows
        .first()
        .map(|r| r.parameters.keys().cloned().collect())
        .unwrap_or_default();

    let mut header = vec!["rank".to_string(), "run_id".to_string()];
    header.extend(param_keys.iter().cloned());
    header.extend(
        [
            "total_trades",
            "win_rate",
            "profit_factor",
            "expectancy",
            "max_drawdown_pct",
            "total_return_pct",
            "error",
        ]
        .map(String::from),
    );
    writer.write_record(&header)?;

    for (rank, run) in rows.iter().enumerate() {
        let mut record = vec![(rank + 1).to_string(), run.run_id.clone()];
        for key in &param_keys {
            record.push(
                run.parameters
                    .get(key)
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            );
        }
        if let Some(m) = &run.metrics {
            record.push(m.total_trades.to_string());
            record.push(format!("{:.3}", m.win_rate));
            record.push(format!("{:.2}", m.profit_factor));
            record.push(format!("{:.2}", m.expectancy));
            record.push(format!("{:.2}", m.max_drawdown_pct));
            record.push(format!("{:.2}", m.total_return_pct));
        } else {
            record.extend(std::iter::repeat_n(String::new(), 6));
        }
        record.push(run.error.clone().unwrap_or_default());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}
