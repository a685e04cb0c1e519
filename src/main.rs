use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{self, EnvFilter};

use candlerun::data::{csv::CsvBars, parquet::ParquetBars, BarProvider};
use candlerun::engine::runner::{BacktestRunner, ProgressSink};
use candlerun::engine::RunConfig;
use candlerun::strategies::find_strategy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(data_path) = args.next() else {
        eprintln!("usage: candlerun <ohlcv.csv|ohlcv.parquet> [config.json]");
        std::process::exit(2);
    };
    let config_path = args.next();

    let provider = provider_for(&data_path)?;

    let config = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            serde_json::from_str::<RunConfig>(&raw)
                .with_context(|| format!("invalid run config in {path}"))?
        }
        None => config_from_data(provider.as_ref()).await?,
    };

    let strategy = find_strategy(&config.strategy_preset, &config.parameter_overrides)?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let sink_bar = bar.clone();
    let sink: Arc<ProgressSink> = Arc::new(move |pct, msg: &str| {
        sink_bar.set_position(u64::from(pct));
        sink_bar.set_message(msg.to_string());
    });

    let result = BacktestRunner::new(config, provider, strategy)
        .with_progress(sink)
        .run()
        .await?;
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&result.metrics)?);
    tracing::info!(
        symbol = %result.symbol,
        trades = result.metrics.total_trades,
        final_capital = result.final_capital,
        "run complete"
    );
    Ok(())
}

fn provider_for(path: &str) -> Result<Arc<dyn BarProvider>> {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("csv") => Ok(Arc::new(CsvBars::new(path))),
        Some("parquet") => Ok(Arc::new(ParquetBars::new(path))),
        _ => bail!("unsupported data file (expected .csv or .parquet): {path}"),
    }
}

/// Zero-config mode: span the run over everything the data file contains.
async fn config_from_data(provider: &dyn BarProvider) -> Result<RunConfig> {
    let bars = provider.get_bars("", 0, i64::MAX).await?;
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        bail!("data file contains no bars");
    };
    Ok(RunConfig::new(
        "UNKNOWN",
        first.datetime(),
        last.datetime() + Duration::minutes(1),
    ))
}
