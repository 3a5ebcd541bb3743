//! Bar Exporter Binary - drives the export pipeline outside the host platform
//!
//! Replays a captured host session, or runs a seeded synthetic feed in real time.
//! Either way the session ends with the backtrack pass and a final flush.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin bar_exporter -- --replay captures/session.jsonl
//! cargo run --release --bin bar_exporter -- --synthetic 120 --tick-ms 500 --freeze-depth
//! ```
//!
//! ## Environment Variables
//!
//! - MIF_* - pipeline configuration (see `PipelineConfig::from_env`)
//! - RUST_LOG - Logging level (optional, default: info)

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use mif_exporter::export_core::BufferedJsonlWriter;
use mif_exporter::pipeline::{
    BarSource, NoopMetrics, PipelineConfig, PipelineEngine, ReplaySource, SyntheticSource,
    UpdateOutcome,
};
use tokio::time::{interval, Duration};

#[derive(Debug)]
enum Mode {
    Replay(PathBuf),
    Synthetic {
        bars: usize,
        tick_ms: u64,
        seed: u64,
        freeze_depth: bool,
    },
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn parse_mode_from_args() -> Result<Mode, String> {
    let args: Vec<String> = env::args().collect();

    if let Some(path) = arg_value(&args, "--replay") {
        return Ok(Mode::Replay(path.into()));
    }

    if let Some(bars) = arg_value(&args, "--synthetic") {
        let parse = |flag: &str, default: u64| -> Result<u64, String> {
            match arg_value(&args, flag) {
                Some(v) => v.parse().map_err(|_| format!("invalid {} value '{}'", flag, v)),
                None => Ok(default),
            }
        };
        return Ok(Mode::Synthetic {
            bars: bars
                .parse()
                .map_err(|_| format!("invalid --synthetic value '{}'", bars))?,
            tick_ms: parse("--tick-ms", 1_000)?,
            seed: parse("--seed", 1_234)?,
            freeze_depth: args.iter().any(|a| a == "--freeze-depth"),
        });
    }

    Err("usage: bar_exporter (--replay <captures.jsonl> | --synthetic <bars> [--tick-ms N] [--seed N] [--freeze-depth])".to_string())
}

fn open_writer(config: &PipelineConfig) -> Result<BufferedJsonlWriter, Box<dyn std::error::Error>> {
    Ok(BufferedJsonlWriter::new(
        &config.output_dir,
        config.file_prefix.clone(),
        config.buffer_size,
    )?)
}

fn run_replay(config: PipelineConfig, path: PathBuf) -> Result<usize, Box<dyn std::error::Error>> {
    let captures = ReplaySource::read_captures(&path)?;
    log::info!("📖 Replaying {} captured callbacks from {}", captures.len(), path.display());

    let writer = open_writer(&config)?;
    let source = ReplaySource::new();
    let clock = source.clock();
    let mut engine =
        PipelineEngine::new_with_clock(config, source, writer, Arc::new(NoopMetrics), clock.now_fn());

    for capture in captures {
        let update = engine.source_mut().push(capture);
        engine.on_bar_update(update);
    }

    let summary = engine.shutdown();
    Ok(summary.unflushed)
}

async fn run_synthetic(
    config: PipelineConfig,
    bars: usize,
    tick_ms: u64,
    seed: u64,
    freeze_depth: bool,
) -> Result<usize, Box<dyn std::error::Error>> {
    let source = SyntheticSource::new(
        seed,
        config.fixed_width,
        Utc::now(),
        config.timeframe.as_duration(),
    )
    .with_frozen_depth(freeze_depth);

    let writer = open_writer(&config)?;
    let mut engine = PipelineEngine::new(config, source, writer, Arc::new(NoopMetrics));

    let mut ticker = interval(Duration::from_millis(tick_ms.max(1)));
    log::info!("✅ Synthetic feed running: {} bars, one every {}ms", bars, tick_ms);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if engine.source().current_bar().map_or(0, |b| b + 1) >= bars {
                    break;
                }
                let updates = engine.source_mut().advance();
                for update in updates {
                    if let UpdateOutcome::Skipped(reason) = engine.on_bar_update(update) {
                        log::debug!("bar {} skipped: {}", update.bar_index, reason);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Interrupted, shutting down");
                break;
            }
        }
    }

    let summary = engine.shutdown();
    Ok(summary.unflushed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = PipelineConfig::from_env();
    config.validate()?;
    let mode = parse_mode_from_args()?;

    log::info!("🚀 Starting Bar Exporter");
    log::info!("   Symbol: {} ({})", config.symbol, config.timeframe);
    log::info!("   Output: {}/{}_YYYYMMDD.jsonl", config.output_dir, config.file_prefix);
    log::info!("   Mode: {:?}", mode);

    let unflushed = match mode {
        Mode::Replay(path) => run_replay(config, path)?,
        Mode::Synthetic {
            bars,
            tick_ms,
            seed,
            freeze_depth,
        } => run_synthetic(config, bars, tick_ms, seed, freeze_depth).await?,
    };

    if unflushed > 0 {
        return Err(format!("{} records could not be written", unflushed).into());
    }
    Ok(())
}
