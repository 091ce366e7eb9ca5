mod presenter;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use engine::error::EXIT_FATAL;
use engine::{
    BatchConfig, BatchError, BatchObserver, CancellationController, Discoverer, DispatchOptions, Dispatcher,
    EncoderMode, EncodingProfile, FfmpegTranscoder, Ledger, ObserverSet,
};
use log::{error, info, warn};

use crate::presenter::{print_summary, summary_line, ConsoleProgress, LogFileObserver};

/// Batch-transcode videos to 1080p web MP4, resuming where the last run stopped
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to scan, or a single video file
    path: PathBuf,

    /// Delete each input once its smaller output is recorded
    #[arg(long)]
    delete_input: bool,

    /// Encoder: cuda, x265 or smart
    #[arg(short, long)]
    encoder: Option<EncoderMode>,

    /// Transcode files the ledger already marks as processed
    #[arg(long)]
    force_rerun: bool,

    /// Only scan the top level of the directory
    #[arg(long)]
    no_recursive: bool,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors, print no progress or summary
    #[arg(short, long)]
    quiet: bool,

    /// Do not print per-file progress lines
    #[arg(long)]
    no_progress: bool,

    /// Number of files transcoded at once
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ledger file (default: process_log.json)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Write outputs here instead of next to each input
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Exit non-zero if any file failed
    #[arg(long)]
    strict: bool,
}

impl Args {
    /// Command-line flags win over the config file
    fn apply_to(&self, cfg: &mut BatchConfig) {
        if let Some(mode) = self.encoder {
            cfg.encoder = mode.name().to_string();
        }
        if let Some(n) = self.concurrency {
            cfg.concurrency = n;
        }
        if let Some(ledger) = &self.ledger {
            cfg.ledger_path = ledger.clone();
        }
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = Some(dir.clone());
        }
        cfg.delete_input |= self.delete_input;
        cfg.force_rerun |= self.force_rerun;
        cfg.strict |= self.strict;
        if self.no_recursive {
            cfg.recursive = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<BatchError>().map(BatchError::exit_code).unwrap_or(EXIT_FATAL);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let mut cfg = BatchConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply_to(&mut cfg);
    cfg.validate()?;

    let profile = EncodingProfile::for_mode(cfg.encoder_mode()?);
    let discoverer = Discoverer::new(&args.path, cfg.recursive, cfg.normalized_extensions())?;

    info!("Webify starting");
    info!("  Input: {}", discoverer.root().display());
    info!("  Encoder: {} (output suffix {})", profile.mode, profile.output_suffix);
    info!("  Ledger: {}", cfg.ledger_path.display());
    info!("  Concurrency: {}", cfg.concurrency);

    let ledger = Arc::new(Ledger::load(&cfg.ledger_path)?);
    let stats = ledger.snapshot_stats();
    if stats.count > 0 {
        info!(
            "Ledger has {} entries, {} processed",
            stats.count, stats.processed_count
        );
    }

    let transcoder = FfmpegTranscoder::new(cfg.ffmpeg_bin.clone(), cfg.ffprobe_bin.clone());
    match transcoder.detect_version().await {
        Ok(version) => info!("Using FFmpeg {}", version),
        Err(e) => {
            return Err(BatchError::Configuration(format!(
                "ffmpeg at {} is not usable: {:#}",
                cfg.ffmpeg_bin.display(),
                e
            ))
            .into())
        }
    }

    let show_progress = !args.quiet && !args.no_progress;
    let mut observers = ObserverSet::new();
    if show_progress {
        let total = discoverer.count();
        info!("Found {} video file(s)", total);
        observers = observers.with(ConsoleProgress::new(total));
    }
    let log_files = match &cfg.log_dir {
        Some(dir) => {
            let logs = Arc::new(LogFileObserver::create(dir)?);
            observers = observers.with(Arc::clone(&logs));
            Some(logs)
        }
        None => None,
    };
    let observer: Arc<dyn BatchObserver> = Arc::new(observers);

    let cancel = CancellationController::new();
    let signals = cancel.spawn_signal_listener(Arc::clone(&observer));

    let dispatcher = Dispatcher::new(
        Arc::clone(&ledger),
        Arc::new(transcoder),
        observer,
        cancel,
        DispatchOptions {
            concurrency: cfg.concurrency,
            force_rerun: cfg.force_rerun,
            delete_input: cfg.delete_input,
            output_dir: cfg.output_dir.clone(),
        },
    )?;

    let started = Utc::now();
    let result = dispatcher.run(discoverer.iter(), &profile).await;
    signals.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(logs) = &log_files {
                logs.error(&format!("fatal: {}", e));
            }
            return Err(e.into());
        }
    };

    info!("{}", summary_line(&summary));
    if summary.failed > 0 {
        warn!("{} file(s) failed; they will be retried on the next run", summary.failed);
    }
    if !args.quiet {
        print_summary(&summary, Utc::now() - started, ledger.snapshot_stats().total_bytes_saved);
    }

    Ok(summary.exit_code(cfg.strict))
}
