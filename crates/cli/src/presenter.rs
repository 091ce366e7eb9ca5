use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use engine::{BatchEvent, BatchObserver, JobState, Summary};
use humansize::{format_size, DECIMAL};
use log::warn;

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `[n/total]` progress lines on stdout
pub struct ConsoleProgress {
    total: usize,
}

impl ConsoleProgress {
    pub fn new(total: usize) -> Self {
        ConsoleProgress { total }
    }

    fn counter(&self, index: usize) -> String {
        // Files can appear after the up-front count
        format!("[{}/{}]", index, self.total.max(index))
    }
}

impl BatchObserver for ConsoleProgress {
    fn on_event(&self, event: &BatchEvent) {
        match event {
            BatchEvent::Skipped { index, path, reason } => {
                println!("{} ⏭️  {} ({})", self.counter(*index), file_name(path), reason.describe());
            }
            BatchEvent::Rejected { index, path, error } => {
                println!("{} ❌ {}: {}", self.counter(*index), file_name(path), error);
            }
            BatchEvent::JobStarted { index, path, output, .. } => {
                println!("{} 🎬 {} -> {}", self.counter(*index), file_name(path), file_name(output));
            }
            BatchEvent::JobFinished { index, report } => {
                let name = file_name(&report.input_path);
                match (report.state, report.outcome) {
                    (JobState::Succeeded, Some(outcome)) => println!(
                        "{} ✅ {}: saved {}{}",
                        self.counter(*index),
                        name,
                        format_size(outcome.bytes_saved(), DECIMAL),
                        if report.input_deleted { ", input deleted" } else { "" }
                    ),
                    _ => println!(
                        "{} ❌ {}: {}",
                        self.counter(*index),
                        name,
                        report.reason.as_deref().unwrap_or("failed")
                    ),
                }
            }
            BatchEvent::StopRequested { repeated: false } => {
                println!("⏸️  Stopping: waiting for running jobs, no new jobs will start");
            }
            BatchEvent::StopRequested { repeated: true } => {
                println!("⏸️  Already stopping, still waiting for running jobs");
            }
            BatchEvent::Discovered { .. } | BatchEvent::RunFinished { .. } => {}
        }
    }
}

/// Appends timestamped lines to `webify.log`, and failures to `webify-errors.log`
pub struct LogFileObserver {
    detail: Mutex<File>,
    errors: Mutex<File>,
    dir: PathBuf,
}

impl LogFileObserver {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let open = |name: &str| -> Result<File> {
            let path = dir.join(name);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))
        };

        Ok(LogFileObserver {
            detail: Mutex::new(open("webify.log")?),
            errors: Mutex::new(open("webify-errors.log")?),
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(&self, file: &Mutex<File>, line: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{} {}", stamp, line) {
            warn!("Failed to write to log in {}: {}", self.dir.display(), e);
        }
    }

    fn note(&self, line: &str) {
        self.append(&self.detail, line);
    }

    /// Failures go to both files
    pub fn error(&self, line: &str) {
        self.append(&self.detail, &format!("ERROR {}", line));
        self.append(&self.errors, line);
    }
}

impl BatchObserver for LogFileObserver {
    fn on_event(&self, event: &BatchEvent) {
        match event {
            BatchEvent::Discovered { index, path } => {
                self.note(&format!("#{} discovered {}", index, path.display()));
            }
            BatchEvent::Skipped { index, path, reason } => {
                self.note(&format!("#{} skipped {}: {}", index, path.display(), reason.describe()));
            }
            BatchEvent::Rejected { index, path, error } => {
                self.error(&format!("#{} {}: {}", index, path.display(), error));
            }
            BatchEvent::JobStarted { index, job_id, path, output } => {
                self.note(&format!(
                    "#{} job {} started {} -> {}",
                    index,
                    job_id,
                    path.display(),
                    output.display()
                ));
            }
            BatchEvent::JobFinished { index, report } => {
                let duration = report.duration_secs.map(|s| format!(" in {:.1}s", s)).unwrap_or_default();
                match (report.state, report.outcome) {
                    (JobState::Succeeded, Some(outcome)) => self.note(&format!(
                        "#{} job {} done{}: {} -> {} ({} bytes, saved {}){}",
                        index,
                        report.job_id,
                        duration,
                        report.input_path.display(),
                        report.output_path.display(),
                        outcome.output_size.unwrap_or(0),
                        outcome.bytes_saved(),
                        if report.input_deleted { ", input deleted" } else { "" }
                    )),
                    _ => self.error(&format!(
                        "#{} job {} failed{}: {}: {}",
                        index,
                        report.job_id,
                        duration,
                        report.input_path.display(),
                        report.reason.as_deref().unwrap_or("unknown error")
                    )),
                }
            }
            BatchEvent::StopRequested { repeated } => {
                self.note(if *repeated { "stop requested again, ignored" } else { "stop requested" });
            }
            BatchEvent::RunFinished { summary } => self.note(&summary_line(summary)),
        }
    }
}

pub fn summary_line(summary: &Summary) -> String {
    format!(
        "run finished: {} discovered, {} processed, {} failed, {} skipped, {} not started, {} saved{}",
        summary.total_discovered,
        summary.processed,
        summary.failed,
        summary.skipped,
        summary.not_started,
        format_size(summary.bytes_saved, DECIMAL),
        if summary.interrupted { " (interrupted)" } else { "" }
    )
}

/// Final block printed after the run
pub fn print_summary(summary: &Summary, elapsed: chrono::Duration, ledger_saved: u64) {
    println!();
    println!("{}", if summary.interrupted { "⏸️  Batch interrupted" } else { "📊 Batch complete" });
    println!("  Discovered:   {}", summary.total_discovered);
    println!("  Processed:    {}", summary.processed);
    println!("  Failed:       {}", summary.failed);
    println!("  Skipped:      {}", summary.skipped);
    if summary.not_started > 0 {
        println!("  Not started:  {}", summary.not_started);
    }
    println!("  Saved:        {}", format_size(summary.bytes_saved, DECIMAL));
    println!("  Saved (all runs): {}", format_size(ledger_saved, DECIMAL));
    println!("  Elapsed:      {}", format_duration(elapsed));
}

pub fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}
