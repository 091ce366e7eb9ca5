use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::cancel::CancellationController;
use crate::error::{BatchError, BatchResult};
use crate::events::{BatchEvent, BatchObserver, SkipReason, Summary};
use crate::fingerprint::{fingerprint_async, FileFingerprint};
use crate::job::{Job, JobReport, JobState};
use crate::ledger::{Ledger, LedgerEntry};
use crate::outcome::{self, evaluate, Outcome};
use crate::policy::EncodingProfile;
use crate::transcoder::{TranscodeOutput, Transcoder};

/// Knobs for one dispatcher run
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub force_rerun: bool,
    pub delete_input: bool,
    pub output_dir: Option<PathBuf>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        DispatchOptions {
            concurrency: 1,
            force_rerun: false,
            delete_input: false,
            output_dir: None,
        }
    }
}

/// Shared handles every job task needs
#[derive(Clone)]
struct JobContext {
    ledger: Arc<Ledger>,
    transcoder: Arc<dyn Transcoder>,
    observer: Arc<dyn BatchObserver>,
    delete_input: bool,
}

/// Turns discovered files into at most `concurrency` concurrent jobs
///
/// Each file is fingerprinted and checked against the ledger before it is
/// submitted. Every job outcome is recorded in the ledger before the job
/// counts as finished.
pub struct Dispatcher {
    ctx: JobContext,
    cancel: CancellationController,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        transcoder: Arc<dyn Transcoder>,
        observer: Arc<dyn BatchObserver>,
        cancel: CancellationController,
        options: DispatchOptions,
    ) -> BatchResult<Self> {
        if options.concurrency == 0 {
            return Err(BatchError::Configuration("concurrency must be at least 1".to_string()));
        }
        Ok(Dispatcher {
            ctx: JobContext {
                ledger,
                transcoder,
                observer,
                delete_input: options.delete_input,
            },
            cancel,
            options,
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ctx.ledger
    }

    fn emit(&self, event: BatchEvent) {
        self.ctx.observer.on_event(&event);
    }

    /// Process `files` in order until they run out, a stop is requested, or
    /// a fatal error occurs
    ///
    /// Returns once every submitted job has finished. Per-file failures are
    /// counted in the summary; only fatal errors are returned as `Err`.
    pub async fn run<I>(&self, files: I, profile: &EncodingProfile) -> BatchResult<Summary>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        if let Some(dir) = &self.options.output_dir {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                BatchError::Configuration(format!("cannot create output directory {}: {}", dir.display(), e))
            })?;
        }

        info!(
            "🚀 Starting batch: encoder={}, concurrency={}, force_rerun={}, delete_input={}",
            profile.mode, self.options.concurrency, self.options.force_rerun, self.options.delete_input
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut jobs: JoinSet<BatchResult<JobReport>> = JoinSet::new();
        let mut files = files.into_iter();
        let mut summary = Summary::default();
        let mut fatal: Option<BatchError> = None;
        let mut claimed_inputs: HashSet<FileFingerprint> = HashSet::new();
        let mut claimed_outputs: HashSet<PathBuf> = HashSet::new();
        let mut exhausted = false;
        let mut index = 0usize;

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            while let Some(joined) = jobs.try_join_next() {
                absorb(joined, &mut summary, &mut fatal);
            }
            if fatal.is_some() || self.cancel.is_stopping() {
                break;
            }

            let Some(path) = files.next() else {
                exhausted = true;
                break;
            };
            index += 1;
            summary.total_discovered += 1;
            self.emit(BatchEvent::Discovered { index, path: path.clone() });

            let fp = match fingerprint_async(path.clone()).await {
                Ok(fp) => fp,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    summary.failed += 1;
                    self.emit(BatchEvent::Rejected { index, path, error: e.to_string() });
                    continue;
                }
            };

            if let Some(reason) = self.skip_reason(&path, &fp, &claimed_inputs) {
                info!("⏭️  Skipping {}: {}", path.display(), reason.describe());
                summary.skipped += 1;
                self.emit(BatchEvent::Skipped { index, path, reason });
                continue;
            }

            let output_path = profile.output_path(&path, self.options.output_dir.as_deref());
            if !claimed_outputs.insert(output_path.clone()) {
                let message = format!(
                    "output {} is already being produced from another file in this run",
                    output_path.display()
                );
                warn!("Skipping {}: {}", path.display(), message);
                summary.failed += 1;
                self.emit(BatchEvent::Rejected { index, path, error: message });
                continue;
            }
            claimed_inputs.insert(fp);

            // Fingerprinting a large file takes a while; look again before committing
            if self.cancel.is_stopping() {
                summary.not_started += 1;
                break;
            }

            let job = Job::new(path, fp, profile.clone(), output_path);
            self.emit(BatchEvent::JobStarted {
                index,
                job_id: job.id.clone(),
                path: job.input_path.clone(),
                output: job.output_path.clone(),
            });

            let ctx = self.ctx.clone();
            jobs.spawn(async move {
                let _permit = permit;
                ctx.execute(job, index).await
            });
        }

        if !exhausted && fatal.is_none() && self.cancel.is_stopping() {
            let remaining = files.count();
            summary.total_discovered += remaining;
            summary.not_started += remaining;
            info!("Stop requested: {} queued file(s) will not be started", summary.not_started);
        }

        if !jobs.is_empty() {
            info!("Waiting for {} running job(s) to finish", jobs.len());
        }
        while let Some(joined) = jobs.join_next().await {
            absorb(joined, &mut summary, &mut fatal);
        }

        summary.interrupted = self.cancel.is_stopping();
        if summary.interrupted {
            self.cancel.mark_stopped();
        }

        if let Some(e) = fatal {
            error!("Batch aborted: {}", e);
            return Err(e);
        }

        info!(
            "Batch finished: {} processed, {} failed, {} skipped, {} not started",
            summary.processed, summary.failed, summary.skipped, summary.not_started
        );
        self.emit(BatchEvent::RunFinished { summary });
        Ok(summary)
    }

    fn skip_reason(&self, path: &Path, fp: &FileFingerprint, claimed: &HashSet<FileFingerprint>) -> Option<SkipReason> {
        if claimed.contains(fp) {
            return Some(SkipReason::DuplicateInRun);
        }
        let produced = self
            .ctx
            .ledger
            .produced_output(fp)
            .or_else(|| self.ctx.ledger.produced_output_at(path, fp.size));
        if let Some(entry) = produced {
            debug!(
                "{} was produced from {}",
                fp,
                entry.source_path.as_deref().unwrap_or(&entry.input_hash)
            );
            return Some(SkipReason::PreviousOutput);
        }
        if self.ctx.ledger.should_skip(fp, self.options.force_rerun) {
            return Some(SkipReason::AlreadyProcessed);
        }
        None
    }
}

fn absorb(joined: Result<BatchResult<JobReport>, JoinError>, summary: &mut Summary, fatal: &mut Option<BatchError>) {
    match joined {
        Ok(Ok(report)) => {
            if report.state == JobState::Succeeded {
                summary.processed += 1;
                summary.bytes_saved += report.outcome.map(|o| o.bytes_saved()).unwrap_or(0);
            } else {
                summary.failed += 1;
            }
        }
        Ok(Err(e)) => {
            summary.failed += 1;
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
        Err(e) => {
            error!("Job task ended abnormally: {}", e);
            summary.failed += 1;
        }
    }
}

impl JobContext {
    async fn execute(self, mut job: Job, index: usize) -> BatchResult<JobReport> {
        job.start();
        info!(
            "Job {}: Transcoding {} -> {}",
            job.id,
            job.input_path.display(),
            job.output_path.display()
        );

        let partial = job.partial_path();
        remove_if_exists(&partial).await;

        let input_size = job.fingerprint.size;
        let attempt = match self.transcoder.transcode(&job.input_path, &partial, &job.profile).await {
            Ok(out) if out.success => match tokio::fs::metadata(&partial).await {
                Ok(meta) if meta.len() > 0 => Ok(meta.len()),
                Ok(_) => Err("encoder wrote an empty output".to_string()),
                Err(_) => Err("encoder reported success but wrote no output".to_string()),
            },
            Ok(out) => Err(describe_exit(&out)),
            Err(e) => Err(format!("{:#}", e)),
        };

        let mut outcome = evaluate(input_size, attempt.as_ref().ok().copied(), attempt.is_ok());
        let mut reason = attempt.err();

        if outcome.processed {
            if let Err(e) = tokio::fs::rename(&partial, &job.output_path).await {
                reason = Some(format!("could not move output into place: {}", e));
                outcome = Outcome {
                    processed: false,
                    ..outcome
                };
            }
        } else if reason.is_none() {
            reason = Some(format!(
                "output not smaller than input ({} >= {} bytes)",
                outcome.output_size.unwrap_or(0),
                input_size
            ));
        }

        if !outcome.processed {
            remove_if_exists(&partial).await;
            if let Some(r) = &reason {
                let err = BatchError::Transcode {
                    path: job.input_path.clone(),
                    reason: r.clone(),
                };
                warn!("Job {}: ❌ {}", job.id, err);
            }
        }

        let output_hash = if outcome.processed {
            match fingerprint_async(job.output_path.clone()).await {
                Ok(fp) => Some(fp.to_string()),
                Err(e) => {
                    warn!("Job {}: output will not be recognised on later scans: {}", job.id, e);
                    None
                }
            }
        } else {
            None
        };

        let state = if outcome.processed { JobState::Succeeded } else { JobState::Failed };
        job.finish(state, reason);

        let entry = LedgerEntry {
            processed: outcome.processed,
            input_size,
            output_size: outcome.output_size,
            size_difference: outcome.size_difference,
            output_file: outcome.processed.then(|| job.output_path.display().to_string()),
            input_hash: job.fingerprint.digest_hex(),
            output_hash,
            source_path: Some(job.input_path.display().to_string()),
            processing_time: job.finished_at,
            duration_secs: job.duration_secs(),
        };
        // Recording rewrites and fsyncs the ledger file
        let ledger = Arc::clone(&self.ledger);
        match tokio::task::spawn_blocking(move || ledger.record(entry)).await {
            Ok(recorded) => recorded?,
            Err(e) => {
                return Err(BatchError::LedgerWrite {
                    path: self.ledger.path().to_path_buf(),
                    source: std::io::Error::new(ErrorKind::Other, e.to_string()),
                })
            }
        }

        let mut input_deleted = false;
        if outcome.processed {
            info!(
                "Job {}: ✅ Done, saved {} bytes ({} -> {})",
                job.id,
                outcome.bytes_saved(),
                input_size,
                outcome.output_size.unwrap_or(0)
            );
            if self.delete_input {
                match outcome::delete_input(&job.input_path) {
                    Ok(()) => {
                        info!("Job {}: Deleted input {}", job.id, job.input_path.display());
                        input_deleted = true;
                    }
                    Err(e) => warn!("Job {}: {:#}", job.id, e),
                }
            }
        }

        let report = JobReport::from_job(&job, Some(outcome), input_deleted);
        self.observer.on_event(&BatchEvent::JobFinished {
            index,
            report: report.clone(),
        });
        Ok(report)
    }
}

fn describe_exit(out: &TranscodeOutput) -> String {
    let code = out
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    match out.diagnostics.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("ffmpeg exited with {}: {}", code, last.trim()),
        None => format!("ffmpeg exited with {}", code),
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
