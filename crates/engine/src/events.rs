use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{EXIT_FATAL, EXIT_INTERRUPTED};
use crate::job::JobReport;

/// Why a discovered file was not submitted as a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The ledger already holds a processed entry for this content
    AlreadyProcessed,
    /// The file is an output an earlier run produced
    PreviousOutput,
    /// Another file with the same content was already handled in this run
    DuplicateInRun,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already processed (by hash)",
            SkipReason::PreviousOutput => "output of a previous run",
            SkipReason::DuplicateInRun => "duplicate content in this run",
        }
    }
}

/// Run summary, final once every job has reached a terminal state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total_discovered: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_started: usize,
    pub bytes_saved: u64,
    pub interrupted: bool,
}

impl Summary {
    /// Files that reached a terminal state in this run
    pub fn settled(&self) -> usize {
        self.processed + self.failed + self.skipped
    }

    /// 130 when interrupted, 1 for failed jobs under `strict`, else 0
    pub fn exit_code(&self, strict: bool) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if strict && self.failed > 0 {
            EXIT_FATAL
        } else {
            0
        }
    }
}

/// Everything the engine reports while it works
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Discovered { index: usize, path: PathBuf },
    Skipped { index: usize, path: PathBuf, reason: SkipReason },
    /// The file never became a job, e.g. it could not be fingerprinted
    Rejected { index: usize, path: PathBuf, error: String },
    JobStarted { index: usize, job_id: String, path: PathBuf, output: PathBuf },
    JobFinished { index: usize, report: JobReport },
    /// A stop signal arrived; `repeated` is true for every signal after the first
    StopRequested { repeated: bool },
    RunFinished { summary: Summary },
}

/// Receiver for engine events, e.g. a progress display or a log file
///
/// Observers must not block for long; they are called from the job tasks.
pub trait BatchObserver: Send + Sync {
    fn on_event(&self, event: &BatchEvent);
}

impl<T: BatchObserver + ?Sized> BatchObserver for Arc<T> {
    fn on_event(&self, event: &BatchEvent) {
        (**self).on_event(event);
    }
}

/// Observer that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BatchObserver for NullObserver {
    fn on_event(&self, _event: &BatchEvent) {}
}

/// Fan one event stream out to several observers
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn BatchObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl BatchObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl BatchObserver for ObserverSet {
    fn on_event(&self, event: &BatchEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
