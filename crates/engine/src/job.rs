use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::FileFingerprint;
use crate::outcome::Outcome;
use crate::policy::EncodingProfile;

/// Lifecycle of a single transcode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// One attempt to transcode one discovered file
///
/// Lives only until its outcome has been folded into the ledger.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub input_path: PathBuf,
    pub fingerprint: FileFingerprint,
    pub profile: EncodingProfile,
    pub output_path: PathBuf,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Job {
    pub fn new(input_path: PathBuf, fingerprint: FileFingerprint, profile: EncodingProfile, output_path: PathBuf) -> Self {
        Job {
            id: Uuid::new_v4().to_string(),
            input_path,
            fingerprint,
            profile,
            output_path,
            state: JobState::Queued,
            started_at: None,
            finished_at: None,
            reason: None,
        }
    }

    /// Where the encoder writes until the output is accepted
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self.output_path.as_os_str().to_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    pub fn start(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, state: JobState, reason: Option<String>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    /// Seconds between start and finish, if both happened
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Terminal record of a job, handed to observers and the run summary
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub state: JobState,
    pub outcome: Option<Outcome>,
    pub reason: Option<String>,
    pub input_deleted: bool,
    pub duration_secs: Option<f64>,
}

impl JobReport {
    pub fn from_job(job: &Job, outcome: Option<Outcome>, input_deleted: bool) -> Self {
        JobReport {
            job_id: job.id.clone(),
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            state: job.state,
            outcome,
            reason: job.reason.clone(),
            input_deleted,
            duration_secs: job.duration_secs(),
        }
    }
}
