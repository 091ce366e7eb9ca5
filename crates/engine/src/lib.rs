//! Resumable batch transcoding of video files to 1080p web formats.
//!
//! A content fingerprint of every input is kept in a JSON ledger, so an
//! interrupted or repeated run never redoes work, even after files are
//! renamed or moved.

pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod ffprobe;
pub mod fingerprint;
pub mod job;
pub mod ledger;
pub mod outcome;
pub mod policy;
pub mod scan;
pub mod transcoder;

pub use cancel::{CancellationController, RunState};
pub use config::BatchConfig;
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::{BatchError, BatchResult};
pub use events::{BatchEvent, BatchObserver, NullObserver, ObserverSet, SkipReason, Summary};
pub use fingerprint::FileFingerprint;
pub use job::{Job, JobReport, JobState};
pub use ledger::{Ledger, LedgerEntry, LedgerStats};
pub use outcome::Outcome;
pub use policy::{EncoderMode, EncodingProfile};
pub use scan::Discoverer;
pub use transcoder::{FfmpegTranscoder, TranscodeOutput, Transcoder};
