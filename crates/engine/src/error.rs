use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a run stopped by the user
pub const EXIT_INTERRUPTED: u8 = 130;
/// Exit code for configuration errors and ledger failures
pub const EXIT_FATAL: u8 = 1;

/// Errors raised by the batch engine
///
/// Per-file kinds (`Fingerprint`, `Transcode`) are folded into a failed job
/// by the dispatcher and never abort a run. Every other kind is fatal.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("cannot read {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot fingerprint {}: {source}", path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode failed for {}: {reason}", path.display())]
    Transcode { path: PathBuf, reason: String },

    #[error("ledger {} is corrupt: {reason}", path.display())]
    LedgerCorruption { path: PathBuf, reason: String },

    #[error("failed to persist ledger {}: {source}", path.display())]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BatchError {
    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BatchError::Fingerprint { .. } | BatchError::Transcode { .. })
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> u8 {
        EXIT_FATAL
    }
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;
