use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{BatchError, BatchResult};

const READ_CHUNK: usize = 64 * 1024;

/// Content identity of a file: byte length plus SHA-256 of the content
///
/// Two files with the same fingerprint are treated as the same content,
/// whatever their names or locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileFingerprint {
    pub size: u64,
    pub digest: [u8; 32],
}

impl FileFingerprint {
    /// Rebuild a fingerprint from a size and a hex-encoded SHA-256 digest
    pub fn from_parts(size: u64, digest_hex: &str) -> Option<Self> {
        let bytes = hex::decode(digest_hex.trim()).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(FileFingerprint { size, digest })
    }

    /// Hex form of the digest, as stored in the ledger's `input_hash` field
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Display for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.size, self.digest_hex())
    }
}

impl FromStr for FileFingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (size, digest) = s
            .split_once('-')
            .ok_or_else(|| format!("fingerprint '{}' has no size separator", s))?;
        let size = size
            .parse::<u64>()
            .map_err(|e| format!("fingerprint '{}' has a bad size: {}", s, e))?;
        FileFingerprint::from_parts(size, digest)
            .ok_or_else(|| format!("fingerprint '{}' has a bad digest", s))
    }
}

/// Read a file once, start to end, and fingerprint its content
pub fn fingerprint(path: &Path) -> BatchResult<FileFingerprint> {
    let wrap = |source: std::io::Error| BatchError::Fingerprint {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(wrap)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(wrap(e)),
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileFingerprint {
        size,
        digest: hasher.finalize().into(),
    })
}

/// Fingerprint on the blocking pool so large files don't stall the runtime
pub async fn fingerprint_async(path: PathBuf) -> BatchResult<FileFingerprint> {
    let task_path = path.clone();
    match tokio::task::spawn_blocking(move || fingerprint(&task_path)).await {
        Ok(result) => result,
        Err(e) => Err(BatchError::Fingerprint {
            path,
            source: std::io::Error::new(ErrorKind::Other, e.to_string()),
        }),
    }
}
