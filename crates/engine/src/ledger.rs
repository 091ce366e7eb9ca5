use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchResult};
use crate::fingerprint::FileFingerprint;

/// Last known processing outcome for one fingerprint
///
/// Field names match the JSON log written by earlier versions of the tool,
/// so old logs stay readable. Unknown fields are ignored on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub processed: bool,
    pub input_size: u64,
    #[serde(default)]
    pub output_size: Option<u64>,
    #[serde(default)]
    pub size_difference: Option<i64>,
    #[serde(default)]
    pub output_file: Option<String>,
    pub input_hash: String,
    /// Fingerprint of the accepted output, used to recognise it on later scans
    #[serde(default)]
    pub output_hash: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub processing_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl LedgerEntry {
    /// Fingerprint this entry is keyed by
    pub fn fingerprint(&self) -> Option<FileFingerprint> {
        FileFingerprint::from_parts(self.input_size, &self.input_hash)
    }

    /// Fingerprint of the output this entry produced, if one was accepted
    pub fn output_fingerprint(&self) -> Option<FileFingerprint> {
        self.output_hash.as_deref().and_then(|s| s.parse().ok())
    }

    /// File name of an accepted output that can only be matched by path
    fn unhashed_output_name(&self) -> Option<OsString> {
        if !self.processed || self.output_fingerprint().is_some() {
            return None;
        }
        self.output_file
            .as_deref()
            .and_then(|f| Path::new(f).file_name())
            .map(|n| n.to_os_string())
    }

    /// Whether `path` (of `size` bytes) is the output recorded in `output_file`
    ///
    /// Logs written by the earlier tool store the output relative to the
    /// scanned directory, so a relative `output_file` matches as a path suffix.
    fn names_output(&self, path: &Path, size: u64) -> bool {
        let Some(recorded) = self.output_file.as_deref().map(Path::new) else {
            return false;
        };
        let same_place = if recorded.is_absolute() {
            recorded == path
        } else {
            path.ends_with(recorded)
        };
        same_place && self.output_size.map_or(true, |s| s == size)
    }
}

/// Summary counters over the whole ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub count: usize,
    pub processed_count: usize,
    pub total_bytes_saved: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: BTreeMap<FileFingerprint, LedgerEntry>,
    /// output fingerprint -> input fingerprint
    outputs: HashMap<FileFingerprint, FileFingerprint>,
    /// output file name -> inputs whose accepted output has no usable `output_hash`
    output_names: HashMap<OsString, Vec<FileFingerprint>>,
}

impl LedgerState {
    fn insert(&mut self, fp: FileFingerprint, entry: LedgerEntry) -> Option<LedgerEntry> {
        self.index(fp, &entry);
        let previous = self.entries.insert(fp, entry);
        if let Some(prev) = &previous {
            self.unindex(fp, prev);
            if let Some(current) = self.entries.get(&fp).cloned() {
                self.index(fp, &current);
            }
        }
        previous
    }

    fn restore(&mut self, fp: FileFingerprint, previous: Option<LedgerEntry>) {
        if let Some(current) = self.entries.remove(&fp) {
            self.unindex(fp, &current);
        }
        if let Some(entry) = previous {
            self.insert(fp, entry);
        }
    }

    fn index(&mut self, fp: FileFingerprint, entry: &LedgerEntry) {
        if let Some(out) = entry.output_fingerprint() {
            self.outputs.insert(out, fp);
        } else if let Some(name) = entry.unhashed_output_name() {
            let inputs = self.output_names.entry(name).or_default();
            if !inputs.contains(&fp) {
                inputs.push(fp);
            }
        }
    }

    fn unindex(&mut self, fp: FileFingerprint, entry: &LedgerEntry) {
        if let Some(out) = entry.output_fingerprint() {
            if self.outputs.get(&out) == Some(&fp) {
                self.outputs.remove(&out);
            }
        } else if let Some(name) = entry.unhashed_output_name() {
            if let Some(inputs) = self.output_names.get_mut(&name) {
                inputs.retain(|i| *i != fp);
                if inputs.is_empty() {
                    self.output_names.remove(&name);
                }
            }
        }
    }
}

/// Which of two entries for the same content survives a legacy migration
fn prefer_migrated(existing: &LedgerEntry, candidate: &LedgerEntry) -> bool {
    match (existing.processed, candidate.processed) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.processing_time > existing.processing_time,
    }
}

/// Durable mapping from fingerprint to processing outcome
///
/// Every `record` rewrites the whole file through a temp file and an atomic
/// rename, so a reader never sees a half-written ledger. Writes are
/// serialized by an internal lock, which makes the ledger safe to share
/// between concurrent jobs.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Load the ledger at `path`, starting empty if the file does not exist
    ///
    /// A file that exists but cannot be read or parsed is reported as
    /// corrupt rather than silently replaced.
    pub fn load(path: &Path) -> BatchResult<Ledger> {
        let corrupt = |reason: String| BatchError::LedgerCorruption {
            path: path.to_path_buf(),
            reason,
        };

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No ledger at {}, starting fresh", path.display());
                return Ok(Ledger::empty(path));
            }
            Err(e) => return Err(corrupt(format!("unreadable: {}", e))),
        };

        let raw: BTreeMap<String, LedgerEntry> =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;

        let mut state = LedgerState::default();
        for (key, mut entry) in raw {
            let fp = entry.fingerprint().ok_or_else(|| {
                corrupt(format!("entry '{}' has an invalid input_hash", key))
            })?;

            match key.parse::<FileFingerprint>() {
                Ok(key_fp) if key_fp != fp => {
                    warn!("Ledger key {} does not match its entry, re-keying to {}", key, fp);
                }
                Ok(_) => {}
                Err(_) => {
                    // Older logs were keyed by relative file name
                    debug!("Migrating filename-keyed ledger entry '{}' to {}", key, fp);
                    if entry.source_path.is_none() {
                        entry.source_path = Some(key.clone());
                    }
                }
            }

            if let Some(existing) = state.entries.get(&fp) {
                let keep_new = prefer_migrated(existing, &entry);
                warn!(
                    "Ledger has two entries for {} ({} and {}), keeping {}",
                    fp,
                    existing.source_path.as_deref().unwrap_or("?"),
                    entry.source_path.as_deref().unwrap_or("?"),
                    if keep_new { "the latter" } else { "the former" }
                );
                if !keep_new {
                    continue;
                }
            }
            state.insert(fp, entry);
        }

        info!("Loaded ledger {} with {} entries", path.display(), state.entries.len());
        Ok(Ledger {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// An empty ledger that will persist to `path` on first record
    pub fn empty(path: &Path) -> Ledger {
        Ledger {
            path: path.to_path_buf(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave the file half-written,
        // so the in-memory state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lookup(&self, fp: &FileFingerprint) -> Option<LedgerEntry> {
        self.lock().entries.get(fp).cloned()
    }

    /// True iff an entry for `fp` exists with `processed = true` and the
    /// caller did not ask to rerun everything
    pub fn should_skip(&self, fp: &FileFingerprint, force_rerun: bool) -> bool {
        if force_rerun {
            return false;
        }
        self.lock().entries.get(fp).map(|e| e.processed).unwrap_or(false)
    }

    /// The entry whose accepted output has fingerprint `fp`, if any
    pub fn produced_output(&self, fp: &FileFingerprint) -> Option<LedgerEntry> {
        let state = self.lock();
        state
            .outputs
            .get(fp)
            .and_then(|input| state.entries.get(input))
            .cloned()
    }

    /// The entry whose accepted output was recorded at `path` without an
    /// output fingerprint, e.g. entries migrated from filename-keyed logs
    pub fn produced_output_at(&self, path: &Path, size: u64) -> Option<LedgerEntry> {
        let name = path.file_name()?;
        let state = self.lock();
        state
            .output_names
            .get(name)?
            .iter()
            .filter_map(|input| state.entries.get(input))
            .find(|entry| entry.names_output(path, size))
            .cloned()
    }

    /// Upsert `entry` under its fingerprint and flush to disk before returning
    ///
    /// If the flush fails the in-memory ledger is rolled back so it keeps
    /// matching what is on disk.
    pub fn record(&self, entry: LedgerEntry) -> BatchResult<()> {
        let fp = entry.fingerprint().ok_or_else(|| BatchError::LedgerCorruption {
            path: self.path.clone(),
            reason: format!("refusing to record entry with invalid input_hash '{}'", entry.input_hash),
        })?;

        let mut state = self.lock();
        let previous = state.insert(fp, entry);
        if let Err(source) = self.persist(&state) {
            state.restore(fp, previous);
            return Err(BatchError::LedgerWrite {
                path: self.path.clone(),
                source,
            });
        }
        debug!("Ledger recorded {}", fp);
        Ok(())
    }

    pub fn snapshot_stats(&self) -> LedgerStats {
        let state = self.lock();
        let mut stats = LedgerStats {
            count: state.entries.len(),
            ..Default::default()
        };
        for entry in state.entries.values().filter(|e| e.processed) {
            stats.processed_count += 1;
            stats.total_bytes_saved += entry.size_difference.unwrap_or(0).max(0) as u64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write-to-temp, fsync, rename over the live file
    fn persist(&self, state: &LedgerState) -> std::io::Result<()> {
        let keyed: BTreeMap<String, &LedgerEntry> = state
            .entries
            .iter()
            .map(|(fp, entry)| (fp.to_string(), entry))
            .collect();
        let json = serde_json::to_vec_pretty(&keyed)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger.json".to_string());
        let tmp_path = dir.join(format!(".{}.tmp", file_name));

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            fs::remove_file(&tmp_path).ok();
            return Err(e);
        }

        #[cfg(unix)]
        if let Err(e) = File::open(&dir).and_then(|d| d.sync_all()) {
            debug!("Could not fsync ledger directory {}: {}", dir.display(), e);
        }

        Ok(())
    }
}
