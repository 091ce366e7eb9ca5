use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchResult};
use crate::policy::EncoderMode;
use crate::scan;

/// Configuration for a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Ledger file, relative paths resolve against the working directory
    pub ledger_path: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Encoder mode name: cuda, x265 or smart
    pub encoder: String,
    /// Maximum number of encoder processes running at once
    pub concurrency: usize,
    /// Where outputs go; alongside each input when unset
    pub output_dir: Option<PathBuf>,
    pub recursive: bool,
    /// Delete inputs once their processed entry is on disk
    pub delete_input: bool,
    /// Re-transcode files the ledger already marks processed
    pub force_rerun: bool,
    /// Exit non-zero when any job failed
    pub strict: bool,
    /// Directory for the detailed and errors-only log files
    pub log_dir: Option<PathBuf>,
    /// Recognised video extensions, without the leading dot
    pub extensions: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl BatchConfig {
    pub fn default_config() -> Self {
        Self {
            ledger_path: PathBuf::from("process_log.json"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encoder: EncoderMode::default().name().to_string(),
            concurrency: 1,
            output_dir: None,
            recursive: true,
            delete_input: false,
            force_rerun: false,
            strict: false,
            log_dir: None,
            extensions: scan::default_extensions(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                config = if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?
                } else {
                    serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?
                };
            }
        }

        Ok(config)
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> BatchResult<()> {
        if self.concurrency == 0 {
            return Err(BatchError::Configuration("concurrency must be at least 1".to_string()));
        }
        self.encoder_mode()?;
        if self.extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(BatchError::Configuration("no video extensions configured".to_string()));
        }
        if let Some(dir) = &self.output_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(BatchError::Configuration(format!(
                    "output directory {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn encoder_mode(&self) -> BatchResult<EncoderMode> {
        self.encoder.parse()
    }

    /// Extensions lower-cased with any leading dot stripped
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}
