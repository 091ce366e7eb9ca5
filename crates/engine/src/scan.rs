use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BatchError, BatchResult};

/// Video file extensions picked up by discovery
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "flv", "wmv", "webm", "mpeg", "mpg", "m4v"];

pub fn default_extensions() -> Vec<String> {
    VIDEO_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

/// Case-insensitive extension check against `extensions` (no leading dot)
pub fn has_video_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Lazy producer of candidate paths under one root
///
/// The root is validated up front; walking happens only while the
/// iterator is consumed.
#[derive(Debug, Clone)]
pub struct Discoverer {
    root: PathBuf,
    recursive: bool,
    extensions: Vec<String>,
    single_file: bool,
}

impl Discoverer {
    /// Fails with `Discovery` if the root is missing or unreadable, and with
    /// `Configuration` for a single file that is not a recognised video.
    pub fn new(root: &Path, recursive: bool, extensions: Vec<String>) -> BatchResult<Self> {
        let metadata = fs::metadata(root).map_err(|source| BatchError::Discovery {
            path: root.to_path_buf(),
            source,
        })?;

        let single_file = metadata.is_file();
        if single_file {
            if !has_video_extension(root, &extensions) {
                return Err(BatchError::Configuration(format!(
                    "{} does not have a recognised video extension ({})",
                    root.display(),
                    extensions.join(", ")
                )));
            }
        } else {
            // Surface permission problems now rather than as a silent empty walk
            fs::read_dir(root).map_err(|source| BatchError::Discovery {
                path: root.to_path_buf(),
                source,
            })?;
        }

        Ok(Discoverer {
            root: root.to_path_buf(),
            recursive,
            extensions,
            single_file,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate files in file-name order
    pub fn iter(&self) -> Box<dyn Iterator<Item = PathBuf> + Send> {
        if self.single_file {
            return Box::new(std::iter::once(self.root.clone()));
        }

        info!("Scanning directory: {}", self.root.display());
        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let extensions = self.extensions.clone();

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| has_video_extension(entry.path(), &extensions))
            .map(|entry| {
                debug!("Found media file: {}", entry.path().display());
                entry.into_path()
            });

        Box::new(walker)
    }

    /// Number of candidates, for progress totals. Walks the tree once
    /// without keeping the paths.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}
