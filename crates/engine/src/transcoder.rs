use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::ffprobe;
use crate::policy::EncodingProfile;

/// Number of trailing stderr lines kept for failure reports
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// What the encoder process reported
#[derive(Debug, Clone, Default)]
pub struct TranscodeOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Tail of the encoder's stderr
    pub diagnostics: String,
}

/// Runs one transcode to completion
///
/// `Err` means the encoder could not be run at all; a process that ran and
/// failed is an `Ok` with `success == false`.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path, profile: &EncodingProfile) -> Result<TranscodeOutput>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 7.0.2-static" -> FFmpegVersion { major: 7, minor: 0, patch: 2 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        let mut parts = version_part.split('.').map(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u32>()
        });

        let major = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

impl fmt::Display for FFmpegVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Transcoder backed by local ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf) -> Self {
        FfmpegTranscoder { ffmpeg_bin, ffprobe_bin }
    }

    /// Check that ffmpeg runs and report its version
    pub async fn detect_version(&self) -> Result<FFmpegVersion> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        FFmpegVersion::parse(first_line)
    }

    async fn source_dimensions(&self, input: &Path) -> Option<(u32, u32)> {
        match ffprobe::probe_file(&self.ffprobe_bin, input).await {
            Ok(data) => data.video_dimensions(),
            Err(e) => {
                warn!("Could not probe {}, letting ffmpeg pick the width: {:#}", input.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path, profile: &EncodingProfile) -> Result<TranscodeOutput> {
        let source = self.source_dimensions(input).await;
        if let Some((w, h)) = source {
            if let Some(g) = profile.target_geometry(w, h) {
                if g.is_padded() {
                    debug!(
                        "{}: {}x{} -> {}x{}, padded to {}x{}",
                        input.display(),
                        w,
                        h,
                        g.scaled_width,
                        g.scaled_height,
                        g.canvas_width,
                        g.canvas_height
                    );
                } else {
                    debug!("{}: {}x{} -> {}x{}", input.display(), w, h, g.scaled_width, g.scaled_height);
                }
            }
        }

        let args = profile.build_command(input, output, source);
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // Own process group: a terminal Ctrl-C must reach only the batch
        // controller so a running encode can finish.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            )
        })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == DIAGNOSTIC_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = child.wait().await.context("Failed to wait for FFmpeg process")?;
        let diagnostics = stderr_handle.await.context("Failed to read FFmpeg stderr")?;

        Ok(TranscodeOutput {
            success: status.success(),
            exit_code: status.code(),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_version_parsing() {
        let v1 = FFmpegVersion::parse("ffmpeg version 6.1").unwrap();
        assert_eq!((v1.major, v1.minor, v1.patch), (6, 1, 0));

        let v2 = FFmpegVersion::parse("ffmpeg version 7.0.2-static https://johnvansickle.com").unwrap();
        assert_eq!((v2.major, v2.minor, v2.patch), (7, 0, 2));

        assert!(FFmpegVersion::parse("ffmpeg version N-a").is_err());
    }

    proptest! {
        #[test]
        fn test_version_display_parses_back(major in 0u32..100, minor in 0u32..100, patch in 0u32..100) {
            let v = FFmpegVersion { major, minor, patch };
            let parsed = FFmpegVersion::parse(&format!("ffmpeg version {}", v)).unwrap();
            prop_assert_eq!(parsed, v);
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"x").unwrap();

        let transcoder = FfmpegTranscoder::new(
            dir.path().join("no-such-ffmpeg"),
            dir.path().join("no-such-ffprobe"),
        );
        let profile = crate::policy::resolve("x265").unwrap();
        let result = transcoder
            .transcode(&input, &dir.path().join("out.mp4.part"), &profile)
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_raised() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\necho 'Unknown encoder hevc_nvenc' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"x").unwrap();

        let transcoder = FfmpegTranscoder::new(fake, dir.path().join("no-such-ffprobe"));
        let profile = crate::policy::resolve("cuda").unwrap();
        let out = transcoder
            .transcode(&input, &dir.path().join("out.mp4.part"), &profile)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.diagnostics.contains("Unknown encoder"));
    }
}
