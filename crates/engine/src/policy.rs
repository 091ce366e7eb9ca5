use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchResult};

/// Every profile scales to this height
pub const TARGET_HEIGHT: u32 = 1080;
/// Canvas width for the letterboxed profile
pub const CANVAS_WIDTH: u32 = 1920;

const OUTPUT_EXTENSION: &str = "mp4";

/// User-selectable encoder mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderMode {
    /// NVENC HEVC with CUDA decode and scaling
    Cuda,
    /// libx265 on the CPU
    X265,
    /// libx265, letterboxed onto a 1920x1080 canvas
    Smart,
}

impl EncoderMode {
    pub const ALL: [EncoderMode; 3] = [EncoderMode::Cuda, EncoderMode::X265, EncoderMode::Smart];

    pub fn name(&self) -> &'static str {
        match self {
            EncoderMode::Cuda => "cuda",
            EncoderMode::X265 => "x265",
            EncoderMode::Smart => "smart",
        }
    }
}

impl Default for EncoderMode {
    fn default() -> Self {
        EncoderMode::Cuda
    }
}

impl fmt::Display for EncoderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncoderMode {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(EncoderMode::Cuda),
            "x265" => Ok(EncoderMode::X265),
            "smart" => Ok(EncoderMode::Smart),
            other => {
                let known: Vec<&str> = EncoderMode::ALL.iter().map(|m| m.name()).collect();
                Err(BatchError::Configuration(format!(
                    "unknown encoder '{}' (expected one of: {})",
                    other,
                    known.join(", ")
                )))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectPolicy {
    /// Scale to the target height, width follows the source aspect
    Preserve,
    /// Fit inside 1920x1080 and pad the rest with black
    PadTo16x9,
}

/// Resolved encoder parameters for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingProfile {
    pub mode: EncoderMode,
    pub acceleration: Acceleration,
    pub target_height: u32,
    pub aspect_policy: AspectPolicy,
    pub output_suffix: &'static str,
}

/// Scaled picture size and the canvas it is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl FrameGeometry {
    pub fn is_padded(&self) -> bool {
        self.scaled_width != self.canvas_width || self.scaled_height != self.canvas_height
    }
}

/// Resolve a mode name into its profile, failing fast on unknown names
pub fn resolve(mode_name: &str) -> BatchResult<EncodingProfile> {
    Ok(EncodingProfile::for_mode(mode_name.parse()?))
}

/// Round to the nearest even integer, never below 2
pub fn nearest_even(value: f64) -> u32 {
    let even = ((value / 2.0).round() * 2.0) as u32;
    even.max(2)
}

impl EncodingProfile {
    pub fn for_mode(mode: EncoderMode) -> Self {
        match mode {
            EncoderMode::Cuda => EncodingProfile {
                mode,
                acceleration: Acceleration::Gpu,
                target_height: TARGET_HEIGHT,
                aspect_policy: AspectPolicy::Preserve,
                output_suffix: "_1080p_web_gpu",
            },
            EncoderMode::X265 => EncodingProfile {
                mode,
                acceleration: Acceleration::Cpu,
                target_height: TARGET_HEIGHT,
                aspect_policy: AspectPolicy::Preserve,
                output_suffix: "_1080p_web",
            },
            EncoderMode::Smart => EncodingProfile {
                mode,
                acceleration: Acceleration::Cpu,
                target_height: TARGET_HEIGHT,
                aspect_policy: AspectPolicy::PadTo16x9,
                output_suffix: "_1080p_smart",
            },
        }
    }

    /// Output geometry for a source of `width` x `height`
    ///
    /// Scaled widths are always even; chroma subsampling in the target codecs
    /// rejects odd widths.
    pub fn target_geometry(&self, width: u32, height: u32) -> Option<FrameGeometry> {
        if width == 0 || height == 0 {
            return None;
        }
        let aspect = width as f64 / height as f64;

        match self.aspect_policy {
            AspectPolicy::Preserve => {
                let scaled_width = nearest_even(aspect * self.target_height as f64);
                Some(FrameGeometry {
                    scaled_width,
                    scaled_height: self.target_height,
                    canvas_width: scaled_width,
                    canvas_height: self.target_height,
                    pad_x: 0,
                    pad_y: 0,
                })
            }
            AspectPolicy::PadTo16x9 => {
                let canvas_width = CANVAS_WIDTH;
                let canvas_height = self.target_height;
                let scale = f64::min(
                    canvas_width as f64 / width as f64,
                    canvas_height as f64 / height as f64,
                );
                let scaled_width = nearest_even(width as f64 * scale).min(canvas_width);
                let scaled_height = nearest_even(height as f64 * scale).min(canvas_height);
                Some(FrameGeometry {
                    scaled_width,
                    scaled_height,
                    canvas_width,
                    canvas_height,
                    pad_x: (canvas_width - scaled_width) / 2,
                    pad_y: (canvas_height - scaled_height) / 2,
                })
            }
        }
    }

    /// Where the output for `input` goes: beside it, or under `output_dir`
    pub fn output_path(&self, input: &Path, output_dir: Option<&Path>) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = format!("{}{}.{}", stem, self.output_suffix, OUTPUT_EXTENSION);
        match output_dir {
            Some(dir) => dir.join(file_name),
            None => input.with_file_name(file_name),
        }
    }

    /// Video filter chain, with explicit sizes when the source size is known
    pub fn filter_chain(&self, source: Option<(u32, u32)>) -> String {
        let geometry = source.and_then(|(w, h)| self.target_geometry(w, h));

        match (self.mode, geometry) {
            (EncoderMode::Cuda, Some(g)) => format!("scale_cuda={}:{}", g.scaled_width, g.scaled_height),
            (EncoderMode::Cuda, None) => format!("scale_cuda=-2:{}", self.target_height),
            (EncoderMode::X265, Some(g)) => format!("scale={}:{}", g.scaled_width, g.scaled_height),
            (EncoderMode::X265, None) => format!("scale=-2:{}", self.target_height),
            (EncoderMode::Smart, Some(g)) => format!(
                "scale={}:{},pad={}:{}:{}:{}:black,setsar=1",
                g.scaled_width, g.scaled_height, g.canvas_width, g.canvas_height, g.pad_x, g.pad_y
            ),
            (EncoderMode::Smart, None) => format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease:force_divisible_by=2,\
                 pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1",
                w = CANVAS_WIDTH,
                h = self.target_height
            ),
        }
    }

    /// Full ffmpeg argument list (without the binary) for one job
    pub fn build_command(&self, input: &Path, output: &Path, source: Option<(u32, u32)>) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-nostdin".into()];

        if self.acceleration == Acceleration::Gpu {
            args.extend(
                ["-vsync", "0", "-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        args.push("-i".into());
        args.push(input.to_string_lossy().into_owned());

        args.push("-vf".into());
        args.push(self.filter_chain(source));

        let codec: &[&str] = match self.acceleration {
            Acceleration::Gpu => &[
                "-c:v", "hevc_nvenc", "-preset", "p4", "-rc", "vbr_hq", "-cq", "24", "-b:v", "0",
            ],
            Acceleration::Cpu => &["-c:v", "libx265", "-preset", "medium", "-crf", "24"],
        };
        args.extend(codec.iter().map(|s| s.to_string()));

        args.extend(
            ["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart", "-f", "mp4"]
                .iter()
                .map(|s| s.to_string()),
        );

        args.push(output.to_string_lossy().into_owned());
        args
    }
}
