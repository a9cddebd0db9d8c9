//! # Processor Configuration
//!
//! - [`ProcessorConfig`]: static, serde-loadable defaults for a processor instance
//! - [`ProcessingContext`]: per-session runtime record filled in while preparing

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::media::{Rotation, Size, VideoFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Static configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Name of the serialized worker thread
    pub pipeline_name: String,
    /// Frame rate used when the source track carries none
    pub default_fps: u32,
    /// Seconds between key frames when the source track carries none
    pub default_i_frame_interval: u32,
    /// Bits per pixel per frame, used to derive a bitrate when the source carries none
    pub bitrate_factor: f32,
    /// Carry the source audio track into the output
    pub keep_audio: bool,
    /// Texture format label of the rendering surface (`rgba8unorm` or `bgra8unorm`)
    pub surface_format: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "video-processor".to_string(),
            default_fps: 30,
            default_i_frame_interval: 2,
            bitrate_factor: 0.25,
            keep_audio: true,
            surface_format: "rgba8unorm".to_string(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline_name is empty".into()));
        }
        if self.default_fps == 0 || self.default_fps > 240 {
            return Err(ConfigError::Invalid(format!(
                "default_fps {} out of range 1..=240",
                self.default_fps
            )));
        }
        if self.default_i_frame_interval == 0 {
            return Err(ConfigError::Invalid("default_i_frame_interval must be > 0".into()));
        }
        if !(self.bitrate_factor > 0.0 && self.bitrate_factor <= 4.0) {
            return Err(ConfigError::Invalid(format!(
                "bitrate_factor {} out of range (0, 4]",
                self.bitrate_factor
            )));
        }
        match self.surface_format.as_str() {
            "rgba8unorm" | "bgra8unorm" => Ok(()),
            other => Err(ConfigError::Invalid(format!("unknown surface_format {other}"))),
        }
    }

    /// Bitrate for a picture size at a frame rate, from `bitrate_factor`
    pub fn derived_bitrate(&self, size: Size, fps: u32) -> u32 {
        let bits = size.pixels() as f64 * fps as f64 * self.bitrate_factor as f64;
        bits.clamp(64_000.0, u32::MAX as f64) as u32
    }
}

// ============================================================================
// Per-session context
// ============================================================================

/// Encoder-facing video parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub i_frame_interval: u32,
    pub bitrate: u32,
    pub profile: Option<u32>,
    pub level: Option<u32>,
}

impl VideoSettings {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Mutable record of one processing session.
///
/// Owned by the processor and only written from its worker; everyone else
/// gets a cloned snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProcessingContext {
    pub video: VideoSettings,
    pub orientation: Rotation,
    /// Coded size of the source before rotation
    pub source_size: Size,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub has_audio: bool,
}

impl ProcessingContext {
    pub fn new(config: &ProcessorConfig) -> Self {
        let mut ctx = Self::default();
        ctx.apply_defaults(config);
        ctx
    }

    fn apply_defaults(&mut self, config: &ProcessorConfig) {
        self.video.fps = config.default_fps;
        self.video.i_frame_interval = config.default_i_frame_interval;
    }

    pub fn is_horizontal(&self) -> bool {
        self.orientation.is_horizontal()
    }

    /// Record the source geometry; the target size becomes the rotated content size.
    pub fn apply_source(&mut self, format: &VideoFormat) {
        self.orientation = format.rotation;
        self.source_size = format.coded_size();
        let content = format.content_size();
        self.video.width = content.width;
        self.video.height = content.height;
    }

    /// Fill encoder parameters from the source track, keeping defaults where it is silent.
    pub fn apply_encoding(&mut self, format: &VideoFormat, config: &ProcessorConfig) {
        if let Some(fps) = format.frame_rate.filter(|f| *f > 0) {
            self.video.fps = fps;
        }
        if let Some(interval) = format.i_frame_interval.filter(|i| *i > 0) {
            self.video.i_frame_interval = interval;
        }
        self.video.bitrate = match format.bitrate.filter(|b| *b > 0) {
            Some(bitrate) => bitrate,
            None => config.derived_bitrate(self.video.size(), self.video.fps),
        };
        if format.profile.is_some() {
            self.video.profile = format.profile;
        }
        if format.level.is_some() {
            self.video.level = format.level;
        }
    }

    /// Drop everything learned during the session
    pub fn reset(&mut self, config: &ProcessorConfig) {
        *self = Self::new(config);
    }
}
