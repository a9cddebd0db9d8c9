//! # Encoder Unit
//!
//! Interface of the hardware encode session. The encoder is driven, not
//! pulled: the processor calls [`Encoder::on_frame_available`] once per
//! rendered frame and the encoder reads the bound source texture itself.
//! Encoded output goes straight to an [`EncodedSampleSink`] (the muxer).

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ProcessingContext;
use crate::media::{Sample, Size, VideoFormat};
use crate::surface::{GpuContext, TextureId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    #[error("Invalid encoder config: {0}")]
    InvalidConfig(String),
    #[error("Encoder configure failed: {0}")]
    Configure(String),
    #[error("Encoder not prepared")]
    NotPrepared,
    #[error("Encoder stopped")]
    Stopped,
    #[error("Encode failed: {0}")]
    EncodeFailed(String),
}

// ============================================================================
// Configuration bundle
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Seconds between key frames
    pub i_frame_interval: u32,
    /// Bits per second
    pub bitrate: u32,
    pub profile: Option<u32>,
    pub level: Option<u32>,
    /// Rendering context the source texture lives in
    #[serde(skip)]
    pub context: GpuContext,
    #[serde(skip)]
    pub source_texture: TextureId,
}

impl EncoderConfig {
    /// Bundle the session's video settings with the GPU binding
    pub fn from_context(ctx: &ProcessingContext, context: GpuContext, source_texture: TextureId) -> Self {
        Self {
            width: ctx.video.width,
            height: ctx.video.height,
            fps: ctx.video.fps,
            i_frame_interval: ctx.video.i_frame_interval,
            bitrate: ctx.video.bitrate,
            profile: ctx.video.profile,
            level: ctx.video.level,
            context,
            source_texture,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<(), EncoderError> {
        if self.size().is_empty() {
            return Err(EncoderError::InvalidConfig(format!("empty frame size {}", self.size())));
        }
        if self.fps == 0 {
            return Err(EncoderError::InvalidConfig("fps is 0".into()));
        }
        if self.bitrate == 0 {
            return Err(EncoderError::InvalidConfig("bitrate is 0".into()));
        }
        Ok(())
    }

    /// Frames between key frames
    pub fn gop_length(&self) -> u32 {
        self.fps.saturating_mul(self.i_frame_interval.max(1))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Receiver of encoded video
pub trait EncodedSampleSink: Send + Sync {
    /// Output format is known; registers the video track
    fn on_format_changed(&self, format: &VideoFormat);

    fn write_video_sample(&self, sample: Sample);
}

/// One-shot signal that the hardware session accepts frames
pub type PreparedCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait Encoder: Send + Sync {
    fn start(&self) -> Result<(), EncoderError>;

    /// Drain and stop. Idempotent.
    fn stop(&self);

    /// Encode whatever is currently on the source texture
    fn on_frame_available(&self, pts_us: i64) -> Result<(), EncoderError>;

    fn config(&self) -> &EncoderConfig;
}

pub trait EncoderFactory: Send + Sync {
    fn create(
        &self,
        config: EncoderConfig,
        on_prepared: PreparedCallback,
        sink: Option<Arc<dyn EncodedSampleSink>>,
    ) -> Result<Arc<dyn Encoder>, EncoderError>;
}
