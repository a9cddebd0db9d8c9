//! # Decoder Units
//!
//! Interface of the hardware decode sessions the processor drives.
//!
//! A decoder runs on its own thread once started and reports every decoded
//! sample as a [`SampleEvent`] on its output channel. Video decoders hand each
//! frame to their [`FrameRenderer`] and emit the event from its completion
//! callback, once the frame is latched and filtered, so video events carry
//! timing only. Audio events carry the decoded payload.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use thiserror::Error;

use crate::media::{SampleInfo, Size, Track};
use crate::render::FrameRenderer;
use crate::surface::{GpuContext, TextureId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoderError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("{kind} decoder configure failed: {reason}")]
    Configure { kind: DecoderKind, reason: String },
    #[error("{0} decoder not prepared")]
    NotPrepared(DecoderKind),
    #[error("{0} decoder already released")]
    Released(DecoderKind),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
}

/// Which decoder an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    Video,
    Audio,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderKind::Video => f.write_str("video"),
            DecoderKind::Audio => f.write_str("audio"),
        }
    }
}

// ============================================================================
// Sample events
// ============================================================================

#[derive(Debug, Clone)]
pub struct SampleEvent {
    pub decoder: DecoderKind,
    pub info: SampleInfo,
    /// Decoded payload; audio only
    pub payload: Option<Bytes>,
}

impl SampleEvent {
    pub fn video(info: SampleInfo) -> Self {
        Self { decoder: DecoderKind::Video, info, payload: None }
    }

    pub fn audio(info: SampleInfo, payload: Bytes) -> Self {
        Self { decoder: DecoderKind::Audio, info, payload: Some(payload) }
    }
}

pub type SampleSender = Sender<SampleEvent>;
pub type SampleReceiver = Receiver<SampleEvent>;

/// Output channel of one decoder
pub fn sample_channel() -> (SampleSender, SampleReceiver) {
    crossbeam_channel::unbounded()
}

// ============================================================================
// Decoder traits
// ============================================================================

pub trait VideoDecoder: Send {
    /// Configure the hardware session; resolves the output dimensions
    fn prepare(&mut self) -> Result<(), DecoderError>;

    /// Begin producing samples
    fn start(&mut self) -> Result<(), DecoderError>;

    /// Stop producing and free the hardware session. Idempotent.
    fn release(&mut self);

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }
}

pub trait AudioDecoder: Send {
    fn prepare(&mut self) -> Result<(), DecoderError>;

    fn start(&mut self) -> Result<(), DecoderError>;

    fn release(&mut self);

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// Everything a video decoder is bound to
pub struct VideoDecoderParams {
    pub track: Track,
    /// Rotated content size of the session
    pub target_size: Size,
    /// Context the decoder writes `input_texture` through
    pub context: GpuContext,
    pub input_texture: TextureId,
    /// Every decoded frame goes through here before its event is sent
    pub renderer: FrameRenderer,
    pub sink: SampleSender,
}

pub struct AudioDecoderParams {
    pub track: Track,
    pub sink: SampleSender,
}

pub trait DecoderFactory: Send + Sync {
    fn create_video(&self, params: VideoDecoderParams) -> Result<Box<dyn VideoDecoder>, DecoderError>;

    fn create_audio(&self, params: AudioDecoderParams) -> Result<Box<dyn AudioDecoder>, DecoderError>;
}
