//! # Muxer Adapter
//!
//! Interface of the container writer. The muxer receives audio samples from
//! the processor's bridge and encoded video from the encoder (it is the
//! encoder's [`EncodedSampleSink`]). Failures are reported through a
//! `(code, message)` listener instead of tearing the session down.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ProcessingContext;
use crate::encoder::EncodedSampleSink;
use crate::media::{AudioFormat, Sample, TrackKind};

pub const ERROR_NOT_READY: i32 = -1;
pub const ERROR_TRACK: i32 = -2;
pub const ERROR_WRITE: i32 = -3;
pub const ERROR_OUTPUT: i32 = -4;
pub const ERROR_RELEASED: i32 = -5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxerError {
    #[error("No output path configured")]
    NoOutput,
    #[error("Cannot open output {path}: {reason}")]
    Output { path: PathBuf, reason: String },
    #[error("{0} track already registered")]
    DuplicateTrack(TrackKind),
    #[error("Muxer not ready: waiting for {0} track")]
    NotReady(TrackKind),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Muxer released")]
    Released,
}

impl MuxerError {
    /// Code delivered to [`MuxerListener::on_error`]
    pub fn code(&self) -> i32 {
        match self {
            MuxerError::NoOutput | MuxerError::Output { .. } => ERROR_OUTPUT,
            MuxerError::DuplicateTrack(_) => ERROR_TRACK,
            MuxerError::NotReady(_) => ERROR_NOT_READY,
            MuxerError::Write(_) => ERROR_WRITE,
            MuxerError::Released => ERROR_RELEASED,
        }
    }
}

pub trait MuxerListener: Send + Sync {
    fn on_error(&self, code: i32, message: &str);
}

/// Container writer. Implementations gate writes on [`MuxerTracks`] and
/// answer a write before registration with [`MuxerError::NotReady`].
pub trait Muxer: EncodedSampleSink {
    fn add_audio_track(&self, format: &AudioFormat) -> Result<(), MuxerError>;

    fn write_audio_sample(&self, sample: Sample) -> Result<(), MuxerError>;

    /// Forget registered tracks and restart the output at the context's path
    fn reset(&self) -> Result<(), MuxerError>;

    /// Finalize the output. Idempotent.
    fn release(&self);

    fn set_listener(&self, listener: Arc<dyn MuxerListener>);

    /// This muxer as the encoder's output sink
    fn sample_sink(self: Arc<Self>) -> Arc<dyn EncodedSampleSink>;
}

pub trait MuxerFactory: Send + Sync {
    fn create(&self, ctx: &ProcessingContext) -> Result<Arc<dyn Muxer>, MuxerError>;
}

// ============================================================================
// Track registration gate
// ============================================================================

/// Tracks which streams are registered. Writes are valid only once the
/// video track and, when expected, the audio track are both present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxerTracks {
    expect_audio: bool,
    video: bool,
    audio: bool,
}

impl MuxerTracks {
    pub fn new(expect_audio: bool) -> Self {
        Self { expect_audio, video: false, audio: false }
    }

    pub fn register(&mut self, kind: TrackKind) -> Result<(), MuxerError> {
        let slot = match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        };
        if *slot {
            return Err(MuxerError::DuplicateTrack(kind));
        }
        *slot = true;
        if kind == TrackKind::Audio {
            self.expect_audio = true;
        }
        Ok(())
    }

    pub fn is_registered(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.video,
            TrackKind::Audio => self.audio,
        }
    }

    pub fn check_ready(&self) -> Result<(), MuxerError> {
        if !self.video {
            return Err(MuxerError::NotReady(TrackKind::Video));
        }
        if self.expect_audio && !self.audio {
            return Err(MuxerError::NotReady(TrackKind::Audio));
        }
        Ok(())
    }

    pub fn reset(&mut self, expect_audio: bool) {
        *self = Self::new(expect_audio);
    }
}
