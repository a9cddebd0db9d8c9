//! Demuxer facade: container detection and the track interface the processor reads.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::media::Track;
use crate::mp4_demux::Mp4Demuxer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DemuxError {
    #[error("Input not found: {0}")]
    NotFound(PathBuf),
    #[error("Read error: {0}")]
    Io(String),
    #[error("Malformed container: {0}")]
    Format(String),
    #[error("Unsupported container: {0}")]
    Unsupported(String),
    #[error("No video track")]
    NoVideoTrack,
    #[error("Demuxer released")]
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Mp4,
}

impl ContainerKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" | "mov" | "3gp" => Some(ContainerKind::Mp4),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ContainerKind::Mp4 => "MP4",
        }
    }
}

pub trait Demuxer: Send {
    fn container(&self) -> ContainerKind;

    /// The first video track
    fn video_track(&self) -> Result<Track, DemuxError>;

    /// The first audio track, if the container has one
    fn audio_track(&self) -> Option<Track>;

    /// Close the input. Idempotent.
    fn release(&mut self);
}

pub trait DemuxerFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, DemuxError>;
}

/// Picks the container reader from the file extension
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDemuxerFactory;

impl DemuxerFactory for DefaultDemuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, DemuxError> {
        if !path.exists() {
            return Err(DemuxError::NotFound(path.to_path_buf()));
        }
        match ContainerKind::from_path(path) {
            Some(ContainerKind::Mp4) => Ok(Box::new(Mp4Demuxer::open(path)?)),
            None => Err(DemuxError::Unsupported(
                path.extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("<none>")
                    .to_string(),
            )),
        }
    }
}
