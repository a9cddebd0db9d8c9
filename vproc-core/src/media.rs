//! # Media Model
//!
//! Passive carriers shared by every stage of a processing session:
//! - [`Track`] describes one stream inside the source container
//! - [`Sample`] is one timed buffer travelling from a codec to the muxer
//! - [`Rotation`] is the display rotation hint attached to a video track

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Unsupported rotation: {0} degrees")]
    UnsupportedRotation(i32),
    #[error("Track {index} is not a {expected} track")]
    WrongTrackKind { index: u32, expected: TrackKind },
    #[error("Invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

// ============================================================================
// Geometry
// ============================================================================

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Display rotation of a video track, clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parse from degrees. Any multiple of 90 is accepted, negative values included.
    pub fn from_degrees(degrees: i32) -> Result<Self, FormatError> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(FormatError::UnsupportedRotation(degrees)),
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Landscape-preserving rotations keep the coded width/height as-is
    pub fn is_horizontal(&self) -> bool {
        matches!(self, Self::Deg0 | Self::Deg180)
    }

    /// Content size after applying this rotation to a coded size
    pub fn apply(&self, coded: Size) -> Size {
        if self.is_horizontal() {
            coded
        } else {
            coded.swapped()
        }
    }
}

// ============================================================================
// Tracks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => f.write_str("video"),
            TrackKind::Audio => f.write_str("audio"),
        }
    }
}

/// Codec carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Av1,
    Mpeg4Visual,
    Aac,
    Ac3,
    Eac3,
    Opus,
    Flac,
    Unknown,
}

impl Codec {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"avc1" | b"avc3" => Codec::H264,
            b"hvc1" | b"hev1" => Codec::H265,
            b"vp09" => Codec::Vp9,
            b"av01" => Codec::Av1,
            b"mp4v" => Codec::Mpeg4Visual,
            b"mp4a" => Codec::Aac,
            b"ac-3" => Codec::Ac3,
            b"ec-3" => Codec::Eac3,
            b"Opus" => Codec::Opus,
            b"fLaC" => Codec::Flac,
            _ => Codec::Unknown,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Codec::H264 => "video/avc",
            Codec::H265 => "video/hevc",
            Codec::Vp9 => "video/x-vnd.on2.vp9",
            Codec::Av1 => "video/av01",
            Codec::Mpeg4Visual => "video/mp4v-es",
            Codec::Aac => "audio/mp4a-latm",
            Codec::Ac3 => "audio/ac3",
            Codec::Eac3 => "audio/eac3",
            Codec::Opus => "audio/opus",
            Codec::Flac => "audio/flac",
            Codec::Unknown => "application/octet-stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Coded width (before rotation)
    pub width: u32,
    /// Coded height (before rotation)
    pub height: u32,
    pub rotation: Rotation,
    pub frame_rate: Option<u32>,
    pub i_frame_interval: Option<u32>,
    /// Average bitrate in bits per second
    pub bitrate: Option<u32>,
    pub profile: Option<u32>,
    pub level: Option<u32>,
    /// Codec configuration record (avcC/hvcC payload)
    #[serde(skip)]
    pub codec_config: Vec<u8>,
}

impl VideoFormat {
    pub fn coded_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Size of the picture as it should be displayed
    pub fn content_size(&self) -> Size {
        self.rotation.apply(self.coded_size())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: Option<u32>,
    #[serde(skip)]
    pub codec_config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// Format descriptor of one stream. Immutable once the demuxer hands it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Index of the track inside its container
    pub index: u32,
    pub codec: Codec,
    pub duration_us: i64,
    pub format: TrackFormat,
}

impl Track {
    pub fn kind(&self) -> TrackKind {
        match self.format {
            TrackFormat::Video(_) => TrackKind::Video,
            TrackFormat::Audio(_) => TrackKind::Audio,
        }
    }

    pub fn video(&self) -> Option<&VideoFormat> {
        match &self.format {
            TrackFormat::Video(v) => Some(v),
            TrackFormat::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioFormat> {
        match &self.format {
            TrackFormat::Audio(a) => Some(a),
            TrackFormat::Video(_) => None,
        }
    }

    pub fn require_video(&self) -> Result<&VideoFormat, FormatError> {
        self.video().ok_or(FormatError::WrongTrackKind {
            index: self.index,
            expected: TrackKind::Video,
        })
    }

    pub fn require_audio(&self) -> Result<&AudioFormat, FormatError> {
        self.audio().ok_or(FormatError::WrongTrackKind {
            index: self.index,
            expected: TrackKind::Audio,
        })
    }
}

// ============================================================================
// Samples
// ============================================================================

/// Per-sample flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleFlags(u8);

impl SampleFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(0x01);
    pub const CODEC_CONFIG: Self = Self(0x02);
    pub const END_OF_STREAM: Self = Self(0x04);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Timing and flag metadata of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
    /// Payload size in bytes
    pub size: usize,
    pub flags: SampleFlags,
}

impl SampleInfo {
    pub fn new(pts_us: i64, size: usize, flags: SampleFlags) -> Self {
        Self { pts_us, size, flags }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(SampleFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
    }
}

/// One timed buffer. Wraps exactly one payload and is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    info: SampleInfo,
    data: Bytes,
}

impl Sample {
    /// Wrap a payload; the recorded size always matches the payload.
    pub fn wrap(info: SampleInfo, data: Bytes) -> Self {
        let info = SampleInfo { size: data.len(), ..info };
        Self { info, data }
    }

    pub fn info(&self) -> &SampleInfo {
        &self.info
    }

    pub fn pts_us(&self) -> i64 {
        self.info.pts_us
    }

    pub fn flags(&self) -> SampleFlags {
        self.info.flags
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hand the payload to its next owner
    pub fn into_data(self) -> Bytes {
        self.data
    }
}
