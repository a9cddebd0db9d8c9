//! # MP4 Track Reader
//!
//! Walks the ISO-BMFF box tree (`.mp4`, `.m4v`, `.mov`) and turns the `moov`
//! metadata into [`Track`] descriptors. Sample data in `mdat` is never read;
//! decoders pull it themselves.
//!
//! ```text
//! moov
//! └─ trak
//!    ├─ tkhd            display matrix → rotation
//!    └─ mdia
//!       ├─ mdhd         timescale, duration
//!       ├─ hdlr         vide / soun
//!       └─ minf/stbl
//!          ├─ stsd      codec, dimensions, avcC/hvcC/esds
//!          ├─ stts      frame rate
//!          ├─ stsz      payload bytes → average bitrate
//!          └─ stss      key frame spacing
//! ```

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::demuxer::{ContainerKind, DemuxError, Demuxer};
use crate::media::{AudioFormat, Codec, Rotation, Track, TrackFormat, TrackKind, VideoFormat};

/// Refuse to buffer leaf boxes larger than this
const MAX_LEAF_SIZE: u64 = 64 * 1024 * 1024;

/// 16.16 fixed-point one
const FIXED_ONE: i32 = 0x0001_0000;

// ============================================================================
// Box header walking
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    kind: [u8; 4],
    /// Offset of the first payload byte
    payload: u64,
    /// Offset one past the box
    end: u64,
}

impl BoxHeader {
    fn payload_len(&self) -> u64 {
        self.end - self.payload
    }
}

struct BoxReader<R: Read + Seek> {
    reader: R,
    len: u64,
}

impl<R: Read + Seek> BoxReader<R> {
    fn new(mut reader: R) -> Result<Self, DemuxError> {
        let len = reader.seek(SeekFrom::End(0)).map_err(io_err)?;
        reader.seek(SeekFrom::Start(0)).map_err(io_err)?;
        Ok(Self { reader, len })
    }

    fn position(&mut self) -> Result<u64, DemuxError> {
        self.reader.stream_position().map_err(io_err)
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), DemuxError> {
        self.reader.seek(SeekFrom::Start(pos)).map_err(io_err)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DemuxError> {
        self.reader.read_exact(buf).map_err(io_err)
    }

    /// Read the header at the current position; `parent_end` bounds the box
    fn read_header(&mut self, parent_end: u64) -> Result<BoxHeader, DemuxError> {
        let start = self.position()?;
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
        let kind = [buf[4], buf[5], buf[6], buf[7]];

        let (size, header_len) = match size32 {
            // largesize follows the type
            1 => {
                let mut ext = [0u8; 8];
                self.read_exact(&mut ext)?;
                (u64::from_be_bytes(ext), 16)
            }
            // box runs to the end of its parent
            0 => (parent_end.saturating_sub(start), 8),
            n => (n, 8),
        };

        if size < header_len {
            return Err(DemuxError::Format(format!(
                "box '{}' at {} has size {}",
                fourcc_str(&kind),
                start,
                size
            )));
        }
        let end = start.checked_add(size).ok_or_else(|| {
            DemuxError::Format(format!("box '{}' at {} has size {}", fourcc_str(&kind), start, size))
        })?;
        if end > parent_end {
            return Err(DemuxError::Format(format!(
                "box '{}' at {} overruns its parent ({} > {})",
                fourcc_str(&kind),
                start,
                end,
                parent_end
            )));
        }

        Ok(BoxHeader { kind, payload: start + header_len, end })
    }

    /// Buffer a leaf box's payload
    fn read_payload(&mut self, header: &BoxHeader) -> Result<Vec<u8>, DemuxError> {
        let len = header.payload_len();
        if len > MAX_LEAF_SIZE {
            return Err(DemuxError::Format(format!(
                "box '{}' too large ({} bytes)",
                fourcc_str(&header.kind),
                len
            )));
        }
        self.seek_to(header.payload)?;
        let mut data = vec![0u8; len as usize];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    /// Visit every direct child of the range `[from, end)`
    fn children(&mut self, from: u64, end: u64) -> Result<Vec<BoxHeader>, DemuxError> {
        let mut out = Vec::new();
        let mut pos = from;
        while end.saturating_sub(pos) >= 8 {
            self.seek_to(pos)?;
            let header = self.read_header(end)?;
            pos = header.end;
            out.push(header);
        }
        Ok(out)
    }
}

fn io_err(e: std::io::Error) -> DemuxError {
    DemuxError::Io(e.to_string())
}

fn fourcc_str(kind: &[u8; 4]) -> String {
    kind.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

// ============================================================================
// Payload cursor
// ============================================================================

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DemuxError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| DemuxError::Format(format!("truncated {}", self.what)))?;
        let data = self.data;
        self.pos = end;
        Ok(&data[end - n..end])
    }

    fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DemuxError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DemuxError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DemuxError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DemuxError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    fn fourcc(&mut self) -> Result<[u8; 4], DemuxError> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn remaining(&self) -> &'a [u8] {
        let data = self.data;
        &data[self.pos..]
    }

    /// Version byte of a full box; the 24 flag bits are skipped
    fn full_box(&mut self) -> Result<u8, DemuxError> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }
}

// ============================================================================
// Per-trak accumulation
// ============================================================================

#[derive(Debug, Default)]
struct TrakInfo {
    handler: Option<TrackKind>,
    rotation: Rotation,
    tkhd_width: u32,
    tkhd_height: u32,
    timescale: u32,
    duration: u64,
    fourcc: Option<[u8; 4]>,
    width: u32,
    height: u32,
    channels: u16,
    sample_rate: u32,
    codec_config: Vec<u8>,
    profile: Option<u32>,
    level: Option<u32>,
    esds_bitrate: Option<u32>,
    sample_count: u64,
    total_delta: u64,
    total_bytes: u64,
    sync_samples: Vec<u32>,
}

impl TrakInfo {
    fn duration_us(&self) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        i64::try_from(self.duration as u128 * 1_000_000 / self.timescale as u128).unwrap_or(i64::MAX)
    }

    fn frame_rate(&self) -> Option<u32> {
        if self.total_delta == 0 || self.sample_count == 0 {
            return None;
        }
        let fps = self.sample_count as f64 * self.timescale as f64 / self.total_delta as f64;
        let fps = fps.round() as u32;
        (fps > 0).then_some(fps)
    }

    fn average_bitrate(&self) -> Option<u32> {
        let duration_us = self.duration_us();
        if duration_us <= 0 || self.total_bytes == 0 {
            return None;
        }
        let bps = self.total_bytes as u128 * 8 * 1_000_000 / duration_us as u128;
        u32::try_from(bps).ok()
    }

    /// Whole seconds between sync samples, when the track has a sync table
    fn i_frame_interval(&self) -> Option<u32> {
        let fps = self.frame_rate()?;
        if self.sync_samples.len() < 2 {
            return None;
        }
        let first = *self.sync_samples.first()?;
        let last = *self.sync_samples.last()?;
        let spacing = (last.saturating_sub(first)) as f64 / (self.sync_samples.len() - 1) as f64;
        Some(((spacing / fps as f64).round() as u32).max(1))
    }

    fn into_track(self, index: u32) -> Option<Track> {
        let kind = self.handler?;
        let codec = self.fourcc.as_ref().map(Codec::from_fourcc).unwrap_or(Codec::Unknown);
        let duration_us = self.duration_us();
        let format = match kind {
            TrackKind::Video => {
                let (width, height) = if self.width > 0 && self.height > 0 {
                    (self.width, self.height)
                } else {
                    (self.tkhd_width, self.tkhd_height)
                };
                TrackFormat::Video(VideoFormat {
                    width,
                    height,
                    rotation: self.rotation,
                    frame_rate: self.frame_rate(),
                    i_frame_interval: self.i_frame_interval(),
                    bitrate: self.average_bitrate(),
                    profile: self.profile,
                    level: self.level,
                    codec_config: self.codec_config,
                })
            }
            TrackKind::Audio => TrackFormat::Audio(AudioFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bitrate: self.esds_bitrate.or_else(|| self.average_bitrate()),
                codec_config: self.codec_config,
            }),
        };
        Some(Track { index, codec, duration_us, format })
    }
}

// ============================================================================
// Demuxer
// ============================================================================

#[derive(Debug)]
pub struct Mp4Demuxer {
    path: Option<PathBuf>,
    tracks: Vec<Track>,
    released: bool,
}

impl Mp4Demuxer {
    pub fn open(path: &Path) -> Result<Self, DemuxError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DemuxError::NotFound(path.to_path_buf()),
            _ => DemuxError::Io(format!("{}: {}", path.display(), e)),
        })?;
        let mut demuxer = Self::from_reader(BufReader::new(file))?;
        demuxer.path = Some(path.to_path_buf());
        debug!(path = %path.display(), tracks = demuxer.tracks.len(), "mp4 opened");
        Ok(demuxer)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, DemuxError> {
        let mut boxes = BoxReader::new(reader)?;
        let len = boxes.len;
        let top = boxes.children(0, len)?;
        let moov = top
            .iter()
            .find(|h| &h.kind == b"moov")
            .ok_or_else(|| DemuxError::Format("no moov box".into()))?;

        let mut tracks = Vec::new();
        let mut trak_index = 0u32;
        for child in boxes.children(moov.payload, moov.end)? {
            if &child.kind != b"trak" {
                continue;
            }
            let info = parse_trak(&mut boxes, &child)?;
            match info.into_track(trak_index) {
                Some(track) => tracks.push(track),
                None => debug!(index = trak_index, "skipping non audio/video track"),
            }
            trak_index += 1;
        }

        Ok(Self { path: None, tracks, released: false })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    fn first(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

impl Demuxer for Mp4Demuxer {
    fn container(&self) -> ContainerKind {
        ContainerKind::Mp4
    }

    fn video_track(&self) -> Result<Track, DemuxError> {
        if self.released {
            return Err(DemuxError::Released);
        }
        self.first(TrackKind::Video).cloned().ok_or(DemuxError::NoVideoTrack)
    }

    fn audio_track(&self) -> Option<Track> {
        if self.released {
            return None;
        }
        self.first(TrackKind::Audio).cloned()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.tracks.clear();
        }
    }
}

// ============================================================================
// Box parsers
// ============================================================================

fn parse_trak<R: Read + Seek>(boxes: &mut BoxReader<R>, trak: &BoxHeader) -> Result<TrakInfo, DemuxError> {
    let mut info = TrakInfo::default();
    for child in boxes.children(trak.payload, trak.end)? {
        match &child.kind {
            b"tkhd" => parse_tkhd(&boxes.read_payload(&child)?, &mut info)?,
            b"mdia" => parse_mdia(boxes, &child, &mut info)?,
            _ => {}
        }
    }
    Ok(info)
}

fn parse_mdia<R: Read + Seek>(
    boxes: &mut BoxReader<R>,
    mdia: &BoxHeader,
    info: &mut TrakInfo,
) -> Result<(), DemuxError> {
    let children = boxes.children(mdia.payload, mdia.end)?;
    // hdlr decides how stsd entries are read, so handle it before minf
    for child in children.iter().filter(|c| &c.kind == b"hdlr") {
        parse_hdlr(&boxes.read_payload(child)?, info)?;
    }
    for child in &children {
        match &child.kind {
            b"mdhd" => parse_mdhd(&boxes.read_payload(child)?, info)?,
            b"minf" => {
                for stbl in boxes.children(child.payload, child.end)? {
                    if &stbl.kind == b"stbl" {
                        parse_stbl(boxes, &stbl, info)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl<R: Read + Seek>(
    boxes: &mut BoxReader<R>,
    stbl: &BoxHeader,
    info: &mut TrakInfo,
) -> Result<(), DemuxError> {
    for child in boxes.children(stbl.payload, stbl.end)? {
        match &child.kind {
            b"stsd" => parse_stsd(&boxes.read_payload(&child)?, info)?,
            b"stts" => parse_stts(&boxes.read_payload(&child)?, info)?,
            b"stsz" => parse_stsz(&boxes.read_payload(&child)?, info)?,
            b"stss" => parse_stss(&boxes.read_payload(&child)?, info)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_tkhd(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "tkhd");
    let version = c.full_box()?;
    if version == 1 {
        c.skip(8 + 8 + 4 + 4 + 8)?; // times, track_ID, reserved, duration
    } else {
        c.skip(4 + 4 + 4 + 4 + 4)?;
    }
    c.skip(8 + 2 + 2 + 2 + 2)?; // reserved, layer, alternate_group, volume, reserved
    let mut matrix = [0i32; 9];
    for m in matrix.iter_mut() {
        *m = c.u32()? as i32;
    }
    info.rotation = rotation_from_matrix(&matrix);
    info.tkhd_width = c.u32()? / FIXED_ONE as u32;
    info.tkhd_height = c.u32()? / FIXED_ONE as u32;
    Ok(())
}

/// Display rotation encoded in a tkhd matrix `{a, b, u, c, d, v, x, y, w}`
fn rotation_from_matrix(matrix: &[i32; 9]) -> Rotation {
    let (a, b) = (matrix[0], matrix[1]);
    match (a.signum(), b.signum()) {
        (0, 1) => Rotation::Deg90,
        (-1, 0) => Rotation::Deg180,
        (0, -1) => Rotation::Deg270,
        (1, 0) => Rotation::Deg0,
        _ => {
            // Scaled or sheared matrix: snap to the nearest quarter turn
            let degrees = (b as f64).atan2(a as f64).to_degrees().round() as i32;
            let snapped = ((degrees + 45).rem_euclid(360) / 90) * 90;
            Rotation::from_degrees(snapped).unwrap_or_default()
        }
    }
}

fn parse_mdhd(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "mdhd");
    let version = c.full_box()?;
    if version == 1 {
        c.skip(16)?;
        info.timescale = c.u32()?;
        info.duration = c.u64()?;
    } else {
        c.skip(8)?;
        info.timescale = c.u32()?;
        info.duration = c.u32()? as u64;
    }
    Ok(())
}

fn parse_hdlr(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "hdlr");
    c.full_box()?;
    c.skip(4)?; // pre_defined
    info.handler = match &c.fourcc()? {
        b"vide" => Some(TrackKind::Video),
        b"soun" => Some(TrackKind::Audio),
        _ => None,
    };
    Ok(())
}

fn parse_stsd(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "stsd");
    c.full_box()?;
    let entries = c.u32()?;
    if entries == 0 {
        return Ok(());
    }
    let entry_size = c.u32()? as usize;
    let fourcc = c.fourcc()?;
    info.fourcc = Some(fourcc);
    let body = c.take(entry_size.saturating_sub(8))?;

    match info.handler {
        Some(TrackKind::Video) => parse_visual_entry(body, info),
        Some(TrackKind::Audio) => parse_audio_entry(body, info),
        None => Ok(()),
    }
}

fn parse_visual_entry(body: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(body, "visual sample entry");
    c.skip(6 + 2)?; // reserved, data_reference_index
    c.skip(2 + 2 + 12)?; // pre_defined, reserved, pre_defined
    info.width = c.u16()? as u32;
    info.height = c.u16()? as u32;
    c.skip(4 + 4 + 4 + 2 + 32 + 2 + 2)?;

    for (kind, payload) in child_boxes(c.remaining()) {
        match &kind {
            b"avcC" => {
                // configurationVersion, AVCProfileIndication, profile_compatibility, AVCLevelIndication
                if payload.len() >= 4 {
                    info.profile = Some(payload[1] as u32);
                    info.level = Some(payload[3] as u32);
                }
                info.codec_config = payload.to_vec();
            }
            b"hvcC" => {
                // general_profile_idc in byte 1, general_level_idc in byte 12
                if payload.len() >= 13 {
                    info.profile = Some((payload[1] & 0x1f) as u32);
                    info.level = Some(payload[12] as u32);
                }
                info.codec_config = payload.to_vec();
            }
            b"vpcC" | b"av1C" => info.codec_config = payload.to_vec(),
            _ => {}
        }
    }
    Ok(())
}

fn parse_audio_entry(body: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(body, "audio sample entry");
    c.skip(6 + 2)?; // reserved, data_reference_index
    let version = c.u16()?;
    c.skip(6)?;
    info.channels = c.u16()?;
    c.skip(2 + 2 + 2)?; // samplesize, pre_defined, reserved
    info.sample_rate = c.u32()? >> 16;
    // QuickTime sound description v1/v2 extensions
    match version {
        1 => c.skip(16)?,
        2 => c.skip(36)?,
        _ => {}
    }

    for (kind, payload) in child_boxes(c.remaining()) {
        match &kind {
            b"esds" => {
                info.codec_config = payload.to_vec();
                info.esds_bitrate = esds_average_bitrate(payload);
            }
            b"dOps" | b"dfLa" | b"dac3" | b"dec3" => info.codec_config = payload.to_vec(),
            _ => {}
        }
    }
    Ok(())
}

/// Split a buffer into `(type, payload)` boxes, stopping at the first malformed one
fn child_boxes(mut data: &[u8]) -> Vec<([u8; 4], &[u8])> {
    let mut out = Vec::new();
    while data.len() >= 8 {
        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let kind = [data[4], data[5], data[6], data[7]];
        if size < 8 || size > data.len() {
            warn!(kind = %fourcc_str(&kind), size, "malformed sample entry child");
            break;
        }
        out.push((kind, &data[8..size]));
        data = &data[size..];
    }
    out
}

/// avgBitrate of the DecoderConfigDescriptor inside an esds payload
fn esds_average_bitrate(esds: &[u8]) -> Option<u32> {
    fn descriptor_len(c: &mut Cursor<'_>) -> Option<usize> {
        let mut len = 0usize;
        for _ in 0..4 {
            let b = c.u8().ok()?;
            len = (len << 7) | (b & 0x7f) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        Some(len)
    }

    let mut c = Cursor::new(esds, "esds");
    c.full_box().ok()?;
    if c.u8().ok()? != 0x03 {
        return None;
    }
    descriptor_len(&mut c)?;
    c.skip(2).ok()?; // ES_ID
    let flags = c.u8().ok()?;
    if flags & 0x80 != 0 {
        c.skip(2).ok()?;
    }
    if flags & 0x40 != 0 {
        let url_len = c.u8().ok()? as usize;
        c.skip(url_len).ok()?;
    }
    if flags & 0x20 != 0 {
        c.skip(2).ok()?;
    }
    if c.u8().ok()? != 0x04 {
        return None;
    }
    descriptor_len(&mut c)?;
    c.skip(1 + 1 + 3 + 4).ok()?; // objectTypeIndication, streamType, bufferSizeDB, maxBitrate
    let avg = c.u32().ok()?;
    (avg > 0).then_some(avg)
}

fn overflow(what: &str) -> DemuxError {
    DemuxError::Format(format!("{what} overflows"))
}

fn parse_stts(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "stts");
    c.full_box()?;
    let entries = c.u32()?;
    for _ in 0..entries {
        let count = c.u32()? as u64;
        let delta = c.u32()? as u64;
        info.sample_count = info.sample_count.checked_add(count).ok_or_else(|| overflow("stts sample count"))?;
        info.total_delta = count
            .checked_mul(delta)
            .and_then(|span| info.total_delta.checked_add(span))
            .ok_or_else(|| overflow("stts duration"))?;
    }
    Ok(())
}

fn parse_stsz(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "stsz");
    c.full_box()?;
    let sample_size = c.u32()? as u64;
    let count = c.u32()? as u64;
    info.total_bytes = if sample_size != 0 {
        sample_size.checked_mul(count).ok_or_else(|| overflow("stsz total size"))?
    } else {
        let mut total = 0u64;
        for _ in 0..count {
            total = total.checked_add(c.u32()? as u64).ok_or_else(|| overflow("stsz total size"))?;
        }
        total
    };
    Ok(())
}

fn parse_stss(data: &[u8], info: &mut TrakInfo) -> Result<(), DemuxError> {
    let mut c = Cursor::new(data, "stss");
    c.full_box()?;
    let entries = c.u32()?;
    info.sync_samples = (0..entries).map(|_| c.u32()).collect::<Result<_, _>>()?;
    Ok(())
}
