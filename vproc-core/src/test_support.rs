//! Shared fixtures for unit tests: an ordered event log, in-memory
//! collaborators, and a minimal MP4 writer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ProcessingContext;
use crate::decoder::{
    AudioDecoder, AudioDecoderParams, DecoderError, DecoderFactory, DecoderKind, SampleEvent, SampleSender,
    VideoDecoder, VideoDecoderParams,
};
use crate::encoder::{EncodedSampleSink, Encoder, EncoderConfig, EncoderError, EncoderFactory, PreparedCallback};
use crate::media::{AudioFormat, Sample, SampleFlags, SampleInfo, Size, TrackKind, VideoFormat};
use crate::muxer::{Muxer, MuxerError, MuxerFactory, MuxerListener, MuxerTracks};
use crate::render::FrameRenderer;
use crate::surface::{GpuContext, RenderSurface, SurfaceError, SurfaceFactory, TextureId};

// ============================================================================
// Event log
// ============================================================================

/// Ordered record of `(event, thread name)` pairs shared by every mock
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        let thread = thread::current().name().unwrap_or("<unnamed>").to_string();
        self.events.lock().push((event.into(), thread));
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|(e, _)| e == event)
    }

    pub fn entries(&self) -> Vec<String> {
        self.events.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    /// Entries matching one of `events`, in log order
    pub fn filtered(&self, events: &[&str]) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| events.contains(&e.as_str()))
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|(e, _)| e == event).count()
    }

    /// Names of the threads `event` was logged from
    pub fn threads_of(&self, event: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// Surface
// ============================================================================

pub struct MockGpu;

pub struct MockSurface {
    size: Size,
    log: EventLog,
    context: GpuContext,
    released: bool,
}

impl MockSurface {
    pub fn new(size: Size, log: EventLog) -> Self {
        Self { size, log, context: GpuContext::new(Arc::new(MockGpu)), released: false }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    fn live(&self) -> Result<(), SurfaceError> {
        if self.released {
            Err(SurfaceError::Released)
        } else {
            Ok(())
        }
    }
}

impl RenderSurface for MockSurface {
    fn make_current(&self) -> Result<(), SurfaceError> {
        self.live()?;
        self.log.push("surface.make_current");
        Ok(())
    }

    fn context(&self) -> GpuContext {
        self.context.clone()
    }

    fn size(&self) -> Size {
        self.size
    }

    fn input_texture(&self) -> TextureId {
        TextureId(1)
    }

    fn frame_buffer(&self) -> TextureId {
        TextureId(2)
    }

    fn frame_buffer_texture(&self) -> TextureId {
        TextureId(3)
    }

    fn write_input(&mut self, pixels: &[u8]) -> Result<(), SurfaceError> {
        self.live()?;
        let expected = self.size.width as usize * self.size.height as usize * 4;
        if pixels.len() != expected {
            return Err(SurfaceError::FrameSize { expected, got: pixels.len() });
        }
        self.log.push("surface.write_input");
        Ok(())
    }

    fn update_texture(&mut self) -> Result<(), SurfaceError> {
        self.live()?;
        self.log.push("surface.update_texture");
        Ok(())
    }

    fn update_location(&mut self, _ctx: &ProcessingContext) -> Result<(), SurfaceError> {
        self.live()?;
        self.log.push("surface.update_location");
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.log.push("surface.release");
        }
    }
}

#[derive(Default)]
pub struct MockSurfaceFactory {
    log: EventLog,
    sizes: Mutex<Vec<Size>>,
}

impl MockSurfaceFactory {
    pub fn new(log: EventLog) -> Self {
        Self { log, sizes: Mutex::new(Vec::new()) }
    }

    pub fn sizes(&self) -> Vec<Size> {
        self.sizes.lock().clone()
    }
}

impl SurfaceFactory for MockSurfaceFactory {
    fn create(&self, size: Size) -> Result<Box<dyn RenderSurface>, SurfaceError> {
        if size.is_empty() {
            return Err(SurfaceError::InvalidSize(size));
        }
        self.sizes.lock().push(size);
        self.log.push("surface.create");
        Ok(Box::new(MockSurface::new(size, self.log.clone())))
    }
}

// ============================================================================
// Decoders
// ============================================================================

/// Emits events from its own thread until `count` is reached or it is stopped
struct Emitter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Emitter {
    fn spawn(name: &str, body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))
            .expect("spawn mock decoder");
        Self { stop, handle: Some(handle) }
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct MockVideoDecoder {
    log: EventLog,
    size: Size,
    frames: usize,
    fail_prepare: bool,
    prepared: bool,
    renderer: FrameRenderer,
    sink: Option<SampleSender>,
    emitter: Option<Emitter>,
}

impl VideoDecoder for MockVideoDecoder {
    fn prepare(&mut self) -> Result<(), DecoderError> {
        if self.fail_prepare {
            return Err(DecoderError::Configure { kind: DecoderKind::Video, reason: "mock".into() });
        }
        self.prepared = true;
        self.log.push("video.prepare");
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        if !self.prepared {
            return Err(DecoderError::NotPrepared(DecoderKind::Video));
        }
        let Some(sink) = self.sink.take() else {
            return Err(DecoderError::Released(DecoderKind::Video));
        };
        self.log.push("video.start");
        let (frames, renderer) = (self.frames, self.renderer.clone());
        let log = self.log.clone();
        self.emitter = Some(Emitter::spawn("mock-video-decoder", move |stop| {
            for i in 0..frames {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let pts = i as i64 * 33_333;
                let (sink, log) = (sink.clone(), log.clone());
                let submitted = renderer.render(pts, move |rendered| {
                    if rendered.is_ok() {
                        log.push("filter.draw");
                    }
                    let _ = sink.send(SampleEvent::video(SampleInfo::new(pts, 0, SampleFlags::NONE)));
                });
                if submitted.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut emitter) = self.emitter.take() {
            emitter.join();
        }
        self.sink = None;
        self.log.push("video.release");
    }

    fn width(&self) -> u32 {
        self.size.width
    }

    fn height(&self) -> u32 {
        self.size.height
    }
}

pub struct MockAudioDecoder {
    log: EventLog,
    samples: usize,
    sample_rate: u32,
    channels: u16,
    prepared: bool,
    sink: Option<SampleSender>,
    emitter: Option<Emitter>,
}

impl AudioDecoder for MockAudioDecoder {
    fn prepare(&mut self) -> Result<(), DecoderError> {
        self.prepared = true;
        self.log.push("audio.prepare");
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        if !self.prepared {
            return Err(DecoderError::NotPrepared(DecoderKind::Audio));
        }
        let Some(sink) = self.sink.take() else {
            return Err(DecoderError::Released(DecoderKind::Audio));
        };
        self.log.push("audio.start");
        let samples = self.samples;
        self.emitter = Some(Emitter::spawn("mock-audio-decoder", move |stop| {
            for i in 0..samples {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let info = SampleInfo::new(i as i64 * 21_333, 1, SampleFlags::NONE);
                if sink.send(SampleEvent::audio(info, Bytes::from(vec![i as u8]))).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut emitter) = self.emitter.take() {
            emitter.join();
        }
        self.sink = None;
        self.log.push("audio.release");
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

pub struct MockDecoderFactory {
    log: EventLog,
    pub video_frames: usize,
    pub audio_samples: usize,
    pub fail_video_prepare: bool,
    target_sizes: Mutex<Vec<Size>>,
}

impl MockDecoderFactory {
    pub fn new(log: EventLog) -> Self {
        Self { log, video_frames: 30, audio_samples: 40, fail_video_prepare: false, target_sizes: Mutex::new(Vec::new()) }
    }

    pub fn target_sizes(&self) -> Vec<Size> {
        self.target_sizes.lock().clone()
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn create_video(&self, params: VideoDecoderParams) -> Result<Box<dyn VideoDecoder>, DecoderError> {
        self.target_sizes.lock().push(params.target_size);
        Ok(Box::new(MockVideoDecoder {
            log: self.log.clone(),
            size: params.target_size,
            frames: self.video_frames,
            fail_prepare: self.fail_video_prepare,
            prepared: false,
            renderer: params.renderer,
            sink: Some(params.sink),
            emitter: None,
        }))
    }

    fn create_audio(&self, params: AudioDecoderParams) -> Result<Box<dyn AudioDecoder>, DecoderError> {
        let format = params.track.audio().cloned().unwrap_or_default();
        Ok(Box::new(MockAudioDecoder {
            log: self.log.clone(),
            samples: self.audio_samples,
            sample_rate: format.sample_rate,
            channels: format.channels,
            prepared: false,
            sink: Some(params.sink),
            emitter: None,
        }))
    }
}

// ============================================================================
// Encoder
// ============================================================================

pub struct MockEncoder {
    log: EventLog,
    config: EncoderConfig,
    sink: Option<Arc<dyn EncodedSampleSink>>,
    started: AtomicBool,
    stopped: AtomicBool,
    frames: Mutex<Vec<i64>>,
}

impl MockEncoder {
    fn with_config(log: EventLog, config: EncoderConfig, sink: Option<Arc<dyn EncodedSampleSink>>) -> Self {
        Self {
            log,
            config,
            sink,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Already started, not attached to any factory or sink
    pub fn standalone(log: EventLog) -> Arc<Self> {
        let config = EncoderConfig {
            width: 640,
            height: 480,
            fps: 30,
            i_frame_interval: 1,
            bitrate: 1_000_000,
            profile: None,
            level: None,
            context: GpuContext::new(Arc::new(MockGpu)),
            source_texture: TextureId(3),
        };
        let encoder = Self::with_config(log, config, None);
        encoder.started.store(true, Ordering::SeqCst);
        Arc::new(encoder)
    }

    pub fn frames(&self) -> Vec<i64> {
        self.frames.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Encoder for MockEncoder {
    fn start(&self) -> Result<(), EncoderError> {
        self.log.push("encoder.start");
        self.started.store(true, Ordering::SeqCst);
        if let Some(sink) = &self.sink {
            sink.on_format_changed(&VideoFormat {
                width: self.config.width,
                height: self.config.height,
                frame_rate: Some(self.config.fps),
                bitrate: Some(self.config.bitrate),
                ..Default::default()
            });
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.log.push("encoder.stop");
        }
    }

    fn on_frame_available(&self, pts_us: i64) -> Result<(), EncoderError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(EncoderError::NotPrepared);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EncoderError::Stopped);
        }
        self.frames.lock().push(pts_us);
        if let Some(sink) = &self.sink {
            let info = SampleInfo::new(pts_us, 0, SampleFlags::NONE);
            sink.write_video_sample(Sample::wrap(info, Bytes::new()));
        }
        Ok(())
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

pub struct MockEncoderFactory {
    log: EventLog,
    /// Number of upcoming `create` calls that fail
    pub failures: AtomicUsize,
    configs: Mutex<Vec<EncoderConfig>>,
    encoders: Mutex<Vec<Arc<MockEncoder>>>,
}

impl MockEncoderFactory {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            failures: AtomicUsize::new(0),
            configs: Mutex::new(Vec::new()),
            encoders: Mutex::new(Vec::new()),
        }
    }

    pub fn configs(&self) -> Vec<EncoderConfig> {
        self.configs.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEncoder>> {
        self.encoders.lock().last().cloned()
    }
}

impl EncoderFactory for MockEncoderFactory {
    fn create(
        &self,
        config: EncoderConfig,
        on_prepared: PreparedCallback,
        sink: Option<Arc<dyn EncodedSampleSink>>,
    ) -> Result<Arc<dyn Encoder>, EncoderError> {
        self.configs.lock().push(config.clone());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.log.push("encoder.create_failed");
            return Err(EncoderError::Configure("mock".into()));
        }

        let encoder = Arc::new(MockEncoder::with_config(self.log.clone(), config, sink));
        self.encoders.lock().push(Arc::clone(&encoder));
        self.log.push("encoder.create");
        // The hardware session reports readiness asynchronously
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            on_prepared();
        });
        Ok(encoder)
    }
}

// ============================================================================
// Muxer
// ============================================================================

pub struct MockMuxer {
    log: EventLog,
    tracks: Mutex<MuxerTracks>,
    listener: Mutex<Option<Arc<dyn MuxerListener>>>,
    audio: Mutex<Vec<Sample>>,
    video: Mutex<Vec<i64>>,
    audio_tracks: AtomicUsize,
    resets: AtomicUsize,
    releases: AtomicUsize,
    released: AtomicBool,
}

impl MockMuxer {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            tracks: Mutex::new(MuxerTracks::new(false)),
            listener: Mutex::new(None),
            audio: Mutex::new(Vec::new()),
            video: Mutex::new(Vec::new()),
            audio_tracks: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn audio_samples(&self) -> Vec<Sample> {
        self.audio.lock().clone()
    }

    pub fn video_pts(&self) -> Vec<i64> {
        self.video.lock().clone()
    }

    pub fn audio_track_count(&self) -> usize {
        self.audio_tracks.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, kind: TrackKind) -> bool {
        self.tracks.lock().is_registered(kind)
    }

    /// Raise an error through the installed listener
    pub fn report(&self, error: &MuxerError) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.on_error(error.code(), &error.to_string());
        }
    }
}

impl EncodedSampleSink for MockMuxer {
    fn on_format_changed(&self, _format: &VideoFormat) {
        if let Err(e) = self.tracks.lock().register(TrackKind::Video) {
            self.report(&e);
        }
        self.log.push("muxer.video_track");
    }

    fn write_video_sample(&self, sample: Sample) {
        if self.released.load(Ordering::SeqCst) {
            self.report(&MuxerError::Released);
            return;
        }
        self.video.lock().push(sample.pts_us());
    }
}

impl Muxer for MockMuxer {
    fn add_audio_track(&self, _format: &AudioFormat) -> Result<(), MuxerError> {
        self.tracks.lock().register(TrackKind::Audio)?;
        self.audio_tracks.fetch_add(1, Ordering::SeqCst);
        self.log.push("muxer.audio_track");
        Ok(())
    }

    fn write_audio_sample(&self, sample: Sample) -> Result<(), MuxerError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(MuxerError::Released);
        }
        self.audio.lock().push(sample);
        Ok(())
    }

    fn reset(&self) -> Result<(), MuxerError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.tracks.lock().reset(false);
        self.audio.lock().clear();
        self.video.lock().clear();
        self.log.push("muxer.reset");
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            self.log.push("muxer.release");
        }
    }

    fn set_listener(&self, listener: Arc<dyn MuxerListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn sample_sink(self: Arc<Self>) -> Arc<dyn EncodedSampleSink> {
        self
    }
}

pub struct MockMuxerFactory {
    log: EventLog,
    muxers: Mutex<Vec<Arc<MockMuxer>>>,
    outputs: Mutex<Vec<PathBuf>>,
}

impl MockMuxerFactory {
    pub fn new(log: EventLog) -> Self {
        Self { log, muxers: Mutex::new(Vec::new()), outputs: Mutex::new(Vec::new()) }
    }

    pub fn created(&self) -> usize {
        self.muxers.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockMuxer>> {
        self.muxers.lock().last().cloned()
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.lock().clone()
    }
}

impl MuxerFactory for MockMuxerFactory {
    fn create(&self, ctx: &ProcessingContext) -> Result<Arc<dyn Muxer>, MuxerError> {
        let path = ctx.output_path.clone().ok_or(MuxerError::NoOutput)?;
        self.outputs.lock().push(path);
        let muxer = MockMuxer::new(self.log.clone());
        self.muxers.lock().push(Arc::clone(&muxer));
        self.log.push("muxer.create");
        Ok(muxer)
    }
}

// ============================================================================
// MP4 fixture
// ============================================================================

const FIXED_ONE: i32 = 0x0001_0000;

/// Writes the `moov` metadata of a small MP4; there is no sample data.
#[derive(Debug, Clone)]
pub struct Mp4Fixture {
    video: Option<(u32, u32)>,
    rotation: i32,
    fps: u32,
    frames: u32,
    sample_size: u32,
    key_frame_every: Option<u32>,
    audio: Option<(u32, u16)>,
}

impl Mp4Fixture {
    /// 60 frames at 30 fps
    pub fn video(width: u32, height: u32) -> Self {
        Self {
            video: Some((width, height)),
            rotation: 0,
            fps: 30,
            frames: 60,
            sample_size: 4_000,
            key_frame_every: None,
            audio: None,
        }
    }

    pub fn audio_only(sample_rate: u32, channels: u16) -> Self {
        Self { video: None, audio: Some((sample_rate, channels)), ..Self::video(0, 0) }
    }

    pub fn rotated(mut self, degrees: i32) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn sample_size(mut self, bytes: u32) -> Self {
        self.sample_size = bytes;
        self
    }

    pub fn key_frame_every(mut self, frames: u32) -> Self {
        self.key_frame_every = Some(frames);
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio = Some((sample_rate, channels));
        self
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).expect("write mp4 fixture");
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let mut ftyp = Vec::new();
        ftyp.extend_from_slice(b"isom");
        ftyp.extend_from_slice(&0x200u32.to_be_bytes());
        ftyp.extend_from_slice(b"isomavc1");

        let duration_s = self.frames / self.fps.max(1);
        let mut moov = mvhd(duration_s * 1_000);
        let mut track_id = 1;
        if let Some((w, h)) = self.video {
            moov.extend(self.video_trak(track_id, w, h));
            track_id += 1;
        }
        if let Some((rate, channels)) = self.audio {
            moov.extend(audio_trak(track_id, rate, channels, duration_s));
        }

        let mut out = mp4_box(b"ftyp", &ftyp);
        out.extend(mp4_box(b"moov", &moov));
        out.extend(mp4_box(b"mdat", &[]));
        out
    }

    fn video_trak(&self, track_id: u32, width: u32, height: u32) -> Vec<u8> {
        let (a, b, c, d) = match self.rotation.rem_euclid(360) {
            90 => (0, FIXED_ONE, -FIXED_ONE, 0),
            180 => (-FIXED_ONE, 0, 0, -FIXED_ONE),
            270 => (0, -FIXED_ONE, FIXED_ONE, 0),
            _ => (FIXED_ONE, 0, 0, FIXED_ONE),
        };
        let tkhd = tkhd(track_id, [a, b, 0, c, d, 0, 0, 0, 0x4000_0000], width, height);

        let timescale = self.fps * 1_000;
        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&(width as u16).to_be_bytes());
        entry.extend_from_slice(&(height as u16).to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&[0u8; 4]);
        entry.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        entry.extend_from_slice(&[0u8; 32]);
        entry.extend_from_slice(&0x18u16.to_be_bytes());
        entry.extend_from_slice(&0xffffu16.to_be_bytes());
        entry.extend(mp4_box(b"avcC", &[1, 100, 0, 40, 0xff, 0xe0, 0]));

        let mut stbl = stsd(b"avc1", &entry);
        stbl.extend(table(b"stts", &[1, self.frames, 1_000]));
        stbl.extend(table(b"stsz", &[self.sample_size, self.frames]));
        if let Some(every) = self.key_frame_every.filter(|n| *n > 0) {
            let keys: Vec<u32> = (0..self.frames).step_by(every as usize).map(|i| i + 1).collect();
            let mut body = vec![keys.len() as u32];
            body.extend(keys);
            stbl.extend(table(b"stss", &body));
        }

        trak(tkhd, mdhd(timescale, self.frames * 1_000), b"vide", stbl)
    }
}

fn audio_trak(track_id: u32, rate: u32, channels: u16, duration_s: u32) -> Vec<u8> {
    let identity = [FIXED_ONE, 0, 0, 0, FIXED_ONE, 0, 0, 0, 0x4000_0000];
    let tkhd = tkhd(track_id, identity, 0, 0);

    let mut entry = vec![0u8; 6];
    entry.extend_from_slice(&1u16.to_be_bytes());
    entry.extend_from_slice(&0u16.to_be_bytes()); // version
    entry.extend_from_slice(&[0u8; 6]);
    entry.extend_from_slice(&channels.to_be_bytes());
    entry.extend_from_slice(&16u16.to_be_bytes());
    entry.extend_from_slice(&[0u8; 4]);
    entry.extend_from_slice(&(rate << 16).to_be_bytes());
    entry.extend(mp4_box(b"esds", &esds(128_000)));

    let samples = rate * duration_s / 1_024;
    let mut stbl = stsd(b"mp4a", &entry);
    stbl.extend(table(b"stts", &[1, samples, 1_024]));
    stbl.extend(table(b"stsz", &[400, samples]));

    trak(tkhd, mdhd(rate, rate * duration_s), b"soun", stbl)
}

fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// Version 0 full box whose body is a run of u32 fields
fn table(kind: &[u8; 4], fields: &[u32]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    for f in fields {
        payload.extend_from_slice(&f.to_be_bytes());
    }
    mp4_box(kind, &payload)
}

fn mvhd(duration_ms: u32) -> Vec<u8> {
    let mut p = vec![0u8; 4];
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&1_000u32.to_be_bytes());
    p.extend_from_slice(&duration_ms.to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    p.extend_from_slice(&0x0100u16.to_be_bytes());
    p.extend_from_slice(&[0u8; 10]);
    for m in [FIXED_ONE, 0, 0, 0, FIXED_ONE, 0, 0, 0, 0x4000_0000] {
        p.extend_from_slice(&m.to_be_bytes());
    }
    p.extend_from_slice(&[0u8; 24]);
    p.extend_from_slice(&3u32.to_be_bytes());
    mp4_box(b"mvhd", &p)
}

fn tkhd(track_id: u32, matrix: [i32; 9], width: u32, height: u32) -> Vec<u8> {
    let mut p = vec![0, 0, 0, 3];
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&track_id.to_be_bytes());
    p.extend_from_slice(&[0u8; 8]); // reserved, duration
    p.extend_from_slice(&[0u8; 16]); // reserved, layer, alternate_group, volume, reserved
    for m in matrix {
        p.extend_from_slice(&m.to_be_bytes());
    }
    p.extend_from_slice(&(width << 16).to_be_bytes());
    p.extend_from_slice(&(height << 16).to_be_bytes());
    mp4_box(b"tkhd", &p)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut p = vec![0u8; 4];
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&0x55c4u16.to_be_bytes());
    p.extend_from_slice(&[0u8; 2]);
    mp4_box(b"mdhd", &p)
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut p = vec![0u8; 8];
    p.extend_from_slice(handler);
    p.extend_from_slice(&[0u8; 12]);
    p.push(0);
    mp4_box(b"hdlr", &p)
}

fn stsd(fourcc: &[u8; 4], entry: &[u8]) -> Vec<u8> {
    let mut p = vec![0u8; 4];
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend(mp4_box(fourcc, entry));
    mp4_box(b"stsd", &p)
}

fn trak(tkhd: Vec<u8>, mdhd: Vec<u8>, handler: &[u8; 4], stbl_children: Vec<u8>) -> Vec<u8> {
    let minf = mp4_box(b"minf", &mp4_box(b"stbl", &stbl_children));
    let mut mdia = mdhd;
    mdia.extend(hdlr(handler));
    mdia.extend(minf);
    let mut body = tkhd;
    body.extend(mp4_box(b"mdia", &mdia));
    mp4_box(b"trak", &body)
}

/// ES_Descriptor carrying an AAC-LC DecoderConfigDescriptor
fn esds(avg_bitrate: u32) -> Vec<u8> {
    let mut dcd = vec![0x40, 0x15, 0, 0, 0];
    dcd.extend_from_slice(&avg_bitrate.to_be_bytes()); // maxBitrate
    dcd.extend_from_slice(&avg_bitrate.to_be_bytes());
    dcd.extend_from_slice(&[0x05, 2, 0x12, 0x10]);

    let mut es = vec![0, 1, 0]; // ES_ID, flags
    es.push(0x04);
    es.push(dcd.len() as u8);
    es.extend(dcd);
    es.extend_from_slice(&[0x06, 1, 0x02]);

    let mut p = vec![0u8; 4];
    p.push(0x03);
    p.push(es.len() as u8);
    p.extend(es);
    p
}
