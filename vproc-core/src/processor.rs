//! # Video Processor
//!
//! Orchestrates one transcode session: demux → decode → filter → encode → mux.
//!
//! ```text
//!  prepare()          save()                    prepared signal
//!     │                 │                             │
//!  ┌──▼─────────────────▼─────────────────────────────▼──┐
//!  │ EventPipeline (one worker, FIFO)                   │
//!  │  open input → surface → video decoder → filter     │
//!  │  muxer → encoder        start encoder/video/audio  │
//!  └────────────────────────────────────────────────────┘
//!          decoders ──channel──► SampleBridge ──► encoder / muxer
//! ```
//!
//! States: Idle → Preparing → Ready → Encoding → Releasing → Released.
//! The session and every handle it owns is only touched from the pipeline
//! worker; callers see a published [`ProcessorState`] snapshot.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeStats, BridgeTargets, SampleBridge};
use crate::config::{ConfigError, ProcessingContext, ProcessorConfig};
use crate::decoder::{
    sample_channel, AudioDecoder, AudioDecoderParams, DecoderError, DecoderFactory, DecoderKind, VideoDecoder,
    VideoDecoderParams,
};
use crate::demuxer::{DefaultDemuxerFactory, DemuxError, Demuxer, DemuxerFactory};
use crate::encoder::{Encoder, EncoderConfig, EncoderError, EncoderFactory};
use crate::filter::{Filter, FilterError, FilterInfo, FilterSlot, NormalFilter};
use crate::media::{FormatError, Track};
use crate::muxer::{Muxer, MuxerError, MuxerFactory, MuxerListener};
use crate::pipeline::{EventPipeline, PipelineError};
use crate::render::{share_surface, FrameRenderer, SharedSurface};
use crate::surface::{RenderSurface, SurfaceError, SurfaceFactory};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    #[error("Input not found: {0}")]
    InputNotFound(String),
    #[error("Operation not allowed while {0:?}")]
    InvalidState(ProcessorState),
    #[error("Processor not prepared")]
    NotPrepared,
    #[error("Already encoding")]
    AlreadyEncoding,
    #[error("No active filter")]
    NoActiveFilter,
    #[error("Processor released")]
    Released,
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    #[error("Muxer error {code}: {message}")]
    MuxerReported { code: i32, message: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Muxer(#[from] MuxerError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

impl From<ConfigError> for ProcessorError {
    fn from(e: ConfigError) -> Self {
        ProcessorError::Config(e.to_string())
    }
}

// ============================================================================
// Public state & listener
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessorState {
    Idle,
    Preparing,
    Ready,
    Encoding,
    Releasing,
    Released,
}

/// Observer of state changes and reported errors.
///
/// Called from the pipeline worker for queued work and from the caller's
/// thread for rejected calls. Must not block.
pub trait ProcessorListener: Send + Sync {
    fn on_state_changed(&self, _from: ProcessorState, _to: ProcessorState) {}

    fn on_error(&self, error: &ProcessorError) {
        error!("Processor error: {}", error);
    }
}

/// Listener that only logs
#[derive(Debug, Default)]
pub struct LogListener;

impl ProcessorListener for LogListener {}

/// Tracks of the prepared input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTracks {
    pub video: Track,
    pub audio: Option<Track>,
}

/// Completion callback of [`VideoProcessor::save`]
pub type SaveCallback = Box<dyn FnOnce(Result<(), ProcessorError>) + Send + 'static>;

// ============================================================================
// Session
// ============================================================================

/// Everything acquired by a successful prepare
struct Session {
    video_demuxer: Box<dyn Demuxer>,
    audio_demuxer: Option<Box<dyn Demuxer>>,
    video_track: Track,
    audio_track: Option<Track>,
    surface: SharedSurface,
    video_decoder: Box<dyn VideoDecoder>,
    audio_decoder: Option<Box<dyn AudioDecoder>>,
    muxer: Option<Arc<dyn Muxer>>,
}

enum SessionState {
    Idle,
    Ready(Box<Session>),
    Encoding {
        session: Box<Session>,
        encoder: Arc<dyn Encoder>,
        generation: u64,
    },
    Released,
}

impl SessionState {
    fn kind(&self) -> ProcessorState {
        match self {
            SessionState::Idle => ProcessorState::Idle,
            SessionState::Ready(_) => ProcessorState::Ready,
            SessionState::Encoding { .. } => ProcessorState::Encoding,
            SessionState::Released => ProcessorState::Released,
        }
    }
}

/// Demuxers and tracks of an opened input
struct OpenedInput {
    path: PathBuf,
    video_demuxer: Box<dyn Demuxer>,
    audio_demuxer: Option<Box<dyn Demuxer>>,
    video_track: Track,
    audio_track: Option<Track>,
}

impl OpenedInput {
    fn release(mut self) {
        if let Some(d) = self.audio_demuxer.as_mut() {
            d.release();
        }
        self.video_demuxer.release();
    }
}

/// Forwards muxer `(code, message)` reports to the processor listener
struct MuxerErrorForwarder {
    listener: Arc<dyn ProcessorListener>,
}

impl MuxerListener for MuxerErrorForwarder {
    fn on_error(&self, code: i32, message: &str) {
        warn!(code, "Muxer error: {}", message);
        self.listener.on_error(&ProcessorError::MuxerReported {
            code,
            message: message.to_string(),
        });
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ProcessorBuilder {
    config: ProcessorConfig,
    demuxers: Arc<dyn DemuxerFactory>,
    decoders: Option<Arc<dyn DecoderFactory>>,
    encoders: Option<Arc<dyn EncoderFactory>>,
    muxers: Option<Arc<dyn MuxerFactory>>,
    surfaces: Option<Arc<dyn SurfaceFactory>>,
    listener: Arc<dyn ProcessorListener>,
}

impl ProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            demuxers: Arc::new(DefaultDemuxerFactory),
            decoders: None,
            encoders: None,
            muxers: None,
            surfaces: None,
            listener: Arc::new(LogListener),
        }
    }

    pub fn demuxers(mut self, factory: Arc<dyn DemuxerFactory>) -> Self {
        self.demuxers = factory;
        self
    }

    pub fn decoders(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = Some(factory);
        self
    }

    pub fn encoders(mut self, factory: Arc<dyn EncoderFactory>) -> Self {
        self.encoders = Some(factory);
        self
    }

    pub fn muxers(mut self, factory: Arc<dyn MuxerFactory>) -> Self {
        self.muxers = Some(factory);
        self
    }

    pub fn surfaces(mut self, factory: Arc<dyn SurfaceFactory>) -> Self {
        self.surfaces = Some(factory);
        self
    }

    /// Use a headless wgpu device for the rendering surface
    #[cfg(feature = "wgpu-surface")]
    pub fn wgpu_surfaces(self) -> Result<Self, ProcessorError> {
        let factory = crate::gpu::WgpuSurfaceFactory::new(&self.config.surface_format)?;
        Ok(self.surfaces(Arc::new(factory)))
    }

    pub fn listener(mut self, listener: Arc<dyn ProcessorListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> Result<VideoProcessor, ProcessorError> {
        self.config.validate()?;
        let decoders = self.decoders.ok_or(ProcessorError::MissingCollaborator("decoder factory"))?;
        let encoders = self.encoders.ok_or(ProcessorError::MissingCollaborator("encoder factory"))?;
        let muxers = self.muxers.ok_or(ProcessorError::MissingCollaborator("muxer factory"))?;
        let surfaces = self.surfaces.ok_or(ProcessorError::MissingCollaborator("surface factory"))?;

        let pipeline = Arc::new(EventPipeline::new(self.config.pipeline_name.clone())?);
        let targets = Arc::new(BridgeTargets::new());
        let bridge = SampleBridge::new(self.config.pipeline_name.clone(), Arc::clone(&targets));

        let inner = Arc::new(Inner {
            context: RwLock::new(ProcessingContext::new(&self.config)),
            config: self.config,
            demuxers: self.demuxers,
            decoders,
            encoders,
            muxers,
            surfaces,
            listener: self.listener,
            pipeline,
            filters: Arc::new(FilterSlot::new()),
            targets,
            bridge,
            session: Mutex::new(SessionState::Idle),
            state: RwLock::new(ProcessorState::Idle),
            tracks: RwLock::new(None),
            input_path: Mutex::new(None),
            generation: AtomicU64::new(0),
            released: AtomicBool::new(false),
        });

        Ok(VideoProcessor { inner })
    }
}

// ============================================================================
// Processor
// ============================================================================

pub struct VideoProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProcessorConfig,
    context: RwLock<ProcessingContext>,
    demuxers: Arc<dyn DemuxerFactory>,
    decoders: Arc<dyn DecoderFactory>,
    encoders: Arc<dyn EncoderFactory>,
    muxers: Arc<dyn MuxerFactory>,
    surfaces: Arc<dyn SurfaceFactory>,
    listener: Arc<dyn ProcessorListener>,
    pipeline: Arc<EventPipeline>,
    filters: Arc<FilterSlot>,
    targets: Arc<BridgeTargets>,
    bridge: SampleBridge,
    /// Worker-only
    session: Mutex<SessionState>,
    /// Published snapshot of the session state
    state: RwLock<ProcessorState>,
    tracks: RwLock<Option<SessionTracks>>,
    input_path: Mutex<Option<PathBuf>>,
    generation: AtomicU64,
    released: AtomicBool,
}

impl VideoProcessor {
    pub fn builder(config: ProcessorConfig) -> ProcessorBuilder {
        ProcessorBuilder::new(config)
    }

    /// Set the source file. Rejected if it does not exist.
    pub fn set_input_resource(&self, path: impl AsRef<Path>) -> Result<(), ProcessorError> {
        let path = path.as_ref();
        self.inner.check_live()?;
        if !path.is_file() {
            return Err(self.inner.rejected(ProcessorError::InputNotFound(path.display().to_string())));
        }
        debug!(path = %path.display(), "input resource set");
        *self.inner.input_path.lock() = Some(path.to_path_buf());
        Ok(())
    }

    /// Queue session preparation; completion is published as `Ready`.
    pub fn prepare(&self) -> Result<(), ProcessorError> {
        self.inner.check_live()?;
        let state = self.state();
        if state != ProcessorState::Idle {
            return Err(self.inner.rejected(ProcessorError::InvalidState(state)));
        }
        match self.inner.input_path.lock().as_ref() {
            Some(path) if path.is_file() => {}
            Some(path) => {
                return Err(self.inner.rejected(ProcessorError::InputNotFound(path.display().to_string())))
            }
            None => return Err(self.inner.rejected(ProcessorError::InputNotFound("<unset>".into()))),
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .pipeline
            .submit(move || inner.prepare_task())
            .map_err(|e| self.inner.rejected(e.into()))
    }

    /// Queue output configuration. `on_done` runs exactly once with the outcome.
    pub fn save<F>(&self, output_path: impl Into<PathBuf>, on_done: F)
    where
        F: FnOnce(Result<(), ProcessorError>) + Send + 'static,
    {
        let output_path = output_path.into();
        let on_done: SaveCallback = Box::new(on_done);
        if let Err(e) = self.inner.check_live() {
            on_done(Err(e));
            return;
        }

        // Shared so a rejected submit can still hand the callback its error
        let slot = Arc::new(Mutex::new(Some(on_done)));
        let task_slot = Arc::clone(&slot);
        let inner = Arc::clone(&self.inner);
        let submitted = self.inner.pipeline.submit(move || {
            let result = inner.save_task(output_path);
            if let Err(e) = &result {
                inner.report(e);
            }
            if let Some(on_done) = task_slot.lock().take() {
                on_done(result);
            }
        });
        if let Err(e) = submitted {
            let e = self.inner.rejected(e.into());
            if let Some(on_done) = slot.lock().take() {
                on_done(Err(e));
            }
        }
    }

    /// Queue a filter swap
    pub fn set_filter(&self, filter: Box<dyn Filter>) -> Result<(), ProcessorError> {
        self.inner.check_live()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .pipeline
            .submit(move || {
                if let Err(e) = inner.install_filter(filter) {
                    inner.report(&e);
                }
            })
            .map_err(|e| self.inner.rejected(e.into()))
    }

    /// Snapshot of the active filter, taken under the filter lock
    pub fn get_filter(&self) -> Option<FilterInfo> {
        self.inner.filters.info()
    }

    /// Run `f` against the live filter under the filter lock
    pub fn with_filter<R>(&self, f: impl FnOnce(&mut dyn Filter) -> R) -> Option<R> {
        self.inner.filters.with_filter(f)
    }

    /// Finalize the muxer, tear the session down and stop the worker. Idempotent.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("releasing processor");

        if let Some(muxer) = self.inner.targets.take_muxer() {
            muxer.release();
        }

        let inner = Arc::clone(&self.inner);
        if let Err(e) = self.inner.pipeline.submit(move || inner.teardown()) {
            warn!("teardown not queued: {}", e);
        }
        self.inner.pipeline.terminate();
        self.inner.bridge.stop();
    }

    pub fn state(&self) -> ProcessorState {
        *self.inner.state.read()
    }

    pub fn context(&self) -> ProcessingContext {
        self.inner.context.read().clone()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn tracks(&self) -> Option<SessionTracks> {
        self.inner.tracks.read().clone()
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.inner.bridge.stats()
    }

    /// Block until every task queued so far has run
    pub fn wait_idle(&self) -> Result<(), ProcessorError> {
        Ok(self.inner.pipeline.flush()?)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl Drop for VideoProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for VideoProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoProcessor")
            .field("state", &self.state())
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

// ============================================================================
// Worker-side operations
// ============================================================================

impl Inner {
    fn check_live(&self) -> Result<(), ProcessorError> {
        if self.released.load(Ordering::SeqCst) {
            Err(self.rejected(ProcessorError::Released))
        } else {
            Ok(())
        }
    }

    /// Report a rejected call and hand the error back to the caller
    fn rejected(&self, error: ProcessorError) -> ProcessorError {
        self.report(&error);
        error
    }

    fn report(&self, error: &ProcessorError) {
        warn!("{}", error);
        self.listener.on_error(error);
    }

    fn publish(&self, to: ProcessorState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            info!(?from, ?to, "processor state changed");
            self.listener.on_state_changed(from, to);
        }
    }

    fn take_session(&self) -> SessionState {
        std::mem::replace(&mut *self.session.lock(), SessionState::Idle)
    }

    fn put_session(&self, state: SessionState) {
        let kind = state.kind();
        *self.session.lock() = state;
        self.publish(kind);
    }

    // ------------------------------------------------------------------------
    // prepare
    // ------------------------------------------------------------------------

    fn prepare_task(self: &Arc<Self>) {
        let state = self.take_session();
        if !matches!(state, SessionState::Idle) {
            let kind = state.kind();
            self.put_session(state);
            self.report(&ProcessorError::InvalidState(kind));
            return;
        }

        // An unreadable input is reported without leaving Idle
        let input = match self.open_input() {
            Ok(input) => input,
            Err(e) => {
                self.put_session(SessionState::Idle);
                self.report(&e);
                return;
            }
        };

        self.publish(ProcessorState::Preparing);
        match self.acquire(input) {
            Ok(session) => {
                *self.tracks.write() = Some(SessionTracks {
                    video: session.video_track.clone(),
                    audio: session.audio_track.clone(),
                });
                self.put_session(SessionState::Ready(Box::new(session)));
            }
            Err(e) => {
                self.context.write().reset(&self.config);
                self.put_session(SessionState::Idle);
                self.report(&e);
            }
        }
    }

    fn open_input(&self) -> Result<OpenedInput, ProcessorError> {
        let path = self
            .input_path
            .lock()
            .clone()
            .ok_or_else(|| ProcessorError::InputNotFound("<unset>".into()))?;

        let open = |path: &Path| {
            self.demuxers.open(path).map_err(|e| match e {
                DemuxError::NotFound(p) => ProcessorError::InputNotFound(p.display().to_string()),
                other => other.into(),
            })
        };

        let mut video_demuxer = open(&path)?;
        let video_track = match video_demuxer.video_track() {
            Ok(track) => track,
            Err(e) => {
                video_demuxer.release();
                return Err(e.into());
            }
        };
        if let Err(e) = video_track.require_video() {
            video_demuxer.release();
            return Err(e.into());
        }

        let (audio_demuxer, audio_track) = if self.config.keep_audio {
            let mut demuxer = match open(&path) {
                Ok(d) => d,
                Err(e) => {
                    video_demuxer.release();
                    return Err(e);
                }
            };
            match demuxer.audio_track() {
                Some(track) => (Some(demuxer), Some(track)),
                None => {
                    debug!("no audio track");
                    demuxer.release();
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        info!(
            path = %path.display(),
            video = ?video_track.codec,
            audio = ?audio_track.as_ref().map(|t| t.codec),
            "input opened"
        );
        Ok(OpenedInput { path, video_demuxer, audio_demuxer, video_track, audio_track })
    }

    /// Surface, video decoder, default filter, audio decoder; in that order.
    /// On failure everything acquired so far is released in reverse.
    fn acquire(&self, input: OpenedInput) -> Result<Session, ProcessorError> {
        let format = match input.video_track.require_video() {
            Ok(format) => format.clone(),
            Err(e) => {
                input.release();
                return Err(e.into());
            }
        };
        let size = {
            let mut ctx = self.context.write();
            ctx.apply_source(&format);
            ctx.input_path = Some(input.path.clone());
            ctx.has_audio = input.audio_track.is_some();
            ctx.video.size()
        };
        debug!(width = size.width, height = size.height, "content size");

        let surface = match self.surfaces.create(size) {
            Ok(surface) => share_surface(surface),
            Err(e) => {
                input.release();
                return Err(e.into());
            }
        };
        let prepared = self.prepare_surface(&mut **surface.lock());
        if let Err(e) = prepared {
            surface.lock().release();
            input.release();
            return Err(e);
        }

        let mut video_decoder = match self.create_video_decoder(&input, &surface, size) {
            Ok(decoder) => decoder,
            Err(e) => {
                surface.lock().release();
                input.release();
                return Err(e);
            }
        };

        let installed = self
            .filters
            .install(Box::new(NormalFilter::new()), &**surface.lock(), video_decoder.size());
        if let Err(e) = installed {
            video_decoder.release();
            surface.lock().release();
            input.release();
            return Err(e.into());
        }

        let audio_decoder = match &input.audio_track {
            Some(track) => match self.create_audio_decoder(track) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    self.filters.clear();
                    video_decoder.release();
                    surface.lock().release();
                    input.release();
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Session {
            video_demuxer: input.video_demuxer,
            audio_demuxer: input.audio_demuxer,
            video_track: input.video_track,
            audio_track: input.audio_track,
            surface,
            video_decoder,
            audio_decoder,
            muxer: None,
        })
    }

    fn prepare_surface(&self, surface: &mut dyn RenderSurface) -> Result<(), ProcessorError> {
        surface.make_current()?;
        surface.update_texture()?;
        let ctx = self.context.read().clone();
        surface.update_location(&ctx)?;
        Ok(())
    }

    fn create_video_decoder(
        &self,
        input: &OpenedInput,
        surface: &SharedSurface,
        size: crate::media::Size,
    ) -> Result<Box<dyn VideoDecoder>, ProcessorError> {
        let (context, input_texture) = {
            let surface = surface.lock();
            (surface.context(), surface.input_texture())
        };
        let renderer = FrameRenderer::new(Arc::clone(surface), Arc::clone(&self.filters), Arc::clone(&self.pipeline));
        let (sink, events) = sample_channel();
        self.bridge.attach(DecoderKind::Video, events)?;
        let mut decoder = self.decoders.create_video(VideoDecoderParams {
            track: input.video_track.clone(),
            target_size: size,
            context,
            input_texture,
            renderer,
            sink,
        })?;
        if let Err(e) = decoder.prepare() {
            decoder.release();
            return Err(e.into());
        }
        debug!(width = decoder.width(), height = decoder.height(), "video decoder prepared");
        Ok(decoder)
    }

    fn create_audio_decoder(&self, track: &Track) -> Result<Box<dyn AudioDecoder>, ProcessorError> {
        let (sink, events) = sample_channel();
        self.bridge.attach(DecoderKind::Audio, events)?;
        let mut decoder = self.decoders.create_audio(AudioDecoderParams { track: track.clone(), sink })?;
        if let Err(e) = decoder.prepare() {
            decoder.release();
            return Err(e.into());
        }
        debug!(sample_rate = decoder.sample_rate(), channels = decoder.channels(), "audio decoder prepared");
        Ok(decoder)
    }

    // ------------------------------------------------------------------------
    // save
    // ------------------------------------------------------------------------

    fn save_task(self: &Arc<Self>, output_path: PathBuf) -> Result<(), ProcessorError> {
        let mut session = match self.take_session() {
            SessionState::Ready(session) => session,
            other => {
                let kind = other.kind();
                self.put_session(other);
                return Err(match kind {
                    ProcessorState::Encoding => ProcessorError::AlreadyEncoding,
                    ProcessorState::Released | ProcessorState::Releasing => ProcessorError::Released,
                    _ => ProcessorError::NotPrepared,
                });
            }
        };

        self.context.write().output_path = Some(output_path);
        let configured = self
            .prepare_muxer(&mut session)
            .and_then(|muxer| self.prepare_encoder(&session, muxer));
        match configured {
            Ok((encoder, generation)) => {
                self.targets.set_encoder(Some(Arc::clone(&encoder)));
                self.put_session(SessionState::Encoding { session, encoder, generation });
                Ok(())
            }
            Err(e) => {
                // The muxer stays configured; the next save resets it
                self.put_session(SessionState::Ready(session));
                Err(e)
            }
        }
    }

    fn prepare_muxer(&self, session: &mut Session) -> Result<Arc<dyn Muxer>, ProcessorError> {
        let muxer = match &session.muxer {
            Some(muxer) => {
                debug!("resetting muxer");
                muxer.reset()?;
                Arc::clone(muxer)
            }
            None => {
                let ctx = self.context.read().clone();
                let muxer = self.muxers.create(&ctx)?;
                muxer.set_listener(Arc::new(MuxerErrorForwarder {
                    listener: Arc::clone(&self.listener),
                }));
                session.muxer = Some(Arc::clone(&muxer));
                muxer
            }
        };

        if let Some(track) = &session.audio_track {
            muxer.add_audio_track(track.require_audio()?)?;
        }
        self.targets.set_muxer(Some(Arc::clone(&muxer)));
        Ok(muxer)
    }

    fn prepare_encoder(
        self: &Arc<Self>,
        session: &Session,
        muxer: Arc<dyn Muxer>,
    ) -> Result<(Arc<dyn Encoder>, u64), ProcessorError> {
        let source_texture = self.filters.output_texture().ok_or(ProcessorError::NoActiveFilter)?;

        let config = {
            let mut ctx = self.context.write();
            ctx.video.width = session.video_decoder.width();
            ctx.video.height = session.video_decoder.height();
            ctx.apply_encoding(session.video_track.require_video()?, &self.config);
            EncoderConfig::from_context(&ctx, session.surface.lock().context(), source_texture)
        };
        config.validate()?;
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate = config.bitrate,
            "configuring encoder"
        );

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_prepared = Box::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let task_inner = Arc::clone(&inner);
            if let Err(e) = inner.pipeline.submit(move || task_inner.start_units(generation)) {
                debug!("prepared signal after shutdown: {}", e);
            }
        });

        let encoder = self.encoders.create(config, on_prepared, Some(muxer.sample_sink()))?;
        Ok((encoder, generation))
    }

    /// Encoder first so no decoded frame is missed, then video, then audio
    fn start_units(&self, generation: u64) {
        let mut errors = Vec::new();
        {
            let mut guard = self.session.lock();
            let SessionState::Encoding { session, encoder, generation: current } = &mut *guard else {
                debug!("prepared signal outside encoding ignored");
                return;
            };
            if *current != generation {
                debug!(generation, current = *current, "stale prepared signal ignored");
                return;
            }

            if let Err(e) = encoder.start() {
                errors.push(ProcessorError::from(e));
            } else {
                if let Err(e) = session.video_decoder.start() {
                    errors.push(e.into());
                }
                if let Some(audio) = session.audio_decoder.as_mut() {
                    if let Err(e) = audio.start() {
                        errors.push(e.into());
                    }
                }
            }
        }
        info!(generation, "units started");
        for e in &errors {
            self.report(e);
        }
    }

    // ------------------------------------------------------------------------
    // filter
    // ------------------------------------------------------------------------

    fn install_filter(&self, filter: Box<dyn Filter>) -> Result<FilterInfo, ProcessorError> {
        let guard = self.session.lock();
        let (session, encoding) = match &*guard {
            SessionState::Ready(session) => (session, false),
            SessionState::Encoding { session, .. } => (session, true),
            SessionState::Idle | SessionState::Released => return Err(ProcessorError::NotPrepared),
        };

        let previous = self.filters.output_texture();
        let info = self
            .filters
            .install(filter, &**session.surface.lock(), session.video_decoder.size())?;
        if encoding && previous.map(|t| t.0) != info.output_texture {
            warn!(filter = %info.name, "filter output texture changed while encoding");
        }
        Ok(info)
    }

    // ------------------------------------------------------------------------
    // release
    // ------------------------------------------------------------------------

    /// Surface, decoders, demuxers, then the encoder
    fn teardown(&self) {
        self.publish(ProcessorState::Releasing);
        let state = std::mem::replace(&mut *self.session.lock(), SessionState::Released);

        let (session, encoder) = match state {
            SessionState::Ready(session) => (Some(session), None),
            SessionState::Encoding { session, encoder, .. } => (Some(session), Some(encoder)),
            SessionState::Idle | SessionState::Released => (None, None),
        };

        if let Some(mut session) = session {
            if let Some(muxer) = session.muxer.take() {
                muxer.release();
            }
            let mut surface = session.surface.lock();
            if let Err(e) = surface.make_current() {
                debug!("surface not current during teardown: {}", e);
            }
            self.filters.clear();
            surface.release();
            drop(surface);
            session.video_decoder.release();
            if let Some(audio) = session.audio_decoder.as_mut() {
                audio.release();
            }
            session.video_demuxer.release();
            if let Some(demuxer) = session.audio_demuxer.as_mut() {
                demuxer.release();
            }
        }
        if let Some(encoder) = encoder {
            encoder.stop();
        }

        self.targets.clear();
        *self.tracks.write() = None;
        self.context.write().reset(&self.config);
        self.publish(ProcessorState::Released);
        info!("processor released");
    }
}
