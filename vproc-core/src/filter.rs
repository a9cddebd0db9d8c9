//! # Filter Stage
//!
//! GPU-side per-frame transforms and the single active-filter slot.
//!
//! The slot's mutex is the filter lock: installing, reading and drawing all
//! go through it, so a reader only ever sees the previous filter or a fully
//! initialized new one.

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media::Size;
use crate::surface::{GpuContext, RenderSurface, SurfaceError, TextureId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Filter {name} init failed: {reason}")]
    Init { name: String, reason: String },
    #[error("Filter {name} draw failed: {reason}")]
    Draw { name: String, reason: String },
    #[error("No active filter")]
    NoActiveFilter,
    #[error("Filter {0} used in state {1:?}")]
    InvalidState(String, FilterState),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Lifecycle: Uninitialized → Initialized → Rendering → Released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FilterState {
    Uninitialized,
    Initialized,
    Rendering,
    Released,
}

pub trait Filter: Send {
    fn name(&self) -> &str;

    fn state(&self) -> FilterState;

    /// Set target dimensions and input texture. Only valid before `init`.
    fn bind(&mut self, size: Size, input: TextureId);

    fn size(&self) -> Size;

    fn input_texture(&self) -> TextureId;

    /// Allocate GPU resources on the current context
    fn init(&mut self, ctx: &GpuContext) -> Result<(), FilterError>;

    /// Transform the current input frame
    fn draw(&mut self, pts_us: i64) -> Result<(), FilterError>;

    /// Texture holding the filtered frame; `None` until initialized
    fn output_texture(&self) -> Option<TextureId>;

    fn release(&mut self);
}

// ============================================================================
// Pass-through filter
// ============================================================================

/// Default filter: the output is the input texture, untouched.
#[derive(Debug)]
pub struct NormalFilter {
    size: Size,
    input: TextureId,
    state: FilterState,
    frames: u64,
}

impl NormalFilter {
    pub fn new() -> Self {
        Self {
            size: Size::default(),
            input: TextureId::default(),
            state: FilterState::Uninitialized,
            frames: 0,
        }
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }
}

impl Default for NormalFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for NormalFilter {
    fn name(&self) -> &str {
        "normal"
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn bind(&mut self, size: Size, input: TextureId) {
        self.size = size;
        self.input = input;
    }

    fn size(&self) -> Size {
        self.size
    }

    fn input_texture(&self) -> TextureId {
        self.input
    }

    fn init(&mut self, _ctx: &GpuContext) -> Result<(), FilterError> {
        match self.state {
            FilterState::Uninitialized => {
                self.state = FilterState::Initialized;
                Ok(())
            }
            other => Err(FilterError::InvalidState(self.name().to_string(), other)),
        }
    }

    fn draw(&mut self, _pts_us: i64) -> Result<(), FilterError> {
        match self.state {
            FilterState::Initialized | FilterState::Rendering => {
                self.state = FilterState::Rendering;
                self.frames += 1;
                Ok(())
            }
            other => Err(FilterError::InvalidState(self.name().to_string(), other)),
        }
    }

    fn output_texture(&self) -> Option<TextureId> {
        match self.state {
            FilterState::Initialized | FilterState::Rendering => Some(self.input),
            _ => None,
        }
    }

    fn release(&mut self) {
        self.state = FilterState::Released;
    }
}

// ============================================================================
// Active filter slot
// ============================================================================

/// Consistent snapshot of the active filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterInfo {
    pub name: String,
    pub state: FilterState,
    pub size: Size,
    pub input_texture: u32,
    pub output_texture: Option<u32>,
}

impl FilterInfo {
    fn of(filter: &dyn Filter) -> Self {
        Self {
            name: filter.name().to_string(),
            state: filter.state(),
            size: filter.size(),
            input_texture: filter.input_texture().0,
            output_texture: filter.output_texture().map(|t| t.0),
        }
    }
}

#[derive(Default)]
pub struct FilterSlot {
    active: Mutex<Option<Box<dyn Filter>>>,
}

impl FilterSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new filter under the lock.
    ///
    /// Makes the surface's context current, releases the old filter, binds
    /// the new one to `size` and the surface's frame-buffer texture, then
    /// initializes it. A filter that fails to initialize is released and the
    /// slot is left empty.
    pub fn install(
        &self,
        mut filter: Box<dyn Filter>,
        surface: &dyn RenderSurface,
        size: Size,
    ) -> Result<FilterInfo, FilterError> {
        let mut active = self.active.lock();
        surface.make_current()?;

        if let Some(mut old) = active.take() {
            debug!(filter = old.name(), "releasing previous filter");
            old.release();
        }

        let input = surface.frame_buffer_texture();
        filter.bind(size, input);
        debug!(
            filter = filter.name(),
            width = size.width,
            height = size.height,
            texture = %input,
            "binding filter"
        );

        if let Err(e) = filter.init(&surface.context()) {
            warn!(filter = filter.name(), "filter init failed: {}", e);
            filter.release();
            return Err(e);
        }

        let info = FilterInfo::of(filter.as_ref());
        info!(filter = %info.name, "filter installed");
        *active = Some(filter);
        Ok(info)
    }

    pub fn info(&self) -> Option<FilterInfo> {
        self.active.lock().as_deref().map(|f| FilterInfo::of(f))
    }

    /// Run `f` against the live filter while holding the lock
    pub fn with_filter<R>(&self, f: impl FnOnce(&mut dyn Filter) -> R) -> Option<R> {
        let mut active = self.active.lock();
        let result = active.as_deref_mut().map(|filter| f(filter));
        result
    }

    pub fn output_texture(&self) -> Option<TextureId> {
        self.active.lock().as_ref().and_then(|f| f.output_texture())
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_none()
    }

    /// Render entry point for the video decoder, on the event pipeline
    pub fn draw(&self, pts_us: i64) -> Result<(), FilterError> {
        match self.active.lock().as_deref_mut() {
            Some(filter) => filter.draw(pts_us),
            None => Err(FilterError::NoActiveFilter),
        }
    }

    /// Release and drop the active filter
    pub fn clear(&self) {
        if let Some(mut filter) = self.active.lock().take() {
            filter.release();
            debug!(filter = filter.name(), "filter cleared");
        }
    }
}

impl std::fmt::Debug for FilterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSlot").field("active", &self.info()).finish()
    }
}
