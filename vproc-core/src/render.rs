//! # Frame Renderer
//!
//! Per-frame render step handed to the video decoder. Each decoded frame is
//! latched into the surface's frame buffer and then run through the active
//! filter, as one task on the processor's event pipeline, so the encoder's
//! source texture always holds the filtered newest frame.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::filter::{FilterError, FilterSlot};
use crate::pipeline::{EventPipeline, PipelineError};
use crate::surface::{RenderSurface, SurfaceError};

/// Surface of one session, shared between the session and its renderer
pub type SharedSurface = Arc<Mutex<Box<dyn RenderSurface>>>;

pub fn share_surface(surface: Box<dyn RenderSurface>) -> SharedSurface {
    Arc::new(Mutex::new(surface))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Called on the pipeline worker once the frame has been drawn (or not)
pub type RenderCallback = Box<dyn FnOnce(Result<(), RenderError>) + Send + 'static>;

#[derive(Clone)]
pub struct FrameRenderer {
    surface: SharedSurface,
    filters: Arc<FilterSlot>,
    pipeline: Arc<EventPipeline>,
}

impl FrameRenderer {
    pub fn new(surface: SharedSurface, filters: Arc<FilterSlot>, pipeline: Arc<EventPipeline>) -> Self {
        Self { surface, filters, pipeline }
    }

    /// Queue latch and filter draw for a frame the decoder already wrote
    /// into the input texture through the shared GPU context.
    pub fn render<F>(&self, pts_us: i64, on_rendered: F) -> Result<(), PipelineError>
    where
        F: FnOnce(Result<(), RenderError>) + Send + 'static,
    {
        self.queue(pts_us, None, Box::new(on_rendered))
    }

    /// Queue an upload of packed pixels into the input texture, then latch and draw
    pub fn render_pixels<F>(&self, pts_us: i64, pixels: Bytes, on_rendered: F) -> Result<(), PipelineError>
    where
        F: FnOnce(Result<(), RenderError>) + Send + 'static,
    {
        self.queue(pts_us, Some(pixels), Box::new(on_rendered))
    }

    fn queue(&self, pts_us: i64, pixels: Option<Bytes>, on_rendered: RenderCallback) -> Result<(), PipelineError> {
        let surface = Arc::clone(&self.surface);
        let filters = Arc::clone(&self.filters);
        self.pipeline.submit(move || {
            let result = draw_frame(&surface, &filters, pts_us, pixels.as_deref());
            if let Err(e) = &result {
                trace!(pts = pts_us, "frame not rendered: {}", e);
            }
            on_rendered(result);
        })
    }
}

impl std::fmt::Debug for FrameRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRenderer").field("filters", &self.filters).finish()
    }
}

/// Surface lock before filter lock, the same order as a filter swap
fn draw_frame(
    surface: &SharedSurface,
    filters: &FilterSlot,
    pts_us: i64,
    pixels: Option<&[u8]>,
) -> Result<(), RenderError> {
    let mut surface = surface.lock();
    surface.make_current()?;
    if let Some(pixels) = pixels {
        surface.write_input(pixels)?;
    }
    surface.update_texture()?;
    filters.draw(pts_us)?;
    Ok(())
}
