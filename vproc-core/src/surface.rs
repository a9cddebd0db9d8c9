//! # Rendering Surface
//!
//! The per-session GPU resource set: the shared rendering context, the input
//! texture decoders render into, and the frame buffer the filter reads from.
//! Exactly one surface exists per session and it is only touched from the
//! processor's event pipeline.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ProcessingContext;
use crate::media::{Rotation, Size};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("No GPU adapter available")]
    NoAdapter,
    #[error("GPU device error: {0}")]
    Device(String),
    #[error("Invalid surface size {0}")]
    InvalidSize(Size),
    #[error("Frame of {got} bytes, surface expects {expected}")]
    FrameSize { expected: usize, got: usize },
    #[error("Surface already released")]
    Released,
}

/// Opaque handle of a texture owned by a rendering surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureId(pub u32);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

// ============================================================================
// Shared GPU context
// ============================================================================

/// Cloneable handle to the backend's rendering context.
///
/// The concrete type is only known to the surface that created it and the
/// collaborators built for the same backend, which recover it with
/// [`GpuContext::downcast`].
#[derive(Clone)]
pub struct GpuContext {
    id: u64,
    inner: Arc<dyn Any + Send + Sync>,
}

impl GpuContext {
    pub fn new<T: Any + Send + Sync>(inner: Arc<T>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn same_as(&self, other: &GpuContext) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext").field("id", &self.id).finish()
    }
}

// ============================================================================
// Orientation-dependent sampling
// ============================================================================

/// Texture coordinates of the full-screen quad, in strip order
/// bottom-left, bottom-right, top-left, top-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureLocation {
    pub coords: [[f32; 2]; 4],
}

impl TextureLocation {
    const IDENTITY: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

    /// Sampling coordinates that undo the source rotation
    pub fn for_rotation(rotation: Rotation) -> Self {
        let turns = rotation.degrees() / 90;
        let mut coords = Self::IDENTITY;
        for _ in 0..turns {
            for c in coords.iter_mut() {
                *c = [c[1], 1.0 - c[0]];
            }
        }
        Self { coords }
    }

    pub fn for_context(ctx: &ProcessingContext) -> Self {
        Self::for_rotation(ctx.orientation)
    }

    pub fn flattened(&self) -> [f32; 8] {
        let mut out = [0.0; 8];
        for (i, c) in self.coords.iter().enumerate() {
            out[i * 2] = c[0];
            out[i * 2 + 1] = c[1];
        }
        out
    }
}

// ============================================================================
// Traits
// ============================================================================

pub trait RenderSurface: Send {
    /// Bind the rendering context to the calling thread
    fn make_current(&self) -> Result<(), SurfaceError>;

    fn context(&self) -> GpuContext;

    fn size(&self) -> Size;

    /// Texture the video decoder renders decoded frames into
    fn input_texture(&self) -> TextureId;

    fn frame_buffer(&self) -> TextureId;

    /// Color attachment of the frame buffer; the filter's input
    fn frame_buffer_texture(&self) -> TextureId;

    /// Upload one tightly packed 4-byte-per-pixel frame into the input texture
    fn write_input(&mut self, pixels: &[u8]) -> Result<(), SurfaceError>;

    /// Latch the newest decoded image into the frame buffer
    fn update_texture(&mut self) -> Result<(), SurfaceError>;

    /// Re-derive sampling coordinates from the session orientation
    fn update_location(&mut self, ctx: &ProcessingContext) -> Result<(), SurfaceError>;

    fn release(&mut self);
}

pub trait SurfaceFactory: Send + Sync {
    fn create(&self, size: Size) -> Result<Box<dyn RenderSurface>, SurfaceError>;
}
