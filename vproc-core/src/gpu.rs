//! # wgpu Rendering Surface
//!
//! Headless [`RenderSurface`] backed by a wgpu device:
//! - input texture the video decoder writes decoded frames into
//! - frame-buffer texture the active filter samples from
//! - uniform buffer holding the orientation texture coordinates
//!
//! All methods are called from the processor's event pipeline only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ProcessingContext;
use crate::media::Size;
use crate::surface::{GpuContext, RenderSurface, SurfaceError, SurfaceFactory, TextureId, TextureLocation};

// ============================================================================
// Device
// ============================================================================

/// Device and queue shared by every surface of one factory
pub struct WgpuBackend {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::AdapterInfo,
}

impl WgpuBackend {
    /// Bring up a headless device on the best available adapter
    pub fn new() -> Result<Self, SurfaceError> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self, SurfaceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(SurfaceError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    label: Some("vproc_surface"),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| SurfaceError::Device(e.to_string()))?;

        let info = adapter.get_info();
        info!(adapter = %info.name, backend = ?info.backend, "wgpu device ready");

        Ok(Self { device, queue, adapter: info })
    }

    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }
}

/// Texture format for a config label
pub fn texture_format(label: &str) -> Option<wgpu::TextureFormat> {
    match label {
        "rgba8unorm" => Some(wgpu::TextureFormat::Rgba8Unorm),
        "bgra8unorm" => Some(wgpu::TextureFormat::Bgra8Unorm),
        _ => None,
    }
}

fn next_texture_id() -> TextureId {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    TextureId(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LocationUniform {
    coords: [f32; 8],
}

// ============================================================================
// Surface
// ============================================================================

pub struct WgpuSurface {
    backend: Arc<WgpuBackend>,
    context: GpuContext,
    size: Size,
    input: wgpu::Texture,
    frame_buffer: wgpu::Texture,
    location_buffer: wgpu::Buffer,
    input_id: TextureId,
    frame_buffer_id: TextureId,
    frame_buffer_texture_id: TextureId,
    location: TextureLocation,
    frames_latched: u64,
    released: bool,
}

impl WgpuSurface {
    pub fn new(backend: Arc<WgpuBackend>, size: Size, format: wgpu::TextureFormat) -> Result<Self, SurfaceError> {
        let max = backend.max_texture_dimension();
        if size.is_empty() || size.width > max || size.height > max {
            return Err(SurfaceError::InvalidSize(size));
        }

        let extent = wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        };
        let texture = |label: &str, usage: wgpu::TextureUsages| {
            backend.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        };

        let input = texture(
            "vproc_input",
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let frame_buffer = texture(
            "vproc_frame_buffer",
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
        );
        let location_buffer = backend.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vproc_texture_location"),
            size: std::mem::size_of::<LocationUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        debug!(width = size.width, height = size.height, ?format, "wgpu surface allocated");

        Ok(Self {
            context: GpuContext::new(Arc::clone(&backend)),
            backend,
            size,
            input,
            frame_buffer,
            location_buffer,
            input_id: next_texture_id(),
            frame_buffer_id: next_texture_id(),
            frame_buffer_texture_id: next_texture_id(),
            location: TextureLocation::for_rotation(Default::default()),
            frames_latched: 0,
            released: false,
        })
    }

    pub fn location(&self) -> TextureLocation {
        self.location
    }

    pub fn frames_latched(&self) -> u64 {
        self.frames_latched
    }

    pub fn input(&self) -> &wgpu::Texture {
        &self.input
    }

    pub fn frame_buffer_target(&self) -> &wgpu::Texture {
        &self.frame_buffer
    }

    /// Map a handle this surface issued back to its texture
    pub fn texture(&self, id: TextureId) -> Option<&wgpu::Texture> {
        if id == self.input_id {
            Some(&self.input)
        } else if id == self.frame_buffer_id || id == self.frame_buffer_texture_id {
            Some(&self.frame_buffer)
        } else {
            None
        }
    }

    fn ensure_live(&self) -> Result<(), SurfaceError> {
        if self.released {
            Err(SurfaceError::Released)
        } else {
            Ok(())
        }
    }
}

impl RenderSurface for WgpuSurface {
    fn make_current(&self) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        // wgpu has no thread-bound context; settle outstanding work instead
        let _ = self.backend.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn context(&self) -> GpuContext {
        self.context.clone()
    }

    fn size(&self) -> Size {
        self.size
    }

    fn input_texture(&self) -> TextureId {
        self.input_id
    }

    fn frame_buffer(&self) -> TextureId {
        self.frame_buffer_id
    }

    fn frame_buffer_texture(&self) -> TextureId {
        self.frame_buffer_texture_id
    }

    fn write_input(&mut self, pixels: &[u8]) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        let expected = self.size.width as usize * self.size.height as usize * 4;
        if pixels.len() != expected {
            return Err(SurfaceError::FrameSize { expected, got: pixels.len() });
        }
        self.backend.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.input,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.size.width),
                rows_per_image: Some(self.size.height),
            },
            self.input.size(),
        );
        Ok(())
    }

    fn update_texture(&mut self) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        let mut encoder = self
            .backend
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vproc_latch_input"),
            });
        encoder.copy_texture_to_texture(
            self.input.as_image_copy(),
            self.frame_buffer.as_image_copy(),
            self.input.size(),
        );
        self.backend.queue.submit(Some(encoder.finish()));
        self.frames_latched += 1;
        Ok(())
    }

    fn update_location(&mut self, ctx: &ProcessingContext) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        self.location = TextureLocation::for_context(ctx);
        let uniform = LocationUniform { coords: self.location.flattened() };
        self.backend
            .queue
            .write_buffer(&self.location_buffer, 0, bytemuck::cast_slice(&[uniform]));
        debug!(rotation = ctx.orientation.degrees(), "texture location updated");
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.input.destroy();
        self.frame_buffer.destroy();
        self.location_buffer.destroy();
        debug!(frames = self.frames_latched, "wgpu surface released");
    }
}

impl Drop for WgpuSurface {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Factory
// ============================================================================

pub struct WgpuSurfaceFactory {
    backend: Arc<WgpuBackend>,
    format: wgpu::TextureFormat,
}

impl WgpuSurfaceFactory {
    pub fn new(format_label: &str) -> Result<Self, SurfaceError> {
        let format = texture_format(format_label)
            .ok_or_else(|| SurfaceError::Device(format!("unknown texture format {format_label}")))?;
        Ok(Self::with_backend(Arc::new(WgpuBackend::new()?), format))
    }

    pub fn with_backend(backend: Arc<WgpuBackend>, format: wgpu::TextureFormat) -> Self {
        Self { backend, format }
    }

    pub fn backend(&self) -> &Arc<WgpuBackend> {
        &self.backend
    }
}

impl SurfaceFactory for WgpuSurfaceFactory {
    fn create(&self, size: Size) -> Result<Box<dyn RenderSurface>, SurfaceError> {
        Ok(Box::new(WgpuSurface::new(Arc::clone(&self.backend), size, self.format)?))
    }
}
