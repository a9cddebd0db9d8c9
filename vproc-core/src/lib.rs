//! # vproc Core
//!
//! Video transcoding and filtering pipeline: demux → decode → GPU filter →
//! encode → mux, orchestrated by [`VideoProcessor`] on one serialized event
//! pipeline.
//!
//! Hardware codecs and the container writer plug in through the factory
//! traits in [`decoder`], [`encoder`] and [`muxer`]; the rendering surface
//! through [`surface::SurfaceFactory`] (a headless wgpu implementation ships
//! behind the `wgpu-surface` feature).

// ============================================================================
// Media model & configuration
// ============================================================================
pub mod config;
pub mod media;

// ============================================================================
// Execution
// ============================================================================
pub mod bridge;
pub mod pipeline;

// ============================================================================
// GPU
// ============================================================================
#[cfg(feature = "wgpu-surface")]
pub mod gpu;
pub mod filter;
pub mod render;
pub mod surface;

// ============================================================================
// Codec & container units
// ============================================================================
pub mod decoder;
pub mod demuxer;
pub mod encoder;
pub mod mp4_demux;
pub mod muxer;

// ============================================================================
// Orchestration
// ============================================================================
pub mod processor;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, ProcessingContext, ProcessorConfig};
pub use filter::{Filter, FilterInfo, FilterState, NormalFilter};
pub use media::{Rotation, Size, Track, TrackKind};
pub use processor::{ProcessorBuilder, ProcessorError, ProcessorListener, ProcessorState, VideoProcessor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
