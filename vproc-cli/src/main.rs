//! # vproc
//!
//! Command-line front end: probe an input's tracks, bring up the GPU
//! surface, dump the effective processor configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vproc_core::demuxer::{DefaultDemuxerFactory, Demuxer, DemuxerFactory};
use vproc_core::gpu::WgpuSurfaceFactory;
use vproc_core::media::{Size, Track, TrackFormat};
use vproc_core::surface::SurfaceFactory;
use vproc_core::{ProcessingContext, ProcessorConfig};

#[derive(Parser)]
#[command(name = "vproc")]
#[command(about = "Video transcode pipeline tools")]
#[command(version)]
struct Cli {
    /// Processor configuration (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the audio and video tracks of a media file
    Probe {
        file: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create a headless rendering surface and run one latch cycle
    GpuCheck {
        #[arg(long, default_value = "1920")]
        width: u32,

        #[arg(long, default_value = "1080")]
        height: u32,
    },

    /// Print the effective processor configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "vproc=debug,vproc_core=debug,wgpu=warn"
    } else {
        "vproc=info,vproc_core=info,wgpu=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!("vproc v{}", vproc_core::VERSION);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe { file, json } => probe(&file, json),
        Commands::GpuCheck { width, height } => gpu_check(&config, Size::new(width, height)),
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProcessorConfig> {
    match path {
        Some(path) => ProcessorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ProcessorConfig::default()),
    }
}

// ============================================================================
// probe
// ============================================================================

#[derive(Serialize)]
struct ProbeReport<'a> {
    path: &'a Path,
    container: &'static str,
    video: Option<Track>,
    audio: Option<Track>,
}

fn probe(file: &Path, json: bool) -> Result<()> {
    let mut demuxer = DefaultDemuxerFactory
        .open(file)
        .with_context(|| format!("opening {}", file.display()))?;

    let report = ProbeReport {
        path: file,
        container: demuxer.container().label(),
        video: demuxer.video_track().ok(),
        audio: demuxer.audio_track(),
    };
    demuxer.release();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} ({})", file.display(), report.container);
    for track in report.video.iter().chain(report.audio.iter()) {
        println!("  {}", describe(track));
    }
    if report.video.is_none() {
        println!("  (no video track)");
    }
    Ok(())
}

fn describe(track: &Track) -> String {
    let secs = track.duration_us as f64 / 1_000_000.0;
    match &track.format {
        TrackFormat::Video(v) => format!(
            "#{} video {:?} {} rot {}° {} fps {} kb/s {:.2}s",
            track.index,
            track.codec,
            v.coded_size(),
            v.rotation.degrees(),
            v.frame_rate.map_or("?".into(), |f| f.to_string()),
            v.bitrate.map_or("?".into(), |b| (b / 1_000).to_string()),
            secs
        ),
        TrackFormat::Audio(a) => format!(
            "#{} audio {:?} {} Hz {} ch {} kb/s {:.2}s",
            track.index,
            track.codec,
            a.sample_rate,
            a.channels,
            a.bitrate.map_or("?".into(), |b| (b / 1_000).to_string()),
            secs
        ),
    }
}

// ============================================================================
// gpu-check
// ============================================================================

fn gpu_check(config: &ProcessorConfig, size: Size) -> Result<()> {
    if size.is_empty() {
        bail!("surface size {size} is empty");
    }

    let factory = WgpuSurfaceFactory::new(&config.surface_format).context("bringing up wgpu device")?;
    let adapter = &factory.backend().adapter;
    info!(adapter = %adapter.name, backend = ?adapter.backend, "adapter selected");

    let mut surface = factory.create(size).context("allocating surface")?;
    surface.make_current()?;
    surface.update_texture()?;
    surface.update_location(&ProcessingContext::new(config))?;
    surface.release();

    println!(
        "ok: {} ({:?}) surface {} {}",
        adapter.name, adapter.backend, size, config.surface_format
    );
    Ok(())
}
