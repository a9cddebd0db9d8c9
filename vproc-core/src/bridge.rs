//! # Sample Bridge
//!
//! Consumes decoder output channels and forwards each event:
//! - audio → muxer (payload moves with the sample)
//! - video → encoder frame-available signal (timing only)
//!
//! One consumer thread per decoder channel keeps each decoder's emission
//! order. The bridge never touches GPU or session state; it only reads the
//! forwarding targets the event pipeline installs.

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

use crate::decoder::{DecoderKind, SampleEvent, SampleReceiver};
use crate::encoder::Encoder;
use crate::media::Sample;
use crate::muxer::Muxer;
use crate::pipeline::PipelineError;

// ============================================================================
// Forwarding targets
// ============================================================================

/// Current encoder and muxer, swapped by the event pipeline
#[derive(Default)]
pub struct BridgeTargets {
    encoder: RwLock<Option<Arc<dyn Encoder>>>,
    muxer: RwLock<Option<Arc<dyn Muxer>>>,
}

impl BridgeTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_encoder(&self, encoder: Option<Arc<dyn Encoder>>) {
        *self.encoder.write() = encoder;
    }

    pub fn set_muxer(&self, muxer: Option<Arc<dyn Muxer>>) {
        *self.muxer.write() = muxer;
    }

    pub fn encoder(&self) -> Option<Arc<dyn Encoder>> {
        self.encoder.read().clone()
    }

    pub fn muxer(&self) -> Option<Arc<dyn Muxer>> {
        self.muxer.read().clone()
    }

    /// Detach the muxer so no further audio reaches it
    pub fn take_muxer(&self) -> Option<Arc<dyn Muxer>> {
        self.muxer.write().take()
    }

    pub fn clear(&self) {
        self.set_encoder(None);
        self.set_muxer(None);
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BridgeStats {
    pub audio_forwarded: u64,
    pub video_signalled: u64,
    /// Events that arrived with no target installed
    pub dropped: u64,
    /// Forwarding calls that returned an error
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    audio_forwarded: AtomicU64,
    video_signalled: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            audio_forwarded: self.audio_forwarded.load(Ordering::Relaxed),
            video_signalled: self.video_signalled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Bridge
// ============================================================================

pub struct SampleBridge {
    name: String,
    targets: Arc<BridgeTargets>,
    counters: Arc<Counters>,
    shutdown: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SampleBridge {
    pub fn new(name: impl Into<String>, targets: Arc<BridgeTargets>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            name: name.into(),
            targets,
            counters: Arc::new(Counters::default()),
            shutdown: Mutex::new(Some(tx)),
            shutdown_rx: rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a consumer for one decoder's output channel
    pub fn attach(&self, kind: DecoderKind, events: SampleReceiver) -> Result<(), PipelineError> {
        let targets = Arc::clone(&self.targets);
        let counters = Arc::clone(&self.counters);
        let shutdown = self.shutdown_rx.clone();
        let thread_name = format!("{}-{}-bridge", self.name, kind);

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                loop {
                    select! {
                        recv(events) -> msg => match msg {
                            Ok(event) => dispatch(&targets, &counters, event),
                            Err(_) => break,
                        },
                        recv(shutdown) -> _ => break,
                    }
                }
                debug!(bridge = %thread_name, "bridge consumer exited");
            })
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        let mut workers = self.workers.lock();
        reap_finished(&mut workers, &self.name);
        workers.push(handle);
        Ok(())
    }

    /// Consumers whose decoder channel is still open
    pub fn active_consumers(&self) -> usize {
        let mut workers = self.workers.lock();
        reap_finished(&mut workers, &self.name);
        workers.len()
    }

    pub fn stats(&self) -> BridgeStats {
        self.counters.snapshot()
    }

    /// Stop every consumer and wait for them. Idempotent.
    pub fn stop(&self) {
        drop(self.shutdown.lock().take());
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!(bridge = %self.name, "bridge consumer panicked");
            }
        }
    }
}

impl Drop for SampleBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join consumers that already exited, e.g. after a rolled-back prepare
fn reap_finished(workers: &mut Vec<JoinHandle<()>>, bridge: &str) {
    let (done, running): (Vec<_>, Vec<_>) = workers.drain(..).partition(|h| h.is_finished());
    *workers = running;
    for handle in done {
        if handle.join().is_err() {
            warn!(bridge, "bridge consumer panicked");
        }
    }
}

/// Route one decoder event to its target
fn dispatch(targets: &BridgeTargets, counters: &Counters, event: SampleEvent) {
    match event.decoder {
        DecoderKind::Audio => {
            let (Some(muxer), Some(payload)) = (targets.muxer(), event.payload) else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(pts = event.info.pts_us, "audio sample dropped");
                return;
            };
            match muxer.write_audio_sample(Sample::wrap(event.info, payload)) {
                Ok(()) => {
                    counters.audio_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pts = event.info.pts_us, "audio write failed: {}", e);
                }
            }
        }
        DecoderKind::Video => {
            let Some(encoder) = targets.encoder() else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(pts = event.info.pts_us, "video frame dropped");
                return;
            };
            match encoder.on_frame_available(event.info.pts_us) {
                Ok(()) => {
                    counters.video_signalled.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pts = event.info.pts_us, "frame signal failed: {}", e);
                }
            }
        }
    }
}
