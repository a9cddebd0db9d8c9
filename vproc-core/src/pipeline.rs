//! # Event Pipeline - Serialized Task Queue
//!
//! One named worker thread executing submitted closures strictly in FIFO order.
//! Everything that touches the shared GPU context or session state runs here.
//!
//! ```text
//! submit() ──┐
//! submit() ──┼──► [ crossbeam channel ] ──► worker: task, task, task ...
//! flush()  ──┘                                        │
//!                                       terminate(): drain, then join
//! ```

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Pipeline terminated: {0}")]
    Terminated(String),
    #[error("Pipeline worker spawn failed: {0}")]
    Spawn(String),
    #[error("Pipeline {0}: flush called from its own worker")]
    Reentrant(String),
}

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
    panicked: AtomicU64,
}

pub struct EventPipeline {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    terminated: AtomicBool,
    counters: Arc<Counters>,
}

impl EventPipeline {
    /// Spawn the worker thread under `name`
    pub fn new(name: impl Into<String>) -> Result<Self, PipelineError> {
        let name = name.into();
        let (tx, rx) = unbounded::<Task>();
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(pipeline = %worker_name, "worker started");
                // Disconnect is only observed after every queued task was received
                while let Ok(task) = rx.recv() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        worker_counters.panicked.fetch_add(1, Ordering::Relaxed);
                        error!(
                            pipeline = %worker_name,
                            "task panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                    worker_counters.executed.fetch_add(1, Ordering::Relaxed);
                }
                debug!(pipeline = %worker_name, "worker drained");
            })
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        info!(pipeline = %name, "event pipeline created");

        Ok(Self {
            worker_id: handle.thread().id(),
            name,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            terminated: AtomicBool::new(false),
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task; returns immediately
    pub fn submit<F>(&self, task: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Box::new(task))
                .map_err(|_| PipelineError::Terminated(self.name.clone())),
            None => Err(PipelineError::Terminated(self.name.clone())),
        }
    }

    /// Block until every task submitted before this call has run
    pub fn flush(&self) -> Result<(), PipelineError> {
        if self.is_worker_thread() {
            return Err(PipelineError::Reentrant(self.name.clone()));
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        self.submit(move || {
            let _ = done_tx.send(());
        })?;
        done_rx
            .recv()
            .map_err(|_| PipelineError::Terminated(self.name.clone()))
    }

    /// Stop accepting tasks. Already queued tasks still run.
    ///
    /// From any thread but the worker this also waits for the queue to drain.
    pub fn terminate(&self) {
        let was_terminated = self.terminated.swap(true, Ordering::SeqCst);
        // Dropping the last sender lets the worker exit once the queue is empty
        drop(self.sender.lock().take());
        if !was_terminated {
            info!(pipeline = %self.name, "event pipeline terminating");
        }
        if self.is_worker_thread() {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(pipeline = %self.name, "worker exited abnormally");
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Tasks run so far, panicked ones included
    pub fn executed_count(&self) -> u64 {
        self.counters.executed.load(Ordering::Relaxed)
    }

    pub fn panicked_count(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .field("executed", &self.executed_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
