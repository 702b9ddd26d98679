/// Concurrent message-passing pipeline framework
///
/// A pipeline is a fixed chain of stages. Each stage owns a bounded input
/// queue and a pool of worker threads; its output is the next stage,
/// reached through the `PipelineStage` capability trait rather than any
/// base-type coupling. Records are moved, never shared: a record has
/// exactly one owning stage at any instant, and ownership transfers on
/// queue hand-off.
///
/// Shutdown protocol: `Pipeline::finish()` closes the entry stage's input
/// queue. Each stage's workers drain the backlog and exit; the last
/// worker out of a stage (tracked by the stage's atomic active-worker
/// counter) closes the downstream stage's input. Closure therefore
/// propagates only after a stage has fully drained, so an orderly
/// shutdown never drops a record.
pub mod align;
pub mod convert;
pub mod queue;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use noodles::sam::alignment::record_buf::RecordBuf;

use crate::error::Error;
use crate::read::ReadUnit;

pub use self::align::Aligner;
pub use self::convert::{ConverterOptions, ReadConverter};
pub use self::queue::BoundedQueue;

/// The unit of exchange between stages.
#[derive(Debug)]
pub enum Message {
    /// An internal read, not yet converted to a record
    Read(ReadUnit),
    /// A canonical alignment record
    Record(Box<RecordBuf>),
}

/// Capability interface implemented by every stage.
pub trait PipelineStage: Send + Sync {
    /// Stage name for diagnostics.
    fn name(&self) -> &'static str;

    /// Spawn this stage's worker threads.
    fn start(self: Arc<Self>);

    /// Hand a message to this stage, blocking under backpressure.
    fn push(&self, msg: Message);

    /// Signal that no further input will arrive.
    fn close(&self);

    /// Wait for all workers to exit; reports worker crashes.
    fn join(&self) -> Result<(), Error>;
}

/// A fixed set of owned worker handles plus the shared completion counter
/// driving the shutdown protocol.
pub(crate) struct WorkerPool {
    stage: &'static str,
    active: Arc<AtomicUsize>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Decrements the active-worker counter when a worker exits, even by
/// panic, and fires the completion hook on the last exit. Keeping this in
/// a `Drop` impl is what lets a crashed worker still propagate closure
/// downstream instead of deadlocking the pipeline.
struct ExitGuard {
    active: Arc<AtomicUsize>,
    on_idle: Arc<dyn Fn() + Send + Sync>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            (self.on_idle)();
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(stage: &'static str) -> Self {
        Self {
            stage,
            active: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers running `work(worker_index)`. `on_idle` runs
    /// exactly once, on the thread of the last worker to exit.
    pub(crate) fn spawn(
        &self,
        count: usize,
        work: impl Fn(usize) + Send + Sync + 'static,
        on_idle: impl Fn() + Send + Sync + 'static,
    ) {
        let work = Arc::new(work);
        let on_idle: Arc<dyn Fn() + Send + Sync> = Arc::new(on_idle);

        self.active.fetch_add(count, Ordering::AcqRel);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..count {
            let work = Arc::clone(&work);
            let guard = ExitGuard {
                active: Arc::clone(&self.active),
                on_idle: Arc::clone(&on_idle),
            };
            let name = format!("{}-{}", self.stage, i);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || {
                    let _guard = guard;
                    work(i);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Join all workers; a panicked worker surfaces as `Error::Stage`.
    pub(crate) fn join(&self) -> Result<(), Error> {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };

        let mut result = Ok(());
        for handle in handles {
            if let Err(payload) = handle.join() {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                if result.is_ok() {
                    result = Err(Error::Stage {
                        stage: self.stage,
                        message,
                    });
                }
            }
        }
        result
    }
}

/// An ordered chain of stages with startup and shutdown sequencing.
///
/// Stages are wired to their downstream neighbor at construction; the
/// pipeline takes them entry-first and drives their lifecycle.
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>) -> Self {
        assert!(!stages.is_empty(), "pipeline needs at least one stage");
        Self { stages }
    }

    /// Spawn worker threads, downstream stages first so every producer
    /// finds its consumer running.
    pub fn start(&self) {
        for stage in self.stages.iter().rev() {
            Arc::clone(stage).start();
        }
    }

    /// Feed a message to the entry stage.
    pub fn push(&self, msg: Message) {
        self.stages[0].push(msg);
    }

    /// Close the entry stage and wait for the chain to drain.
    ///
    /// Returns the first stage failure encountered, after attempting to
    /// join every stage so no threads are leaked.
    pub fn finish(&self) -> Result<(), Error> {
        self.stages[0].close();

        let mut result = Ok(());
        for stage in &self.stages {
            if let Err(e) = stage.join() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
