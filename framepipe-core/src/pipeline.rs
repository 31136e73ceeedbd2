//! Pipeline lifecycle: `Idle → Running → Idle`.
//!
//! [`PipelineOrchestrator::start`] opens the frame source, the encoder
//! and the output channel through a [`ResourceProvider`], then launches
//! one capture thread and one transmit thread around a fresh
//! [`FrameQueue`]. [`stop`](PipelineOrchestrator::stop) clears the
//! running flag, joins both threads and releases the resources in a fixed
//! order: encoder, then source, then channel. Frames still queued at that
//! point are discarded.
//!
//! ```no_run
//! # use framepipe_core::{PipelineConfig, PipelineOrchestrator, ResourceProvider};
//! # fn example(provider: impl ResourceProvider) -> framepipe_core::Result<()> {
//! let mut pipeline = PipelineOrchestrator::new(PipelineConfig::default(), provider);
//! let stop = pipeline.stop_handle();
//! pipeline.start()?;
//! // … a signal handler only does this …
//! stop.store(false, std::sync::atomic::Ordering::SeqCst);
//! // … and the owning thread then joins and releases:
//! pipeline.stop();
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::CaptureWorker;
use crate::encoder::VideoEncoder;
use crate::error::{PipelineError, Result};
use crate::queue::FrameQueue;
use crate::source::FrameSource;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::transmit::{Channel, TransmitWorker};

// ── PipelineConfig ───────────────────────────────────────────────

/// Timing knobs for the two workers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target capture rate. Achieved rate never exceeds it.
    pub fps: u32,
    /// Bounded wait handed to [`FrameSource::acquire`].
    pub capture_timeout: Duration,
    /// Transmit-thread sleep when the queue is empty.
    pub idle_sleep: Duration,
    /// Queue depth that triggers a backlog warning (0 = never).
    pub queue_warn_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            capture_timeout: Duration::from_millis(100),
            idle_sleep: Duration::from_millis(1),
            queue_warn_depth: 120,
        }
    }
}

impl PipelineConfig {
    /// `1_000_000 / fps` microseconds.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}

// ── WorkerContext ────────────────────────────────────────────────

/// State shared by both workers of one run.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<FrameQueue>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) started_at: Instant,
    pub(crate) config: PipelineConfig,
}

// ── ResourceProvider ─────────────────────────────────────────────

/// Opens the external collaborators for each run.
///
/// Called on the orchestrating thread, in the order source, encoder,
/// channel. A failure aborts `start()` after anything already opened has
/// been released.
pub trait ResourceProvider {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>>;
    fn open_encoder(&mut self) -> Result<Box<dyn VideoEncoder>>;
    fn open_channel(&mut self) -> Result<Channel>;
}

// ── PipelineOrchestrator ─────────────────────────────────────────

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
}

type CaptureResources = (Box<dyn FrameSource>, Box<dyn VideoEncoder>);

struct Workers {
    capture: JoinHandle<Option<CaptureResources>>,
    transmit: JoinHandle<Option<Channel>>,
    queue: Arc<FrameQueue>,
}

/// Owns the running flag, the worker threads and, between runs, nothing
/// else: resources live inside the workers while running.
pub struct PipelineOrchestrator<P: ResourceProvider> {
    provider: P,
    config: PipelineConfig,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    workers: Option<Workers>,
}

impl<P: ResourceProvider> PipelineOrchestrator<P> {
    pub fn new(config: PipelineConfig, provider: P) -> Self {
        Self {
            provider,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            workers: None,
        }
    }

    /// Open resources and launch both workers.
    ///
    /// Fails with [`PipelineError::AlreadyRunning`] unless `Idle`, and with
    /// [`PipelineError::Initialization`] if any resource cannot be opened.
    pub fn start(&mut self) -> Result<()> {
        if self.workers.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let (source, encoder, channel) = self.open_resources()?;

        let queue = Arc::new(FrameQueue::new());
        self.stats = Arc::new(PipelineStats::default());
        let ctx = WorkerContext {
            queue: Arc::clone(&queue),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            started_at: Instant::now(),
            config: self.config.clone(),
        };

        self.running.store(true, Ordering::SeqCst);

        let capture_worker = CaptureWorker::new(source, encoder, ctx.clone());
        let capture = match spawn_worker("framepipe-capture", capture_worker, CaptureWorker::run) {
            Ok(handle) => handle,
            Err((worker, e)) => {
                self.running.store(false, Ordering::SeqCst);
                release_resources(Some(worker.into_resources()), Some(channel));
                return Err(PipelineError::Initialization(format!(
                    "spawn capture thread: {e}"
                )));
            }
        };

        let transmit_worker = TransmitWorker::new(channel, ctx);
        let transmit =
            match spawn_worker("framepipe-transmit", transmit_worker, TransmitWorker::run) {
                Ok(handle) => handle,
                Err((worker, e)) => {
                    self.running.store(false, Ordering::SeqCst);
                    let capture = capture.join().ok().flatten();
                    release_resources(capture, Some(worker.into_channel()));
                    return Err(PipelineError::Initialization(format!(
                        "spawn transmit thread: {e}"
                    )));
                }
            };

        self.workers = Some(Workers {
            capture,
            transmit,
            queue,
        });
        info!(
            fps = self.config.fps,
            interval_us = self.config.frame_interval().as_micros() as u64,
            "pipeline started"
        );
        Ok(())
    }

    /// Halt both workers and release resources. No-op when `Idle`.
    pub fn stop(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        debug!("waiting for workers to exit");

        let capture = match workers.capture.join() {
            Ok(resources) => resources,
            Err(_) => {
                error!("capture thread panicked; its resources are gone");
                None
            }
        };
        let channel = match workers.transmit.join() {
            Ok(channel) => channel,
            Err(_) => {
                error!("transmit thread panicked; its channel is gone");
                None
            }
        };
        release_resources(capture, channel);

        let discarded = workers.queue.clear();
        self.stats.add_discarded(discarded as u64);
        if discarded > 0 {
            warn!(discarded, "discarded untransmitted frames");
        }
        info!("pipeline stopped");
    }

    pub fn state(&self) -> PipelineState {
        if self.workers.is_some() {
            PipelineState::Running
        } else {
            PipelineState::Idle
        }
    }

    /// The shared running flag.
    ///
    /// Storing `false` makes both workers finish their current iteration
    /// and exit; [`stop`](Self::stop) must still be called to join them
    /// and release resources.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Whether the running flag is set.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Counters of the current (or most recent) run.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn open_resources(&mut self) -> Result<(Box<dyn FrameSource>, Box<dyn VideoEncoder>, Channel)> {
        let source = self.provider.open_source().map_err(init_error("frame source"))?;

        let encoder = match self.provider.open_encoder() {
            Ok(encoder) => encoder,
            Err(e) => {
                release("source", source);
                return Err(init_error("encoder")(e));
            }
        };

        let channel = match self.provider.open_channel() {
            Ok(channel) => channel,
            Err(e) => {
                release("encoder", encoder);
                release("source", source);
                return Err(init_error("channel")(e));
            }
        };

        debug!(
            source = source.name(),
            encoder = encoder.name(),
            "resources opened"
        );
        Ok((source, encoder, channel))
    }
}

impl<P: ResourceProvider> Drop for PipelineOrchestrator<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn init_error(what: &'static str) -> impl Fn(PipelineError) -> PipelineError {
    move |e| match e {
        PipelineError::Initialization(msg) => {
            PipelineError::Initialization(format!("{what}: {msg}"))
        }
        other => PipelineError::Initialization(format!("{what}: {other}")),
    }
}

/// Start `run(worker)` on a named thread.
///
/// The worker is handed over only once the thread exists, so a failed
/// spawn gives it back to the caller.
fn spawn_worker<W, R>(
    name: &str,
    worker: W,
    run: fn(W) -> R,
) -> std::result::Result<JoinHandle<Option<R>>, (W, io::Error)>
where
    W: Send + 'static,
    R: Send + 'static,
{
    let (handoff, inbox) = mpsc::channel::<W>();
    let spawned = thread::Builder::new()
        .name(name.into())
        .spawn(move || inbox.recv().ok().map(run));

    match spawned {
        Ok(handle) => match handoff.send(worker) {
            Ok(()) => Ok(handle),
            Err(mpsc::SendError(worker)) => Err((
                worker,
                io::Error::other("worker thread exited before it was started"),
            )),
        },
        Err(e) => Err((worker, e)),
    }
}

/// Release whatever is left of a run: encoder, then source, then channel.
fn release_resources(capture: Option<CaptureResources>, channel: Option<Channel>) {
    if let Some((source, encoder)) = capture {
        release("encoder", encoder);
        release("source", source);
    }
    if let Some(channel) = channel {
        release("channel", channel);
    }
}

fn release<T: ?Sized>(what: &'static str, resource: Box<T>) {
    drop(resource);
    debug!(resource = what, "released");
}

// ── Tests ────────────────────────────────────────────────────────
