//! Producer side: capture → encode → normalise → enqueue.
//!
//! Runs on its own thread. Each iteration:
//!
//! 1. Stamp the iteration with microseconds since pipeline start.
//! 2. [`FrameSource::acquire`] with the configured bounded wait.
//! 3. [`VideoEncoder::submit`] the frame, or [`VideoEncoder::poll`] when
//!    there was none; zero or more access units come back, each carrying
//!    the timestamp of the iteration that captured it.
//! 4. Normalise each unit, prepend the parameter-set frame once per run,
//!    enqueue.
//! 5. Sleep out the rest of the frame interval. An overrun starts the
//!    next iteration immediately; nothing is caught up.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::bitstream::{detect_keyframe, normalize_access_unit, normalize_parameter_sets};
use crate::encoder::VideoEncoder;
use crate::error::PipelineError;
use crate::pipeline::WorkerContext;
use crate::source::FrameSource;
use crate::types::{AccessUnit, EncodedFrame, RawFrame};

/// Where this run stands with respect to the parameter-set frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterSetState {
    /// Nothing picture-bearing enqueued yet.
    Pending,
    /// The parameter-set frame went out ahead of the first picture.
    Sent,
    /// A picture went out first; no parameter-set frame this run.
    Skipped,
}

/// The capture/encode loop and the resources it owns.
pub struct CaptureWorker {
    source: Box<dyn FrameSource>,
    encoder: Box<dyn VideoEncoder>,
    ctx: WorkerContext,
    parameter_sets: ParameterSetState,
    backlog_warned: bool,
}

impl CaptureWorker {
    pub(crate) fn new(
        source: Box<dyn FrameSource>,
        encoder: Box<dyn VideoEncoder>,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            source,
            encoder,
            ctx,
            parameter_sets: ParameterSetState::Pending,
            backlog_warned: false,
        }
    }

    /// Loop until the running flag clears, then hand the resources back.
    pub fn run(mut self) -> (Box<dyn FrameSource>, Box<dyn VideoEncoder>) {
        let interval = self.ctx.config.frame_interval();
        info!(
            source = self.source.name(),
            encoder = self.encoder.name(),
            fps = self.ctx.config.fps,
            "capture loop started"
        );

        while self.ctx.running.load(Ordering::SeqCst) {
            let loop_start = Instant::now();
            self.step();
            pace(loop_start, interval);
        }

        let stats = self.ctx.stats.snapshot();
        info!(
            frames_captured = stats.frames_captured,
            frames_enqueued = stats.frames_enqueued,
            "capture loop ended"
        );
        self.into_resources()
    }

    /// Give back the source and encoder without running.
    pub(crate) fn into_resources(self) -> (Box<dyn FrameSource>, Box<dyn VideoEncoder>) {
        (self.source, self.encoder)
    }

    /// One capture/encode iteration.
    pub(crate) fn step(&mut self) {
        let timestamp_us = self.ctx.started_at.elapsed().as_micros() as u64;

        let units = match self.source.acquire(self.ctx.config.capture_timeout) {
            Ok(Some(mut frame)) => {
                frame.timestamp_us = timestamp_us;
                self.ctx.stats.add_captured(1);
                self.encode(frame, timestamp_us)
            }
            Ok(None) | Err(PipelineError::AcquisitionTimeout(_)) => {
                self.ctx.stats.add_acquisition_timeout(1);
                trace!(timestamp_us, "no new frame");
                self.poll_encoder()
            }
            Err(e) => {
                warn!(error = %e, "frame acquisition failed");
                self.poll_encoder()
            }
        };

        for unit in units {
            self.emit_unit(unit);
        }
    }

    fn encode(&mut self, frame: RawFrame, timestamp_us: u64) -> Vec<AccessUnit> {
        match self.encoder.submit(frame, timestamp_us) {
            Ok(units) => units,
            Err(e) => {
                self.ctx.stats.add_encode_failure(1);
                warn!(error = %e, timestamp_us, "encode failed; dropping this cycle");
                Vec::new()
            }
        }
    }

    /// Pick up whatever a buffering encoder finished since the last call.
    fn poll_encoder(&mut self) -> Vec<AccessUnit> {
        match self.encoder.poll() {
            Ok(units) => units,
            Err(e) => {
                self.ctx.stats.add_encode_failure(1);
                warn!(error = %e, "encoder poll failed");
                Vec::new()
            }
        }
    }

    fn emit_unit(&mut self, unit: AccessUnit) {
        let timestamp_us = unit.timestamp_us;
        let data = match normalize_access_unit(unit.data) {
            Ok(data) => data,
            Err(e) => {
                self.ctx.stats.add_normalization_failure(1);
                warn!(error = %e, timestamp_us, "dropping access unit");
                return;
            }
        };

        if self.parameter_sets == ParameterSetState::Pending {
            self.emit_parameter_sets(timestamp_us);
        }

        let is_keyframe = detect_keyframe(&data);
        trace!(timestamp_us, len = data.len(), is_keyframe, "access unit");
        self.enqueue(EncodedFrame::video(data, timestamp_us, is_keyframe));
    }

    /// Called right before the first picture of the run is enqueued.
    fn emit_parameter_sets(&mut self, timestamp_us: u64) {
        let Some(blob) = self.encoder.parameter_sets() else {
            debug!("no parameter sets before first picture; none will be sent this run");
            self.parameter_sets = ParameterSetState::Skipped;
            return;
        };

        match normalize_parameter_sets(blob) {
            Ok(data) => {
                info!(len = data.len(), "sending parameter sets");
                self.enqueue(EncodedFrame::parameter_sets(data, timestamp_us));
                self.parameter_sets = ParameterSetState::Sent;
            }
            Err(e) => {
                self.ctx.stats.add_normalization_failure(1);
                warn!(error = %e, "unusable parameter sets; none will be sent this run");
                self.parameter_sets = ParameterSetState::Skipped;
            }
        }
    }

    fn enqueue(&mut self, frame: EncodedFrame) {
        let depth = self.ctx.queue.push(frame);
        self.ctx.stats.add_enqueued(1);

        let limit = self.ctx.config.queue_warn_depth;
        if limit == 0 {
            return;
        }
        if depth >= limit && !self.backlog_warned {
            warn!(depth, "frame queue backlog; channel is not keeping up");
            self.backlog_warned = true;
        } else if depth < limit / 2 {
            self.backlog_warned = false;
        }
    }
}

/// Sleep for the remainder of the frame interval.
fn pace(loop_start: Instant, interval: Duration) {
    let elapsed = loop_start.elapsed();
    if elapsed < interval {
        thread::sleep(interval - elapsed);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::PipelineConfig;
    use crate::queue::FrameQueue;
    use crate::stats::PipelineStats;
    use crate::types::PixelFormat;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    const CONFIG_RECORD: &[u8] = &[
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x02, 0x67, 0x64, 0x01, 0x00, 0x02, 0x68, 0xEE,
    ];
    const IDR: &[u8] = &[0, 0, 0, 2, 0x65, 0x88];
    const NON_IDR: &[u8] = &[0, 0, 0, 2, 0x41, 0x9A];

    fn raw_frame() -> RawFrame {
        RawFrame {
            width: 2,
            height: 2,
            stride: 8,
            format: PixelFormat::Bgra8,
            data: vec![0; 16],
            timestamp_us: 0,
        }
    }

    struct ScriptedSource(VecDeque<Option<()>>);

    impl FrameSource for ScriptedSource {
        fn acquire(&mut self, _timeout: Duration) -> Result<Option<RawFrame>> {
            Ok(self.0.pop_front().flatten().map(|_| raw_frame()))
        }
    }

    /// Always has a frame; notes when each call started and sleeps through
    /// the first one for `first_call_delay`.
    struct TimedSource {
        calls: Arc<Mutex<Vec<Instant>>>,
        first_call_delay: Duration,
    }

    impl FrameSource for TimedSource {
        fn acquire(&mut self, _timeout: Duration) -> Result<Option<RawFrame>> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            let first = calls.len() == 1;
            drop(calls);
            if first {
                thread::sleep(self.first_call_delay);
            }
            Ok(Some(raw_frame()))
        }
    }

    /// Returns one scripted batch per submit; parameter sets appear from
    /// submission `sets_after` onward.
    struct ScriptedEncoder {
        batches: VecDeque<Result<Vec<Bytes>>>,
        submitted: usize,
        sets_after: Option<usize>,
    }

    impl VideoEncoder for ScriptedEncoder {
        fn submit(&mut self, _frame: RawFrame, ts: u64) -> Result<Vec<AccessUnit>> {
            self.submitted += 1;
            let batch = self.batches.pop_front().unwrap_or(Ok(Vec::new()))?;
            Ok(batch.into_iter().map(|unit| AccessUnit::new(unit, ts)).collect())
        }

        fn parameter_sets(&self) -> Option<Bytes> {
            match self.sets_after {
                Some(n) if self.submitted >= n => Some(Bytes::from_static(CONFIG_RECORD)),
                _ => None,
            }
        }
    }

    /// Holds each picture until the next submit or poll, like an encoder
    /// whose output arrives on another thread.
    #[derive(Default)]
    struct LaggingEncoder {
        held: Option<AccessUnit>,
        submitted_at: Arc<Mutex<Vec<u64>>>,
    }

    impl VideoEncoder for LaggingEncoder {
        fn submit(&mut self, _frame: RawFrame, ts: u64) -> Result<Vec<AccessUnit>> {
            let mut submitted_at = self.submitted_at.lock().unwrap();
            submitted_at.push(ts);
            let unit = if submitted_at.len() == 1 { IDR } else { NON_IDR };
            Ok(self
                .held
                .replace(AccessUnit::new(Bytes::from_static(unit), ts))
                .into_iter()
                .collect())
        }

        fn poll(&mut self) -> Result<Vec<AccessUnit>> {
            Ok(self.held.take().into_iter().collect())
        }

        fn parameter_sets(&self) -> Option<Bytes> {
            None
        }
    }

    fn context(config: PipelineConfig) -> (WorkerContext, Arc<FrameQueue>) {
        let queue = Arc::new(FrameQueue::new());
        let ctx = WorkerContext {
            queue: Arc::clone(&queue),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(PipelineStats::default()),
            started_at: Instant::now(),
            config,
        };
        (ctx, queue)
    }

    fn worker(
        frames: usize,
        batches: Vec<Result<Vec<Bytes>>>,
        sets_after: Option<usize>,
    ) -> (CaptureWorker, Arc<FrameQueue>) {
        let encoder = ScriptedEncoder {
            batches: batches.into(),
            submitted: 0,
            sets_after,
        };
        scripted_worker(frames, Box::new(encoder))
    }

    fn scripted_worker(
        frames: usize,
        encoder: Box<dyn VideoEncoder>,
    ) -> (CaptureWorker, Arc<FrameQueue>) {
        let (ctx, queue) = context(PipelineConfig::default());
        let source = ScriptedSource((0..frames).map(|_| Some(())).collect());
        (CaptureWorker::new(Box::new(source), encoder, ctx), queue)
    }

    fn drain(queue: &FrameQueue) -> Vec<EncodedFrame> {
        std::iter::from_fn(|| queue.try_pop()).collect()
    }

    /// Run the full loop at `fps` for `wall` and return when each
    /// acquisition started.
    fn run_timed(fps: u32, first_call_delay: Duration, wall: Duration) -> Vec<Instant> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let source = TimedSource {
            calls: Arc::clone(&calls),
            first_call_delay,
        };
        let encoder = ScriptedEncoder {
            batches: VecDeque::new(),
            submitted: 0,
            sets_after: None,
        };
        let (ctx, _queue) = context(PipelineConfig {
            fps,
            ..PipelineConfig::default()
        });
        let running = Arc::clone(&ctx.running);
        let w = CaptureWorker::new(Box::new(source), Box::new(encoder), ctx);

        let handle = thread::spawn(move || w.run());
        thread::sleep(wall);
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        calls.lock().unwrap().clone()
    }

    #[test]
    fn parameter_sets_precede_first_picture() {
        let batches = vec![
            Ok(vec![]),
            Ok(vec![Bytes::from_static(IDR), Bytes::from_static(NON_IDR)]),
            Ok(vec![Bytes::from_static(NON_IDR)]),
        ];
        let (mut w, queue) = worker(3, batches, Some(2));
        for _ in 0..3 {
            w.step();
        }

        let frames = drain(&queue);
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[0].data[..], &[0, 0, 0, 1, 0x67, 0x64, 0, 0, 0, 1, 0x68, 0xEE]);
        assert!(!frames[0].is_keyframe);
        assert!(frames[1].is_keyframe);
        assert!(!frames[2].is_keyframe);
        assert!(frames.iter().all(|f| !f.is_audio));
        assert_eq!(frames[0].timestamp_us, frames[1].timestamp_us);
    }

    #[test]
    fn late_parameter_sets_are_never_sent() {
        let batches = vec![
            Ok(vec![Bytes::from_static(IDR)]),
            Ok(vec![Bytes::from_static(NON_IDR)]),
        ];
        let (mut w, queue) = worker(2, batches, Some(2));
        w.step();
        w.step();

        let frames = drain(&queue);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_keyframe);
    }

    #[test]
    fn no_frame_skips_iteration() {
        let (mut w, queue) = worker(0, vec![], Some(0));
        w.step();
        assert!(queue.is_empty());
        assert_eq!(w.ctx.stats.snapshot().acquisition_timeouts, 1);
        assert_eq!(w.ctx.stats.snapshot().frames_captured, 0);
    }

    #[test]
    fn bad_unit_dropped_others_kept() {
        let batches = vec![Ok(vec![
            Bytes::from_static(&[0, 0, 0, 9, 0x65]),
            Bytes::from_static(IDR),
        ])];
        let (mut w, queue) = worker(1, batches, None);
        w.step();

        let frames = drain(&queue);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_keyframe);
        assert_eq!(w.ctx.stats.snapshot().normalization_failures, 1);
    }

    #[test]
    fn encode_failure_drops_cycle() {
        let batches = vec![
            Err(PipelineError::Encode("rejected".into())),
            Ok(vec![Bytes::from_static(NON_IDR)]),
        ];
        let (mut w, queue) = worker(2, batches, None);
        w.step();
        assert!(queue.is_empty());
        w.step();
        assert_eq!(queue.len(), 1);
        assert_eq!(w.ctx.stats.snapshot().encode_failures, 1);
    }

    #[test]
    fn delayed_output_keeps_its_capture_timestamp() {
        let encoder = LaggingEncoder::default();
        let submitted_at = Arc::clone(&encoder.submitted_at);
        let (mut w, queue) = scripted_worker(2, Box::new(encoder));

        w.step();
        assert!(queue.is_empty());
        thread::sleep(Duration::from_millis(20));
        w.step();

        let frames = drain(&queue);
        let submitted_at = submitted_at.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_keyframe);
        assert_eq!(frames[0].timestamp_us, submitted_at[0]);
        assert!(frames[0].timestamp_us + 20_000 <= submitted_at[1]);
    }

    #[test]
    fn idle_iterations_collect_buffered_output() {
        let encoder = LaggingEncoder::default();
        let submitted_at = Arc::clone(&encoder.submitted_at);
        let (mut w, queue) = scripted_worker(1, Box::new(encoder));

        w.step();
        assert!(queue.is_empty());
        w.step();

        let frames = drain(&queue);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_us, submitted_at.lock().unwrap()[0]);
        assert_eq!(w.ctx.stats.snapshot().acquisition_timeouts, 1);

        for _ in 0..10 {
            w.step();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn rate_never_exceeds_target_fps() {
        let calls = run_timed(20, Duration::ZERO, Duration::from_millis(300));

        // 20 fps over 300 ms: one iteration at t = 0, then one per 50 ms.
        assert!(calls.len() >= 3, "only {} iterations", calls.len());
        assert!(calls.len() <= 7, "{} iterations in 300 ms", calls.len());
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(48));
        }
    }

    #[test]
    fn overrun_is_not_caught_up() {
        let calls = run_timed(20, Duration::from_millis(120), Duration::from_millis(300));
        assert!(calls.len() >= 3, "only {} iterations", calls.len());

        // The slow iteration is followed at once, with no extra sleep...
        let after_overrun = calls[1] - calls[0];
        assert!(after_overrun >= Duration::from_millis(120));
        assert!(after_overrun < Duration::from_millis(160), "{after_overrun:?}");
        // ...and the missed slots are not made up with a burst.
        for pair in calls[1..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(48));
        }
    }

    #[test]
    fn run_returns_when_flag_clears() {
        let (w, _queue) = worker(0, vec![], None);
        w.ctx.running.store(false, Ordering::SeqCst);
        let (source, encoder) = w.run();
        assert_eq!(source.name(), "frame-source");
        assert_eq!(encoder.name(), "encoder");
    }
}
