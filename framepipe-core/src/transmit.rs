//! Consumer side: dequeue → frame → write → flush.
//!
//! Runs on its own thread and is the only user of the output channel.
//! Delivery is at-most-once: a frame whose write fails is dropped and
//! the loop moves on to the next one.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::{debug, info, trace, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::WorkerContext;
use crate::types::EncodedFrame;
use crate::wire::FrameCodec;

/// The outbound byte-stream endpoint, already connected.
pub type Channel = Box<dyn Write + Send>;

/// How often the throughput line is logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive write failures between repeated warnings.
const FAILURE_LOG_EVERY: u64 = 100;

/// The transmit loop and the channel it owns.
pub struct TransmitWorker {
    channel: Channel,
    ctx: WorkerContext,
    codec: FrameCodec,
    buf: BytesMut,
    /// Frames and bytes sent since `last_report`.
    window: (u64, u64),
    last_report: Instant,
    consecutive_failures: u64,
}

impl TransmitWorker {
    pub(crate) fn new(channel: Channel, ctx: WorkerContext) -> Self {
        Self {
            channel,
            ctx,
            codec: FrameCodec,
            buf: BytesMut::with_capacity(256 * 1024),
            window: (0, 0),
            last_report: Instant::now(),
            consecutive_failures: 0,
        }
    }

    /// Loop until the running flag clears, then hand the channel back.
    pub fn run(mut self) -> Channel {
        info!("transmit loop started");

        while self.ctx.running.load(Ordering::SeqCst) {
            match self.ctx.queue.try_pop() {
                Some(frame) => self.transmit(frame),
                None => thread::sleep(self.ctx.config.idle_sleep),
            }
        }

        let stats = self.ctx.stats.snapshot();
        info!(
            frames_sent = stats.frames_sent,
            bytes_sent = stats.bytes_sent,
            write_failures = stats.write_failures,
            "transmit loop ended"
        );
        self.into_channel()
    }

    /// Give back the channel without running.
    pub(crate) fn into_channel(self) -> Channel {
        self.channel
    }

    /// Serialise and write one frame, flushing immediately.
    pub(crate) fn transmit(&mut self, frame: EncodedFrame) {
        let timestamp_us = frame.timestamp_us;
        let is_keyframe = frame.is_keyframe;

        match self.write_frame(frame) {
            Ok(written) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "channel writes recovered"
                    );
                    self.consecutive_failures = 0;
                }
                self.ctx.stats.add_sent(1);
                self.ctx.stats.add_bytes_sent(written as u64);
                self.window.0 += 1;
                self.window.1 += written as u64;
                trace!(timestamp_us, written, is_keyframe, "frame sent");
                self.report();
            }
            Err(e) => {
                self.ctx.stats.add_write_failure(1);
                self.consecutive_failures += 1;
                if self.consecutive_failures % FAILURE_LOG_EVERY == 1 {
                    warn!(
                        error = %e,
                        timestamp_us,
                        consecutive = self.consecutive_failures,
                        "dropping frame"
                    );
                } else {
                    debug!(error = %e, timestamp_us, "dropping frame");
                }
            }
        }
    }

    fn write_frame(&mut self, frame: EncodedFrame) -> Result<usize> {
        self.buf.clear();
        self.codec.encode(frame, &mut self.buf)?;

        self.channel
            .write_all(&self.buf)
            .map_err(PipelineError::ChannelWrite)?;
        self.channel.flush().map_err(PipelineError::ChannelWrite)?;
        Ok(self.buf.len())
    }

    fn report(&mut self) {
        let elapsed = self.last_report.elapsed();
        if elapsed < REPORT_INTERVAL {
            return;
        }
        let (frames, bytes) = std::mem::take(&mut self.window);
        self.last_report = Instant::now();

        let secs = elapsed.as_secs_f64();
        debug!(
            bytes_per_sec = (bytes as f64 / secs) as u64,
            frames_per_sec = frames as f64 / secs,
            queued = self.ctx.queue.len(),
            "transmit throughput"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
