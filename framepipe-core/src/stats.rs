//! Run counters shared by the two workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, reset at every `start()`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    acquisition_timeouts: AtomicU64,
    encode_failures: AtomicU64,
    normalization_failures: AtomicU64,
    frames_enqueued: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    write_failures: AtomicU64,
    frames_discarded: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub acquisition_timeouts: u64,
    pub encode_failures: u64,
    pub normalization_failures: u64,
    pub frames_enqueued: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub write_failures: u64,
    pub frames_discarded: u64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $inc(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    counter! {
        add_captured => frames_captured,
        add_acquisition_timeout => acquisition_timeouts,
        add_encode_failure => encode_failures,
        add_normalization_failure => normalization_failures,
        add_enqueued => frames_enqueued,
        add_sent => frames_sent,
        add_bytes_sent => bytes_sent,
        add_write_failure => write_failures,
        add_discarded => frames_discarded,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            acquisition_timeouts: self.acquisition_timeouts.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            normalization_failures: self.normalization_failures.load(Ordering::Relaxed),
            frames_enqueued: self.frames_enqueued.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}
