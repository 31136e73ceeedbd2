//! FIFO hand-off between the capture and transmit threads.
//!
//! One producer pushes, one consumer pops. A single mutex guards the
//! deque; `try_pop` never blocks on an empty queue. The queue is not
//! bounded: see `PipelineConfig::queue_warn_depth` for the high-water
//! warning the capture worker emits instead.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::types::EncodedFrame;

/// Thread-safe, unbounded queue of encoded frames.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<EncodedFrame>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Returns the queue length after the push.
    pub fn push(&self, frame: EncodedFrame) -> usize {
        let mut frames = self.lock();
        frames.push_back(frame);
        frames.len()
    }

    /// Remove and return the oldest frame, if any.
    pub fn try_pop(&self) -> Option<EncodedFrame> {
        self.lock().pop_front()
    }

    /// Number of frames waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let n = frames.len();
        frames.clear();
        n
    }

    // A panic on the other side must not wedge the survivor; the deque
    // itself is never left half-modified.
    fn lock(&self) -> MutexGuard<'_, VecDeque<EncodedFrame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Tests ────────────────────────────────────────────────────────
