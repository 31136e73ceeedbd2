//! Frame source seam.

use std::time::Duration;

use crate::error::Result;
use crate::types::RawFrame;

/// Produces raw screen images for the capture thread.
///
/// Implementations are owned and called by exactly one thread, so they
/// need `Send` but not `Sync`.
pub trait FrameSource: Send {
    /// Wait up to `timeout` for a new image.
    ///
    /// `Ok(None)` means nothing changed since the previous call; it is not
    /// an error. The capture worker overwrites `timestamp_us` on the
    /// returned frame.
    fn acquire(&mut self, timeout: Duration) -> Result<Option<RawFrame>>;

    /// Short name for log lines.
    fn name(&self) -> &str {
        "frame-source"
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn acquire(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        (**self).acquire(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
