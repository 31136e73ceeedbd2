//! Domain-specific error types for the capture pipeline.
//!
//! Fallible operations return `Result<T, PipelineError>`. Errors raised
//! inside the worker loops are logged and counted by the loop itself; only
//! [`PipelineOrchestrator::start`](crate::PipelineOrchestrator::start)
//! hands an error back to the caller.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The canonical error type for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── In-loop (non-fatal) ──────────────────────────────────────
    /// The frame source had nothing new within the wait.
    #[error("no frame acquired within {0:?}")]
    AcquisitionTimeout(Duration),

    /// The encoder rejected its input or produced unusable output.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A parameter-set blob or access unit could not be normalised.
    #[error("bitstream normalization failed: {0}")]
    Normalization(&'static str),

    /// Writing a frame to the output channel failed.
    #[error("channel write failed: {0}")]
    ChannelWrite(#[source] std::io::Error),

    // ── Wire Errors ──────────────────────────────────────────────
    /// A frame header announced a payload beyond the codec limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Reserved flag bits were set in a frame header.
    #[error("reserved wire flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    // ── Lifecycle ────────────────────────────────────────────────
    /// A source, encoder or channel could not be opened.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// `start()` was called while the pipeline was already running.
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// Generic I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for PipelineError {
    fn from(s: String) -> Self {
        PipelineError::Other(s)
    }
}

impl From<&str> for PipelineError {
    fn from(s: &str) -> Self {
        PipelineError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = PipelineError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = PipelineError::Normalization("blob shorter than 7 bytes");
        assert!(e.to_string().contains("7 bytes"));
    }

    #[test]
    fn from_string() {
        let e: PipelineError = "something broke".into();
        assert!(matches!(e, PipelineError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: PipelineError = io_err.into();
        assert!(matches!(e, PipelineError::Io(_)));
    }
}
