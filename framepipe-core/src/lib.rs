//! # framepipe-core
//!
//! Capture → encode → transport pipeline for low-latency screen streaming.
//!
//! This crate contains:
//! - **Seams**: `FrameSource`, `VideoEncoder` and `ResourceProvider`, the
//!   boundaries to platform capture, hardware/software encoders and the
//!   output channel
//! - **Bitstream**: H.264 normalisation to start-code delimited form,
//!   keyframe detection and access-unit splitting
//! - **Queue**: `FrameQueue`, the unbounded FIFO between the two workers
//! - **Workers**: the capture/encode loop and the transmit loop, each on
//!   its own thread
//! - **Wire**: `FrameCodec`, the 13-byte-header framing written to the
//!   channel (usable with `tokio_util::codec::FramedRead` on the far end)
//! - **Pipeline**: `PipelineOrchestrator`, which owns the lifecycle
//! - **Error**: `PipelineError`, a typed `thiserror`-based hierarchy

pub mod bitstream;
pub mod capture;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod stats;
pub mod transmit;
pub mod types;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use encoder::{UnitInbox, UnitSink, VideoEncoder, unit_channel};
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineConfig, PipelineOrchestrator, PipelineState, ResourceProvider};
pub use queue::FrameQueue;
pub use source::FrameSource;
pub use stats::{PipelineStats, StatsSnapshot};
pub use transmit::Channel;
pub use types::{AccessUnit, EncodedFrame, PixelFormat, RawFrame};
pub use wire::{FrameCodec, FrameHeader, MAX_PAYLOAD_SIZE, WireFlags};
