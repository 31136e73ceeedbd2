//! # framepipe-host: screen capture host
//!
//! Captures the local desktop (DXGI Desktop Duplication on Windows, or a
//! synthetic test pattern anywhere), encodes it to H.264 with an ffmpeg
//! child process, and streams the framed elementary stream over a local
//! pipe to a single consumer process.
//!
//! ## Endpoints
//!
//! - **Windows**: `\\.\pipe\<name>` named pipe (default `CloudGameCapture`).
//! - **Unix**: domain socket path (default `/tmp/framepipe.sock`).
//! - **stdout**: `-`.

pub mod channel;
pub mod config;
pub mod ffmpeg;
pub mod provider;
pub mod service;
pub mod source;
