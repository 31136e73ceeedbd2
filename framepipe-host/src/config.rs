//! Configuration for the capture host.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use framepipe_core::PipelineConfig;

/// Default output endpoint for the platform.
#[cfg(target_os = "windows")]
pub const DEFAULT_PIPE: &str = r"\\.\pipe\CloudGameCapture";
#[cfg(not(target_os = "windows"))]
pub const DEFAULT_PIPE: &str = "/tmp/framepipe.sock";

/// Highest frame rate the host will configure.
pub const MAX_FPS: u32 = 240;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Frame source settings.
    pub capture: CaptureConfig,
    /// ffmpeg encoder settings.
    pub encoder: EncoderConfig,
    /// Output channel settings.
    pub channel: ChannelConfig,
    /// Worker tuning.
    pub pipeline: PipelineTuning,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Which frame source to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// DXGI desktop duplication (Windows only).
    Desktop,
    /// Synthetic moving test pattern.
    Pattern,
}

/// Frame source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Pattern width in pixels. The desktop source always encodes at the
    /// desktop's own size, and the encoder restarts when that changes.
    pub width: u32,
    /// Pattern height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: u32,
    /// Monitor index to duplicate (0 = primary).
    pub monitor_index: u32,
    /// Bounded wait for a new desktop frame, in milliseconds.
    pub capture_timeout_ms: u32,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// ffmpeg executable, looked up on `PATH` when not absolute.
    pub ffmpeg: String,
    /// Average bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// x264 preset.
    pub preset: String,
    /// Keyframe interval in frames (0 = one per second).
    pub gop: u32,
}

/// Output channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Named pipe / socket path, or `-` for stdout.
    pub endpoint: String,
}

/// Worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    /// Transmit idle sleep in milliseconds.
    pub idle_sleep_ms: u64,
    /// Queue depth that triggers a backlog warning (0 = never).
    pub queue_warn_depth: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            encoder: EncoderConfig::default(),
            channel: ChannelConfig::default(),
            pipeline: PipelineTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: if cfg!(target_os = "windows") {
                SourceKind::Desktop
            } else {
                SourceKind::Pattern
            },
            width: 1920,
            height: 1080,
            fps: 60,
            monitor_index: 0,
            capture_timeout_ms: 100,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            bitrate_kbps: 5000,
            preset: "ultrafast".into(),
            gop: 0,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_PIPE.into(),
        }
    }
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 1,
            queue_warn_depth: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Frame rate actually used, clamped to `1..=MAX_FPS`.
    pub fn fps(&self) -> u32 {
        self.capture.fps.clamp(1, MAX_FPS)
    }

    /// Keyframe interval handed to the encoder.
    pub fn gop(&self) -> u32 {
        match self.encoder.gop {
            0 => self.fps(),
            n => n,
        }
    }

    /// Convert capture and tuning settings into a `PipelineConfig`.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            fps: self.fps(),
            capture_timeout: Duration::from_millis(u64::from(self.capture.capture_timeout_ms)),
            idle_sleep: Duration::from_millis(self.pipeline.idle_sleep_ms.max(1)),
            queue_warn_depth: self.pipeline.queue_warn_depth,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
