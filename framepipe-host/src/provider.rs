//! Opens the host's concrete source, encoder and channel for each run.

use tracing::{info, warn};

use framepipe_core::{
    Channel, FrameSource, PixelFormat, ResourceProvider, Result, VideoEncoder,
};

use crate::channel::open_channel;
use crate::config::{HostConfig, SourceKind};
use crate::ffmpeg::{FfmpegEncoder, FfmpegSettings};
use crate::source::{DesktopSource, PatternSource};

pub struct HostProvider {
    config: HostConfig,
    /// Size of the most recently opened source; the encoder is sized to it.
    frame_size: (u32, u32),
}

impl HostProvider {
    pub fn new(config: HostConfig) -> Self {
        let frame_size = (config.capture.width, config.capture.height);
        Self { config, frame_size }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Encoder settings for the current frame size.
    pub fn encoder_settings(&self) -> FfmpegSettings {
        let (width, height) = self.frame_size;
        FfmpegSettings {
            program: self.config.encoder.ffmpeg.clone(),
            width,
            height,
            format: PixelFormat::Bgra8,
            fps: self.config.fps(),
            bitrate_kbps: self.config.encoder.bitrate_kbps,
            preset: self.config.encoder.preset.clone(),
            gop: self.config.gop(),
        }
    }
}

impl ResourceProvider for HostProvider {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        let capture = &self.config.capture;
        match capture.source {
            SourceKind::Desktop => {
                let source = DesktopSource::open(capture.monitor_index)?;
                let actual = (source.width(), source.height());
                if actual != (capture.width, capture.height) {
                    warn!(
                        configured = ?(capture.width, capture.height),
                        ?actual,
                        "desktop size differs from configuration; encoding at desktop size"
                    );
                }
                self.frame_size = actual;
                Ok(Box::new(source))
            }
            SourceKind::Pattern => {
                self.frame_size = (capture.width, capture.height);
                info!(width = capture.width, height = capture.height, "using test pattern");
                Ok(Box::new(PatternSource::new(capture.width, capture.height)))
            }
        }
    }

    fn open_encoder(&mut self) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegEncoder::spawn(self.encoder_settings())?))
    }

    fn open_channel(&mut self) -> Result<Channel> {
        open_channel(&self.config.channel.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_source_sets_encoder_size() {
        let mut config = HostConfig::default();
        config.capture.source = SourceKind::Pattern;
        config.capture.width = 320;
        config.capture.height = 240;
        config.capture.fps = 500;
        let mut provider = HostProvider::new(config);

        let source = provider.open_source().unwrap();
        assert_eq!(source.name(), "test-pattern");

        let settings = provider.encoder_settings();
        assert_eq!((settings.width, settings.height), (320, 240));
        assert_eq!(settings.fps, 240);
        assert_eq!(settings.gop, 240);
    }

    #[test]
    fn missing_ffmpeg_is_an_initialization_error() {
        let mut config = HostConfig::default();
        config.encoder.ffmpeg = "/nonexistent/framepipe-ffmpeg".into();
        let mut provider = HostProvider::new(config);

        let err = provider.open_encoder().err().unwrap();
        assert!(matches!(err, framepipe_core::PipelineError::Initialization(_)));
    }
}
