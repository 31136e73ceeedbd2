//! Host service: owns one pipeline run from start to shutdown.
//!
//! The pipeline itself is thread-based, so the service drives it from a
//! blocking task and only watches the running flag from there. Signal
//! handlers flip the flag and never touch the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use framepipe_core::{PipelineOrchestrator, StatsSnapshot};

use crate::config::HostConfig;
use crate::provider::HostProvider;

/// How often the supervising loop checks the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a status line is logged while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

// ── HostService ──────────────────────────────────────────────────

pub struct HostService {
    config: HostConfig,
    running: Arc<AtomicBool>,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Obtain a handle that can be used to stop the service from a
    /// signal handler or another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pipeline until stopped and return its final counters.
    ///
    /// 1. Opens the source, the encoder and the channel; the channel blocks
    ///    until a consumer connects.
    /// 2. Starts the capture and transmit workers.
    /// 3. Logs a status line every few seconds.
    /// 4. Once the flag clears, joins the workers and releases everything.
    pub async fn run(&self) -> Result<StatsSnapshot, Box<dyn std::error::Error + Send + Sync>> {
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let stats = tokio::task::spawn_blocking(move || supervise(config, running)).await??;
        Ok(stats)
    }
}

fn supervise(config: HostConfig, running: Arc<AtomicBool>) -> framepipe_core::Result<StatsSnapshot> {
    let mut pipeline =
        PipelineOrchestrator::new(config.to_pipeline_config(), HostProvider::new(config));

    pipeline.start()?;
    info!("capture running; press Ctrl-C to stop");

    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) && pipeline.is_running() {
        thread::sleep(POLL_INTERVAL);
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            log_status(&pipeline.stats());
        }
    }

    pipeline.stop();
    let stats = pipeline.stats();
    log_status(&stats);
    Ok(stats)
}

fn log_status(stats: &StatsSnapshot) {
    info!(
        captured = stats.frames_captured,
        sent = stats.frames_sent,
        bytes = stats.bytes_sent,
        encode_failures = stats.encode_failures,
        write_failures = stats.write_failures,
        discarded = stats.frames_discarded,
        "status"
    );
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creates_with_defaults() {
        let svc = HostService::new(HostConfig::default());
        assert!(svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = HostService::new(HostConfig::default());
        let handle = svc.stop_handle();
        svc.stop();
        assert!(!handle.load(Ordering::SeqCst));
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
    }

    #[tokio::test]
    async fn run_reports_initialization_failure() {
        let mut config = HostConfig::default();
        config.capture.source = crate::config::SourceKind::Pattern;
        config.encoder.ffmpeg = "/nonexistent/framepipe-ffmpeg".into();
        let svc = HostService::new(config);

        let err = svc.run().await.unwrap_err();
        assert!(err.to_string().contains("initialization failed"));
    }
}
