//! framepipe-host entry point.
//!
//! ```text
//! framepipe-host                          Run with defaults / config file
//! framepipe-host --config <path>          Load a custom config TOML
//! framepipe-host --gen-config             Write default config to stdout
//! framepipe-host --width 1280 --height 720 --fps 30 --pipe <endpoint>
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framepipe_host::config::HostConfig;
use framepipe_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "framepipe-host",
    about = "Capture the screen, encode to H.264 and stream it over a local pipe"
)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "framepipe-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Capture width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Capture height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second.
    #[arg(long)]
    fps: Option<u32>,

    /// Output endpoint: named pipe, socket path, or `-` for stdout.
    #[arg(long)]
    pipe: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(pipe) = &self.pipe {
            config.channel.endpoint = pipe.clone();
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then let flags override it.
    let mut config = HostConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing. stdout may carry frames, so logs always go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("framepipe-host v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "resolution: {}x{}",
        config.capture.width, config.capture.height
    );
    info!("target FPS: {}", config.fps());
    info!("source: {:?}", config.capture.source);
    info!("endpoint: {}", config.channel.endpoint);

    let service = HostService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler: the first press only clears the running flag; a
    // second one aborts, e.g. while still waiting for a consumer.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Ctrl-C received; shutting down");
        stop.store(false, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second Ctrl-C; exiting immediately");
            std::process::exit(130);
        }
    });

    let stats = service.run().await?;
    info!(
        frames_sent = stats.frames_sent,
        bytes_sent = stats.bytes_sent,
        "capture stopped"
    );

    Ok(())
}
