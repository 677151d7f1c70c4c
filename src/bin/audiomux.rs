//! audiomux daemon
//!
//! Opens the configured default output and input over the selected
//! hardware backend and keeps them running until Ctrl-C. Pass a config
//! file path as the first argument to override the default location.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiomux::{
    audio::{device::AudioHardware, memory::MemoryHardware},
    config::{Backend, ServerConfig},
    protocol::{IoConfigNotification, OutputFlags},
    AudioServer,
};

/// Pid the daemon uses for its own privileged calls
const DAEMON_PID: u32 = 0;

fn build_hardware(config: &ServerConfig) -> Result<Box<dyn AudioHardware>> {
    let daemon = &config.daemon;
    match daemon.backend {
        Backend::Memory => Ok(Box::new(MemoryHardware::realtime(
            daemon.output_frame_count,
            daemon.input_frame_count,
        ))),
        #[cfg(feature = "cpal-backend")]
        Backend::Cpal => Ok(Box::new(audiomux::audio::cpal_backend::CpalHardware::new(
            daemon.output_frame_count,
        ))),
        #[cfg(not(feature = "cpal-backend"))]
        Backend::Cpal => anyhow::bail!("cpal backend requested but built without `cpal-backend`"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audiomux");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServerConfig::load_or_default(path.as_deref()).context("loading config")?;
    tracing::info!("Backend: {:?}", config.daemon.backend);

    let hardware = build_hardware(&config)?;
    let server = AudioServer::new(hardware, config.clone()).context("starting server")?;

    // Log every io change
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<IoConfigNotification>();
    server.register_client(Box::new(event_tx));
    std::thread::Builder::new()
        .name("audiomux-events".into())
        .spawn(move || {
            for event in event_rx {
                tracing::info!(
                    "io {} {:?} {:?}",
                    event.handle,
                    event.event,
                    event.descriptor
                );
            }
        })?;

    let output = server
        .open_output(config.daemon.output, OutputFlags::NONE)
        .context("opening default output")?;
    tracing::info!("Default output {} ({:?})", output, server.output_descriptor(output)?);

    match server.open_input(config.daemon.input) {
        Ok(input) => tracing::info!("Default input {}", input),
        Err(e) => tracing::warn!("No default input: {}", e),
    }

    let dump_every = config.daemon.dump_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(dump_every.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = ticker.tick(), if dump_every > 0 => {
                match server.dump(DAEMON_PID) {
                    Ok(report) => tracing::info!("\n{}", report.to_text()),
                    Err(e) => tracing::warn!("Dump failed: {}", e),
                }
            }
        }
    }

    server.shutdown();
    Ok(())
}
