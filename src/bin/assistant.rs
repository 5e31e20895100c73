//! Live Assistant
//!
//! Press Enter to toggle the session on and off; Ctrl-C quits.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_assistant::{
    audio::list_devices,
    config::AppConfig,
    network::WebSocketConnector,
    session::{SessionController, SessionHandle, SessionState, StdinToggle, SystemDevices, ToggleListener},
};

#[derive(Parser, Debug)]
#[command(name = "assistant", version, about = "Toggle-driven live voice and screen assistant")]
struct Args {
    /// Config file used in place of ./live-assistant.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,
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

    let args = Args::parse();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    tracing::info!("Starting Live Assistant");

    let config = AppConfig::load_from(args.config.as_deref()).context("loading configuration")?;
    config
        .validate_for_connect()
        .context("checking configuration")?;
    tracing::info!(
        "Model {} voice {}, screen capture {}",
        config.transport.model,
        config.transport.voice,
        if config.screen.enabled { "on" } else { "off" }
    );

    let handle = SessionController::spawn(
        Arc::new(config),
        Arc::new(SystemDevices),
        Arc::new(WebSocketConnector::new()),
    );
    present(&handle);

    StdinToggle
        .listen(Arc::new(handle.clone()))
        .context("starting toggle listener")?;
    println!("Press Enter to toggle, Ctrl-C to quit");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    handle.shutdown().await;

    Ok(())
}

/// Console stand-in for the overlay and tray indicators
fn present(handle: &SessionHandle) {
    let faults = handle.clone();
    handle.subscribe(move |state| match state {
        SessionState::Active => println!("ONLINE"),
        SessionState::Idle => println!("PAUSED"),
        SessionState::Faulted => match faults.last_fault() {
            Some(fault) => println!("FAILED: {} (press Enter to retry)", fault),
            None => println!("FAILED (press Enter to retry)"),
        },
        SessionState::Starting | SessionState::Stopping => {
            tracing::debug!("Indicator: {}", state)
        }
    });
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let direction = match (device.is_input, device.is_output) {
            (true, true) => "in/out",
            (true, false) => "in",
            _ => "out",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, direction, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}
