//! replaywatch - Launch a recording companion while whitelisted games run
//!
//! Polls the process table, starts the companion (OBS Studio by default)
//! when a whitelisted game appears and closes it again once the game is
//! gone. Only instances started by this supervisor are ever stopped.

mod cli;
mod core;
mod platform;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;
use crate::core::{
    ActionLog, CompanionLauncher, ConfigStore, ObsIdentity, ProcessScanner, Supervisor,
    SystemProbe,
};

/// Application name constant
pub const APP_NAME: &str = "replaywatch";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    // Initialize logging
    init_logging(settings.debug_logging);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Ensure only one supervisor is running on this host
    let instance = SingleInstance::new(APP_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to create single instance lock: {}", e))?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install interrupt handler")?;

    let config_path = cli.config_path(&settings);
    let action_log_path = cli.action_log_path(&settings);
    info!("Configuration: {}", config_path.display());
    info!("Action log: {}", action_log_path.display());

    let mut supervisor = Supervisor::new(
        ConfigStore::new(config_path, Box::new(SystemProbe)),
        ProcessScanner::system(Box::new(ObsIdentity::default())),
        CompanionLauncher::new(&settings),
        ActionLog::new(action_log_path),
        settings,
    )
    .context("Failed to load configuration")?;

    let reason = supervisor.run(&shutdown);
    info!("{} shutting down: {}", APP_NAME, reason.describe());
    Ok(())
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default_filter = if debug {
        "replaywatch=debug"
    } else {
        "replaywatch=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
