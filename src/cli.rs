//! Command line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::core::SupervisorSettings;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "replaywatch",
    version,
    about = "Launch the recording companion while whitelisted games run"
)]
pub struct Cli {
    /// Shared configuration file (defaults to the user data directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// File the latest start/stop action is written to
    #[arg(long)]
    pub action_log: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Settings for this run
    pub fn settings(&self) -> SupervisorSettings {
        let mut settings = SupervisorSettings {
            debug_logging: self.verbose,
            ..Default::default()
        };
        settings.validate();
        settings
    }

    pub fn config_path(&self, settings: &SupervisorSettings) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| settings.get_config_path())
    }

    /// Defaults next to the configuration file, where the editor looks for it
    pub fn action_log_path(&self, settings: &SupervisorSettings) -> PathBuf {
        match (&self.action_log, &self.config) {
            (Some(path), _) => path.clone(),
            (None, Some(config)) => config.with_file_name("actions.log"),
            (None, None) => settings.get_action_log_path(),
        }
    }
}
