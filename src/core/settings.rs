//! Supervisor settings - Timing and default file locations

use std::path::PathBuf;
use std::time::Duration;

/// Timing and file locations for one supervisor run
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Seconds between monitoring cycles
    pub poll_interval_secs: u64,
    /// Time given to a freshly spawned companion before resolving it (ms)
    pub launch_grace_ms: u64,
    /// How long a graceful stop may take before the companion is killed (ms)
    pub stop_timeout_ms: u64,
    /// Liveness polling step while waiting for the companion to exit (ms)
    pub stop_poll_ms: u64,
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            launch_grace_ms: 2000,
            stop_timeout_ms: 3000,
            stop_poll_ms: 100,
            data_directory: None,
            debug_logging: false,
        }
    }
}

impl SupervisorSettings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("replaywatch")
        })
    }

    /// Default location of the shared configuration file
    pub fn get_config_path(&self) -> PathBuf {
        self.get_data_directory().join("config.json")
    }

    /// Default location of the action log
    pub fn get_action_log_path(&self) -> PathBuf {
        self.get_data_directory().join("actions.log")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.poll_interval_secs = self.poll_interval_secs.max(1);
        self.stop_poll_ms = self.stop_poll_ms.clamp(10, 1000);
        self.stop_timeout_ms = self.stop_timeout_ms.max(self.stop_poll_ms);
    }
}
