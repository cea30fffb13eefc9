//! Supervisor - Polling loop and companion ownership state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::action_log::ActionLog;
use super::config::{ConfigError, ConfigStore, Configuration};
use super::launcher::{Launch, LaunchError};
use super::scanner::{ProcessRef, ProcessScanner};
use super::settings::SupervisorSettings;

/// Longest uninterrupted sleep, so shutdown requests are noticed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Failures of a single monitoring cycle
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Why the supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The whitelist was empty at startup
    NothingToMonitor,
    /// The whitelist was emptied while running
    WhitelistEmptied,
    /// The configuration file disappeared while running
    ConfigRemoved,
    /// An interrupt or terminate request was received
    Interrupted,
}

impl ExitReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NothingToMonitor => "no whitelisted processes configured",
            Self::WhitelistEmptied => "whitelist is now empty",
            Self::ConfigRemoved => "configuration file was removed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Result of one monitoring cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Exit(ExitReason),
}

/// Coarse view of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// No companion of ours is running
    Quiescent,
    /// We started the companion and it is still alive
    Supervising,
}

/// State carried between cycles
#[derive(Debug, Clone, Default)]
pub struct SupervisorState {
    /// True only while `tracked` is a companion this supervisor spawned
    pub owns_companion: bool,
    pub tracked: Option<ProcessRef>,
    /// Whitelist identifier that caused the current launch
    pub last_trigger: Option<String>,
}

impl SupervisorState {
    fn release(&mut self) -> Option<(ProcessRef, Option<String>)> {
        let trigger = self.last_trigger.take();
        let tracked = self.tracked.take();
        let owned = std::mem::take(&mut self.owns_companion);
        match tracked {
            Some(process) if owned => Some((process, trigger)),
            _ => None,
        }
    }
}

/// Starts the companion while a whitelisted process runs and stops it after
pub struct Supervisor<L: Launch> {
    store: ConfigStore,
    config: Configuration,
    config_seen: SystemTime,
    scanner: ProcessScanner,
    launcher: L,
    action_log: ActionLog,
    settings: SupervisorSettings,
    state: SupervisorState,
}

impl<L: Launch> Supervisor<L> {
    /// Prepare a supervisor: clear the action log and load the configuration
    ///
    /// A corrupt configuration file is returned as `ConfigError::Invalid`
    /// before any process is scanned.
    pub fn new(
        store: ConfigStore,
        scanner: ProcessScanner,
        launcher: L,
        action_log: ActionLog,
        settings: SupervisorSettings,
    ) -> Result<Self, ConfigError> {
        if let Err(e) = action_log.clear() {
            warn!("Error clearing action log {}: {}", action_log.path().display(), e);
        }

        let config = store.load()?;
        let config_seen = store.modified()?;

        Ok(Self {
            store,
            config,
            config_seen,
            scanner,
            launcher,
            action_log,
            settings,
            state: SupervisorState::default(),
        })
    }

    #[cfg(test)]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    #[cfg(test)]
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn phase(&self) -> SupervisorPhase {
        if self.state.owns_companion && self.state.tracked.is_some() {
            SupervisorPhase::Supervising
        } else {
            SupervisorPhase::Quiescent
        }
    }

    /// Run monitoring cycles until an exit condition or `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> ExitReason {
        if self.config.whitelist.is_empty() {
            info!(
                "No whitelisted processes in {}, nothing to monitor",
                self.store.path().display()
            );
            return ExitReason::NothingToMonitor;
        }

        info!("Starting monitoring");
        info!("Whitelist: {:?}", self.config.whitelist);
        info!("Companion path: {}", self.config.companion_path);

        loop {
            if shutdown.load(Ordering::SeqCst) {
                self.shutdown();
                return ExitReason::Interrupted;
            }

            match self.cycle() {
                Ok(CycleOutcome::Continue) => {}
                Ok(CycleOutcome::Exit(reason)) => return reason,
                Err(e) => error!("Error in monitoring cycle: {}", e),
            }

            self.sleep(shutdown);
        }
    }

    /// Stop the companion if we own it; used on interrupt
    pub fn shutdown(&mut self) {
        info!("Stopping monitoring");
        self.release_companion();
    }

    /// One level-triggered pass: reload, re-validate, match, act
    pub fn cycle(&mut self) -> Result<CycleOutcome, SupervisorError> {
        if let Some(reason) = self.reload_config()? {
            return Ok(CycleOutcome::Exit(reason));
        }

        self.revalidate_tracked();

        match self.scanner.find_match(&self.config.whitelist) {
            Some((identifier, process)) => {
                debug!(
                    "Found running whitelisted process '{}' (PID {})",
                    identifier, process.pid
                );
                self.on_match(identifier)?;
            }
            None => self.on_absent(),
        }

        debug!("Phase after cycle: {:?}", self.phase());
        Ok(CycleOutcome::Continue)
    }

    fn reload_config(&mut self) -> Result<Option<ExitReason>, ConfigError> {
        let reloaded = match self.store.poll_for_change(&mut self.config_seen) {
            Ok(Some(config)) => config,
            Ok(None) => return Ok(None),
            Err(ConfigError::Missing(path)) => {
                warn!("{} was not found during a check, stopping", path.display());
                self.release_companion();
                return Ok(Some(ExitReason::ConfigRemoved));
            }
            Err(e @ ConfigError::Invalid { .. }) => {
                warn!("{}; keeping previous configuration", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!("Configuration file changed, reloading");
        if reloaded.whitelist_set() != self.config.whitelist_set() {
            info!("Whitelist updated: {:?}", reloaded.whitelist);
        }
        if reloaded.companion_path != self.config.companion_path {
            info!("Companion path updated: {}", reloaded.companion_path);
        }
        self.config = reloaded;

        if self.config.whitelist.is_empty() {
            info!("Whitelist is now empty, stopping");
            self.release_companion();
            return Ok(Some(ExitReason::WhitelistEmptied));
        }

        Ok(None)
    }

    /// Forget a tracked companion that exited or whose pid was reused
    fn revalidate_tracked(&mut self) {
        let Some(tracked) = &self.state.tracked else {
            return;
        };
        if !self.scanner.still_companion(tracked) {
            debug!("Tracked companion PID {} is gone", tracked.pid);
            self.state.tracked = None;
            self.state.owns_companion = false;
        }
    }

    fn on_match(&mut self, identifier: String) -> Result<(), LaunchError> {
        if self.phase() == SupervisorPhase::Supervising {
            return Ok(());
        }

        if let Some(external) = self.scanner.find_companion() {
            debug!(
                "Companion already running (PID {}), started externally",
                external.pid
            );
            return Ok(());
        }

        info!("{} process detected, launching companion", identifier);
        match self
            .launcher
            .launch(&self.config.companion_path, &mut self.scanner)?
        {
            Some(process) => {
                info!("Companion started with PID {}", process.pid);
                self.state = SupervisorState {
                    owns_companion: true,
                    tracked: Some(process),
                    last_trigger: Some(identifier.clone()),
                };
                self.log_action(&format!(
                    "{} process detected, launching companion...",
                    identifier
                ));
            }
            None => warn!("Companion launch could not be confirmed, retrying next cycle"),
        }

        Ok(())
    }

    fn on_absent(&mut self) {
        let Some((process, trigger)) = self.stop_owned() else {
            return;
        };

        let message = match trigger {
            Some(identifier) => format!(
                "{} process no longer present, closing companion...",
                identifier
            ),
            None => "Whitelisted game process no longer present, closing companion...".to_string(),
        };
        debug!("Released companion PID {}", process.pid);
        self.log_action(&message);
    }

    /// Stop the owned companion, if any, without touching the action log
    fn release_companion(&mut self) {
        self.stop_owned();
    }

    /// Stop and forget the owned companion; the handle is cleared even if
    /// stopping fails so the stop is not retried every cycle
    fn stop_owned(&mut self) -> Option<(ProcessRef, Option<String>)> {
        let (process, trigger) = self.state.release()?;
        if let Err(e) = self.launcher.stop(&process, &mut self.scanner) {
            error!("Error stopping companion PID {}: {:#}", process.pid, e);
        }
        Some((process, trigger))
    }

    fn log_action(&self, message: &str) {
        if let Err(e) = self.action_log.write(message) {
            warn!("Error writing action log: {}", e);
        }
    }

    fn sleep(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.settings.poll_interval();
        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
