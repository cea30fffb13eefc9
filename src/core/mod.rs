//! Core module - Configuration, process scanning, companion control and the supervisor loop

pub mod action_log;
pub mod config;
pub mod launcher;
pub mod scanner;
pub mod settings;
pub mod supervisor;

pub use action_log::ActionLog;
pub use config::{ConfigStore, SystemProbe};
pub use launcher::CompanionLauncher;
pub use scanner::{ObsIdentity, ProcessScanner};
pub use settings::SupervisorSettings;
pub use supervisor::Supervisor;
