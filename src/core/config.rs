//! Shared configuration file - Loading, default synthesis and change detection

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors raised while reading or writing the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    Missing(PathBuf),

    #[error("configuration file {path} is not valid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write default configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Supervisor configuration as shared with the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Configuration {
    /// Executable path or launch command of the companion
    pub companion_path: String,
    /// Process identifiers that trigger the companion, in priority order
    pub whitelist: Vec<String>,
}

impl Configuration {
    /// Whitelist as a case-insensitive set, for change reporting
    pub fn whitelist_set(&self) -> BTreeSet<String> {
        self.whitelist.iter().map(|id| id.to_lowercase()).collect()
    }
}

/// On-disk layout, accepting the key names older editors wrote
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default, alias = "obs_path")]
    companion_path: Option<String>,
    #[serde(default, alias = "whitelisted_games")]
    whitelist: Vec<String>,
}

/// Trim entries, drop blanks and case-insensitive duplicates, keep order
fn normalize_whitelist(entries: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty() && seen.insert(entry.to_lowercase()))
        .collect()
}

/// Strategy for picking a companion path when the configuration has none
pub trait CompanionPathProbe {
    fn detect(&self) -> String;
}

/// Probes the usual OBS install locations for this platform
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl CompanionPathProbe for SystemProbe {
    fn detect(&self) -> String {
        #[cfg(windows)]
        {
            const CANDIDATES: [&str; 2] = [
                "C:\\Program Files\\obs-studio\\bin\\64bit\\obs64.exe",
                "C:\\Program Files (x86)\\obs-studio\\bin\\32bit\\obs32.exe",
            ];
            if let Some(path) = CANDIDATES.iter().find(|p| Path::new(p).exists()) {
                return path.to_string();
            }
        }

        #[cfg(not(windows))]
        {
            use std::process::{Command, Stdio};

            let flatpak = Command::new("flatpak")
                .args(["info", "com.obsproject.Studio"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if matches!(flatpak, Ok(status) if status.success()) {
                tracing::debug!("Detected Flatpak OBS install");
                return "flatpak run com.obsproject.Studio".to_string();
            }
        }

        "obs".to_string()
    }
}

/// Reads the shared configuration file and notices external edits
pub struct ConfigStore {
    path: PathBuf,
    probe: Box<dyn CompanionPathProbe>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, probe: Box<dyn CompanionPathProbe>) -> Self {
        Self { path, probe }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, writing defaults first if the file is missing
    pub fn load(&self) -> Result<Configuration, ConfigError> {
        match self.read() {
            Err(ConfigError::Missing(_)) => {
                let config = self.defaults();
                self.persist(&config)?;
                info!("Created default configuration at {}", self.path.display());
                Ok(config)
            }
            other => other,
        }
    }

    /// Modification time of the configuration file
    pub fn modified(&self) -> Result<SystemTime, ConfigError> {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|e| self.io_error(e))
    }

    /// Reload the configuration if the file changed since `last_seen`
    ///
    /// `last_seen` is advanced before parsing, so a broken edit is reported
    /// once rather than on every poll. A vanished file is `Missing`; no
    /// defaults are synthesized here.
    pub fn poll_for_change(
        &self,
        last_seen: &mut SystemTime,
    ) -> Result<Option<Configuration>, ConfigError> {
        let modified = self.modified()?;
        if modified == *last_seen {
            return Ok(None);
        }
        *last_seen = modified;
        self.read().map(Some)
    }

    fn read(&self) -> Result<Configuration, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let file: ConfigFile =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Invalid {
                path: self.path.clone(),
                source,
            })?;

        let companion_path = match file.companion_path {
            Some(path) if !path.trim().is_empty() => path.trim().to_string(),
            _ => self.probe.detect(),
        };

        Ok(Configuration {
            companion_path,
            whitelist: normalize_whitelist(file.whitelist),
        })
    }

    fn defaults(&self) -> Configuration {
        Configuration {
            companion_path: self.probe.detect(),
            whitelist: Vec::new(),
        }
    }

    fn persist(&self, config: &Configuration) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        config
            .serialize(&mut serializer)
            .map_err(|e| write_error(io::Error::other(e)))?;

        fs::write(&self.path, buf).map_err(write_error)
    }

    fn io_error(&self, source: io::Error) -> ConfigError {
        if source.kind() == io::ErrorKind::NotFound {
            ConfigError::Missing(self.path.clone())
        } else {
            ConfigError::Io {
                path: self.path.clone(),
                source,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs::{self, File};
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use super::CompanionPathProbe;

    /// Probe with a fixed answer
    pub struct FixedProbe(pub &'static str);

    impl CompanionPathProbe for FixedProbe {
        fn detect(&self) -> String {
            self.0.to_string()
        }
    }

    /// Write `contents` and push the mtime forward so every edit is observable
    pub fn write_config(path: &Path, contents: &str) {
        let previous = fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        fs::write(path, contents).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(previous.max(SystemTime::now()) + Duration::from_secs(1))
            .unwrap();
    }
}
