//! Companion launching - Spawning, resolving and stopping the companion process

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::scanner::{ProcessRef, ProcessScanner};
use super::settings::SupervisorSettings;
use crate::platform::{self, Delivery};

/// Flags appended to every companion invocation
pub const COMPANION_FLAGS: [&str; 2] = ["--startreplaybuffer", "--minimize-to-tray"];

/// Marker the companion leaves behind when it did not shut down cleanly
const SENTINEL_NAME: &str = ".sentinel";

/// Errors raised while starting the companion
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("companion path is empty")]
    EmptyCommand,

    #[error("cannot tokenize companion command '{0}'")]
    Tokenize(String),

    #[error("failed to spawn companion '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Starting and stopping the companion, as seen by the supervisor
pub trait Launch {
    /// Spawn the companion and resolve its process
    ///
    /// `Ok(None)` means the spawn went through but no companion process
    /// could be found afterwards.
    fn launch(
        &mut self,
        path: &str,
        scanner: &mut ProcessScanner,
    ) -> Result<Option<ProcessRef>, LaunchError>;

    /// Terminate a companion this supervisor started
    fn stop(&mut self, process: &ProcessRef, scanner: &mut ProcessScanner) -> Result<()>;
}

/// Build the argument vector for a companion path
///
/// Sandboxed invocations (`flatpak run <app-id>`) are split shell-style;
/// anything else is a single executable, spaces included.
pub fn build_command(path: &str) -> Result<Vec<String>, LaunchError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }

    let mut command = if is_sandboxed_invocation(path) {
        shlex::split(path).ok_or_else(|| LaunchError::Tokenize(path.to_string()))?
    } else {
        vec![path.to_string()]
    };

    command.extend(COMPANION_FLAGS.iter().map(|flag| flag.to_string()));
    Ok(command)
}

fn is_sandboxed_invocation(path: &str) -> bool {
    let mut tokens = path.split_whitespace();
    tokens.next() == Some("flatpak") && tokens.next() == Some("run")
}

/// Per-OS profile directories where the companion keeps its sentinel
pub fn companion_profile_dirs() -> Vec<PathBuf> {
    let mut dirs_found = Vec::new();

    #[cfg(target_os = "linux")]
    if let Some(home) = dirs::home_dir() {
        dirs_found.push(home.join(".config").join("obs-studio"));
        dirs_found.push(
            home.join(".var")
                .join("app")
                .join("com.obsproject.Studio")
                .join("config")
                .join("obs-studio"),
        );
    }

    #[cfg(windows)]
    if let Some(config) = dirs::config_dir() {
        dirs_found.push(config.join("obs-studio"));
    }

    #[cfg(target_os = "macos")]
    if let Some(support) = dirs::data_dir() {
        dirs_found.push(support.join("obs-studio"));
    }

    dirs_found
}

/// Remove stale sentinel markers; absence and failures are not errors
pub fn remove_sentinels(profile_dirs: &[PathBuf]) -> usize {
    let mut removed = 0;

    for dir in profile_dirs {
        let sentinel = dir.join(SENTINEL_NAME);
        let result = match fs::symlink_metadata(&sentinel) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&sentinel),
            Ok(_) => fs::remove_file(&sentinel),
            Err(_) => continue,
        };

        match result {
            Ok(()) => {
                info!("Removed companion sentinel from {}", dir.display());
                removed += 1;
            }
            Err(e) => warn!("Could not remove sentinel from {}: {}", dir.display(), e),
        }
    }

    removed
}

/// Find the companion process after a launch
///
/// Our own child is taken only if it passes the identity rules; a wrapper
/// that keeps running under another name would otherwise be owned and then
/// dropped on the next re-validation, orphaning the real companion.
fn resolve_companion(child_pid: Option<u32>, scanner: &mut ProcessScanner) -> Option<ProcessRef> {
    if let Some(process) = child_pid.and_then(|pid| scanner.lookup(pid)) {
        if scanner.identifies_companion(&process) {
            debug!("Resolved companion as spawned child {}", process.pid);
            return Some(process);
        }
        debug!(
            "Spawned child {} ({}) is not the companion, searching by identity",
            process.pid, process.name
        );
    }

    let resolved = scanner.find_companion();
    match &resolved {
        Some(process) => debug!("Resolved companion as PID {}", process.pid),
        None => warn!("Started companion but could not find its process"),
    }
    resolved
}

/// Spawns the companion as a detached process and stops it on request
pub struct CompanionLauncher {
    /// Handle of the last spawned child, kept so it can be reaped
    child: Option<Child>,
    profile_dirs: Vec<PathBuf>,
    launch_grace: Duration,
    stop_timeout: Duration,
    stop_poll: Duration,
}

impl CompanionLauncher {
    pub fn new(settings: &SupervisorSettings) -> Self {
        Self::with_profile_dirs(settings, companion_profile_dirs())
    }

    pub fn with_profile_dirs(settings: &SupervisorSettings, profile_dirs: Vec<PathBuf>) -> Self {
        Self {
            child: None,
            profile_dirs,
            launch_grace: settings.launch_grace(),
            stop_timeout: settings.stop_timeout(),
            stop_poll: settings.stop_poll(),
        }
    }

    fn spawn(&mut self, command: &[String]) -> Result<u32, LaunchError> {
        let (program, args) = command.split_first().ok_or(LaunchError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        // Detach from our process group
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x00000008); // DETACHED_PROCESS
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        info!("Spawned companion with PID {}", pid);
        self.child = Some(child);
        Ok(pid)
    }

    /// Collect the exit status of our child once it has exited
    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Companion child {} exited with {}", child.id(), status);
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Error checking companion child status: {}", e);
                    self.child = None;
                }
            }
        }
    }

    /// Wait for the process to disappear, up to the stop timeout
    fn wait_for_exit(&mut self, process: &ProcessRef, scanner: &mut ProcessScanner) -> bool {
        let deadline = Instant::now() + self.stop_timeout;
        loop {
            self.reap();
            if !scanner.is_alive(process) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.stop_poll);
        }
    }
}

impl Launch for CompanionLauncher {
    fn launch(
        &mut self,
        path: &str,
        scanner: &mut ProcessScanner,
    ) -> Result<Option<ProcessRef>, LaunchError> {
        self.reap();
        remove_sentinels(&self.profile_dirs);

        let command = build_command(path)?;
        info!("Starting companion: {:?}", command);
        let pid = self.spawn(&command)?;

        thread::sleep(self.launch_grace);
        self.reap();

        let child_pid = self.child.as_ref().map(|_| pid);
        Ok(resolve_companion(child_pid, scanner))
    }

    fn stop(&mut self, process: &ProcessRef, scanner: &mut ProcessScanner) -> Result<()> {
        if !scanner.still_companion(process) {
            info!(
                "Companion PID {} is no longer running or no longer the companion",
                process.pid
            );
            self.reap();
            return Ok(());
        }

        info!("Stopping companion process with PID {}", process.pid);
        if platform::terminate_process(process.pid)? == Delivery::Gone {
            self.reap();
            return Ok(());
        }

        if self.wait_for_exit(process, scanner) {
            info!("Companion terminated successfully");
            return Ok(());
        }

        warn!(
            "Companion PID {} did not terminate gracefully, killing it",
            process.pid
        );
        platform::kill_process(process.pid)?;
        self.wait_for_exit(process, scanner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::testing::FakeTable;
    use crate::core::scanner::ObsIdentity;

    #[test]
    fn plain_path_is_one_token_plus_flags() {
        let path = "C:\\Program Files\\obs-studio\\bin\\64bit\\obs64.exe";
        let command = build_command(path).unwrap();
        assert_eq!(
            command,
            vec![
                path,
                "--startreplaybuffer",
                "--minimize-to-tray",
            ]
        );
    }

    #[test]
    fn flatpak_invocation_is_tokenized() {
        let command = build_command("flatpak run --branch=stable com.obsproject.Studio").unwrap();
        assert_eq!(
            command,
            vec![
                "flatpak",
                "run",
                "--branch=stable",
                "com.obsproject.Studio",
                "--startreplaybuffer",
                "--minimize-to-tray",
            ]
        );
    }

    #[test]
    fn empty_or_unbalanced_commands_are_rejected() {
        assert!(matches!(build_command("   "), Err(LaunchError::EmptyCommand)));
        assert!(matches!(
            build_command("flatpak run 'com.obsproject.Studio"),
            Err(LaunchError::Tokenize(_))
        ));
    }

    #[test]
    fn sentinel_file_and_directory_are_removed() {
        let root = tempfile::tempdir().unwrap();
        let native = root.path().join("obs-studio");
        let sandboxed = root.path().join("flatpak").join("obs-studio");
        let untouched = root.path().join("missing");
        fs::create_dir_all(native.join(".sentinel").join("run")).unwrap();
        fs::create_dir_all(&sandboxed).unwrap();
        fs::write(sandboxed.join(".sentinel"), "").unwrap();

        let removed = remove_sentinels(&[native.clone(), sandboxed.clone(), untouched]);
        assert_eq!(removed, 2);
        assert!(!native.join(".sentinel").exists());
        assert!(!sandboxed.join(".sentinel").exists());
        assert!(native.exists());
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let settings = SupervisorSettings::default();
        let mut launcher = CompanionLauncher::with_profile_dirs(&settings, Vec::new());
        let mut scanner =
            ProcessScanner::new(Box::new(FakeTable::default()), Box::new(ObsIdentity::default()));

        let result = launcher.launch("/nonexistent/replaywatch-test/obs", &mut scanner);
        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }

    #[test]
    fn stopping_a_vanished_companion_succeeds_without_signals() {
        let settings = SupervisorSettings::default();
        let mut launcher = CompanionLauncher::with_profile_dirs(&settings, Vec::new());
        let table = FakeTable::default();
        let obs = table.spawn(4_000_000, "obs", &["obs"]);
        table.exit(obs.pid);
        let mut scanner =
            ProcessScanner::new(Box::new(table.clone()), Box::new(ObsIdentity::default()));

        assert!(launcher.stop(&obs, &mut scanner).is_ok());
    }

    #[test]
    fn spawned_wrapper_is_not_taken_as_companion() {
        let table = FakeTable::default();
        table.spawn(700, "recorder-wrapper", &["/opt/rec/recorder-wrapper"]);
        let mut scanner =
            ProcessScanner::new(Box::new(table.clone()), Box::new(ObsIdentity::default()));

        assert!(resolve_companion(Some(700), &mut scanner).is_none());

        table.spawn(701, "obs", &["obs", "--startreplaybuffer"]);
        let resolved = resolve_companion(Some(700), &mut scanner).unwrap();
        assert_eq!(resolved.pid, 701);
        assert!(scanner.still_companion(&resolved));
    }

    #[test]
    fn spawned_child_is_taken_when_it_is_the_companion() {
        let table = FakeTable::default();
        table.spawn(710, "obs", &["obs"]);
        table.spawn(
            720,
            "flatpak",
            &["flatpak", "run", "com.obsproject.Studio", "--minimize-to-tray"],
        );
        let mut scanner =
            ProcessScanner::new(Box::new(table.clone()), Box::new(ObsIdentity::default()));

        assert_eq!(resolve_companion(Some(720), &mut scanner).map(|p| p.pid), Some(720));
        assert_eq!(resolve_companion(None, &mut scanner).map(|p| p.pid), Some(710));
    }

    #[cfg(target_os = "linux")]
    mod stop_sequence {
        use std::os::unix::process::CommandExt;
        use std::path::Path;
        use std::process::Child;

        use super::*;

        /// Start `sleep` under the name `obs`, optionally ignoring SIGTERM
        fn spawn_obs(dir: &Path, ignore_term: bool) -> Child {
            let sleep = ["/bin/sleep", "/usr/bin/sleep"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .unwrap();
            let obs = dir.join("obs");
            std::os::unix::fs::symlink(sleep, &obs).unwrap();

            let mut cmd = Command::new(&obs);
            cmd.arg("30");
            if ignore_term {
                unsafe {
                    cmd.pre_exec(|| {
                        libc::signal(libc::SIGTERM, libc::SIG_IGN);
                        Ok(())
                    });
                }
            }
            let child = cmd.spawn().unwrap();
            thread::sleep(Duration::from_millis(300));
            child
        }

        fn stop_and_time(ignore_term: bool) -> (Duration, bool) {
            let dir = tempfile::tempdir().unwrap();
            let mut child = spawn_obs(dir.path(), ignore_term);
            let mut scanner = ProcessScanner::system(Box::new(ObsIdentity::default()));
            let obs = scanner.lookup(child.id()).unwrap();
            assert_eq!(obs.name, "obs");

            let settings = SupervisorSettings::default();
            let mut launcher = CompanionLauncher::with_profile_dirs(&settings, Vec::new());
            let started = Instant::now();
            launcher.stop(&obs, &mut scanner).unwrap();
            let elapsed = started.elapsed();
            let alive = scanner.is_alive(&obs);

            let _ = child.kill();
            let _ = child.wait();
            (elapsed, alive)
        }

        #[test]
        fn companion_exiting_on_terminate_is_not_killed() {
            let (elapsed, alive) = stop_and_time(false);
            assert!(!alive);
            assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        }

        #[test]
        fn companion_ignoring_terminate_is_killed_after_timeout() {
            let (elapsed, alive) = stop_and_time(true);
            assert!(!alive);
            assert!(elapsed >= Duration::from_millis(2900), "took {:?}", elapsed);
            assert!(elapsed < Duration::from_secs(7), "took {:?}", elapsed);
        }
    }
}
