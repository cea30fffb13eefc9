//! Process scanning - Whitelist matching and companion identification

use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind,
};
use tracing::trace;

/// Snapshot of a running process
///
/// Never held across cycles for anything but re-validation: pids are
/// recycled, so `start_time` is compared whenever a handle is checked again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRef {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    /// Process start time in seconds since the epoch
    pub start_time: u64,
}

impl ProcessRef {
    /// Lowercased command line with blank arguments dropped
    pub fn command_line(&self) -> String {
        self.cmd
            .iter()
            .filter(|arg| !arg.trim().is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Whether the process name or command line contains `target`
    ///
    /// `target` must already be lowercased. Backslashes in the command line
    /// are normalized to `/` so Windows-style paths match either way.
    fn matches(&self, target: &str) -> bool {
        if self.name.to_lowercase().contains(target) {
            return true;
        }
        self.command_line().replace('\\', "/").contains(target)
    }
}

/// Source of live process information
pub trait ProcessTable {
    /// All live processes
    fn processes(&mut self) -> Vec<ProcessRef>;

    /// A single live process, if it still exists
    fn process(&mut self, pid: u32) -> Option<ProcessRef>;
}

/// Process table backed by `sysinfo`
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::new().with_cmd(UpdateKind::Always)
    }

    /// Zombies have exited but not been reaped; they count as gone
    fn to_ref(pid: Pid, process: &Process) -> Option<ProcessRef> {
        if process.status() == ProcessStatus::Zombie {
            return None;
        }
        Some(ProcessRef {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            cmd: process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy().into_owned())
                .collect(),
            start_time: process.start_time(),
        })
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn processes(&mut self) -> Vec<ProcessRef> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        // Processes we may not inspect still report a name with an empty
        // command line, so nothing here can abort the scan.
        let processes: Vec<ProcessRef> = self
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| Self::to_ref(*pid, process))
            .collect();

        trace!("Process table refreshed ({} processes)", processes.len());
        processes
    }

    fn process(&mut self, pid: u32) -> Option<ProcessRef> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            Self::refresh_kind(),
        );
        self.system
            .process(pid)
            .and_then(|process| Self::to_ref(pid, process))
    }
}

/// Rules for recognising the companion application among running processes
pub trait CompanionIdentity {
    /// Strict identification, used to detect a running companion
    fn is_companion(&self, process: &ProcessRef) -> bool;

    /// Looser identification, used to confirm a handle we already track
    fn still_companion(&self, process: &ProcessRef) -> bool {
        self.is_companion(process)
    }
}

/// Identity rules for OBS Studio, including the Flatpak build
#[derive(Debug, Clone)]
pub struct ObsIdentity {
    /// Executable base names, without extension
    pub base_names: Vec<String>,
    /// Bundle identifiers found on sandboxed command lines
    pub bundle_ids: Vec<String>,
}

impl Default for ObsIdentity {
    fn default() -> Self {
        Self {
            base_names: vec!["obs".into(), "obs64".into(), "obs32".into()],
            bundle_ids: vec!["com.obsproject.studio".into()],
        }
    }
}

impl ObsIdentity {
    fn base_name(name: &str) -> String {
        let name = name.to_lowercase();
        match name.strip_suffix(".exe") {
            Some(stem) => stem.to_string(),
            None => name,
        }
    }

    fn has_bundle_id(&self, process: &ProcessRef) -> bool {
        let cmdline = process.command_line();
        self.bundle_ids
            .iter()
            .any(|id| cmdline.contains(&id.to_lowercase()))
    }
}

impl CompanionIdentity for ObsIdentity {
    fn is_companion(&self, process: &ProcessRef) -> bool {
        let base = Self::base_name(&process.name);
        self.base_names.iter().any(|n| *n == base) || self.has_bundle_id(process)
    }

    fn still_companion(&self, process: &ProcessRef) -> bool {
        if self.is_companion(process) {
            return true;
        }
        let name = process.name.to_lowercase();
        self.base_names.iter().any(|n| name.contains(n.as_str()))
    }
}

/// Answers identifier-match and identity questions about live processes
pub struct ProcessScanner {
    table: Box<dyn ProcessTable>,
    identity: Box<dyn CompanionIdentity>,
}

impl ProcessScanner {
    pub fn new(table: Box<dyn ProcessTable>, identity: Box<dyn CompanionIdentity>) -> Self {
        Self { table, identity }
    }

    /// Scanner over the live system process table
    pub fn system(identity: Box<dyn CompanionIdentity>) -> Self {
        Self::new(Box::new(SysinfoTable::new()), identity)
    }

    /// Find the first identifier, in the given order, matched by any process
    pub fn find_match(&mut self, identifiers: &[String]) -> Option<(String, ProcessRef)> {
        let processes = self.table.processes();

        identifiers.iter().find_map(|identifier| {
            let target = identifier.trim().to_lowercase();
            if target.is_empty() {
                return None;
            }
            processes
                .iter()
                .find(|process| process.matches(&target))
                .map(|process| (identifier.clone(), process.clone()))
        })
    }

    /// Find a running companion instance, whoever started it
    pub fn find_companion(&mut self) -> Option<ProcessRef> {
        self.table
            .processes()
            .into_iter()
            .find(|process| self.identity.is_companion(process))
    }

    /// Look up a live process by pid
    pub fn lookup(&mut self, pid: u32) -> Option<ProcessRef> {
        self.table.process(pid)
    }

    /// Whether the process behind a handle is still running
    pub fn is_alive(&mut self, process: &ProcessRef) -> bool {
        self.table
            .process(process.pid)
            .is_some_and(|live| live.start_time == process.start_time)
    }

    /// Whether a process passes the rules used to re-validate a tracked companion
    pub fn identifies_companion(&self, process: &ProcessRef) -> bool {
        self.identity.still_companion(process)
    }

    /// Whether the process behind a handle is still running and still the companion
    pub fn still_companion(&mut self, process: &ProcessRef) -> bool {
        match self.table.process(process.pid) {
            Some(live) => {
                live.start_time == process.start_time && self.identity.still_companion(&live)
            }
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{ProcessRef, ProcessTable};

    /// In-memory process table shared between a scanner and a test
    #[derive(Clone, Default)]
    pub struct FakeTable {
        pub processes: Rc<RefCell<Vec<ProcessRef>>>,
        pub queries: Rc<RefCell<usize>>,
    }

    impl FakeTable {
        pub fn spawn(&self, pid: u32, name: &str, cmd: &[&str]) -> ProcessRef {
            let process = ProcessRef {
                pid,
                name: name.to_string(),
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                start_time: 1_700_000_000 + pid as u64,
            };
            self.processes.borrow_mut().push(process.clone());
            process
        }

        pub fn exit(&self, pid: u32) {
            self.processes.borrow_mut().retain(|p| p.pid != pid);
        }

        pub fn query_count(&self) -> usize {
            *self.queries.borrow()
        }
    }

    impl ProcessTable for FakeTable {
        fn processes(&mut self) -> Vec<ProcessRef> {
            *self.queries.borrow_mut() += 1;
            self.processes.borrow().clone()
        }

        fn process(&mut self, pid: u32) -> Option<ProcessRef> {
            *self.queries.borrow_mut() += 1;
            self.processes.borrow().iter().find(|p| p.pid == pid).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTable;
    use super::*;

    fn scanner(table: &FakeTable) -> ProcessScanner {
        ProcessScanner::new(Box::new(table.clone()), Box::new(ObsIdentity::default()))
    }

    fn whitelist(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_identifier_in_configured_order_wins() {
        let table = FakeTable::default();
        table.spawn(10, "hl2_linux", &["./hl2_linux", "-game", "tf"]);
        table.spawn(11, "cs2", &["/games/cs2/cs2"]);

        let mut scanner = scanner(&table);
        let (identifier, process) = scanner
            .find_match(&whitelist(&["cs2", "hl2_linux"]))
            .unwrap();
        assert_eq!(identifier, "cs2");
        assert_eq!(process.pid, 11);
    }

    #[test]
    fn matches_name_case_insensitively() {
        let table = FakeTable::default();
        table.spawn(20, "EldenRing.exe", &[]);

        let mut scanner = scanner(&table);
        let found = scanner.find_match(&whitelist(&["eldenring"]));
        assert_eq!(found.map(|(id, _)| id), Some("eldenring".to_string()));
    }

    #[test]
    fn matches_slash_normalized_command_line() {
        let table = FakeTable::default();
        table.spawn(
            30,
            "wine64-preloader",
            &["C:\\Games\\Witcher3\\bin\\x64\\witcher3.exe", "", "  "],
        );

        let mut scanner = scanner(&table);
        assert!(scanner
            .find_match(&whitelist(&["Games/Witcher3"]))
            .is_some());
        assert!(scanner.find_match(&whitelist(&["minecraft"])).is_none());
    }

    #[test]
    fn blank_identifiers_never_match() {
        let table = FakeTable::default();
        table.spawn(40, "bash", &["bash"]);

        let mut scanner = scanner(&table);
        assert!(scanner.find_match(&whitelist(&["", "   "])).is_none());
    }

    #[test]
    fn finds_companion_by_name_or_bundle_id() {
        let table = FakeTable::default();
        table.spawn(50, "obs-browser-page", &["obs-browser-page"]);
        let mut scanner = scanner(&table);
        assert!(scanner.find_companion().is_none());

        table.spawn(
            51,
            "bwrap",
            &["bwrap", "--args", "41", "com.obsproject.Studio"],
        );
        assert_eq!(scanner.find_companion().map(|p| p.pid), Some(51));

        table.exit(51);
        table.spawn(52, "obs64.exe", &[]);
        assert_eq!(scanner.find_companion().map(|p| p.pid), Some(52));
    }

    #[test]
    fn tracked_handle_revalidation() {
        let table = FakeTable::default();
        let obs = table.spawn(60, "obs", &["obs", "--minimize-to-tray"]);
        let mut scanner = scanner(&table);

        assert!(scanner.is_alive(&obs));
        assert!(scanner.still_companion(&obs));

        // Same pid reused by an unrelated process
        table.exit(60);
        table.processes.borrow_mut().push(ProcessRef {
            pid: 60,
            name: "vim".into(),
            cmd: vec!["vim".into()],
            start_time: obs.start_time + 100,
        });
        assert!(!scanner.is_alive(&obs));
        assert!(!scanner.still_companion(&obs));

        table.exit(60);
        assert!(!scanner.is_alive(&obs));
    }

    #[test]
    fn loose_identity_accepts_obs_substring() {
        let identity = ObsIdentity::default();
        let process = ProcessRef {
            pid: 1,
            name: "obs-studio".into(),
            cmd: vec![],
            start_time: 0,
        };
        assert!(!identity.is_companion(&process));
        assert!(identity.still_companion(&process));
    }
}
