use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

/// A live process, identified by pid, with the executable it was started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcess {
    pub pid: u32,
    pub name: String,
    pub exe: PathBuf,
}

impl ManagedProcess {
    /// Case-insensitive path-prefix test. An empty prefix matches nothing.
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return false;
        }
        let exe = self.exe.to_string_lossy().to_lowercase();
        if !exe.starts_with(&prefix) {
            return false;
        }
        prefix.ends_with(['\\', '/']) || exe[prefix.len()..].starts_with(['\\', '/'])
    }
}

#[derive(Debug, Error)]
pub enum KillError {
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
    #[error("failed to terminate pid {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// OS process table seam used by the reaper and the batch supervisor.
pub trait ProcessTable: Send + Sync {
    /// Every live process whose executable path is known.
    fn snapshot(&self) -> Vec<ManagedProcess>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to close its main window. Does not wait.
    fn request_close(&self, pid: u32) -> Result<(), KillError>;

    /// Terminate the process together with its children.
    fn kill_tree(&self, pid: u32) -> Result<(), KillError>;

    fn force_kill(&self, pid: u32) -> Result<(), KillError>;

    /// Total processor time accumulated by `pid` and its live descendants.
    fn cpu_time(&self, pid: u32) -> Option<Duration>;
}

/// Processes running from below `prefix`, minus the caller itself and an
/// optional host process that must survive.
pub fn processes_under(
    table: &dyn ProcessTable,
    prefix: &str,
    exclude: Option<&str>,
) -> Vec<ManagedProcess> {
    let own_pid = std::process::id();
    table
        .snapshot()
        .into_iter()
        .filter(|p| p.pid != own_pid)
        .filter(|p| !exclude.is_some_and(|name| p.name.eq_ignore_ascii_case(name)))
        .filter(|p| p.is_under(prefix))
        .collect()
}

/// `ProcessTable` over the live OS process list.
pub struct SystemProcessTable {
    system: Mutex<System>,
    #[cfg_attr(not(windows), allow(dead_code))]
    kill_tool: String,
}

impl SystemProcessTable {
    pub fn new(kill_tool: impl Into<String>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            kill_tool: kill_tool.into(),
        }
    }

    fn refreshed(&self) -> MutexGuard<'_, System> {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_exe(UpdateKind::OnlyIfNotSet),
        );
        sys
    }

    fn refreshed_one(&self, pid: u32) -> MutexGuard<'_, System> {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing(),
        );
        sys
    }

    #[cfg(windows)]
    fn run_kill_tool(&self, pid: u32, args: &[&str]) -> Result<(), KillError> {
        let mut cmd = std::process::Command::new(&self.kill_tool);
        cmd.args(args)
            .arg(pid.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());
        crate::partition::hide_window(&mut cmd);
        let output = cmd.output().map_err(|e| KillError::Failed {
            pid,
            reason: format!("{}: {e}", self.kill_tool),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") {
            Err(KillError::NoSuchProcess(pid))
        } else {
            Err(KillError::Failed {
                pid,
                reason: stderr.trim().to_owned(),
            })
        }
    }

    #[cfg(not(windows))]
    fn signal_all(&self, pids: &[Pid], signal: sysinfo::Signal) -> Result<(), KillError> {
        let sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = false;
        for pid in pids {
            if let Some(process) = sys.process(*pid) {
                delivered |= process.kill_with(signal).unwrap_or(false);
            }
        }
        let root = pids.first().map_or(0, |p| p.as_u32());
        if delivered {
            Ok(())
        } else {
            Err(KillError::Failed {
                pid: root,
                reason: format!("{signal:?} not delivered"),
            })
        }
    }
}

/// `root` followed by every live descendant, breadth first.
fn descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut found = vec![root];
    let mut i = 0;
    while i < found.len() {
        let parent = found[i];
        for (pid, process) in sys.processes() {
            if process.thread_kind().is_none()
                && process.parent() == Some(parent)
                && !found.contains(pid)
            {
                found.push(*pid);
            }
        }
        i += 1;
    }
    found
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ManagedProcess> {
        let sys = self.refreshed();
        sys.processes()
            .values()
            .filter(|p| p.thread_kind().is_none())
            .filter_map(|p| {
                Some(ManagedProcess {
                    pid: p.pid().as_u32(),
                    name: p.name().to_string_lossy().into_owned(),
                    exe: p.exe()?.to_path_buf(),
                })
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.refreshed_one(pid)
            .process(Pid::from_u32(pid))
            .is_some()
    }

    #[cfg(windows)]
    fn request_close(&self, pid: u32) -> Result<(), KillError> {
        self.run_kill_tool(pid, &["/pid"])
    }

    #[cfg(not(windows))]
    fn request_close(&self, pid: u32) -> Result<(), KillError> {
        if !self.is_alive(pid) {
            return Err(KillError::NoSuchProcess(pid));
        }
        self.signal_all(&[Pid::from_u32(pid)], sysinfo::Signal::Hangup)
    }

    #[cfg(windows)]
    fn kill_tree(&self, pid: u32) -> Result<(), KillError> {
        self.run_kill_tool(pid, &["/t", "/pid"])
    }

    #[cfg(not(windows))]
    fn kill_tree(&self, pid: u32) -> Result<(), KillError> {
        let tree = {
            let sys = self.refreshed();
            if sys.process(Pid::from_u32(pid)).is_none() {
                return Err(KillError::NoSuchProcess(pid));
            }
            descendants(&sys, Pid::from_u32(pid))
        };
        self.signal_all(&tree, sysinfo::Signal::Term)
    }

    fn force_kill(&self, pid: u32) -> Result<(), KillError> {
        let sys = self.refreshed_one(pid);
        let process = sys
            .process(Pid::from_u32(pid))
            .ok_or(KillError::NoSuchProcess(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(KillError::Failed {
                pid,
                reason: "kill request rejected".to_owned(),
            })
        }
    }

    fn cpu_time(&self, pid: u32) -> Option<Duration> {
        let sys = self.refreshed();
        let root = Pid::from_u32(pid);
        sys.process(root)?;
        let total: u64 = descendants(&sys, root)
            .iter()
            .filter_map(|p| sys.process(*p))
            .map(sysinfo::Process::accumulated_cpu_time)
            .sum();
        Some(Duration::from_millis(total))
    }
}
