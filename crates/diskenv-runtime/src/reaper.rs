use crate::process::{processes_under, KillError, ManagedProcess, ProcessTable};
use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    pub soft_settle: Duration,
    pub hard_settle: Duration,
    pub force_attempts: u32,
    pub force_interval: Duration,
    /// Executable name that is never terminated, e.g. the launcher hosting us.
    pub exclude_process: Option<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            soft_settle: Duration::from_secs(3),
            hard_settle: Duration::from_secs(1),
            force_attempts: 3,
            force_interval: Duration::from_millis(500),
            exclude_process: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Processes found below the prefix when reaping started.
    pub found: Vec<ManagedProcess>,
    /// Processes still alive after every stage was exhausted.
    pub abandoned: Vec<ManagedProcess>,
}

impl ReapReport {
    pub fn terminated(&self) -> usize {
        self.found.len().saturating_sub(self.abandoned.len())
    }
}

/// Escalating termination of every process running from a given path prefix:
/// polite close, settle, tree kill, settle, then bounded force-kill rounds.
/// The set is re-queried before each stage so exited processes drop out.
pub struct ProcessReaper<'a> {
    table: &'a dyn ProcessTable,
    config: ReaperConfig,
}

impl<'a> ProcessReaper<'a> {
    pub fn new(table: &'a dyn ProcessTable, config: ReaperConfig) -> Self {
        Self { table, config }
    }

    fn remaining(&self, prefix: &str) -> Vec<ManagedProcess> {
        processes_under(self.table, prefix, self.config.exclude_process.as_deref())
    }

    pub fn terminate(&self, prefix: &str) -> ReapReport {
        let found = self.remaining(prefix);
        if found.is_empty() {
            debug!("no processes running under {prefix}");
            return ReapReport::default();
        }
        info!("terminating {} process(es) under {prefix}", found.len());

        for p in &found {
            report("close", p, self.table.request_close(p.pid));
        }
        thread::sleep(self.config.soft_settle);

        let mut left = self.remaining(prefix);
        if !left.is_empty() {
            for p in &left {
                report("kill tree", p, self.table.kill_tree(p.pid));
            }
            thread::sleep(self.config.hard_settle);
            left = self.remaining(prefix);
        }

        let mut attempt = 0;
        while !left.is_empty() && attempt < self.config.force_attempts {
            attempt += 1;
            debug!("force round {attempt}: {} process(es) left", left.len());
            for p in &left {
                report("force kill", p, self.table.force_kill(p.pid));
            }
            thread::sleep(self.config.force_interval);
            left = self.remaining(prefix);
        }

        for p in &left {
            warn!("could not terminate {} (pid {})", p.name, p.pid);
        }
        ReapReport {
            found,
            abandoned: left,
        }
    }
}

fn report(stage: &str, process: &ManagedProcess, result: Result<(), KillError>) {
    match result {
        Ok(()) | Err(KillError::NoSuchProcess(_)) => {}
        Err(e) => warn!("{stage} of {} failed: {e}", process.name),
    }
}
