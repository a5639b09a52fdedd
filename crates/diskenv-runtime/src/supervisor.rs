//! Supervised execution of an environment's startup/shutdown script.
//!
//! The child is polled on the calling thread: every `poll_interval` the
//! accumulated processor time of the child and its descendants is sampled.
//! If it stops changing for longer than `idle_threshold` while the child is
//! still alive, the tree is killed and the run fails as frozen. Wall-clock
//! duration alone never fails a run. The calling thread is blocked for the
//! whole supervised duration.

use crate::drive::Drive;
use crate::partition::{hide_window, ExecutionResult};
use crate::process::ProcessTable;
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// How long to keep collecting output after the child exits. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Identity variables every lifecycle script sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIdentity {
    pub name: String,
    pub home_dir: PathBuf,
    pub disk_file: PathBuf,
    pub app_path: PathBuf,
    pub drive: Drive,
}

impl ScriptIdentity {
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("DISKENV_NAME".to_owned(), self.name.clone()),
            ("DISKENV_HOME".to_owned(), self.home_dir.display().to_string()),
            ("DISKENV_DISK".to_owned(), self.disk_file.display().to_string()),
            ("DISKENV_APP".to_owned(), self.app_path.display().to_string()),
            ("DISKENV_DRIVE".to_owned(), self.drive.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ScriptInvocation {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Caller-supplied variables. Identity variables applied later win.
    #[must_use]
    pub fn env(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: &ScriptIdentity) -> Self {
        self.env.extend(identity.env_vars());
        self
    }

    fn command(&self) -> Command {
        let ext = self
            .script
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        let mut cmd = match ext.as_deref() {
            Some("cmd" | "bat") => {
                let mut c = Command::new("cmd");
                c.arg("/c").arg(&self.script);
                c
            }
            Some("sh") => {
                let mut c = Command::new("sh");
                c.arg(&self.script);
                c
            }
            _ => Command::new(&self.script),
        };
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = self.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_window(&mut cmd);
        cmd
    }
}

pub struct BatchSupervisor<'a> {
    processes: &'a dyn ProcessTable,
    config: SupervisorConfig,
}

impl<'a> BatchSupervisor<'a> {
    pub fn new(processes: &'a dyn ProcessTable, config: SupervisorConfig) -> Self {
        Self { processes, config }
    }

    /// Run the script to completion, handing every output line to `on_line`
    /// on the calling thread as it arrives.
    pub fn run(
        &self,
        invocation: &ScriptInvocation,
        mut on_line: impl FnMut(&str),
    ) -> Result<ExecutionResult, RuntimeError> {
        let script = invocation.script.display().to_string();
        let mut child = invocation
            .command()
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: script.clone(),
                source,
            })?;
        let pid = child.id();
        info!("supervising {script} (pid {pid})");

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
        }

        let mut output = String::new();
        let mut last_cpu = self.processes.cpu_time(pid).unwrap_or_default();
        let mut last_progress = Instant::now();

        let status = loop {
            drain(&rx, &mut output, &mut on_line);
            if let Some(status) = poll_exit(&mut child)? {
                break status;
            }
            thread::sleep(self.config.poll_interval);

            // Descendants that exit drop out of the sample, so a lower
            // total is progress too.
            if let Some(cpu) = self.processes.cpu_time(pid) {
                if cpu != last_cpu {
                    last_cpu = cpu;
                    last_progress = Instant::now();
                }
            }

            let idle = last_progress.elapsed();
            if idle >= self.config.idle_threshold && poll_exit(&mut child)?.is_none() {
                warn!("{script} consumed no processor time for {idle:?}, killing pid {pid}");
                if let Err(e) = self.processes.kill_tree(pid) {
                    debug!("tree kill of {pid} failed: {e}");
                }
                let _ = child.kill();
                let _ = child.wait();
                drain(&rx, &mut output, &mut on_line);
                return Err(RuntimeError::Frozen {
                    script,
                    idle,
                    output: output.trim().to_owned(),
                });
            }
        };

        loop {
            match rx.recv_timeout(OUTPUT_GRACE) {
                Ok(line) => push_line(&mut output, &line, &mut on_line),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("{script} exited with {status}");
        Ok(ExecutionResult {
            output: output.trim().to_owned(),
            failed: !status.success(),
        })
    }

    pub fn run_script(
        &self,
        script: &Path,
        on_line: impl FnMut(&str),
    ) -> Result<ExecutionResult, RuntimeError> {
        self.run(&ScriptInvocation::new(script), on_line)
    }
}

/// The slice of [`Child`] the poll loop needs.
trait Supervised {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

impl Supervised for Child {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }
    fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self)
    }
    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Exit status if the child is done. A child whose status cannot be read is
/// killed before the error is returned.
fn poll_exit(child: &mut impl Supervised) -> Result<Option<ExitStatus>, RuntimeError> {
    match child.try_wait() {
        Ok(status) => Ok(status),
        Err(e) => {
            warn!("cannot read child status, killing it: {e}");
            let _ = child.kill();
            let _ = child.wait();
            Err(e.into())
        }
    }
}

fn spawn_reader(stream: impl Read + Send + 'static, tx: Sender<String>) {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn drain(rx: &Receiver<String>, output: &mut String, on_line: &mut impl FnMut(&str)) {
    while let Ok(line) = rx.try_recv() {
        push_line(output, &line, on_line);
    }
}

fn push_line(output: &mut String, line: &str, on_line: &mut impl FnMut(&str)) {
    output.push_str(line);
    output.push('\n');
    on_line(line);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mock::MockProcessTable;
    use crate::process::SystemProcessTable;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("script.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn fast(idle_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            idle_threshold: Duration::from_millis(idle_ms),
        }
    }

    /// CPU clock that advances on every sample, like a busy child would.
    #[derive(Default)]
    struct Busy {
        ticks: AtomicU64,
    }

    /// CPU clock that never advances and remembers which pid it was asked about.
    #[derive(Default)]
    struct Stalled {
        pid: Mutex<Option<u32>>,
    }

    impl ProcessTable for Busy {
        fn snapshot(&self) -> Vec<crate::ManagedProcess> {
            Vec::new()
        }
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
        fn request_close(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn kill_tree(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn force_kill(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn cpu_time(&self, _pid: u32) -> Option<Duration> {
            let t = self.ticks.fetch_add(1, Ordering::SeqCst);
            Some(Duration::from_millis(t))
        }
    }

    impl ProcessTable for Stalled {
        fn snapshot(&self) -> Vec<crate::ManagedProcess> {
            Vec::new()
        }
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
        fn request_close(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn kill_tree(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn force_kill(&self, _pid: u32) -> Result<(), crate::KillError> {
            Ok(())
        }
        fn cpu_time(&self, pid: u32) -> Option<Duration> {
            *self.pid.lock().unwrap() = Some(pid);
            Some(Duration::from_millis(5))
        }
    }

    #[test]
    fn captures_output_and_success() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo hello\necho oops >&2\nexit 0");
        let table = MockProcessTable::default();
        let supervisor = BatchSupervisor::new(&table, fast(5_000));

        let mut lines = Vec::new();
        let result = supervisor
            .run_script(&script, |l| lines.push(l.to_owned()))
            .unwrap();
        assert!(result.succeeded());
        assert!(result.output.contains("hello"));
        assert!(result.output.contains("oops"));
        assert!(lines.iter().any(|l| l == "hello"));
    }

    #[test]
    fn nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo broken\nexit 3");
        let table = MockProcessTable::default();
        let supervisor = BatchSupervisor::new(&table, fast(5_000));

        let result = supervisor.run_script(&script, |_| {}).unwrap();
        assert!(result.failed);
        assert_eq!(result.output, "broken");
    }

    #[test]
    fn injects_caller_and_identity_variables() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo \"$DISKENV_NAME|$DISKENV_DRIVE|$EXTRA|$1\"",
        );
        let identity = ScriptIdentity {
            name: "dev".to_owned(),
            home_dir: PathBuf::from("E:\\Home"),
            disk_file: PathBuf::from("/envs/dev.vhdx"),
            app_path: PathBuf::from("/usr/bin/diskenv"),
            drive: Drive::new('E').unwrap(),
        };
        let mut extra = BTreeMap::new();
        extra.insert("EXTRA".to_owned(), "x1".to_owned());
        extra.insert("DISKENV_NAME".to_owned(), "shadowed".to_owned());
        let invocation = ScriptInvocation::new(&script)
            .args(["arg1".to_owned()])
            .env(&extra)
            .identity(&identity);

        let table = MockProcessTable::default();
        let result = BatchSupervisor::new(&table, fast(5_000))
            .run(&invocation, |_| {})
            .unwrap();
        assert_eq!(result.output, "dev|E:|x1|arg1");
    }

    #[test]
    fn missing_script_fails_to_spawn() {
        let table = MockProcessTable::default();
        let err = BatchSupervisor::new(&table, fast(5_000))
            .run_script(Path::new("/nonexistent/diskenv-startup"), |_| {})
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn stalled_child_is_killed_as_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo waiting\nexec sleep 30");
        let table = Stalled::default();
        let started = Instant::now();

        let err = BatchSupervisor::new(&table, fast(300))
            .run_script(&script, |_| {})
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            RuntimeError::Frozen { output, .. } => assert!(output.contains("waiting")),
            other => panic!("expected Frozen, got {other:?}"),
        }

        let pid = table.pid.lock().unwrap().expect("cpu time sampled");
        assert!(!Path::new(&format!("/proc/{pid}")).exists() || !cfg!(target_os = "linux"));
    }

    #[test]
    fn busy_child_outlives_idle_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 1\necho finished");
        let table = Busy::default();
        let started = Instant::now();

        let result = BatchSupervisor::new(&table, fast(150))
            .run_script(&script, |_| {})
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(result.succeeded());
        assert_eq!(result.output, "finished");
    }

    #[test]
    fn real_process_table_tolerates_exited_busy_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "sh -c 'i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done'\n\
             echo child-done\n\
             n=0\n\
             while [ $n -lt 25 ]; do\n\
             j=0; while [ $j -lt 4000 ]; do j=$((j+1)); done\n\
             sleep 0.1; n=$((n+1))\n\
             done\n\
             echo finished",
        );
        let table = SystemProcessTable::new("taskkill");

        let result = BatchSupervisor::new(&table, fast(700))
            .run_script(&script, |_| {})
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.output, "child-done\nfinished");
    }

    /// Child whose status can never be read.
    #[derive(Default)]
    struct Unreadable {
        killed: bool,
        reaped: bool,
    }

    impl Supervised for Unreadable {
        fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
            Err(std::io::Error::other("status unavailable"))
        }
        fn kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }
        fn wait(&mut self) -> std::io::Result<ExitStatus> {
            self.reaped = true;
            Err(std::io::Error::other("status unavailable"))
        }
    }

    #[test]
    fn unreadable_status_kills_child() {
        let mut child = Unreadable::default();
        let err = poll_exit(&mut child).unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
        assert!(child.killed);
        assert!(child.reaped);
    }

    #[test]
    fn real_process_table_detects_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 30");
        let table = SystemProcessTable::new("taskkill");
        let started = Instant::now();

        let err = BatchSupervisor::new(&table, fast(500))
            .run_script(&script, |_| {})
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Frozen { .. }));
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
