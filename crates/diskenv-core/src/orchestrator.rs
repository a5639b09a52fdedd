use crate::disk::{clean_transient_dirs, DiskImage, DiskLifecycle, DiskParams};
use crate::events::EventBus;
use crate::settings::mirror_settings;
use crate::shortcuts::write_shortcuts;
use crate::LifecycleError;
use diskenv_runtime::{
    Backend, BatchSupervisor, ProcessReaper, ReaperConfig, ScriptIdentity, ScriptInvocation,
    SupervisorConfig,
};
use diskenv_schema::ManifestV1;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Create,
    Attach,
    Detach,
    Compact,
    Shortcuts,
}

impl Task {
    pub const ALL: [Task; 5] = [
        Task::Create,
        Task::Attach,
        Task::Detach,
        Task::Compact,
        Task::Shortcuts,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Task::Create => "create",
            Task::Attach => "attach",
            Task::Detach => "detach",
            Task::Compact => "compact",
            Task::Shortcuts => "shortcuts",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::ALL
            .into_iter()
            .find(|t| t.keyword().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown task '{s}' (expected create, attach, detach, compact or shortcuts)")
            })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub params: DiskParams,
    /// Extra variables for lifecycle scripts.
    pub env: BTreeMap<String, String>,
    pub supervisor: SupervisorConfig,
    pub reaper: ReaperConfig,
    /// Executable reported to scripts and written into shortcuts.
    pub app_path: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_manifest(manifest: &ManifestV1) -> Self {
        Self {
            params: DiskParams::from_manifest(manifest),
            env: manifest.env.clone(),
            supervisor: SupervisorConfig {
                poll_interval: Duration::from_millis(manifest.supervisor.poll_interval_ms),
                idle_threshold: Duration::from_secs(manifest.supervisor.idle_timeout_secs),
            },
            reaper: ReaperConfig {
                soft_settle: Duration::from_millis(manifest.reaper.soft_settle_ms),
                hard_settle: Duration::from_millis(manifest.reaper.hard_settle_ms),
                force_attempts: manifest.reaper.force_attempts,
                force_interval: Duration::from_millis(manifest.reaper.force_interval_ms),
                exclude_process: manifest.reaper.exclude_process.clone(),
            },
            app_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("diskenv")),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_manifest(&ManifestV1::default())
    }
}

/// Sequences whole lifecycle tasks and reports progress on the bus.
///
/// `DiskLifecycle` and the batch supervisor raise; this is the only place
/// failures are caught, and the only place rollback happens.
pub struct Orchestrator {
    backend: Backend,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(backend: Backend, bus: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            bus,
            config,
        }
    }

    pub fn lifecycle(&self) -> DiskLifecycle {
        DiskLifecycle::new(&self.backend)
            .with_exclude(self.config.reaper.exclude_process.clone())
            .with_format(self.config.params.format)
    }

    pub fn run(&self, task: Task, disk: &DiskImage) -> Result<(), LifecycleError> {
        let context = task.keyword();
        self.bus.trace(
            context,
            format!("{task} {} on {}", disk.file.display(), disk.drive),
        );
        let result = match task {
            Task::Create => self.create(disk),
            Task::Attach => self.attach(disk),
            Task::Detach => self.detach(disk),
            Task::Compact => self.compact(disk),
            Task::Shortcuts => self.shortcuts(disk),
        };
        match &result {
            Ok(()) => self.bus.trace(context, format!("{task} completed")),
            Err(err) => self.bus.error(err),
        }
        result
    }

    /// Run `task` on a dedicated worker thread.
    pub fn spawn(
        self,
        task: Task,
        disk: DiskImage,
    ) -> std::io::Result<JoinHandle<Result<(), LifecycleError>>> {
        thread::Builder::new()
            .name("diskenv-worker".to_owned())
            .spawn(move || self.run(task, &disk))
    }

    fn create(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let lifecycle = self.lifecycle();
        let Err(err) = lifecycle.create(disk, &self.config.params) else {
            self.bus
                .trace("create", format!("{} created", disk.file.display()));
            return Ok(());
        };
        if err.rollback_required {
            self.bus
                .warning("rollback", format!("detaching {} after failed create", disk.drive));
            if let Err(rollback) = lifecycle.force_detach(disk) {
                debug!("rollback output: {}", rollback.output.as_deref().unwrap_or_default());
                self.bus.warning(&rollback.context, rollback.message);
            }
        }
        Err(err)
    }

    fn attach(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let root = self.lifecycle().attach(disk)?;
        self.bus.trace(
            "attach",
            format!("{} attached at {}", disk.name, root.display()),
        );

        let properties = [
            ("drive", disk.drive.to_string()),
            ("name", disk.name.clone()),
            ("home", root.join("Home").display().to_string()),
        ];
        let rendered = mirror_settings(&root, &properties).map_err(|e| {
            LifecycleError::tool_failure("settings", format!("settings mirror failed: {e}"), "")
        })?;
        if rendered > 0 {
            self.bus
                .trace("settings", format!("rendered {rendered} settings file(s)"));
        }

        self.run_script("startup", &root, &self.config.params.startup_script, disk, Task::Attach)
    }

    fn detach(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let lifecycle = self.lifecycle();
        lifecycle.can_detach(disk)?;

        let mut script_failure = None;
        if let Some(root) = lifecycle.mount_root(disk) {
            let shutdown = &self.config.params.shutdown_script;
            if let Err(err) = self.run_script("shutdown", &root, shutdown, disk, Task::Detach) {
                self.bus.warning("shutdown", err.to_string());
                script_failure = Some(err);
            }
        } else {
            self.bus.trace(
                "detach",
                format!("{} does not hold {}, skipping shutdown", disk.drive, disk.name),
            );
        }

        // Whatever is mounted on the drive goes away with the detach.
        if let Some(root) = lifecycle.drive_root(disk) {
            self.reap(&root);
        }

        lifecycle.detach(disk)?;
        match script_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reap(&self, root: &Path) {
        let reaper = ProcessReaper::new(self.backend.processes.as_ref(), self.config.reaper.clone());
        let report = reaper.terminate(&root.display().to_string());
        if report.terminated() > 0 {
            self.bus.trace(
                "reaper",
                format!("terminated {} process(es)", report.terminated()),
            );
        }
        for p in &report.abandoned {
            self.bus.warning(
                "reaper",
                format!("{} (pid {}) resisted termination", p.name, p.pid),
            );
        }
    }

    fn compact(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let lifecycle = self.lifecycle();
        let root = lifecycle.attach(disk)?;
        let removed = clean_transient_dirs(&root);
        self.bus.trace(
            "compact",
            format!("emptied transient directories ({removed} entries removed)"),
        );
        lifecycle.detach(disk)?;
        lifecycle.compact(disk)
    }

    fn shortcuts(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let written = write_shortcuts(disk, &self.config.app_path).map_err(|e| {
            LifecycleError::tool_failure("shortcuts", format!("could not write shortcuts: {e}"), "")
        })?;
        for path in written {
            self.bus.trace("shortcuts", path.display().to_string());
        }
        Ok(())
    }

    /// Supervise one lifecycle script on the mounted volume. A missing script
    /// is skipped.
    fn run_script(
        &self,
        context: &str,
        root: &Path,
        script: &str,
        disk: &DiskImage,
        task: Task,
    ) -> Result<(), LifecycleError> {
        let path = root.join(script);
        if !path.is_file() {
            self.bus
                .trace(context, format!("no {context} script at {}", path.display()));
            return Ok(());
        }

        let identity = ScriptIdentity {
            name: disk.name.clone(),
            home_dir: root.join("Home"),
            disk_file: disk.file.clone(),
            app_path: self.config.app_path.clone(),
            drive: disk.drive,
        };
        let invocation = ScriptInvocation::new(&path)
            .args([task.keyword().to_owned()])
            .env(&self.config.env)
            .identity(&identity);

        let supervisor = BatchSupervisor::new(self.backend.processes.as_ref(), self.config.supervisor);
        let result = supervisor
            .run(&invocation, |line| self.bus.trace(context, line))
            .map_err(|e| LifecycleError::from_runtime(context, e))?;
        if result.failed {
            return Err(LifecycleError::tool_failure(
                context,
                format!("{script} reported failure"),
                &result.output,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_keywords_parse_case_insensitively() {
        assert_eq!("attach".parse::<Task>().unwrap(), Task::Attach);
        assert_eq!("DETACH".parse::<Task>().unwrap(), Task::Detach);
        assert_eq!(" Compact ".parse::<Task>().unwrap(), Task::Compact);
        for task in Task::ALL {
            assert_eq!(task.to_string().parse::<Task>().unwrap(), task);
        }
    }

    #[test]
    fn unknown_task_is_rejected() {
        let err = "mount".parse::<Task>().unwrap_err();
        assert!(err.contains("mount"));
    }

    #[test]
    fn config_follows_manifest_timings() {
        let manifest = diskenv_schema::parse_manifest_str(
            r#"
manifest_version = 1
[supervisor]
poll_interval_ms = 20
idle_timeout_secs = 5
[reaper]
force_attempts = 5
exclude_process = "launcher.exe"
[env]
TOOLS = "E:\\Apps"
"#,
        )
        .unwrap();
        let config = OrchestratorConfig::from_manifest(&manifest);
        assert_eq!(config.supervisor.poll_interval, Duration::from_millis(20));
        assert_eq!(config.supervisor.idle_threshold, Duration::from_secs(5));
        assert_eq!(config.reaper.force_attempts, 5);
        assert_eq!(config.reaper.exclude_process.as_deref(), Some("launcher.exe"));
        assert_eq!(config.env.get("TOOLS").map(String::as_str), Some("E:\\Apps"));
    }
}
