use crate::LifecycleError;
use diskenv_runtime::{
    processes_under, render_template, Backend, CreateParams, Drive, ExecutionResult,
    ManagedProcess, PartitionTool, ProcessTable, ScriptTask, VolumeParams, VolumeProbe,
};
use diskenv_schema::{DiskFormat, DiskKind, ManifestV1, PartitionStyle};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directories every environment volume is provisioned with.
pub const SKELETON_DIRS: &[&str] = &["Apps", "Home", "Home/Cache", "Settings", "Temp", "Logs"];

/// Directories whose contents are thrown away before compaction.
pub const TRANSIENT_DIRS: &[&str] = &["Temp", "Home/Cache"];

#[cfg(windows)]
const STARTUP_RESOURCE: &str = include_str!("../resources/startup.cmd");
#[cfg(windows)]
const SHUTDOWN_RESOURCE: &str = include_str!("../resources/shutdown.cmd");
#[cfg(not(windows))]
const STARTUP_RESOURCE: &str = include_str!("../resources/startup.sh");
#[cfg(not(windows))]
const SHUTDOWN_RESOURCE: &str = include_str!("../resources/shutdown.sh");
const README_RESOURCE: &str = include_str!("../resources/README.txt");

/// A virtual disk file and the drive letter it mounts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub file: PathBuf,
    pub drive: Drive,
    /// Environment name, taken from the file stem.
    pub name: String,
}

impl DiskImage {
    pub fn new(file: impl Into<PathBuf>, drive: Drive) -> Self {
        let file = file.into();
        let name = file
            .file_stem()
            .map_or_else(|| "disk".to_owned(), |s| s.to_string_lossy().into_owned());
        Self { file, drive, name }
    }

    /// Volume label the disk is formatted with: the name, cut to what
    /// `format` can store.
    pub fn label(&self, format: DiskFormat) -> String {
        self.name.chars().take(format.max_label_len()).collect()
    }

    fn volume(&self) -> VolumeParams {
        VolumeParams {
            file: self.file.clone(),
            drive: self.drive,
        }
    }
}

/// Geometry and bootstrap content for a new disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskParams {
    pub size_mb: u64,
    pub kind: DiskKind,
    pub style: PartitionStyle,
    pub format: DiskFormat,
    pub version: String,
    pub startup_script: String,
    pub shutdown_script: String,
}

impl DiskParams {
    pub fn from_manifest(manifest: &ManifestV1) -> Self {
        Self {
            size_mb: manifest.disk.size_mb,
            kind: manifest.disk.kind,
            style: manifest.disk.style,
            format: manifest.disk.format,
            version: manifest.disk.version.clone(),
            startup_script: manifest.scripts.startup.clone(),
            shutdown_script: manifest.scripts.shutdown.clone(),
        }
    }
}

impl Default for DiskParams {
    fn default() -> Self {
        Self::from_manifest(&ManifestV1::default())
    }
}

/// Observed state of one disk image, always probed from live OS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Absent,
    CreatedUnattached,
    Attached,
    /// Attached with processes running from the volume.
    AttachedBusy,
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiskState::Absent => "absent",
            DiskState::CreatedUnattached => "created",
            DiskState::Attached => "attached",
            DiskState::AttachedBusy => "attached (busy)",
        })
    }
}

/// Preconditions and disk operations. Every check re-reads live OS state.
pub struct DiskLifecycle {
    partition: Arc<dyn PartitionTool>,
    volumes: Arc<dyn VolumeProbe>,
    processes: Arc<dyn ProcessTable>,
    exclude_process: Option<String>,
    format: DiskFormat,
}

impl DiskLifecycle {
    pub fn new(backend: &Backend) -> Self {
        Self {
            partition: Arc::clone(&backend.partition),
            volumes: Arc::clone(&backend.volumes),
            processes: Arc::clone(&backend.processes),
            exclude_process: None,
            format: DiskFormat::default(),
        }
    }

    #[must_use]
    pub fn with_exclude(mut self, exclude_process: Option<String>) -> Self {
        self.exclude_process = exclude_process;
        self
    }

    /// Filesystem the managed disks are formatted with; decides how long
    /// the expected volume label is.
    #[must_use]
    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    fn label_matches(&self, disk: &DiskImage) -> bool {
        self.volumes
            .volume_label(disk.drive)
            .is_some_and(|label| label.eq_ignore_ascii_case(&disk.label(self.format)))
    }

    /// Root of whatever volume is mounted on the disk's drive, label or not.
    pub fn drive_root(&self, disk: &DiskImage) -> Option<PathBuf> {
        self.volumes.mount_root(disk.drive)
    }

    /// Root of the volume when this disk (by label) is the one mounted.
    pub fn mount_root(&self, disk: &DiskImage) -> Option<PathBuf> {
        let root = self.volumes.mount_root(disk.drive)?;
        self.label_matches(disk).then_some(root)
    }

    pub fn busy_processes(&self, root: &Path) -> Vec<ManagedProcess> {
        processes_under(
            self.processes.as_ref(),
            &root.display().to_string(),
            self.exclude_process.as_deref(),
        )
    }

    pub fn state(&self, disk: &DiskImage) -> DiskState {
        match self.mount_root(disk) {
            Some(root) if self.busy_processes(&root).is_empty() => DiskState::Attached,
            Some(_) => DiskState::AttachedBusy,
            None if disk.file.exists() => DiskState::CreatedUnattached,
            None => DiskState::Absent,
        }
    }

    pub fn can_create(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        if self.volumes.mount_root(disk.drive).is_some() {
            return Err(LifecycleError::precondition(
                "create",
                format!("drive {} is already mounted", disk.drive),
            ));
        }
        if disk.file.exists() {
            return Err(LifecycleError::precondition(
                "create",
                format!("file already exists: {}", disk.file.display()),
            ));
        }
        Ok(())
    }

    /// `Some(root)` when the disk is already correctly attached.
    pub fn can_attach(&self, disk: &DiskImage) -> Result<Option<PathBuf>, LifecycleError> {
        let Some(root) = self.volumes.mount_root(disk.drive) else {
            if !disk.file.exists() {
                return Err(LifecycleError::precondition(
                    "attach",
                    format!("file not exists: {}", disk.file.display()),
                ));
            }
            return Ok(None);
        };

        if !self.label_matches(disk) {
            let found = self
                .volumes
                .volume_label(disk.drive)
                .unwrap_or_else(|| "<none>".to_owned());
            return Err(LifecycleError::precondition(
                "attach",
                format!(
                    "volume label mismatch: {} holds '{found}', expected '{}'",
                    disk.drive,
                    disk.label(self.format)
                ),
            ));
        }
        let busy = self.busy_processes(&root);
        if !busy.is_empty() {
            return Err(LifecycleError::precondition(
                "attach",
                format!(
                    "drive in use: {} process(es) running from {}",
                    busy.len(),
                    root.display()
                ),
            ));
        }
        Ok(Some(root))
    }

    pub fn can_detach(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        require_file("detach", disk)
    }

    pub fn can_compact(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        require_file("compact", disk)?;
        if self.mount_root(disk).is_some() {
            return Err(LifecycleError::precondition(
                "compact",
                format!("disk is attached to {}", disk.drive),
            ));
        }
        Ok(())
    }

    fn run_tool(&self, context: &str, task: &ScriptTask) -> Result<ExecutionResult, LifecycleError> {
        debug!("{context}: running {} {} script", self.partition.name(), task.kind());
        let result = self.partition.run(task);
        if result.failed {
            return Err(LifecycleError::tool_failure(
                context,
                format!("{} {} script failed", self.partition.name(), task.kind()),
                &result.output,
            ));
        }
        Ok(result)
    }

    /// Create, attach, provision, and detach a new disk. Any failure past the
    /// precondition is flagged `rollback_required`.
    pub fn create(&self, disk: &DiskImage, params: &DiskParams) -> Result<(), LifecycleError> {
        self.can_create(disk)?;

        info!("creating {} ({} MB)", disk.file.display(), params.size_mb);
        let task = ScriptTask::Create(CreateParams {
            file: disk.file.clone(),
            size_mb: params.size_mb,
            kind: params.kind,
            style: params.style,
            format: params.format,
            name: disk.label(params.format),
            drive: disk.drive,
        });
        self.run_tool("create", &task)
            .map_err(LifecycleError::with_rollback)?;

        let root = self.attach(disk).map_err(LifecycleError::with_rollback)?;
        provision(&root, disk, params).map_err(|e| {
            LifecycleError::tool_failure("create", format!("provisioning failed: {e}"), "")
                .with_rollback()
        })?;
        self.detach(disk).map_err(LifecycleError::with_rollback)
    }

    /// Attach the disk unless it is already correctly attached.
    pub fn attach(&self, disk: &DiskImage) -> Result<PathBuf, LifecycleError> {
        if let Some(root) = self.can_attach(disk)? {
            debug!("{} already attached on {}", disk.name, disk.drive);
            return Ok(root);
        }

        info!("attaching {} on {}", disk.file.display(), disk.drive);
        let result = self.run_tool("attach", &ScriptTask::Attach(disk.volume()))?;
        self.mount_root(disk).ok_or_else(|| {
            LifecycleError::tool_failure(
                "attach",
                format!("volume did not appear on {}", disk.drive),
                &result.output,
            )
        })
    }

    pub fn detach(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        self.can_detach(disk)?;

        info!("detaching {} from {}", disk.file.display(), disk.drive);
        self.run_tool("detach", &ScriptTask::Detach(disk.volume()))?;
        Ok(())
    }

    /// Unconditional detach used for rollback; skips every precondition.
    pub fn force_detach(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        let result = self.partition.run(&ScriptTask::Detach(disk.volume()));
        if result.failed {
            return Err(LifecycleError::rollback(
                "rollback",
                format!("could not detach {}", disk.drive),
                &result.output,
            ));
        }
        Ok(())
    }

    /// Compact the disk file. Runs the compaction script twice: the second
    /// pass shrinks the metadata region freed by the first.
    pub fn compact(&self, disk: &DiskImage) -> Result<(), LifecycleError> {
        self.can_compact(disk)?;

        info!("compacting {}", disk.file.display());
        for pass in 1..=2 {
            self.run_tool("compact", &ScriptTask::Compact(disk.volume()))?;
            debug!("compaction pass {pass} done");
        }
        Ok(())
    }
}

fn require_file(context: &str, disk: &DiskImage) -> Result<(), LifecycleError> {
    if disk.file.exists() {
        Ok(())
    } else {
        Err(LifecycleError::precondition(
            context,
            format!("file not exists: {}", disk.file.display()),
        ))
    }
}

fn provision(root: &Path, disk: &DiskImage, params: &DiskParams) -> std::io::Result<()> {
    for dir in SKELETON_DIRS {
        std::fs::create_dir_all(root.join(dir))?;
    }

    let properties = [
        ("drive", disk.drive.to_string()),
        ("name", disk.name.clone()),
        ("version", params.version.clone()),
    ];
    for (file, template) in [
        (params.startup_script.as_str(), STARTUP_RESOURCE),
        (params.shutdown_script.as_str(), SHUTDOWN_RESOURCE),
        ("README.txt", README_RESOURCE),
    ] {
        let path = root.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, render_template(template, &properties))?;
    }
    debug!("provisioned {}", root.display());
    Ok(())
}

/// Empty the transient directories under `root`, keeping the directories.
/// Individual delete failures are skipped. Returns the number of entries removed.
pub fn clean_transient_dirs(root: &Path) -> usize {
    let mut removed = 0;
    for dir in TRANSIENT_DIRS {
        let Ok(entries) = std::fs::read_dir(root.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => debug!("skipping {}: {e}", path.display()),
            }
        }
    }
    removed
}
