use crate::drive::Drive;
use crate::partition::{ExecutionResult, PartitionTool};
use crate::process::{KillError, ManagedProcess, ProcessTable};
use crate::script::{ScriptKind, ScriptTask};
use crate::volume::VolumeProbe;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const STATE_DIR: &str = ".diskenv-mock";
const MOCK_DISK_HEADER: &str = "diskenv mock disk\n";

/// Partition tool and volume probe emulated with plain files.
///
/// State lives under `<state_dir>/.diskenv-mock/` so several processes (and
/// several CLI invocations) observe the same attach state:
/// `volumes/<stem>/` is the volume content, `volumes/<stem>.label` its label,
/// and `mounts/<L>` marks drive `L` as mounted, holding the disk file path.
pub struct MockHost {
    root: PathBuf,
    calls: Mutex<Vec<ScriptKind>>,
    failures: Mutex<BTreeMap<ScriptKind, Failure>>,
}

struct Failure {
    /// `None` fails every call, `Some(n)` only the n-th (1-based).
    nth: Option<usize>,
    seen: usize,
    message: String,
}

impl MockHost {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join(STATE_DIR),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every partition tool invocation so far, in order.
    pub fn calls(&self) -> Vec<ScriptKind> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_calls(&self) -> Vec<ScriptKind> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn count(&self, kind: ScriptKind) -> usize {
        self.calls().into_iter().filter(|k| *k == kind).count()
    }

    /// Make every invocation of `kind` fail with `message` on the error stream.
    pub fn fail_on(&self, kind: ScriptKind, message: &str) {
        self.set_failure(kind, None, message);
    }

    /// Make only the `nth` (1-based) invocation of `kind` fail.
    pub fn fail_nth(&self, kind: ScriptKind, nth: usize, message: &str) {
        self.set_failure(kind, Some(nth), message);
    }

    fn set_failure(&self, kind: ScriptKind, nth: Option<usize>, message: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                kind,
                Failure {
                    nth,
                    seen: 0,
                    message: message.to_owned(),
                },
            );
    }

    fn injected_failure(&self, kind: ScriptKind) -> Option<String> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let failure = failures.get_mut(&kind)?;
        failure.seen += 1;
        match failure.nth {
            None => Some(failure.message.clone()),
            Some(n) if n == failure.seen => Some(failure.message.clone()),
            Some(_) => None,
        }
    }

    pub fn volume_dir(&self, file: &Path) -> PathBuf {
        self.root.join("volumes").join(stem(file))
    }

    fn label_path(&self, file: &Path) -> PathBuf {
        self.root
            .join("volumes")
            .join(format!("{}.label", stem(file)))
    }

    fn mount_marker(&self, drive: Drive) -> PathBuf {
        self.root.join("mounts").join(drive.letter().to_string())
    }

    fn mounted_file(&self, drive: Drive) -> Option<PathBuf> {
        std::fs::read_to_string(self.mount_marker(drive))
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }

    fn is_mounted_anywhere(&self, file: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(self.root.join("mounts")) else {
            return false;
        };
        entries.flatten().any(|e| {
            std::fs::read_to_string(e.path()).is_ok_and(|s| Path::new(s.trim()) == file)
        })
    }

    /// Change the label of whatever volume is mounted on `drive`.
    pub fn relabel(&self, drive: Drive, label: &str) -> std::io::Result<()> {
        let file = self.mounted_file(drive).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "drive is not mounted")
        })?;
        std::fs::write(self.label_path(&file), label)
    }

    /// Mount a volume that does not belong to any managed disk on `drive`.
    pub fn mount_foreign(&self, drive: Drive, label: &str) -> std::io::Result<PathBuf> {
        let file = self.root.join(format!("foreign-{}.vhdx", drive.letter()));
        std::fs::create_dir_all(self.volume_dir(&file))?;
        std::fs::write(self.label_path(&file), label)?;
        self.write_marker(drive, &file)?;
        Ok(self.volume_dir(&file))
    }

    fn write_marker(&self, drive: Drive, file: &Path) -> std::io::Result<()> {
        let marker = self.mount_marker(drive);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(marker, file.display().to_string())
    }

    fn apply(&self, task: &ScriptTask) -> Result<String, String> {
        let file = task.file();
        let drive = task.drive();
        let io = |e: std::io::Error| e.to_string();
        match task {
            ScriptTask::Create(params) => {
                if file.exists() {
                    return Err("The file exists.".to_owned());
                }
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent).map_err(io)?;
                }
                std::fs::write(
                    file,
                    format!("{MOCK_DISK_HEADER}size_mb={}\n", params.size_mb),
                )
                .map_err(io)?;
                std::fs::create_dir_all(self.volume_dir(file)).map_err(io)?;
                std::fs::write(self.label_path(file), &params.name).map_err(io)?;
                Ok("DiskPart successfully created the virtual disk file.".to_owned())
            }
            ScriptTask::Attach(_) => {
                if !file.exists() {
                    return Err("The system cannot find the file specified.".to_owned());
                }
                if self.mounted_file(drive).is_some() {
                    return Err("The specified drive letter is not free to be assigned.".to_owned());
                }
                std::fs::create_dir_all(self.volume_dir(file)).map_err(io)?;
                self.write_marker(drive, file).map_err(io)?;
                Ok("DiskPart successfully attached the virtual disk file.".to_owned())
            }
            ScriptTask::Detach(_) => match self.mounted_file(drive) {
                Some(mounted) if mounted == *file => {
                    std::fs::remove_file(self.mount_marker(drive)).map_err(io)?;
                    Ok("DiskPart successfully detached the virtual disk file.".to_owned())
                }
                _ => Err("The virtual disk is not attached.".to_owned()),
            },
            ScriptTask::Compact(_) => {
                if !file.exists() {
                    return Err("The system cannot find the file specified.".to_owned());
                }
                if self.is_mounted_anywhere(file) {
                    return Err("The virtual disk is already attached.".to_owned());
                }
                Ok("DiskPart successfully compacted the virtual disk file.".to_owned())
            }
        }
    }
}

fn stem(file: &Path) -> String {
    file.file_stem()
        .map_or_else(|| "disk".to_owned(), |s| s.to_string_lossy().into_owned())
}

impl PartitionTool for MockHost {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn run(&self, task: &ScriptTask) -> ExecutionResult {
        let kind = task.kind();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(kind);

        if let Some(message) = self.injected_failure(kind) {
            return ExecutionResult::classify(false, "", &message);
        }
        match self.apply(task) {
            Ok(out) => ExecutionResult::classify(true, &out, ""),
            Err(err) => ExecutionResult::classify(false, "", &err),
        }
    }
}

impl VolumeProbe for MockHost {
    fn mount_root(&self, drive: Drive) -> Option<PathBuf> {
        let file = self.mounted_file(drive)?;
        let root = self.volume_dir(&file);
        root.is_dir().then_some(root)
    }

    fn volume_label(&self, drive: Drive) -> Option<String> {
        let file = self.mounted_file(drive)?;
        std::fs::read_to_string(self.label_path(&file))
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
    }
}

/// How a synthetic process reacts to termination requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resist {
    /// Exits on the first close request.
    #[default]
    Cooperative,
    /// Ignores close requests, exits on a tree kill.
    UntilHard,
    /// Exits on the n-th forced kill.
    UntilForce(u32),
    /// Never exits.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Close,
    KillTree,
    Force,
}

struct Synthetic {
    process: ManagedProcess,
    resist: Resist,
    forced: u32,
}

/// In-memory process table holding synthetic processes.
#[derive(Default)]
pub struct MockProcessTable {
    processes: Mutex<BTreeMap<u32, Synthetic>>,
    calls: Mutex<Vec<(Stage, u32)>>,
}

impl MockProcessTable {
    pub fn add(&self, process: ManagedProcess) {
        self.add_with(process, Resist::Cooperative);
    }

    pub fn add_with(&self, process: ManagedProcess, resist: Resist) {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                process.pid,
                Synthetic {
                    process,
                    resist,
                    forced: 0,
                },
            );
    }

    pub fn calls(&self) -> Vec<(Stage, u32)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn hit(&self, stage: Stage, pid: u32) -> Result<(), KillError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stage, pid));

        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = processes
            .get_mut(&pid)
            .ok_or(KillError::NoSuchProcess(pid))?;
        let exits = match (stage, entry.resist) {
            (_, Resist::Cooperative) | (Stage::KillTree | Stage::Force, Resist::UntilHard) => true,
            (Stage::Force, Resist::UntilForce(n)) => {
                entry.forced += 1;
                entry.forced >= n
            }
            (Stage::Force, Resist::Never) => {
                return Err(KillError::Failed {
                    pid,
                    reason: "Access is denied.".to_owned(),
                })
            }
            _ => false,
        };
        if exits {
            processes.remove(&pid);
        }
        Ok(())
    }
}

impl ProcessTable for MockProcessTable {
    fn snapshot(&self) -> Vec<ManagedProcess> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.process.clone())
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pid)
    }

    fn request_close(&self, pid: u32) -> Result<(), KillError> {
        self.hit(Stage::Close, pid)
    }

    fn kill_tree(&self, pid: u32) -> Result<(), KillError> {
        self.hit(Stage::KillTree, pid)
    }

    fn force_kill(&self, pid: u32) -> Result<(), KillError> {
        self.hit(Stage::Force, pid)
    }

    fn cpu_time(&self, _pid: u32) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{CreateParams, VolumeParams};
    use diskenv_schema::{DiskFormat, DiskKind, PartitionStyle};

    fn e() -> Drive {
        Drive::new('E').unwrap()
    }

    fn create(file: &Path) -> ScriptTask {
        ScriptTask::Create(CreateParams {
            file: file.to_path_buf(),
            size_mb: 64,
            kind: DiskKind::Expandable,
            style: PartitionStyle::Gpt,
            format: DiskFormat::Ntfs,
            name: "env".to_owned(),
            drive: e(),
        })
    }

    fn volume(file: &Path) -> VolumeParams {
        VolumeParams {
            file: file.to_path_buf(),
            drive: e(),
        }
    }

    #[test]
    fn create_attach_detach_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        let file = dir.path().join("env.vhdx");

        assert!(host.run(&create(&file)).succeeded());
        assert!(file.exists());
        assert!(host.mount_root(e()).is_none());

        assert!(host.run(&ScriptTask::Attach(volume(&file))).succeeded());
        assert_eq!(host.mount_root(e()), Some(host.volume_dir(&file)));
        assert_eq!(host.volume_label(e()).as_deref(), Some("env"));

        let compact = host.run(&ScriptTask::Compact(volume(&file)));
        assert!(compact.failed, "compact must refuse an attached disk");

        assert!(host.run(&ScriptTask::Detach(volume(&file))).succeeded());
        assert!(host.mount_root(e()).is_none());
        assert!(host.run(&ScriptTask::Compact(volume(&file))).succeeded());
        assert_eq!(
            host.calls(),
            vec![
                ScriptKind::Create,
                ScriptKind::Attach,
                ScriptKind::Compact,
                ScriptKind::Detach,
                ScriptKind::Compact
            ]
        );
    }

    #[test]
    fn state_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("env.vhdx");
        let first = MockHost::new(dir.path());
        first.run(&create(&file));
        first.run(&ScriptTask::Attach(volume(&file)));

        let second = MockHost::new(dir.path());
        assert!(second.mount_root(e()).is_some());
        assert!(second.calls().is_empty());
    }

    #[test]
    fn create_over_existing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        let file = dir.path().join("env.vhdx");
        std::fs::write(&file, "x").unwrap();
        let result = host.run(&create(&file));
        assert!(result.failed);
        assert_eq!(result.output, "The file exists.");
    }

    #[test]
    fn injected_failure_targets_one_call() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        let file = dir.path().join("env.vhdx");
        host.run(&create(&file));
        host.fail_nth(ScriptKind::Attach, 1, "Virtual Disk Service error");

        let first = host.run(&ScriptTask::Attach(volume(&file)));
        assert!(first.failed);
        assert_eq!(first.output, "Virtual Disk Service error");
        assert!(host.run(&ScriptTask::Attach(volume(&file))).succeeded());
    }

    #[test]
    fn foreign_mount_occupies_the_drive() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        host.mount_foreign(e(), "OTHER").unwrap();
        assert_eq!(host.volume_label(e()).as_deref(), Some("OTHER"));

        let file = dir.path().join("env.vhdx");
        host.run(&create(&file));
        assert!(host.run(&ScriptTask::Attach(volume(&file))).failed);
    }

    #[test]
    fn synthetic_process_resistance() {
        let table = MockProcessTable::default();
        let p = |pid| ManagedProcess {
            pid,
            name: "p".to_owned(),
            exe: PathBuf::from("E:\\p.exe"),
        };
        table.add_with(p(1), Resist::UntilForce(2));
        assert!(table.request_close(1).is_ok());
        assert!(table.kill_tree(1).is_ok());
        assert!(table.force_kill(1).is_ok());
        assert!(table.is_alive(1));
        assert!(table.force_kill(1).is_ok());
        assert!(!table.is_alive(1));
        assert!(matches!(table.force_kill(1), Err(KillError::NoSuchProcess(1))));
    }
}
