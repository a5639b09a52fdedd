use crate::script::{ScriptKind, ScriptTask};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

const SCRIPT_PREFIX: &str = "diskenv-";
const SCRIPT_SUFFIX: &str = ".txt";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured outcome of one external tool invocation.
///
/// `failed` is set on a non-zero exit code and also whenever anything was
/// written to the error stream, since the partitioning tool does not reliably
/// report failure through its exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub failed: bool,
}

impl ExecutionResult {
    pub fn classify(success: bool, stdout: &str, stderr: &str) -> Self {
        let stdout = stdout.trim();
        let stderr = stderr.trim();
        let output = match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_owned(),
            (true, false) => stderr.to_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        };
        Self {
            output,
            failed: !success || !stderr.is_empty(),
        }
    }

    pub fn spawn_failure(err: &std::io::Error) -> Self {
        Self {
            output: err.to_string(),
            failed: true,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.failed
    }
}

pub trait PartitionTool: Send + Sync {
    fn name(&self) -> &str;

    /// Render and execute one script synchronously.
    fn run(&self, task: &ScriptTask) -> ExecutionResult;
}

/// Invokes the host partitioning utility as `<tool> /s <scriptfile>`.
pub struct DiskPartTool {
    program: PathBuf,
    script_dir: PathBuf,
}

impl DiskPartTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_script_dir(program, std::env::temp_dir())
    }

    pub fn with_script_dir(program: impl Into<PathBuf>, script_dir: impl Into<PathBuf>) -> Self {
        let tool = Self {
            program: program.into(),
            script_dir: script_dir.into(),
        };
        let removed = tool.clean_stale_scripts();
        if removed > 0 {
            debug!("removed {removed} stale partition script(s)");
        }
        tool
    }

    /// Scripts use a fixed name per kind so leftovers from a crashed run can be found.
    pub fn script_path(&self, kind: ScriptKind) -> PathBuf {
        self.script_dir
            .join(format!("{SCRIPT_PREFIX}{}{SCRIPT_SUFFIX}", kind.name()))
    }

    pub fn clean_stale_scripts(&self) -> usize {
        [
            ScriptKind::Create,
            ScriptKind::Attach,
            ScriptKind::Detach,
            ScriptKind::Compact,
        ]
        .into_iter()
        .map(|kind| self.script_path(kind))
        .filter(|path| path.exists() && std::fs::remove_file(path).is_ok())
        .count()
    }

    fn execute(&self, script: &Path) -> ExecutionResult {
        let mut cmd = Command::new(&self.program);
        cmd.arg("/s")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_window(&mut cmd);

        match cmd.output() {
            Ok(output) => ExecutionResult::classify(
                output.status.success(),
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            Err(e) => {
                warn!("failed to start {}: {e}", self.program.display());
                ExecutionResult::spawn_failure(&e)
            }
        }
    }
}

impl PartitionTool for DiskPartTool {
    fn name(&self) -> &'static str {
        "diskpart"
    }

    fn run(&self, task: &ScriptTask) -> ExecutionResult {
        let path = self.script_path(task.kind());
        if let Err(e) = std::fs::write(&path, task.render()) {
            return ExecutionResult {
                output: format!("failed to write {}: {e}", path.display()),
                failed: true,
            };
        }
        let _guard = ScriptFile(&path);
        debug!("running {} script {}", task.kind(), path.display());
        self.execute(&path)
    }
}

/// Removes the materialized script however the invocation ends.
struct ScriptFile<'a>(&'a Path);

impl Drop for ScriptFile<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

#[cfg(windows)]
pub(crate) fn hide_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_window(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::Drive;
    use crate::script::VolumeParams;

    fn detach_task() -> ScriptTask {
        ScriptTask::Detach(VolumeParams {
            file: PathBuf::from("/envs/dev.vhdx"),
            drive: Drive::new('E').unwrap(),
        })
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-diskpart");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn classify_success() {
        let r = ExecutionResult::classify(true, "  done\n", "");
        assert!(r.succeeded());
        assert_eq!(r.output, "done");
    }

    #[test]
    fn classify_nonzero_exit_fails() {
        let r = ExecutionResult::classify(false, "partial", "");
        assert!(r.failed);
        assert_eq!(r.output, "partial");
    }

    #[test]
    fn classify_stderr_fails_even_on_zero_exit() {
        let r = ExecutionResult::classify(true, "out", "Virtual Disk Service error\n");
        assert!(r.failed);
        assert_eq!(r.output, "out\nVirtual Disk Service error");
    }

    #[test]
    fn missing_program_is_a_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let tool = DiskPartTool::with_script_dir(dir.path().join("no-such-tool"), dir.path());
        let result = tool.run(&detach_task());
        assert!(result.failed);
        assert!(!result.output.is_empty());
        assert!(!tool.script_path(ScriptKind::Detach).exists());
    }

    #[test]
    fn stale_scripts_are_removed_on_construction() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("diskenv-attach.txt");
        std::fs::write(&stale, "select vdisk").unwrap();
        let unrelated = dir.path().join("notes.txt");
        std::fs::write(&unrelated, "keep").unwrap();

        let _tool = DiskPartTool::with_script_dir("diskpart", dir.path());
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[cfg(unix)]
    #[test]
    fn tool_receives_rendered_script_and_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tool_path = fake_tool(dir.path(), "[ \"$1\" = \"/s\" ] || exit 9\ncat \"$2\"");
        let tool = DiskPartTool::with_script_dir(&tool_path, dir.path());

        let result = tool.run(&detach_task());
        assert!(result.succeeded(), "output: {}", result.output);
        assert!(result.output.contains("select vdisk file=\"/envs/dev.vhdx\""));
        assert!(result.output.contains("detach vdisk"));
        assert!(!tool.script_path(ScriptKind::Detach).exists());
    }

    #[cfg(unix)]
    #[test]
    fn tool_stderr_with_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool_path = fake_tool(dir.path(), "echo 'The file is in use.' >&2\nexit 0");
        let tool = DiskPartTool::with_script_dir(&tool_path, dir.path());

        let result = tool.run(&detach_task());
        assert!(result.failed);
        assert_eq!(result.output, "The file is in use.");
        assert!(!tool.script_path(ScriptKind::Detach).exists());
    }

    #[cfg(unix)]
    #[test]
    fn tool_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool_path = fake_tool(dir.path(), "echo 'DiskPart has encountered an error'\nexit 1");
        let tool = DiskPartTool::with_script_dir(&tool_path, dir.path());

        let result = tool.run(&detach_task());
        assert!(result.failed);
        assert!(result.output.contains("encountered an error"));
    }
}
