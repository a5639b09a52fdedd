use crate::disk::DiskImage;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `Attach <name>` and `Detach <name>` launchers next to the disk file.
/// Each launcher re-invokes `app` with the disk, drive letter, and task.
pub fn write_shortcuts(disk: &DiskImage, app: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = disk
        .file
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut written = Vec::new();
    for task in ["attach", "detach"] {
        let title = format!("{}{} {}", task[..1].to_uppercase(), &task[1..], disk.name);
        let path = dir.join(format!("{title}.{}", launcher_extension()));
        std::fs::write(&path, launcher(disk, app, task))?;
        make_executable(&path)?;
        info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(windows)]
fn launcher_extension() -> &'static str {
    "cmd"
}

#[cfg(not(windows))]
fn launcher_extension() -> &'static str {
    "sh"
}

#[cfg(windows)]
fn launcher(disk: &DiskImage, app: &Path, task: &str) -> String {
    format!(
        "@echo off\r\n\"{}\" --disk \"{}\" {} {task}\r\n",
        app.display(),
        disk.file.display(),
        disk.drive.letter()
    )
}

#[cfg(not(windows))]
fn launcher(disk: &DiskImage, app: &Path, task: &str) -> String {
    format!(
        "#!/bin/sh\nexec {} --disk {} {} {task}\n",
        shell_quote_path(app),
        shell_quote_path(&disk.file),
        disk.drive.letter()
    )
}

/// Single-quote for POSIX sh: replace ' with '\'' then wrap in '.
#[cfg(not(windows))]
fn shell_quote_path(p: &Path) -> String {
    format!("'{}'", p.to_string_lossy().replace('\'', "'\\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
