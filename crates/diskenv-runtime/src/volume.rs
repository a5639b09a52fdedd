use crate::drive::Drive;
use std::path::PathBuf;

/// Live view of mounted volumes. Implementations must not cache: every call
/// reflects the current OS state.
pub trait VolumeProbe: Send + Sync {
    /// Root directory of the volume mounted on `drive`, if any.
    fn mount_root(&self, drive: Drive) -> Option<PathBuf>;

    /// Volume label of the mounted volume. `None` when unmounted, unlabeled,
    /// or when the platform cannot report it.
    fn volume_label(&self, drive: Drive) -> Option<String>;
}

pub struct HostVolumes;

impl VolumeProbe for HostVolumes {
    fn mount_root(&self, drive: Drive) -> Option<PathBuf> {
        let root = drive.root();
        root.is_dir().then_some(root)
    }

    #[cfg(windows)]
    fn volume_label(&self, drive: Drive) -> Option<String> {
        let output = std::process::Command::new("cmd")
            .args(["/c", "vol", &drive.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_vol_output(&String::from_utf8_lossy(&output.stdout), drive)
    }

    #[cfg(not(windows))]
    fn volume_label(&self, _drive: Drive) -> Option<String> {
        None
    }
}

/// Extract the label from `vol` output such as ` Volume in drive E is DEV`.
pub fn parse_vol_output(output: &str, drive: Drive) -> Option<String> {
    let marker = format!("drive {} is ", drive.letter());
    output.lines().find_map(|line| {
        let idx = line.find(&marker)?;
        let label = line[idx + marker.len()..].trim();
        (!label.is_empty()).then(|| label.to_owned())
    })
}
