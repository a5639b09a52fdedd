use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("disk.size_mb must be greater than zero")]
    ZeroDiskSize,
    #[error("disk.file must not be empty")]
    EmptyDiskFile,
    #[error("reaper.force_attempts must be at least 1")]
    ZeroForceAttempts,
    #[error("supervisor.poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
    #[error("invalid environment variable name: '{0}'")]
    InvalidEnvName(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    #[serde(default)]
    pub disk: DiskSection,
    #[serde(default)]
    pub scripts: ScriptsSection,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub reaper: ReaperSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

impl Default for ManifestV1 {
    fn default() -> Self {
        Self {
            manifest_version: 1,
            disk: DiskSection::default(),
            scripts: ScriptsSection::default(),
            env: BTreeMap::new(),
            supervisor: SupervisorSection::default(),
            reaper: ReaperSection::default(),
            runtime: RuntimeSection::default(),
        }
    }
}

impl ManifestV1 {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        if self.disk.size_mb == 0 {
            return Err(ManifestError::ZeroDiskSize);
        }
        if self.disk.file.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(ManifestError::EmptyDiskFile);
        }
        if self.reaper.force_attempts == 0 {
            return Err(ManifestError::ZeroForceAttempts);
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ManifestError::ZeroPollInterval);
        }
        for key in self.env.keys() {
            let valid = !key.is_empty()
                && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                && !key.as_bytes()[0].is_ascii_digit();
            if !valid {
                return Err(ManifestError::InvalidEnvName(key.clone()));
            }
        }
        Ok(())
    }

    /// Resolve `disk.file` against the directory the manifest was loaded from.
    pub fn disk_path(&self, manifest_dir: &Path) -> Option<PathBuf> {
        let file = self.disk.file.as_deref()?;
        let path = PathBuf::from(file);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(manifest_dir.join(path))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DiskSection {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_size_mb")]
    pub size_mb: u64,
    #[serde(default)]
    pub kind: DiskKind,
    #[serde(default)]
    pub style: PartitionStyle,
    #[serde(default)]
    pub format: DiskFormat,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for DiskSection {
    fn default() -> Self {
        Self {
            file: None,
            size_mb: default_size_mb(),
            kind: DiskKind::default(),
            style: PartitionStyle::default(),
            format: DiskFormat::default(),
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    #[default]
    Expandable,
    Fixed,
}

impl DiskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskKind::Expandable => "expandable",
            DiskKind::Fixed => "fixed",
        }
    }
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStyle {
    #[default]
    Gpt,
    Mbr,
}

impl PartitionStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionStyle::Gpt => "gpt",
            PartitionStyle::Mbr => "mbr",
        }
    }
}

impl fmt::Display for PartitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Ntfs,
    Exfat,
    Fat32,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Ntfs => "ntfs",
            DiskFormat::Exfat => "exfat",
            DiskFormat::Fat32 => "fat32",
        }
    }

    /// Longest volume label the filesystem stores, in characters.
    pub fn max_label_len(self) -> usize {
        match self {
            DiskFormat::Ntfs => 32,
            DiskFormat::Exfat => 15,
            DiskFormat::Fat32 => 11,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScriptsSection {
    #[serde(default = "default_startup_script")]
    pub startup: String,
    #[serde(default = "default_shutdown_script")]
    pub shutdown: String,
}

impl Default for ScriptsSection {
    fn default() -> Self {
        Self {
            startup: default_startup_script(),
            shutdown: default_shutdown_script(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReaperSection {
    #[serde(default = "default_soft_settle_ms")]
    pub soft_settle_ms: u64,
    #[serde(default = "default_hard_settle_ms")]
    pub hard_settle_ms: u64,
    #[serde(default = "default_force_attempts")]
    pub force_attempts: u32,
    #[serde(default = "default_force_interval_ms")]
    pub force_interval_ms: u64,
    #[serde(default)]
    pub exclude_process: Option<String>,
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            soft_settle_ms: default_soft_settle_ms(),
            hard_settle_ms: default_hard_settle_ms(),
            force_attempts: default_force_attempts(),
            force_interval_ms: default_force_interval_ms(),
            exclude_process: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_partition_tool")]
    pub partition_tool: String,
    #[serde(default = "default_kill_tool")]
    pub kill_tool: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            partition_tool: default_partition_tool(),
            kill_tool: default_kill_tool(),
        }
    }
}

fn default_size_mb() -> u64 {
    8192
}

fn default_version() -> String {
    "1.0".to_owned()
}

#[cfg(windows)]
fn default_startup_script() -> String {
    "startup.cmd".to_owned()
}

#[cfg(not(windows))]
fn default_startup_script() -> String {
    "startup.sh".to_owned()
}

#[cfg(windows)]
fn default_shutdown_script() -> String {
    "shutdown.cmd".to_owned()
}

#[cfg(not(windows))]
fn default_shutdown_script() -> String {
    "shutdown.sh".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_soft_settle_ms() -> u64 {
    3000
}

fn default_hard_settle_ms() -> u64 {
    1000
}

fn default_force_attempts() -> u32 {
    3
}

fn default_force_interval_ms() -> u64 {
    500
}

fn default_backend() -> String {
    "host".to_owned()
}

fn default_partition_tool() -> String {
    "diskpart".to_owned()
}

fn default_kill_tool() -> String {
    "taskkill".to_owned()
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    let manifest: ManifestV1 = toml::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}
