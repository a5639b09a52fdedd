//! Manifest parsing and validation for diskenv.
//!
//! The schema layer turns a `diskenv.toml` file into plain values: the disk
//! file and its geometry, the startup/shutdown script names, extra variables
//! for the batch environment, and the supervision and reaping timings. The
//! lifecycle crates never read configuration files themselves.

pub mod manifest;

pub use manifest::{
    parse_manifest_file, parse_manifest_str, DiskFormat, DiskKind, DiskSection, ManifestError,
    ManifestV1, PartitionStyle, ReaperSection, RuntimeSection, ScriptsSection, SupervisorSection,
};
