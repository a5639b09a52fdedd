//! OS-facing execution layer for diskenv.
//!
//! This crate owns everything that talks to the host: drive letters and volume
//! probing, partitioning-tool scripts rendered from embedded templates, the
//! partition tool invoker, the batch-script supervisor with CPU-idle freeze
//! detection, the process table and the escalating process reaper. Each OS
//! seam is a trait (`PartitionTool`, `VolumeProbe`, `ProcessTable`) with a host
//! implementation and a mock, bundled together by `select_backend`.

pub mod backend;
pub mod drive;
pub mod mock;
pub mod partition;
pub mod process;
pub mod reaper;
pub mod script;
pub mod supervisor;
pub mod volume;

pub use backend::{select_backend, Backend, BackendOptions};
pub use drive::Drive;
pub use partition::{DiskPartTool, ExecutionResult, PartitionTool};
pub use process::{processes_under, KillError, ManagedProcess, ProcessTable, SystemProcessTable};
pub use reaper::{ProcessReaper, ReapReport, ReaperConfig};
pub use script::{render_template, CreateParams, ScriptKind, ScriptTask, VolumeParams};
pub use supervisor::{BatchSupervisor, ScriptIdentity, ScriptInvocation, SupervisorConfig};
pub use volume::{HostVolumes, VolumeProbe};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("invalid drive letter: '{0}'")]
    InvalidDrive(String),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{script}' froze: no processor time consumed for {}s", idle.as_secs())]
    Frozen {
        script: String,
        idle: Duration,
        output: String,
    },
}
