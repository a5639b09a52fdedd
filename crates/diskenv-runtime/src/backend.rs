use crate::mock::MockHost;
use crate::partition::{DiskPartTool, PartitionTool};
use crate::process::{ProcessTable, SystemProcessTable};
use crate::volume::{HostVolumes, VolumeProbe};
use crate::RuntimeError;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    pub partition_tool: String,
    pub kill_tool: String,
    /// Directory the mock backend keeps its state in, normally the directory
    /// holding the disk file.
    pub state_dir: PathBuf,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            partition_tool: "diskpart".to_owned(),
            kill_tool: "taskkill".to_owned(),
            state_dir: std::env::temp_dir(),
        }
    }
}

/// The three OS seams one lifecycle run talks to.
#[derive(Clone)]
pub struct Backend {
    pub name: &'static str,
    pub partition: Arc<dyn PartitionTool>,
    pub volumes: Arc<dyn VolumeProbe>,
    pub processes: Arc<dyn ProcessTable>,
}

impl Backend {
    pub fn from_parts(
        name: &'static str,
        partition: Arc<dyn PartitionTool>,
        volumes: Arc<dyn VolumeProbe>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            name,
            partition,
            volumes,
            processes,
        }
    }
}

pub fn select_backend(name: &str, options: &BackendOptions) -> Result<Backend, RuntimeError> {
    match name {
        "host" => Ok(Backend::from_parts(
            "host",
            Arc::new(DiskPartTool::new(&options.partition_tool)),
            Arc::new(HostVolumes),
            Arc::new(SystemProcessTable::new(&options.kill_tool)),
        )),
        "mock" => {
            let host = Arc::new(MockHost::new(&options.state_dir));
            Ok(Backend::from_parts(
                "mock",
                host.clone(),
                host,
                Arc::new(SystemProcessTable::new(&options.kill_tool)),
            ))
        }
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
