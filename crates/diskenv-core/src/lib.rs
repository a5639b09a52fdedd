//! Lifecycle engine for disk-image-backed environments.
//!
//! This crate drives a virtual disk through its states (absent, created,
//! attached, attached and busy) on top of the OS seams from `diskenv-runtime`.
//! `DiskLifecycle` owns the preconditions and the four disk operations, the
//! `Orchestrator` sequences whole tasks with rollback and batch supervision,
//! and the `EventBus` carries progress text to whatever is rendering it.

pub mod disk;
pub mod events;
pub mod orchestrator;
pub mod settings;
pub mod shortcuts;

pub use disk::{clean_transient_dirs, DiskImage, DiskLifecycle, DiskParams, DiskState};
pub use events::{Event, EventBus, Notify, Severity, TracingNotifier};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Task};
pub use settings::mirror_settings;
pub use shortcuts::write_shortcuts;

use diskenv_runtime::RuntimeError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The disk or drive is not in the state the operation requires.
    Precondition,
    /// The partitioning tool or a lifecycle script reported failure.
    ToolFailure,
    /// A lifecycle script stopped consuming processor time.
    FreezeTimeout,
    /// Best-effort corrective action failed. Never surfaced as the final error.
    Rollback,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Precondition => "precondition not met",
            ErrorKind::ToolFailure => "tool failure",
            ErrorKind::FreezeTimeout => "freeze detected",
            ErrorKind::Rollback => "rollback failed",
        })
    }
}

/// How a finished task should be reported to a non-interactive caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    Success,
    /// Nothing was changed; the task can be re-run once the state is right.
    RetryLater,
    HardFailure,
}

#[derive(Debug, Error)]
#[error("{context}: {message}")]
pub struct LifecycleError {
    pub kind: ErrorKind,
    pub context: String,
    pub message: String,
    /// Raw text captured from the failing tool or script.
    pub output: Option<String>,
    /// Set when the failure happened part-way through a multi-step operation
    /// and the disk may have been left attached.
    pub rollback_required: bool,
}

impl LifecycleError {
    fn new(kind: ErrorKind, context: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.to_owned(),
            message: message.into(),
            output: None,
            rollback_required: false,
        }
    }

    pub fn precondition(context: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, context, message)
    }

    pub fn tool_failure(context: &str, message: impl Into<String>, output: &str) -> Self {
        Self::new(ErrorKind::ToolFailure, context, message).with_output(output)
    }

    pub fn rollback(context: &str, message: impl Into<String>, output: &str) -> Self {
        Self::new(ErrorKind::Rollback, context, message).with_output(output)
    }

    #[must_use]
    pub fn with_output(mut self, output: &str) -> Self {
        let output = output.trim();
        self.output = (!output.is_empty()).then(|| output.to_owned());
        self
    }

    #[must_use]
    pub fn with_rollback(mut self) -> Self {
        self.rollback_required = true;
        self
    }

    pub fn from_runtime(context: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Frozen { script, idle, output } => Self::new(
                ErrorKind::FreezeTimeout,
                context,
                format!(
                    "{script} consumed no processor time for {}s and was killed",
                    idle.as_secs()
                ),
            )
            .with_output(&output),
            other => Self::new(ErrorKind::ToolFailure, context, other.to_string()),
        }
    }

    pub fn exit_signal(&self) -> ExitSignal {
        match self.kind {
            ErrorKind::Precondition => ExitSignal::RetryLater,
            ErrorKind::ToolFailure | ErrorKind::FreezeTimeout | ErrorKind::Rollback => {
                ExitSignal::HardFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn precondition_is_retry_later() {
        let err = LifecycleError::precondition("attach", "file not exists: env.vhdx");
        assert_eq!(err.exit_signal(), ExitSignal::RetryLater);
        assert!(!err.rollback_required);
        assert_eq!(err.to_string(), "attach: file not exists: env.vhdx");
    }

    #[test]
    fn tool_failure_keeps_trimmed_output() {
        let err = LifecycleError::tool_failure("create", "diskpart failed", "  boom\n");
        assert_eq!(err.exit_signal(), ExitSignal::HardFailure);
        assert_eq!(err.output.as_deref(), Some("boom"));

        let quiet = LifecycleError::tool_failure("create", "diskpart failed", " \n");
        assert!(quiet.output.is_none());
    }

    #[test]
    fn frozen_script_maps_to_freeze_timeout() {
        let err = LifecycleError::from_runtime(
            "startup",
            RuntimeError::Frozen {
                script: "startup.cmd".to_owned(),
                idle: Duration::from_secs(30),
                output: "installing".to_owned(),
            },
        );
        assert_eq!(err.kind, ErrorKind::FreezeTimeout);
        assert_eq!(err.output.as_deref(), Some("installing"));
        assert!(err.message.contains("30s"));
    }

    #[test]
    fn rollback_flag_is_explicit() {
        let err = LifecycleError::tool_failure("create", "x", "").with_rollback();
        assert!(err.rollback_required);
        assert_eq!(err.kind, ErrorKind::ToolFailure);
    }
}
