// Error types for the passthrough lifecycle manager
//
// Everything the core can fail with is a typed value; expected host
// failures (missing files, busy devices, bad addresses) never panic.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PassthroughError>;

/// Errors surfaced to callers of the core
#[derive(Error, Debug)]
pub enum PassthroughError {
    #[error("PCI topology unavailable: {reason}")]
    TopologyUnavailable { reason: String },

    #[error("GPU {address} is not eligible for passthrough: {reason}")]
    NoEligibleGpu { address: String, reason: String },

    #[error("timed out during '{step}' for {address}")]
    BindTimeout { address: String, step: String },

    #[error("{address} is bound to {driver} instead of vfio-pci", driver = .found.as_deref().unwrap_or("no driver"))]
    BindVerificationFailed {
        address: String,
        found: Option<String>,
    },

    #[error("failed to update descriptor of VM '{vm}': {reason}")]
    DescriptorMutationFailed { vm: String, reason: String },

    #[error("operation already in progress for {key}")]
    AlreadyInProgress { key: String },

    #[error("VM '{vm}' must be stopped first")]
    VmRunning { vm: String },

    #[error("VM '{vm}' not found")]
    VmNotFound { vm: String },

    #[error("VM runtime error for '{vm}': {reason}")]
    Runtime { vm: String, reason: String },

    #[error("invalid PCI address '{address}' (expected 0000:01:00.0)")]
    InvalidAddress { address: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl PassthroughError {
    /// Transient errors may succeed on a later attempt (timeouts, busy devices)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PassthroughError::BindTimeout { .. } | PassthroughError::AlreadyInProgress { .. }
        )
    }
}

/// Conditions that do not fail an operation but must reach the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughWarning {
    /// Every detected GPU looks like it drives the host display
    RiskyConfiguration { gpu_count: usize },
    /// The stop watcher gave up before the VM terminated; the GPU stays on vfio-pci
    RestoreTimedOut { vm: String, gpu: String },
    /// The VM stopped but the GPU could not be handed back to the host driver
    RestoreFailed { vm: String, gpu: String, reason: String },
}

impl fmt::Display for PassthroughWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PassthroughWarning::RiskyConfiguration { gpu_count } => write!(
                f,
                "all {} GPUs appear to drive the host display; passthrough disabled",
                gpu_count
            ),
            PassthroughWarning::RestoreTimedOut { vm, gpu } => write!(
                f,
                "VM '{}' did not stop in time; {} left bound to vfio-pci",
                vm, gpu
            ),
            PassthroughWarning::RestoreFailed { vm, gpu, reason } => write!(
                f,
                "VM '{}' stopped but {} could not be restored to the host: {}",
                vm, gpu, reason
            ),
        }
    }
}
