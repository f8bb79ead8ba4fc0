// Lifecycle state of a VM with respect to GPU passthrough
//
// States are not persisted; a VM with no recorded in-flight state has its
// state recomputed from its descriptor and the runtime.

use std::fmt;

use serde::Serialize;

use crate::error::PassthroughWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    StoppedNoPassthrough,
    StoppedPassthroughConfigured,
    /// GPU being moved to vfio-pci before the VM starts
    Starting,
    /// Running without a passed-through GPU
    Running,
    RunningGpuAttached,
    /// Stop issued, watcher waiting for the VM to terminate
    StopRequested,
    /// VM gone, GPU being returned to the host
    Restoring,
}

impl LifecycleState {
    /// States that only exist while an operation or watcher is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::StopRequested | LifecycleState::Restoring
        )
    }

    /// Settled state derived from what the descriptor and runtime say
    pub fn settled(has_passthrough: bool, running: bool) -> Self {
        match (has_passthrough, running) {
            (false, false) => LifecycleState::StoppedNoPassthrough,
            (true, false) => LifecycleState::StoppedPassthroughConfigured,
            (false, true) => LifecycleState::Running,
            (true, true) => LifecycleState::RunningGpuAttached,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LifecycleState::StoppedNoPassthrough => "Stopped/NoPassthrough",
            LifecycleState::StoppedPassthroughConfigured => "Stopped/PassthroughConfigured",
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::RunningGpuAttached => "Running/GPUAttached",
            LifecycleState::StopRequested => "StopRequested",
            LifecycleState::Restoring => "Restoring",
        };
        f.write_str(name)
    }
}

/// Outcome of a lifecycle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub vm: String,
    pub state: LifecycleState,
    pub warnings: Vec<PassthroughWarning>,
}

impl Transition {
    pub fn new(vm: impl Into<String>, state: LifecycleState) -> Self {
        Self { vm: vm.into(), state, warnings: Vec::new() }
    }

    pub fn with_warning(mut self, warning: PassthroughWarning) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Published for every finished operation, synchronous or watcher-driven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Transitioned(Transition),
    Failed { vm: String, error: String },
}

impl LifecycleEvent {
    pub fn vm(&self) -> &str {
        match self {
            LifecycleEvent::Transitioned(t) => &t.vm,
            LifecycleEvent::Failed { vm, .. } => vm,
        }
    }
}
