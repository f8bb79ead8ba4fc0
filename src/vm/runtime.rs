// VM runtime control
//
// The core never runs VMs itself; it only asks the runtime whether a VM is
// alive and requests start/stop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::system::Host;
use crate::error::{PassthroughError, Result};
use crate::utils::CommandOutput;

/// Start/stop/liveness of VMs
pub trait VmRuntime: Send + Sync {
    fn is_running(&self, vm: &str) -> Result<bool>;

    fn start(&self, vm: &str) -> Result<()>;

    /// Requests a stop; graceful unless `force`. Returns once the request is
    /// accepted, not once the VM is gone.
    fn stop(&self, vm: &str, force: bool) -> Result<()>;
}

/// `virsh` against one libvirt connection
#[derive(Clone)]
pub struct Virsh {
    host: Arc<dyn Host>,
    uri: String,
    timeout: Duration,
}

impl Virsh {
    pub fn new(host: Arc<dyn Host>, uri: impl Into<String>, timeout: Duration) -> Self {
        Self { host, uri: uri.into(), timeout }
    }

    /// Runs `virsh -c <uri> <args>`; `vm` is the domain the call is about,
    /// used to report `VmNotFound`
    pub fn run(&self, vm: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        let action = args.first().copied().unwrap_or_default();

        let output = self
            .host
            .run("virsh", &full, self.timeout)
            .map_err(|e| PassthroughError::Runtime {
                vm: vm.to_string(),
                reason: format!("virsh {} failed to run: {}", action, e),
            })?;

        if output.success() {
            return Ok(output);
        }
        let stderr = output.stderr.trim();
        if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
            return Err(PassthroughError::VmNotFound { vm: vm.to_string() });
        }
        Err(PassthroughError::Runtime {
            vm: vm.to_string(),
            reason: format!("virsh {} exited with {:?}: {}", action, output.code, stderr),
        })
    }
}

/// Drives libvirt through `virsh`
pub struct VirshRuntime {
    virsh: Virsh,
}

impl VirshRuntime {
    pub fn new(virsh: Virsh) -> Self {
        Self { virsh }
    }

    fn virsh(&self, action: &str, vm: &str) -> Result<CommandOutput> {
        self.virsh.run(vm, &[action, vm])
    }
}

impl VmRuntime for VirshRuntime {
    fn is_running(&self, vm: &str) -> Result<bool> {
        let output = self.virsh("domstate", vm)?;
        let state = output.stdout.trim();
        debug!(vm, state, "Domain state");
        Ok(!matches!(state, "shut off" | "crashed" | ""))
    }

    fn start(&self, vm: &str) -> Result<()> {
        info!(vm, "Starting VM");
        self.virsh("start", vm).map(|_| ())
    }

    fn stop(&self, vm: &str, force: bool) -> Result<()> {
        let action = if force { "destroy" } else { "shutdown" };
        info!(vm, action, "Stopping VM");
        self.virsh(action, vm).map(|_| ())
    }
}
