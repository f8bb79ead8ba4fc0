// Lifecycle orchestrator
//
// Ties GPU ownership to VM run state: the GPU is put on vfio-pci before a
// VM with passthrough starts, and handed back to the host once a stop
// watcher has seen the VM terminate. Every outcome, synchronous or from
// the watcher, goes through `Shared::complete`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::core::state::{LifecycleEvent, LifecycleState, Transition};
use crate::core::vfio::{BindingEngine, GpuLockTable};
use crate::error::{PassthroughError, PassthroughWarning, Result};
use crate::gpu::eligibility;
use crate::gpu::{Gpu, Topology};
use crate::vm::descriptor::VmDescriptor;
use crate::vm::mutator::{self, MutatorSettings};
use crate::vm::runtime::VmRuntime;
use crate::vm::store::DescriptorStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared with stop watchers
struct Shared {
    /// In-flight states only; settled states are recomputed
    states: Mutex<HashMap<String, LifecycleState>>,
    /// GPU configured for each VM by this process
    attached: Mutex<HashMap<String, Gpu>>,
    /// VMs with a synchronous operation running
    busy: Mutex<HashSet<String>>,
    events: Mutex<Sender<LifecycleEvent>>,
}

impl Shared {
    fn set_state(&self, vm: &str, state: LifecycleState) {
        debug!(vm, %state, "Lifecycle state");
        lock(&self.states).insert(vm.to_string(), state);
    }

    fn recorded(&self, vm: &str) -> Option<LifecycleState> {
        lock(&self.states).get(vm).copied()
    }

    fn publish(&self, event: LifecycleEvent) {
        // nobody listening is fine
        let _ = lock(&self.events).send(event);
    }

    /// Reports an operation refused before it touched anything
    fn reject(&self, vm: &str, error: PassthroughError) -> Result<Transition> {
        warn!(vm, error = %error, "Lifecycle operation rejected");
        self.publish(LifecycleEvent::Failed { vm: vm.to_string(), error: error.to_string() });
        Err(error)
    }

    /// Records the outcome, releases the VM, publishes the outcome and
    /// hands it back
    fn complete(&self, vm: &str, result: Result<Transition>) -> Result<Transition> {
        let event = match &result {
            Ok(transition) => {
                if transition.state.is_transient() {
                    self.set_state(vm, transition.state);
                } else {
                    lock(&self.states).remove(vm);
                }
                for warning in &transition.warnings {
                    warn!(vm, %warning, "Lifecycle warning");
                }
                info!(vm, state = %transition.state, "Lifecycle transition");
                LifecycleEvent::Transitioned(transition.clone())
            }
            Err(e) => {
                lock(&self.states).remove(vm);
                error!(vm, error = %e, "Lifecycle operation failed");
                LifecycleEvent::Failed { vm: vm.to_string(), error: e.to_string() }
            }
        };
        lock(&self.busy).remove(vm);
        self.publish(event);
        result
    }
}

struct Watcher {
    handle: JoinHandle<Result<Transition>>,
    cancel: Arc<AtomicBool>,
}

/// Everything a stop watcher needs, moved onto its thread
struct StopWatch {
    vm: String,
    gpu: Gpu,
    engine: Arc<BindingEngine>,
    runtime: Arc<dyn VmRuntime>,
    locks: GpuLockTable,
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
    ceiling: Duration,
}

impl StopWatch {
    fn run(self) -> Result<Transition> {
        let result = self.watch();
        self.shared.complete(&self.vm, result)
    }

    fn watch(&self) -> Result<Transition> {
        let vm = self.vm.as_str();
        let gpu = self.gpu.address().to_string();
        let deadline = Instant::now() + self.ceiling;
        info!(vm, ceiling = ?self.ceiling, "Waiting for VM to stop");

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                info!(vm, "Stop watcher cancelled, GPU left as is");
                return Err(PassthroughError::Runtime {
                    vm: vm.to_string(),
                    reason: "stop watcher cancelled".to_string(),
                });
            }
            match self.runtime.is_running(vm) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => warn!(vm, error = %e, "Could not query VM state"),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(vm, gpu = %gpu, "VM did not stop in time, GPU stays on vfio-pci");
                return Ok(Transition::new(vm, LifecycleState::StoppedPassthroughConfigured)
                    .with_warning(PassthroughWarning::RestoreTimedOut { vm: vm.to_string(), gpu }));
            }
            thread::sleep(self.poll_interval.min(remaining));
        }

        info!(vm, gpu = %gpu, "VM stopped, returning GPU to host");
        self.shared.set_state(vm, LifecycleState::Restoring);
        let stopped = Transition::new(vm, LifecycleState::StoppedPassthroughConfigured);

        let restored = self
            .locks
            .acquire(&self.gpu)
            .and_then(|lease| self.engine.bind_to_host(&lease, &self.gpu, None));
        match restored {
            Ok(report) => {
                debug!(vm, steps = report.steps.len(), "Restore finished");
                Ok(stopped)
            }
            Err(e) => Ok(stopped.with_warning(PassthroughWarning::RestoreFailed {
                vm: vm.to_string(),
                gpu,
                reason: e.to_string(),
            })),
        }
    }
}

/// Per-VM passthrough state machine
pub struct Orchestrator {
    engine: Arc<BindingEngine>,
    runtime: Arc<dyn VmRuntime>,
    store: Arc<dyn DescriptorStore>,
    locks: GpuLockTable,
    shared: Arc<Shared>,
    watchers: Mutex<HashMap<String, Watcher>>,
    events: Mutex<Option<Receiver<LifecycleEvent>>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<BindingEngine>, runtime: Arc<dyn VmRuntime>, store: Arc<dyn DescriptorStore>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            engine,
            runtime,
            store,
            locks: GpuLockTable::new(),
            shared: Arc::new(Shared {
                states: Mutex::new(HashMap::new()),
                attached: Mutex::new(HashMap::new()),
                busy: Mutex::new(HashSet::new()),
                events: Mutex::new(tx),
            }),
            watchers: Mutex::new(HashMap::new()),
            events: Mutex::new(Some(rx)),
        }
    }

    /// The event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<Receiver<LifecycleEvent>> {
        lock(&self.events).take()
    }

    pub fn engine(&self) -> &BindingEngine {
        &self.engine
    }

    /// Scans the host; an internally inconsistent scan is an error here
    pub fn scan(&self) -> Result<Topology> {
        let topology = self.engine.scan();
        topology.validate()?;
        Ok(topology)
    }

    pub fn eligible_gpus(&self, gpus: &[Gpu]) -> Vec<Gpu> {
        eligibility::eligible_gpus(gpus)
    }

    /// GPU this process configured for `vm`, if any
    pub fn attached_gpu(&self, vm: &str) -> Option<Gpu> {
        lock(&self.shared.attached).get(vm).cloned()
    }

    /// Current state: the in-flight state if one is recorded, otherwise
    /// derived from the descriptor and the runtime
    pub fn state(&self, vm: &str) -> Result<LifecycleState> {
        if let Some(state) = self.shared.recorded(vm) {
            return Ok(state);
        }
        let descriptor = self.store.load(vm)?;
        let running = self.runtime.is_running(vm)?;
        Ok(LifecycleState::settled(descriptor.has_passthrough(), running))
    }

    /// Binds `gpu` to vfio-pci and commits a descriptor that passes it
    /// through. The VM must be stopped. On failure the descriptor is
    /// untouched and the GPU is back where it was.
    pub fn enable_passthrough(&self, vm: &str, gpu: &Gpu) -> Result<Transition> {
        self.exclusive(vm, || self.enable(vm, gpu))
    }

    /// Commits a descriptor without `gpu` and returns the GPU to the host.
    /// The VM must be stopped.
    pub fn disable_passthrough(&self, vm: &str, gpu: &Gpu) -> Result<Transition> {
        self.exclusive(vm, || self.disable(vm, gpu))
    }

    /// Makes sure a passthrough GPU is on vfio-pci, then starts the VM
    pub fn on_vm_start(&self, vm: &str) -> Result<Transition> {
        self.exclusive(vm, || self.start(vm))
    }

    /// Issues the stop and, for a VM with passthrough, spawns the watcher
    /// that restores the GPU once the VM is gone
    pub fn on_vm_stop(&self, vm: &str, force: bool) -> Result<Transition> {
        if let Err(e) = self.begin(vm) {
            return self.shared.reject(vm, e);
        }
        match self.request_stop(vm, force) {
            Ok(Some(gpu)) => {
                let transition = self
                    .shared
                    .complete(vm, Ok(Transition::new(vm, LifecycleState::StopRequested)))?;
                if let Err(e) = self.spawn_watcher(vm, gpu) {
                    return self.shared.complete(vm, Err(e));
                }
                Ok(transition)
            }
            Ok(None) => self
                .shared
                .complete(vm, Ok(Transition::new(vm, LifecycleState::StoppedNoPassthrough))),
            Err(e) => self.shared.complete(vm, Err(e)),
        }
    }

    /// Asks the VM's watcher to give up; true if one was running
    pub fn cancel_watcher(&self, vm: &str) -> bool {
        match lock(&self.watchers).get(vm) {
            Some(watcher) if !watcher.handle.is_finished() => {
                watcher.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Blocks until the VM's watcher finishes and returns its outcome
    pub fn wait_watcher(&self, vm: &str) -> Option<Result<Transition>> {
        let watcher = lock(&self.watchers).remove(vm)?;
        Some(watcher.handle.join().unwrap_or_else(|_| {
            Err(PassthroughError::Runtime {
                vm: vm.to_string(),
                reason: "stop watcher panicked".to_string(),
            })
        }))
    }

    fn settings(&self) -> MutatorSettings {
        MutatorSettings::from(self.engine.config())
    }

    /// Claims `vm` for one operation; fails while another operation or a
    /// stop watcher owns it. `Shared::complete` releases the claim.
    fn begin(&self, vm: &str) -> Result<()> {
        let mut busy = lock(&self.shared.busy);
        let watching = lock(&self.watchers)
            .get(vm)
            .is_some_and(|w| !w.handle.is_finished());
        let in_flight = self.shared.recorded(vm).is_some_and(|s| s.is_transient());
        if watching || in_flight || !busy.insert(vm.to_string()) {
            return Err(PassthroughError::AlreadyInProgress { key: vm.to_string() });
        }
        Ok(())
    }

    fn exclusive(&self, vm: &str, op: impl FnOnce() -> Result<Transition>) -> Result<Transition> {
        if let Err(e) = self.begin(vm) {
            return self.shared.reject(vm, e);
        }
        let result = op();
        self.shared.complete(vm, result)
    }

    fn ensure_stopped(&self, vm: &str) -> Result<()> {
        if self.runtime.is_running(vm)? {
            return Err(PassthroughError::VmRunning { vm: vm.to_string() });
        }
        Ok(())
    }

    fn enable(&self, vm: &str, gpu: &Gpu) -> Result<Transition> {
        if !gpu.can_passthrough {
            return Err(PassthroughError::NoEligibleGpu {
                address: gpu.address().to_string(),
                reason: "GPU drives the host display, is the only GPU, or IOMMU is off".to_string(),
            });
        }
        self.ensure_stopped(vm)?;

        let descriptor = self.store.load(vm)?;
        let staged = mutator::attach_gpu(&descriptor, gpu, &self.settings())?;

        let lease = self.locks.acquire(gpu)?;
        let bound_here = !self.engine.is_bound_to_vfio(gpu);
        if bound_here {
            self.engine.bind_to_vfio(&lease, gpu)?;
        } else {
            debug!(vm, gpu = %gpu.address(), "GPU already on vfio-pci");
        }

        if let Err(e) = self.store.replace(&staged) {
            if bound_here {
                warn!(vm, error = %e, "Descriptor commit failed, returning GPU to host");
                if let Err(restore) = self.engine.bind_to_host(&lease, gpu, None) {
                    error!(vm, error = %restore, "Could not return GPU to host");
                }
            }
            return Err(PassthroughError::DescriptorMutationFailed { vm: vm.to_string(), reason: e.to_string() });
        }

        lock(&self.shared.attached).insert(vm.to_string(), gpu.clone());
        info!(vm, gpu = %gpu.full_name(), address = %gpu.address(), "Passthrough enabled");
        Ok(Transition::new(vm, LifecycleState::StoppedPassthroughConfigured))
    }

    fn disable(&self, vm: &str, gpu: &Gpu) -> Result<Transition> {
        self.ensure_stopped(vm)?;

        let descriptor = self.store.load(vm)?;
        let staged = mutator::detach_gpu(&descriptor, gpu, &self.settings())?;

        {
            let lease = self.locks.acquire(gpu)?;
            self.engine.bind_to_host(&lease, gpu, None)?;
        }
        self.store.replace(&staged).map_err(|e| PassthroughError::DescriptorMutationFailed {
            vm: vm.to_string(),
            reason: e.to_string(),
        })?;

        lock(&self.shared.attached).remove(vm);
        info!(vm, address = %gpu.address(), "Passthrough disabled");
        Ok(Transition::new(vm, LifecycleState::settled(staged.has_passthrough(), false)))
    }

    fn start(&self, vm: &str) -> Result<Transition> {
        self.ensure_stopped(vm)?;

        let descriptor = self.store.load(vm)?;
        if !descriptor.has_passthrough() {
            self.runtime.start(vm)?;
            return Ok(Transition::new(vm, LifecycleState::Running));
        }

        self.shared.set_state(vm, LifecycleState::Starting);
        let gpu = self.resolve_gpu(vm, &descriptor)?;
        {
            let lease = self.locks.acquire(&gpu)?;
            if self.engine.is_bound_to_vfio(&gpu) {
                debug!(vm, gpu = %gpu.address(), "GPU still on vfio-pci");
            } else {
                info!(vm, gpu = %gpu.address(), "GPU not on vfio-pci, binding before start");
                self.engine.bind_to_vfio(&lease, &gpu)?;
            }
        }

        self.runtime.start(vm)?;
        lock(&self.shared.attached).insert(vm.to_string(), gpu);
        Ok(Transition::new(vm, LifecycleState::RunningGpuAttached))
    }

    /// Issues the stop; returns the GPU to restore when there is one
    fn request_stop(&self, vm: &str, force: bool) -> Result<Option<Gpu>> {
        let descriptor = self.store.load(vm)?;
        let running = self.runtime.is_running(vm)?;
        let gpu = if descriptor.has_passthrough() {
            Some(self.resolve_gpu(vm, &descriptor)?)
        } else {
            None
        };

        if running {
            self.runtime.stop(vm, force)?;
        } else {
            debug!(vm, "VM already stopped");
        }
        Ok(gpu)
    }

    /// The GPU recorded for `vm`, or the scanned GPU whose address the
    /// descriptor passes through
    fn resolve_gpu(&self, vm: &str, descriptor: &VmDescriptor) -> Result<Gpu> {
        let sources = descriptor.hostdev_sources();
        if let Some(gpu) = self.attached_gpu(vm) {
            if sources.contains(&gpu.address()) {
                return Ok(gpu);
            }
        }

        let topology = self.scan()?;
        topology
            .gpus
            .iter()
            .find(|g| sources.contains(&g.address()))
            .cloned()
            .ok_or_else(|| PassthroughError::NoEligibleGpu {
                address: sources.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "),
                reason: format!("no scanned GPU matches the passthrough entries of VM '{}'", vm),
            })
    }

    fn spawn_watcher(&self, vm: &str, gpu: Gpu) -> Result<()> {
        let config = self.engine.config();
        let cancel = Arc::new(AtomicBool::new(false));
        let watch = StopWatch {
            vm: vm.to_string(),
            gpu,
            engine: Arc::clone(&self.engine),
            runtime: Arc::clone(&self.runtime),
            locks: self.locks.clone(),
            shared: Arc::clone(&self.shared),
            cancel: Arc::clone(&cancel),
            poll_interval: config.watcher_poll_interval(),
            ceiling: config.watcher_ceiling(),
        };

        let handle = thread::Builder::new()
            .name(format!("stop-watcher-{}", vm))
            .spawn(move || watch.run())
            .map_err(|e| PassthroughError::Runtime {
                vm: vm.to_string(),
                reason: format!("could not spawn stop watcher: {}", e),
            })?;
        lock(&self.watchers).insert(vm.to_string(), Watcher { handle, cancel });
        Ok(())
    }
}
