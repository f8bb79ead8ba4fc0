// VM side of passthrough
//
// Descriptor model, the mutations that add or remove a GPU, where
// descriptors live, and how VMs are started and stopped.

pub mod descriptor;
pub mod libvirt;
pub mod mutator;
pub mod runtime;
pub mod store;

pub use descriptor::{DeviceEntry, VmDescriptor};
pub use libvirt::LibvirtDescriptorStore;
pub use mutator::{attach_gpu, detach_gpu, MutatorSettings};
pub use runtime::{Virsh, VirshRuntime, VmRuntime};
pub use store::{DescriptorStore, JsonDescriptorStore, MemoryDescriptorStore};
