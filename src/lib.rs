// VFIO passthrough lifecycle manager
//
// Discovers GPUs and their IOMMU groups, moves them between host drivers
// and vfio-pci, and rewrites VM descriptors so a guest owns a GPU while it
// runs and the host gets it back afterwards.

// Host surface, binding engine and lifecycle orchestration
pub mod core;

// GPU model, detection and eligibility
pub mod gpu;

// VM descriptors, stores and runtime control
pub mod vm;

pub mod config;
pub mod error;

// Utility functions
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::PassthroughConfig;
pub use crate::core::lifecycle::Orchestrator;
pub use crate::error::{PassthroughError, PassthroughWarning, Result};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
