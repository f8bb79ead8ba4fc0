// Core of the passthrough lifecycle manager

pub mod lifecycle;
pub mod state;
pub mod system;
pub mod vfio;
