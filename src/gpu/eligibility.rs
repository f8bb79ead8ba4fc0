// Passthrough eligibility analysis
//
// Decides, once per scan, which GPUs can be handed to a guest without
// taking the host's display away.

use tracing::{info, warn};

use crate::error::PassthroughWarning;
use crate::gpu::Gpu;

/// Outcome of one analysis pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub eligible: usize,
    pub warnings: Vec<PassthroughWarning>,
}

/// Sets `can_passthrough` on every GPU.
///
/// - IOMMU off: nothing is eligible.
/// - A single GPU is never eligible, whatever its primary flag says.
/// - Otherwise every non-primary GPU is eligible; if all of them look
///   primary nothing is, and a risky-configuration warning is returned.
pub fn analyze(iommu_enabled: bool, gpus: &mut [Gpu]) -> Analysis {
    for gpu in gpus.iter_mut() {
        gpu.can_passthrough = false;
    }

    if !iommu_enabled {
        warn!("No GPU can be passed through - IOMMU disabled");
        return Analysis::default();
    }

    if gpus.len() == 1 {
        warn!(gpu = %gpus[0].full_name(), "Only 1 GPU detected - passthrough disabled to protect host display");
        return Analysis::default();
    }

    if !gpus.is_empty() && gpus.iter().all(|g| g.is_primary) {
        warn!(count = gpus.len(), "All GPUs detected as primary - passthrough risky");
        return Analysis {
            eligible: 0,
            warnings: vec![PassthroughWarning::RiskyConfiguration { gpu_count: gpus.len() }],
        };
    }

    let mut eligible = 0;
    for gpu in gpus.iter_mut().filter(|g| !g.is_primary) {
        gpu.can_passthrough = true;
        eligible += 1;
        info!(gpu = %gpu.full_name(), address = %gpu.address(), "GPU marked for passthrough");
    }

    Analysis { eligible, warnings: Vec::new() }
}

/// Copies of the GPUs marked eligible
pub fn eligible_gpus(gpus: &[Gpu]) -> Vec<Gpu> {
    gpus.iter().filter(|g| g.can_passthrough).cloned().collect()
}
