use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use vfio_passthrough::core::lifecycle::Orchestrator;
use vfio_passthrough::core::system::{Host, LinuxHost};
use vfio_passthrough::core::vfio::BindingEngine;
use vfio_passthrough::gpu::{Gpu, PciAddress, Topology};
use vfio_passthrough::utils::logging;
use vfio_passthrough::config::DescriptorBackend;
use vfio_passthrough::vm::{DescriptorStore, JsonDescriptorStore, LibvirtDescriptorStore, Virsh, VirshRuntime};
use vfio_passthrough::{PassthroughConfig, PassthroughError, Result};

#[derive(Parser)]
#[command(name = "vfio-passthrough", version, about = "GPU passthrough lifecycle manager")]
struct Cli {
    /// Config file (defaults to $VFIO_PASSTHROUGH_CONFIG or ~/.config/vfio-passthrough/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan PCI topology and list GPUs
    Scan {
        #[arg(long)]
        json: bool,
    },
    /// List GPUs that can be passed through
    Eligible,
    /// Bind a GPU to vfio-pci and add it to a stopped VM
    Enable { vm: String, gpu: String },
    /// Remove a GPU from a stopped VM and return it to the host
    Disable { vm: String, gpu: String },
    /// Start a VM, binding its GPU first when needed
    Start { vm: String },
    /// Stop a VM and return its GPU once it is down
    Stop {
        vm: String,
        /// Power off instead of a guest shutdown
        #[arg(long)]
        force: bool,
        /// Exit once the stop is issued; the GPU stays on vfio-pci
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the lifecycle state of a VM
    Status { vm: String },
    /// Print a VM's devices as libvirt XML
    Show { vm: String },
    /// Copy a libvirt domain's devices into the JSON descriptor store
    Import { vm: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = PassthroughConfig::load(cli.config.as_deref())?;

    let host: Arc<dyn Host> = Arc::new(LinuxHost);
    let virsh = Virsh::new(Arc::clone(&host), config.libvirt_uri.clone(), config.command_timeout());
    let runtime = Arc::new(VirshRuntime::new(virsh.clone()));
    let libvirt = Arc::new(LibvirtDescriptorStore::new(virsh, config.descriptor_dir.clone()));
    let json = Arc::new(JsonDescriptorStore::new(config.descriptor_dir.clone()));
    let store: Arc<dyn DescriptorStore> = match config.descriptor_backend {
        DescriptorBackend::Libvirt => libvirt.clone(),
        DescriptorBackend::Json => json.clone(),
    };
    let engine = Arc::new(BindingEngine::new(host, config));
    let orchestrator = Orchestrator::new(engine, runtime, Arc::clone(&store));

    match cli.command {
        Command::Scan { json } => {
            let topology = orchestrator.scan()?;
            if json {
                let out = serde_json::to_string_pretty(&topology).map_err(|e| PassthroughError::Io {
                    path: PathBuf::from("<stdout>"),
                    source: e.into(),
                })?;
                println!("{}", out);
            } else {
                print_topology(&topology);
            }
        }
        Command::Eligible => {
            let topology = orchestrator.scan()?;
            let eligible = orchestrator.eligible_gpus(&topology.gpus);
            if eligible.is_empty() {
                println!("No GPU can be passed through");
            }
            for gpu in &eligible {
                println!("{}  {}", gpu.address(), gpu.full_name());
            }
        }
        Command::Enable { vm, gpu } => {
            let gpu = find_gpu(&orchestrator, &gpu)?;
            let t = orchestrator.enable_passthrough(&vm, &gpu)?;
            println!("{}: {}", t.vm, t.state);
        }
        Command::Disable { vm, gpu } => {
            let gpu = find_gpu(&orchestrator, &gpu)?;
            let t = orchestrator.disable_passthrough(&vm, &gpu)?;
            println!("{}: {}", t.vm, t.state);
        }
        Command::Start { vm } => {
            let t = orchestrator.on_vm_start(&vm)?;
            println!("{}: {}", t.vm, t.state);
        }
        Command::Stop { vm, force, no_wait } => {
            let t = orchestrator.on_vm_stop(&vm, force)?;
            println!("{}: {}", t.vm, t.state);
            if no_wait {
                if orchestrator.cancel_watcher(&vm) {
                    println!("Not waiting; the GPU stays on vfio-pci until the next start or disable");
                }
            } else if let Some(outcome) = orchestrator.wait_watcher(&vm) {
                let done = outcome?;
                println!("{}: {}", done.vm, done.state);
                for warning in &done.warnings {
                    println!("  warning: {}", warning);
                }
            }
        }
        Command::Status { vm } => {
            let state = orchestrator.state(&vm)?;
            let descriptor = store.load(&vm)?;
            println!("{}: {}", vm, state);
            for source in descriptor.hostdev_sources() {
                println!("  passthrough {}", source);
            }
        }
        Command::Show { vm } => {
            let descriptor = store.load(&vm)?;
            println!("{}", descriptor.devices_xml());
        }
        Command::Import { vm } => {
            let descriptor = libvirt.load(&vm)?;
            json.create(&descriptor)?;
            println!("{}: imported {} devices", vm, descriptor.devices.len());
        }
    }
    Ok(())
}

/// Accepts `dddd:bb:ss.f` or the short `bb:ss.f` form
fn parse_address(value: &str) -> Result<PciAddress> {
    match value.parse() {
        Ok(address) => Ok(address),
        Err(e) if value.matches(':').count() == 1 => format!("0000:{}", value).parse().map_err(|_| e),
        Err(e) => Err(e),
    }
}

fn find_gpu(orchestrator: &Orchestrator, value: &str) -> Result<Gpu> {
    let address = parse_address(value)?;
    let topology = orchestrator.scan()?;
    topology
        .gpu_by_address(&address)
        .cloned()
        .ok_or_else(|| PassthroughError::NoEligibleGpu {
            address: address.to_string(),
            reason: "no GPU at this address".to_string(),
        })
}

fn print_topology(topology: &Topology) {
    println!("VFIO Passthrough (v{})", vfio_passthrough::VERSION);
    println!("===========================\n");
    println!("IOMMU: {}", if topology.iommu_enabled { "enabled" } else { "disabled" });

    if topology.gpus.is_empty() {
        println!("No GPUs detected!");
        return;
    }

    println!("Found {} GPU(s):", topology.gpus.len());
    for (i, gpu) in topology.gpus.iter().enumerate() {
        println!("\nGPU {}: {}", i + 1, gpu.full_name());
        println!("  Address: {}", gpu.address());
        println!("  Vendor ID: {}", gpu.primary.vendor_id);
        println!("  Device ID: {}", gpu.primary.device_id);
        println!("  Driver: {}", gpu.primary.driver.as_deref().unwrap_or("None"));
        println!(
            "  IOMMU group: {}",
            gpu.iommu_group().map(|g| g.to_string()).unwrap_or_else(|| "None".to_string())
        );
        println!("  Host display: {}", if gpu.is_primary { "Yes" } else { "No" });
        println!("  Passthrough: {}", if gpu.can_passthrough { "Eligible" } else { "Not eligible" });
        for device in &gpu.related {
            println!(
                "    + {} {} ({})",
                device.address,
                device.device_name,
                device.driver.as_deref().unwrap_or("no driver")
            );
        }
    }

    for warning in &topology.warnings {
        println!("\nWarning: {}", warning);
    }
}
