use std::path::PathBuf;

use clap::ValueEnum;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

use crate::config::host::NumaPlacement;
use crate::error::ConfigError;

/// How guest vCPUs are pinned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VcpuBind {
    /// Pin every vCPU to its own host core
    Core,
    /// Let every vCPU float over all cores of a host NUMA node
    Node,
}

/// Immutable description of the fleet to provision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetConfig {
    pub count: usize,
    pub ncpus: usize,
    /// Guest memory in bytes
    pub memory: u64,
    /// Share of guest memory initially backed by the fast tier
    pub dram_ratio: f64,
    pub memory_mode: bool,
    pub bind: VcpuBind,
    pub numa: NumaPlacement,
    /// Run directory receiving per-VM artifacts
    pub output_dir: PathBuf,
}

/// Guest addresses run from `192.168.122.166` to `.254`, one per VM.
pub const MAX_VM_COUNT: usize = 89;

impl FleetConfig {
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |message: &str| {
            Err(Report::new(ConfigError::InvalidFleet {
                message: message.to_string(),
            }))
        };
        if self.count == 0 {
            return invalid("VM count must be positive");
        }
        if self.count > MAX_VM_COUNT {
            return invalid("VM count exceeds the guest address range (at most 89)");
        }
        if self.ncpus == 0 {
            return invalid("vCPU count must be positive");
        }
        if self.memory == 0 {
            return invalid("memory must be positive");
        }
        if !(0.0..=1.0).contains(&self.dram_ratio) {
            return invalid("dram ratio must be within [0, 1]");
        }
        if self.numa.vm_nodes.is_empty() {
            return invalid("at least one VM NUMA node is required");
        }
        Ok(())
    }
}
