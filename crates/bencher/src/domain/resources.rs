//! Host topology and the cycler handing host cores or nodes out to VMs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use error_stack::Report;
use serde::Serialize;
use thiserror::Error;

use crate::config::FleetConfig;
use crate::config::VcpuBind;
use crate::error::FleetError;

const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";

/// Errors that can occur while reading the host NUMA topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Failed to read cpulist of node {node}: {source}")]
    Read {
        node: u32,
        #[source]
        source: io::Error,
    },
    #[error("Malformed cpulist `{0}`")]
    Malformed(String),
    #[error("Node {0} has no CPUs")]
    EmptyNode(u32),
}

/// Parses the kernel cpulist syntax, e.g. `0-3,8,10-11`.
pub fn parse_cpulist(list: &str) -> Result<Vec<u32>, TopologyError> {
    let malformed = || TopologyError::Malformed(list.to_string());
    let mut cpus = Vec::new();
    for range in list.trim().split(',').filter(|s| !s.is_empty()) {
        match range.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| malformed())?;
                let end: u32 = end.trim().parse().map_err(|_| malformed())?;
                if end < start {
                    return Err(malformed());
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(range.trim().parse().map_err(|_| malformed())?),
        }
    }
    Ok(cpus)
}

/// CPUs of every host NUMA node we care about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostTopology {
    nodes: BTreeMap<u32, Vec<u32>>,
}

impl HostTopology {
    pub fn from_nodes(nodes: impl IntoIterator<Item = (u32, Vec<u32>)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    /// Reads the cpulist of each requested node from sysfs.
    pub fn detect(nodes: &[u32]) -> Result<Self, TopologyError> {
        Self::detect_in(Path::new(SYSFS_NODE_DIR), nodes)
    }

    fn detect_in(root: &Path, nodes: &[u32]) -> Result<Self, TopologyError> {
        let mut topology = BTreeMap::new();
        for &node in nodes {
            let path = root.join(format!("node{node}")).join("cpulist");
            let list = fs::read_to_string(&path)
                .map_err(|source| TopologyError::Read { node, source })?;
            let cpus = parse_cpulist(&list)?;
            if cpus.is_empty() {
                return Err(TopologyError::EmptyNode(node));
            }
            topology.insert(node, cpus);
        }
        Ok(Self { nodes: topology })
    }

    pub fn node_to_cpus(&self, node: u32) -> Option<&[u32]> {
        self.nodes.get(&node).map(Vec::as_slice)
    }
}

/// Host resources bound to one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// One exclusive host core per vCPU, in vCPU order
    Cores(Vec<u32>),
    /// Every vCPU may run on any CPU of the node
    Node { node: u32, cpus: Vec<u32> },
}

/// Resources assigned to the VM with the given ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceAssignment {
    pub ordinal: usize,
    pub binding: Binding,
}

impl ResourceAssignment {
    /// Host CPU set of each guest vCPU.
    pub fn affinity(&self, ncpus: usize) -> Vec<Vec<u32>> {
        match &self.binding {
            Binding::Cores(cores) => cores.iter().map(|&core| vec![core]).collect(),
            Binding::Node { cpus, .. } => vec![cpus.clone(); ncpus],
        }
    }
}

/// Deterministic dispenser of host resources for one fleet.
///
/// Cores are issued in ascending order, node by node, and never twice. Nodes
/// are handed out round-robin and may be shared between VMs.
#[derive(Debug)]
pub struct HostCycler {
    topology: HostTopology,
    cores: Vec<u32>,
    next_core: usize,
    nodes: Vec<u32>,
    next_node: usize,
}

impl HostCycler {
    pub fn new(topology: HostTopology, vm_nodes: &[u32]) -> Result<Self, Report<FleetError>> {
        if vm_nodes.is_empty() {
            return Err(Report::new(FleetError::NoVmNodes));
        }
        let mut cores = Vec::new();
        for &node in vm_nodes {
            let cpus = topology
                .node_to_cpus(node)
                .ok_or_else(|| Report::new(FleetError::UnknownNode { node }))?;
            cores.extend_from_slice(cpus);
        }
        Ok(Self {
            topology,
            cores,
            next_core: 0,
            nodes: vm_nodes.to_vec(),
            next_node: 0,
        })
    }

    /// Cores that have not been issued yet.
    pub fn remaining_cores(&self) -> usize {
        self.cores.len() - self.next_core
    }

    /// Issues the next unused host core.
    pub fn next_core(&mut self) -> Result<u32, Report<FleetError>> {
        let core = self.cores.get(self.next_core).copied().ok_or_else(|| {
            Report::new(FleetError::ResourceExhausted {
                requested: 1,
                available: 0,
            })
        })?;
        self.next_core += 1;
        Ok(core)
    }

    /// Issues the next VM node, wrapping around.
    pub fn next_node(&mut self) -> u32 {
        let node = self.nodes[self.next_node % self.nodes.len()];
        self.next_node += 1;
        node
    }

    /// Fails up front when an exclusive binding cannot be satisfied.
    pub fn ensure_capacity(&self, config: &FleetConfig) -> Result<(), Report<FleetError>> {
        if config.bind == VcpuBind::Core {
            let available = self.remaining_cores();
            let requested = config.count.checked_mul(config.ncpus).unwrap_or(usize::MAX);
            if requested > available {
                return Err(Report::new(FleetError::ResourceExhausted {
                    requested,
                    available,
                }));
            }
        }
        Ok(())
    }

    /// Draws the resources of one VM.
    pub fn assign(
        &mut self,
        ordinal: usize,
        config: &FleetConfig,
    ) -> Result<ResourceAssignment, Report<FleetError>> {
        let binding = match config.bind {
            VcpuBind::Core => {
                if config.ncpus > self.remaining_cores() {
                    return Err(Report::new(FleetError::ResourceExhausted {
                        requested: config.ncpus,
                        available: self.remaining_cores(),
                    }));
                }
                let cores = (0..config.ncpus)
                    .map(|_| self.next_core())
                    .collect::<Result<Vec<_>, _>>()?;
                Binding::Cores(cores)
            }
            VcpuBind::Node => {
                let node = self.next_node();
                let cpus = self
                    .topology
                    .node_to_cpus(node)
                    .map(<[u32]>::to_vec)
                    .unwrap_or_default();
                Binding::Node { node, cpus }
            }
        };
        Ok(ResourceAssignment { ordinal, binding })
    }
}
