use std::path::PathBuf;

use serde::Serialize;

use crate::config::FleetConfig;
use crate::config::HostLayout;
use crate::config::DEFAULT_CMDLINE;
use crate::domain::resources::ResourceAssignment;

pub const API_SOCKET: &str = "cloud-hypervisor.socket";
pub const VIRTIOFSD_SOCKET: &str = "virtiofsd.socket";
pub const VIRTIOFSD_OUTPUT_SOCKET: &str = "virtiofsd-output.socket";

/// Everything needed to launch one VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmSpec {
    pub id: usize,
    pub ncpus: usize,
    pub memory: u64,
    pub dram_ratio: f64,
    pub memory_mode: bool,
    pub assignment: ResourceAssignment,
    pub dram_node: u32,
    pub pmem_node: u32,
    /// Per-VM artifact directory, shared into the guest as `Output`
    pub output_dir: PathBuf,
}

impl VmSpec {
    pub fn new(config: &FleetConfig, assignment: ResourceAssignment) -> Self {
        let id = assignment.ordinal;
        Self {
            id,
            ncpus: config.ncpus,
            memory: config.memory,
            dram_ratio: config.dram_ratio,
            memory_mode: config.memory_mode,
            assignment,
            dram_node: config.numa.dram_node,
            pmem_node: config.numa.pmem_node,
            output_dir: config.output_dir.join(format!("vm{id}")),
        }
    }

    pub fn name(&self) -> String {
        format!("vm{}", self.id)
    }

    pub fn ip(&self) -> String {
        format!("192.168.122.{}", self.id + 166)
    }

    pub fn mac(&self) -> String {
        format!("2e:89:a8:e4:b9:{:02x}", self.id + 0x48)
    }

    pub fn tap(&self) -> String {
        format!("ich{}", self.id)
    }

    /// Bytes initially backed by the fast tier.
    pub fn dram(&self) -> u64 {
        (self.memory as f64 * self.dram_ratio) as u64
    }

    pub fn pmem(&self) -> u64 {
        self.memory - self.dram()
    }

    /// Host node backing the slow zone; memory mode keeps everything in DRAM.
    pub fn slow_node(&self) -> u32 {
        if self.memory_mode {
            self.dram_node
        } else {
            self.pmem_node
        }
    }

    /// cloud-hypervisor `affinity=[...]` value, e.g. `0@[8],1@[9]`.
    pub fn affinity_arg(&self) -> String {
        self.assignment
            .affinity(self.ncpus)
            .iter()
            .enumerate()
            .map(|(vcpu, cpus)| {
                let cpus = cpus
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{vcpu}@[{cpus}]")
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn virtiofsd_args(&self, layout: &HostLayout) -> Vec<String> {
        vec![
            layout.virtiofsd.display().to_string(),
            "--cache=never".to_string(),
            format!("--socket-path={VIRTIOFSD_SOCKET}"),
            format!("--shared-dir={}", layout.shared_dir.display()),
        ]
    }

    pub fn virtiofsd_output_args(&self, layout: &HostLayout) -> Vec<String> {
        vec![
            layout.virtiofsd.display().to_string(),
            "--cache=never".to_string(),
            format!("--socket-path={VIRTIOFSD_OUTPUT_SOCKET}"),
            format!("--shared-dir={}", self.output_dir.display()),
        ]
    }

    pub fn cloud_hypervisor_args(&self, layout: &HostLayout) -> Vec<String> {
        vec![
            layout.cloud_hypervisor.display().to_string(),
            "--api-socket".to_string(),
            format!("path={API_SOCKET}"),
            "--kernel".to_string(),
            layout.kernel.display().to_string(),
            "--cmdline".to_string(),
            DEFAULT_CMDLINE.join(" "),
            "--fs".to_string(),
            format!("tag=Projects,socket={VIRTIOFSD_SOCKET}"),
            format!("tag=Output,socket={VIRTIOFSD_OUTPUT_SOCKET}"),
            "--disk".to_string(),
            format!("path={}", layout.image.display()),
            "--cpus".to_string(),
            format!("boot={},affinity=[{}]", self.ncpus, self.affinity_arg()),
            "--net".to_string(),
            format!("tap={},mac={}", self.tap(), self.mac()),
            "--balloon".to_string(),
            format!(
                "size=[{},{}],statistics=on,heterogeneous_memory=on",
                self.pmem(),
                self.dram()
            ),
            "--memory".to_string(),
            "size=0,shared=on".to_string(),
            "--memory-zone".to_string(),
            format!(
                "size={},shared=on,host_numa_node={},id=fast",
                self.memory, self.dram_node
            ),
            format!(
                "size={},shared=on,host_numa_node={},id=slow",
                self.memory,
                self.slow_node()
            ),
            "--numa".to_string(),
            format!(
                "guest_numa_id=0,cpus=0-{},memory_zones=fast",
                self.ncpus - 1
            ),
            "guest_numa_id=1,memory_zones=slow".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::HostArgs;
    use crate::domain::mock::fleet_config;
    use crate::domain::resources::Binding;

    fn spec(memory_mode: bool) -> VmSpec {
        let config = FleetConfig {
            memory_mode,
            ..fleet_config(1)
        };
        VmSpec::new(
            &config,
            ResourceAssignment {
                ordinal: 2,
                binding: Binding::Cores(vec![10, 11]),
            },
        )
    }

    fn layout() -> HostLayout {
        HostLayout::from_args(&HostArgs {
            project_dir: Some(PathBuf::from("/p")),
            kernel: PathBuf::from("vmlinux.bin"),
            image: PathBuf::from("clr.img"),
            ..Default::default()
        })
        .expect("layout")
    }

    #[test]
    fn addresses_derive_from_id() {
        let spec = spec(false);
        assert_eq!(spec.name(), "vm2");
        assert_eq!(spec.ip(), "192.168.122.168");
        assert_eq!(spec.mac(), "2e:89:a8:e4:b9:4a");
        assert_eq!(spec.tap(), "ich2");
        assert_eq!(spec.output_dir, PathBuf::from("/tmp/bencher-test/vm2"));
    }

    #[test]
    fn memory_split_follows_dram_ratio() {
        let spec = spec(false);
        let dram = ((8u64 << 30) as f64 * 0.2) as u64;
        assert_eq!(spec.dram(), dram);
        assert_eq!(spec.pmem(), (8u64 << 30) - dram);
        assert_eq!(spec.dram() + spec.pmem(), spec.memory);
    }

    #[test]
    fn memory_mode_moves_slow_zone_to_dram() {
        assert_eq!(spec(false).slow_node(), 2);
        assert_eq!(spec(true).slow_node(), 1);
    }

    #[test]
    fn affinity_pins_each_vcpu() {
        assert_eq!(spec(false).affinity_arg(), "0@[10],1@[11]");
    }

    #[test]
    fn cloud_hypervisor_args_carry_topology() {
        let args = spec(false).cloud_hypervisor_args(&layout());
        assert_eq!(
            args[0],
            "/p/../cloud-hypervisor/target/release/cloud-hypervisor"
        );
        assert!(args.contains(&"boot=2,affinity=[0@[10],1@[11]]".to_string()));
        assert!(args.contains(&"tap=ich2,mac=2e:89:a8:e4:b9:4a".to_string()));
        assert!(args.contains(&"guest_numa_id=0,cpus=0-1,memory_zones=fast".to_string()));
        assert!(args
            .iter()
            .any(|arg| arg.ends_with("host_numa_node=2,id=slow")));
    }

    #[test]
    fn output_share_points_at_vm_directory() {
        let args = spec(false).virtiofsd_output_args(&layout());
        assert_eq!(
            args.last().map(String::as_str),
            Some("--shared-dir=/tmp/bencher-test/vm2")
        );
    }
}
