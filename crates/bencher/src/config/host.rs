use std::env;
use std::path::PathBuf;

use clap::Args;
use error_stack::Report;
use serde::Serialize;

use crate::error::ConfigError;

/// Kernel command line handed to every guest.
pub const DEFAULT_CMDLINE: &[&str] = &[
    "psi=1",
    "root=/dev/vda2",
    "rw",
    "rootfstype=ext4,btrfs,xfs,f2fs",
    "console=hvc0",
    "console=ttyS0,115200n8",
    "console=tty0",
    "module.sig_enforce=0",
    "mitigations=off",
    "cryptomgr.notests",
    "quiet",
    "init=/usr/lib/systemd/systemd-bootchart",
    "no_timer_check",
    "tsc=reliable",
    "noreplace-smp",
    "page_alloc.shuffle=1",
];

/// Options for ssh invocations that must never prompt.
pub const DEFAULT_SSH_ARGS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=1",
    "-o",
    "LogLevel=ERROR",
];

/// Where binaries, images and shared data live on the host.
#[derive(Args, Debug, Clone, Default)]
pub struct HostArgs {
    #[arg(
        long,
        env = "BENCHER_PROJECT_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Project directory shared with guests, defaults to $HOME/Projects/ch-test"
    )]
    pub project_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "BENCHER_CLOUD_HYPERVISOR",
        value_hint = clap::ValueHint::FilePath,
        help = "cloud-hypervisor binary, defaults to <project>/../cloud-hypervisor/target/release/cloud-hypervisor"
    )]
    pub cloud_hypervisor: Option<PathBuf>,

    #[arg(
        long,
        env = "BENCHER_VIRTIOFSD",
        value_hint = clap::ValueHint::FilePath,
        help = "virtiofsd binary, defaults to <project>/base/virtiofsd"
    )]
    pub virtiofsd: Option<PathBuf>,

    #[arg(
        long,
        env = "BENCHER_GO_YCSB",
        value_hint = clap::ValueHint::FilePath,
        help = "go-ycsb binary, defaults to <project>/base/go-ycsb"
    )]
    pub go_ycsb: Option<PathBuf>,

    #[arg(
        long,
        env = "BENCHER_MODULES_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the guest kernel modules, defaults to <project>/base"
    )]
    pub modules_dir: Option<PathBuf>,

    #[arg(long, env = "BENCHER_KERNEL", default_value = "vmlinux.bin")]
    pub kernel: PathBuf,

    #[arg(long, env = "BENCHER_IMAGE", default_value = "clr.img")]
    pub image: PathBuf,

    #[arg(long, env = "BENCHER_GAP_GRAPH", default_value = "kronecker-s25d24.sg")]
    pub gap_graph: String,
}

/// Resolved host paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostLayout {
    /// Mapped into guests for easy access to supplementary data
    pub project_dir: PathBuf,
    pub shared_dir: PathBuf,
    pub cloud_hypervisor: PathBuf,
    pub virtiofsd: PathBuf,
    pub go_ycsb: PathBuf,
    pub modules_dir: PathBuf,
    pub kernel: PathBuf,
    pub image: PathBuf,
    pub gapbs_dir: PathBuf,
    pub gap_graph: String,
}

impl HostLayout {
    pub fn from_args(args: &HostArgs) -> Result<Self, Report<ConfigError>> {
        let project_dir = match &args.project_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = env::var_os("HOME").ok_or_else(|| {
                    Report::new(ConfigError::InvalidHost {
                        message: "neither --project-dir nor $HOME is set".to_string(),
                    })
                })?;
                PathBuf::from(home).join("Projects/ch-test")
            }
        };
        Ok(Self::with_project_dir(project_dir, args))
    }

    fn with_project_dir(project_dir: PathBuf, args: &HostArgs) -> Self {
        let shared_dir = project_dir.join("..");
        let base = project_dir.join("base");
        Self {
            cloud_hypervisor: args.cloud_hypervisor.clone().unwrap_or_else(|| {
                shared_dir.join("cloud-hypervisor/target/release/cloud-hypervisor")
            }),
            virtiofsd: args
                .virtiofsd
                .clone()
                .unwrap_or_else(|| base.join("virtiofsd")),
            go_ycsb: args.go_ycsb.clone().unwrap_or_else(|| base.join("go-ycsb")),
            modules_dir: args.modules_dir.clone().unwrap_or(base),
            kernel: args.kernel.clone(),
            image: args.image.clone(),
            gapbs_dir: shared_dir.join("gapbs"),
            gap_graph: args.gap_graph.clone(),
            shared_dir,
            project_dir,
        }
    }

    /// Working directory of one VM, holding its api and virtiofsd sockets.
    pub fn vm_working_dir(&self, id: usize) -> PathBuf {
        self.project_dir.join(format!("vm{id}"))
    }
}

/// Host NUMA placement of guests, clients and guest memory tiers.
#[derive(Args, Debug, Clone, PartialEq, Serialize)]
pub struct NumaPlacement {
    #[arg(
        long = "vm-nodes",
        value_delimiter = ',',
        default_value = "1",
        help = "Host NUMA nodes whose CPUs run guest vCPUs"
    )]
    pub vm_nodes: Vec<u32>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Host NUMA node running benchmark clients"
    )]
    pub client_node: u32,

    #[arg(long, default_value_t = 1, help = "Host NUMA node backing fast memory")]
    pub dram_node: u32,

    #[arg(long, default_value_t = 2, help = "Host NUMA node backing slow memory")]
    pub pmem_node: u32,
}

impl Default for NumaPlacement {
    fn default() -> Self {
        Self {
            vm_nodes: vec![1],
            client_node: 0,
            dram_node: 1,
            pmem_node: 2,
        }
    }
}
