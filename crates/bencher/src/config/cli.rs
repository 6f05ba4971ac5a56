use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;
use utils::version;

use crate::config::fleet::FleetConfig;
use crate::config::fleet::VcpuBind;
use crate::config::host::HostArgs;
use crate::config::host::NumaPlacement;
use crate::config::ycsb::YcsbWorkload;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a fleet of VMs, run one benchmark against it and tear it down
    Run(Box<RunArgs>),
    /// Prepare the host (pmem, libvirt, cpufreq, numa balancing, swap)
    #[command(name = "setup-host")]
    SetupHost(SetupHostArgs),
    /// Extract per-VM trial times from a gap_bc log
    #[command(name = "parse-gap")]
    ParseGap(ParseGapArgs),
}

/// Logging verbosity, named after the levels the experiment logs use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Notset,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Notset => LevelFilter::TRACE,
        }
    }
}

#[derive(Args, Clone)]
pub struct RunArgs {
    #[arg(long, help = "How many VMs to launch")]
    pub num: usize,

    #[arg(long, default_value_t = 4, help = "How many vCPUs for each VM")]
    pub ncpus: usize,

    #[arg(
        long,
        value_enum,
        ignore_case = true,
        default_value_t = VcpuBind::Core,
        help = "Bind guest CPUs to host cores or to a host node"
    )]
    pub bind: VcpuBind,

    #[arg(long, default_value_t = 8u64 << 30, help = "Memory in bytes for each VM")]
    pub memory: u64,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Initial DRAM ratio out of all guest system RAM"
    )]
    pub dram_ratio: f64,

    #[arg(
        long,
        value_enum,
        ignore_case = true,
        default_value_t = LogLevel::Info,
        help = "Logging level"
    )]
    pub log_level: LogLevel,

    #[arg(
        long,
        default_value = "",
        help = "perf event recorded in guests during the redis benchmark, empty disables it"
    )]
    pub perf_event: String,

    #[arg(long, help = "Back the slow memory zone with DRAM as well")]
    pub memory_mode: bool,

    #[arg(long, help = "Enable pretty printing")]
    pub pretty: bool,

    #[arg(long, help = "Disable inserting balloon related kernel modules")]
    pub no_module: bool,

    #[arg(
        long,
        default_value = "output",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory receiving one timestamped subdirectory per run"
    )]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub numa: NumaPlacement,

    #[command(flatten)]
    pub host: HostArgs,

    #[command(subcommand)]
    pub bench: BenchCommand,
}

impl RunArgs {
    /// Fleet description for a run writing its artifacts to `run_dir`.
    pub fn fleet_config(&self, run_dir: PathBuf) -> FleetConfig {
        FleetConfig {
            count: self.num,
            ncpus: self.ncpus,
            memory: self.memory,
            dram_ratio: self.dram_ratio,
            memory_mode: self.memory_mode,
            bind: self.bind,
            numa: self.numa.clone(),
            output_dir: run_dir,
        }
    }

    pub fn perf_event(&self) -> Option<&str> {
        Some(self.perf_event.as_str()).filter(|event| !event.is_empty())
    }
}

/// Which benchmark to run.
#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum BenchCommand {
    /// Run an ad-hoc shell command in every guest
    Manual(ManualArgs),
    /// Redis driven by go-ycsb clients on the host
    Redis(RedisArgs),
    /// gapbs betweenness centrality
    Gap(GapArgs),
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct ManualArgs {
    #[arg(long, default_value = "", help = "Shell command run in every guest")]
    pub cmd: String,

    #[arg(long, help = "Wait for the command and check its exit status")]
    pub wait: bool,

    #[arg(long, help = "Keep the fleet alive until the VMs are shut down externally")]
    pub hold: bool,
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct RedisArgs {
    #[arg(long, value_enum, ignore_case = true, default_value_t = YcsbWorkload::A)]
    pub workload: YcsbWorkload,
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct GapArgs {
    #[arg(long, default_value_t = 5)]
    pub ntrials: u32,

    #[arg(long, default_value_t = 1)]
    pub niters: u32,
}

#[derive(Args, Clone, Debug)]
pub struct SetupHostArgs {
    #[arg(
        long,
        value_delimiter = ',',
        help = "Setup steps to skip, e.g. --skip freq,swap"
    )]
    pub skip: Vec<String>,

    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Args, Clone, Debug)]
pub struct ParseGapArgs {
    #[arg(value_hint = clap::ValueHint::FilePath, help = "Log file to be processed")]
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn parse_run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).expect("arguments should parse");
        match cli.command {
            Commands::Run(run) => *run,
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn run_defaults() {
        let run = parse_run(&["bencher", "run", "--num", "3", "gap"]);
        assert_eq!(run.num, 3);
        assert_eq!(run.ncpus, 4);
        assert_eq!(run.bind, VcpuBind::Core);
        assert_eq!(run.memory, 8 << 30);
        assert_eq!(run.dram_ratio, 0.2);
        assert_eq!(run.log_level, LogLevel::Info);
        assert!(!run.memory_mode);
        assert!(!run.no_module);
        assert_eq!(run.numa.vm_nodes, vec![1]);
        assert_eq!(
            run.bench,
            BenchCommand::Gap(GapArgs {
                ntrials: 5,
                niters: 1
            })
        );
    }

    #[test]
    fn run_requires_vm_count() {
        assert!(Cli::try_parse_from(["bencher", "run", "gap"]).is_err());
    }

    #[test]
    fn run_requires_benchmark() {
        assert!(Cli::try_parse_from(["bencher", "run", "--num", "1"]).is_err());
    }

    #[test]
    fn manual_subcommand_flags() {
        let run = parse_run(&[
            "bencher", "run", "--num", "2", "--bind", "NODE", "manual", "--cmd", "uname -a",
            "--wait",
        ]);
        assert_eq!(run.bind, VcpuBind::Node);
        assert_eq!(
            run.bench,
            BenchCommand::Manual(ManualArgs {
                cmd: "uname -a".to_string(),
                wait: true,
                hold: false,
            })
        );
    }

    #[test]
    fn redis_workload_is_case_insensitive() {
        let run = parse_run(&["bencher", "run", "--num", "1", "redis", "--workload", "c"]);
        assert_eq!(
            run.bench,
            BenchCommand::Redis(RedisArgs {
                workload: YcsbWorkload::C
            })
        );
    }

    #[test]
    fn log_level_maps_to_tracing_filter() {
        let run = parse_run(&["bencher", "run", "--num", "1", "--log-level", "DEBUG", "gap"]);
        assert_eq!(LevelFilter::from(run.log_level), LevelFilter::DEBUG);
        assert_eq!(LevelFilter::from(LogLevel::Warning), LevelFilter::WARN);
    }

    #[test]
    fn run_args_build_fleet_config() {
        let run = parse_run(&[
            "bencher", "run", "--num", "2", "--vm-nodes", "1,3", "--memory-mode", "--perf-event",
            "cycles", "gap",
        ]);
        let fleet = run.fleet_config(PathBuf::from("/runs/now"));

        assert_eq!(fleet.count, 2);
        assert!(fleet.memory_mode);
        assert_eq!(fleet.numa.vm_nodes, vec![1, 3]);
        assert_eq!(fleet.output_dir, PathBuf::from("/runs/now"));
        assert_eq!(run.perf_event(), Some("cycles"));
        assert_eq!(parse_run(&["bencher", "run", "--num", "1", "gap"]).perf_event(), None);
    }
}
