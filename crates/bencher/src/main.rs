use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use bencher::app::artifacts::create_run_dir;
use bencher::app::Orchestrator;
use bencher::app::RunPlan;
use bencher::config::Cli;
use bencher::config::Commands;
use bencher::config::HostLayout;
use bencher::config::ParseGapArgs;
use bencher::config::RunArgs;
use bencher::config::SetupHostArgs;
use bencher::domain::benchmark::parse_gap_log;
use bencher::domain::benchmark::TracingEventSink;
use bencher::domain::traits::GuestShell;
use bencher::domain::traits::HostShell;
use bencher::domain::HostTopology;
use bencher::infrastructure::cloud_hypervisor::CloudHypervisor;
use bencher::infrastructure::cloud_hypervisor::LaunchTiming;
use bencher::infrastructure::host_setup::setup_host;
use bencher::infrastructure::network::TapNetwork;
use bencher::infrastructure::shell::LocalShell;
use bencher::infrastructure::shell::SshShell;
use bencher::logging;
use chrono::Local;
use clap::Parser;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run(*run_args).await,
        Commands::SetupHost(setup_args) => run_setup_host(setup_args).await,
        Commands::ParseGap(parse_args) => run_parse_gap(parse_args),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let start = Local::now();
    let run_dir = create_run_dir(&args.output_dir, start)
        .with_context(|| format!("create run directory under {}", args.output_dir.display()))?;
    let _guard = logging::init(args.log_level.into(), args.pretty, &run_dir);

    tracing::info!("Starting bencher {}", &**version::VERSION);
    tracing::info!("run directory: {}", run_dir.display());

    let layout = HostLayout::from_args(&args.host).map_err(|report| anyhow!("{report:?}"))?;
    let mut nodes = args.numa.vm_nodes.clone();
    nodes.push(args.numa.client_node);
    nodes.sort_unstable();
    nodes.dedup();
    let topology = HostTopology::detect(&nodes).context("detect host NUMA topology")?;

    let host: Arc<dyn HostShell> = Arc::new(LocalShell);
    let guest: Arc<dyn GuestShell> = Arc::new(SshShell::default());
    let hypervisor = CloudHypervisor::new(
        layout.clone(),
        TapNetwork::new(host.clone()),
        guest.clone(),
        LaunchTiming::default(),
    );
    let orchestrator = Orchestrator::new(
        Arc::new(hypervisor),
        guest,
        host,
        layout,
        topology,
        TracingEventSink,
    );

    let plan = RunPlan::from_run_args(&args, run_dir);
    match orchestrator.run(&plan).await {
        Ok(summary) => {
            tracing::info!("run finished in {:.1}s", summary.elapsed_secs);
            Ok(())
        }
        Err(report) => {
            tracing::error!("{report:?}");
            Err(anyhow!("{report:#}"))
        }
    }
}

async fn run_setup_host(args: SetupHostArgs) -> Result<()> {
    utils::logging::init();

    let layout = HostLayout::from_args(&args.host).map_err(|report| anyhow!("{report:?}"))?;
    let ran = setup_host(&LocalShell, &layout, &args.skip)
        .await
        .map_err(|report| anyhow!("{report:?}"))?;
    tracing::info!("host setup finished: {}", ran.join(", "));
    Ok(())
}

fn run_parse_gap(args: ParseGapArgs) -> Result<()> {
    let log = std::fs::read_to_string(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    for (vm, times) in parse_gap_log(&log).iter().enumerate() {
        let times: Vec<String> = times.iter().map(f64::to_string).collect();
        println!("vm{vm}: {}", times.join(" "));
    }
    Ok(())
}
