//! Wires configuration, provisioning, guest preparation and dispatch into
//! one benchmark run.

pub mod artifacts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use futures::FutureExt;
use tracing::error;
use tracing::info;
use tracing::warn;

use self::artifacts::write_summary;
use self::artifacts::RunOutcome;
use self::artifacts::RunSummary;
use crate::config::FleetConfig;
use crate::config::HostLayout;
use crate::config::RunArgs;
use crate::domain::benchmark::BenchmarkContext;
use crate::domain::benchmark::BenchmarkReport;
use crate::domain::benchmark::EventSink;
use crate::domain::benchmark::PreloadTiming;
use crate::domain::guest::insert_kernel_modules;
use crate::domain::guest::set_numa_balancing;
use crate::domain::guest::BALLOON_MODULES;
use crate::domain::traits::GuestShell;
use crate::domain::traits::HostShell;
use crate::domain::traits::Hypervisor;
use crate::domain::BenchmarkSpec;
use crate::domain::Dispatcher;
use crate::domain::HostCycler;
use crate::domain::HostTopology;
use crate::domain::Provisioner;
use crate::error::RunError;

/// What one run does.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub fleet: FleetConfig,
    pub benchmark: BenchmarkSpec,
    pub insert_modules: bool,
    pub perf_event: Option<String>,
}

impl RunPlan {
    /// Plan of a `run` invocation writing its artifacts to `run_dir`.
    pub fn from_run_args(args: &RunArgs, run_dir: PathBuf) -> Self {
        Self {
            fleet: args.fleet_config(run_dir),
            benchmark: BenchmarkSpec::from(&args.bench),
            insert_modules: !args.no_module,
            perf_event: args.perf_event().map(str::to_string),
        }
    }
}

/// Outcome of the fleet scope on success.
struct Completed {
    module_failures: Vec<String>,
    report: BenchmarkReport,
}

pub struct Orchestrator<H: Hypervisor, S> {
    provisioner: Provisioner<H>,
    guest: Arc<dyn GuestShell>,
    host: Arc<dyn HostShell>,
    layout: HostLayout,
    topology: HostTopology,
    sink: S,
    preload: PreloadTiming,
}

impl<H, S> Orchestrator<H, S>
where
    H: Hypervisor,
    S: EventSink + Clone + 'static,
{
    pub fn new(
        hypervisor: Arc<H>,
        guest: Arc<dyn GuestShell>,
        host: Arc<dyn HostShell>,
        layout: HostLayout,
        topology: HostTopology,
        sink: S,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(hypervisor),
            guest,
            host,
            layout,
            topology,
            sink,
            preload: PreloadTiming::default(),
        }
    }

    pub fn with_preload_timing(mut self, preload: PreloadTiming) -> Self {
        self.preload = preload;
        self
    }

    /// Runs `plan` and records `run.json` in `plan.fleet.output_dir`.
    ///
    /// The fleet is always torn down before this returns. A failed run still
    /// writes its summary.
    pub async fn run(&self, plan: &RunPlan) -> Result<RunSummary, Report<RunError>> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(benchmark = plan.benchmark.name(), count = plan.fleet.count, "run started");

        let outcome = self.execute(plan).await;

        let finished_at = Utc::now();
        let (outcome, report, module_failures, failure) = match outcome {
            Ok(completed) => (
                RunOutcome::Succeeded,
                Some(completed.report),
                completed.module_failures,
                None,
            ),
            Err(report) => (
                RunOutcome::Failed {
                    stage: report.current_context().to_string(),
                    error: format!("{report:#}"),
                },
                None,
                Vec::new(),
                Some(report),
            ),
        };
        let summary = RunSummary {
            version: &**utils::version::VERSION,
            started_at,
            finished_at,
            elapsed_secs: clock.elapsed().as_secs_f64(),
            fleet: plan.fleet.clone(),
            benchmark: plan.benchmark.clone(),
            outcome,
            report,
            module_failures,
        };

        let written = write_summary(&plan.fleet.output_dir, &summary);
        match (failure, written) {
            (None, Ok(path)) => {
                info!(summary = %path.display(), "run finished");
                Ok(summary)
            }
            (None, Err(report)) => Err(report),
            (Some(failure), written) => {
                if let Err(report) = written {
                    error!("failed to write run summary: {report:?}");
                }
                Err(failure)
            }
        }
    }

    async fn execute(&self, plan: &RunPlan) -> Result<Completed, Report<RunError>> {
        let config = &plan.fleet;
        config.validate().change_context(RunError::Config)?;

        let mut cycler = HostCycler::new(self.topology.clone(), &config.numa.vm_nodes)
            .change_context(RunError::Provision)?;
        let client_cpus = self
            .topology
            .node_to_cpus(config.numa.client_node)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| {
                Report::new(RunError::Config).attach_printable(format!(
                    "client node {} has no CPUs",
                    config.numa.client_node
                ))
            })?;
        let client_membind = if config.memory_mode {
            config.numa.dram_node
        } else {
            config.numa.pmem_node
        };

        // the scope body owns everything it uses besides the fleet
        let guest = self.guest.clone();
        let host = self.host.clone();
        let layout = self.layout.clone();
        let sink = self.sink.clone();
        let run_dir: PathBuf = config.output_dir.clone();
        let ncpus = config.ncpus;
        let preload = self.preload;
        let benchmark = plan.benchmark.clone();
        let insert_modules = plan.insert_modules;
        let perf_event = plan.perf_event.clone();

        self.provisioner
            .scope(config, &mut cycler, move |fleet| {
                async move {
                    let mut module_failures = Vec::new();
                    if insert_modules {
                        let failures = insert_kernel_modules(
                            fleet,
                            guest.as_ref(),
                            &layout.modules_dir,
                            BALLOON_MODULES,
                        )
                        .await;
                        for failure in &failures {
                            warn!("{failure:?}");
                        }
                        module_failures = failures
                            .iter()
                            .map(|failure| format!("{failure:#}"))
                            .collect();
                    }
                    set_numa_balancing(fleet, guest.as_ref(), false)
                        .await
                        .change_context(RunError::GuestPreparation)?;

                    let ctx = BenchmarkContext {
                        fleet,
                        guest: guest.as_ref(),
                        host: host.as_ref(),
                        layout: &layout,
                        run_dir: &run_dir,
                        ncpus,
                        perf_event: perf_event.as_deref(),
                        client_cpus: &client_cpus,
                        client_membind,
                        preload,
                    };
                    let mut dispatcher = Dispatcher::new(sink);
                    let report = dispatcher
                        .dispatch(&benchmark, &ctx)
                        .await
                        .change_context(RunError::Benchmark)?;
                    Ok(Completed {
                        module_failures,
                        report,
                    })
                }
                .boxed()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use std::path::Path;

    use super::*;
    use crate::config::HostArgs;
    use crate::domain::benchmark::BenchmarkDetail;
    use crate::domain::mock::fleet_config;
    use crate::domain::mock::two_node_topology;
    use crate::domain::mock::MockGuest;
    use crate::domain::mock::MockHost;
    use crate::domain::mock::MockHypervisor;
    use crate::domain::mock::RecordingEventSink;

    fn read_summary(run_dir: &Path) -> serde_json::Value {
        let contents =
            std::fs::read_to_string(run_dir.join(artifacts::SUMMARY_FILE)).expect("run.json");
        serde_json::from_str(&contents).expect("valid json")
    }

    struct Harness {
        hypervisor: Arc<MockHypervisor>,
        guest: Arc<MockGuest>,
        sink: RecordingEventSink,
        orchestrator: Orchestrator<MockHypervisor, RecordingEventSink>,
        run_dir: tempfile::TempDir,
        _project: tempfile::TempDir,
    }

    fn harness(hypervisor: MockHypervisor, guest: MockGuest) -> Harness {
        let hypervisor = Arc::new(hypervisor);
        let guest = Arc::new(guest);
        let sink = RecordingEventSink::default();
        let project = tempfile::tempdir().expect("tempdir");
        let layout = HostLayout::from_args(&HostArgs {
            project_dir: Some(project.path().to_path_buf()),
            gap_graph: "g.sg".to_string(),
            ..Default::default()
        })
        .expect("layout");
        let orchestrator = Orchestrator::new(
            hypervisor.clone(),
            guest.clone(),
            Arc::new(MockHost::new()),
            layout,
            two_node_topology(),
            sink.clone(),
        )
        .with_preload_timing(PreloadTiming {
            grace: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        });
        Harness {
            hypervisor,
            guest,
            sink,
            orchestrator,
            run_dir: tempfile::tempdir().expect("tempdir"),
            _project: project,
        }
    }

    fn gap_plan(harness: &Harness, count: usize) -> RunPlan {
        RunPlan {
            fleet: FleetConfig {
                output_dir: harness.run_dir.path().to_path_buf(),
                ..fleet_config(count)
            },
            benchmark: BenchmarkSpec::Graph {
                trials: 5,
                iterations: 1,
            },
            insert_modules: true,
            perf_event: None,
        }
    }

    #[test(tokio::test)]
    async fn successful_run_prepares_guests_before_benchmarking() {
        let harness = harness(
            MockHypervisor::new(),
            MockGuest::new().respond("bc -n 1", "Trial Time:          3.00000\n"),
        );
        let plan = gap_plan(&harness, 2);

        let summary = harness.orchestrator.run(&plan).await.expect("run");

        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert!(matches!(
            summary.report.map(|report| report.detail),
            Some(BenchmarkDetail::Graph { trial_times }) if trial_times == vec![vec![3.0; 5]; 2]
        ));
        assert_eq!(harness.sink.kinds(), vec!["started", "finished"]);
        assert_eq!(harness.hypervisor.live(), 0);

        let commands = harness.guest.commands_for(1);
        let position = |needle: &str| {
            commands
                .iter()
                .position(|command| command.contains(needle))
                .expect(needle)
        };
        assert!(position("insmod") < position("numa_balancing"));
        assert!(position("numa_balancing") < position("bc -n 1"));

        let json = read_summary(harness.run_dir.path());
        assert_eq!(json["outcome"]["status"], "succeeded");
        assert_eq!(json["report"]["benchmark"], "gap_bc");
    }

    #[test(tokio::test)]
    async fn benchmark_failure_still_tears_down_and_records_failure() {
        let harness = harness(MockHypervisor::new(), MockGuest::new().fail_on(0, "bc -n 1"));
        let plan = gap_plan(&harness, 2);

        let report = harness.orchestrator.run(&plan).await.expect_err("gap fails");

        assert!(matches!(report.current_context(), RunError::Benchmark));
        assert_eq!(harness.hypervisor.stopped(), vec![1, 0]);
        assert_eq!(harness.hypervisor.live(), 0);
        assert_eq!(harness.sink.kinds(), vec!["started", "failed"]);

        let json = read_summary(harness.run_dir.path());
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["stage"], "Benchmark failed");
    }

    #[test(tokio::test)]
    async fn provisioning_failure_runs_no_guest_command() {
        let harness = harness(MockHypervisor::failing_launch(1), MockGuest::new());
        let plan = gap_plan(&harness, 3);

        let report = harness.orchestrator.run(&plan).await.expect_err("launch fails");

        assert!(matches!(report.current_context(), RunError::Provision));
        assert!(harness.guest.commands_for(0).is_empty());
        assert!(harness.sink.events().is_empty());
        assert_eq!(harness.hypervisor.stopped(), vec![0]);
    }

    #[test(tokio::test)]
    async fn invalid_config_touches_nothing() {
        let harness = harness(MockHypervisor::new(), MockGuest::new());
        let mut plan = gap_plan(&harness, 1);
        plan.fleet.dram_ratio = 1.5;

        let report = harness.orchestrator.run(&plan).await.expect_err("invalid");

        assert!(matches!(report.current_context(), RunError::Config));
        assert!(harness.hypervisor.launched().is_empty());
    }

    #[test(tokio::test)]
    async fn module_failures_do_not_abort_the_run() {
        let harness = harness(
            MockHypervisor::new(),
            MockGuest::new()
                .fail_on(1, "balloon_events.ko")
                .respond("bc -n 1", "Trial Time:          1.00000\n"),
        );
        let plan = gap_plan(&harness, 2);

        let summary = harness.orchestrator.run(&plan).await.expect("run");

        assert_eq!(summary.module_failures.len(), 1);
        assert!(summary.module_failures[0].contains("vm1"));
    }

    #[test(tokio::test)]
    async fn disabled_module_insertion_skips_insmod() {
        let harness = harness(
            MockHypervisor::new(),
            MockGuest::new().respond("bc -n 1", "Trial Time:          1.00000\n"),
        );
        let mut plan = gap_plan(&harness, 1);
        plan.insert_modules = false;

        harness.orchestrator.run(&plan).await.expect("run");

        assert!(harness
            .guest
            .commands_for(0)
            .iter()
            .all(|command| !command.contains("insmod")));
    }
}
