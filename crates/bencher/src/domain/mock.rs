//! Test adapters implementing the collaborator traits
//!
//! Scripted stand-ins for the hypervisor, guest and host shells so the
//! orchestration logic can be exercised without launching anything.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tempfile::TempDir;

use super::benchmark::BenchmarkContext;
use super::benchmark::BenchmarkEvent;
use super::benchmark::EventSink;
use super::benchmark::PreloadTiming;
use super::fleet::Fleet;
use super::resources::Binding;
use super::resources::HostTopology;
use super::resources::ResourceAssignment;
use super::traits::CommandOutput;
use super::traits::GuestShell;
use super::traits::HostShell;
use super::traits::Hypervisor;
use super::traits::VmInstance;
use super::vm::VmSpec;
use crate::config::FleetConfig;
use crate::config::HostArgs;
use crate::config::HostLayout;
use crate::config::NumaPlacement;
use crate::config::VcpuBind;

pub fn fleet_config(count: usize) -> FleetConfig {
    FleetConfig {
        count,
        ncpus: 2,
        memory: 8 << 30,
        dram_ratio: 0.2,
        memory_mode: false,
        bind: VcpuBind::Core,
        numa: NumaPlacement::default(),
        output_dir: PathBuf::from("/tmp/bencher-test"),
    }
}

/// Node 0 holds CPUs 0-7, node 1 holds CPUs 8-15.
pub fn two_node_topology() -> HostTopology {
    HostTopology::from_nodes([(0, (0..8).collect()), (1, (8..16).collect())])
}

/// A fleet of `count` mock VMs with two exclusive cores each, never launched.
pub fn mock_fleet(count: usize) -> Fleet<MockInstance> {
    let config = fleet_config(count);
    Fleet::from_parts((0..count).map(|ordinal| {
        let first = 8 + 2 * ordinal as u32;
        let assignment = ResourceAssignment {
            ordinal,
            binding: Binding::Cores(vec![first, first + 1]),
        };
        (VmSpec::new(&config, assignment), MockInstance::new(ordinal))
    }))
}

pub struct MockInstance {
    ordinal: usize,
    exit_awaited: AtomicBool,
}

impl MockInstance {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            exit_awaited: AtomicBool::new(false),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Whether someone waited for this VM to exit.
    pub fn exit_awaited(&self) -> bool {
        self.exit_awaited.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VmInstance for MockInstance {
    async fn wait_exit(&self) -> Result<()> {
        self.exit_awaited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HypervisorLog {
    launched: Vec<usize>,
    stopped: Vec<usize>,
    live: BTreeSet<usize>,
}

/// Hypervisor that records launches and stops and fails on request
#[derive(Default)]
pub struct MockHypervisor {
    fail_launch: Option<usize>,
    fail_readiness: Option<usize>,
    fail_stop: Option<usize>,
    log: Mutex<HypervisorLog>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_launch(ordinal: usize) -> Self {
        Self {
            fail_launch: Some(ordinal),
            ..Self::default()
        }
    }

    pub fn failing_readiness(ordinal: usize) -> Self {
        Self {
            fail_readiness: Some(ordinal),
            ..Self::default()
        }
    }

    pub fn failing_stop(ordinal: usize) -> Self {
        Self {
            fail_stop: Some(ordinal),
            ..Self::default()
        }
    }

    /// Ordinals launched successfully, in launch order.
    pub fn launched(&self) -> Vec<usize> {
        self.log.lock().unwrap().launched.clone()
    }

    /// Ordinals stopped successfully, in stop order.
    pub fn stopped(&self) -> Vec<usize> {
        self.log.lock().unwrap().stopped.clone()
    }

    /// Number of VMs launched and not successfully stopped
    pub fn live(&self) -> usize {
        self.log.lock().unwrap().live.len()
    }
}

#[async_trait::async_trait]
impl Hypervisor for MockHypervisor {
    type Instance = MockInstance;

    async fn launch(&self, spec: &VmSpec) -> Result<MockInstance> {
        if self.fail_launch == Some(spec.id) {
            return Err(anyhow!("cloud-hypervisor for vm{} exited early", spec.id));
        }
        let mut log = self.log.lock().unwrap();
        log.launched.push(spec.id);
        log.live.insert(spec.id);
        Ok(MockInstance::new(spec.id))
    }

    async fn wait_ready(&self, spec: &VmSpec, _instance: &MockInstance) -> Result<()> {
        if self.fail_readiness == Some(spec.id) {
            return Err(anyhow!("ssh to {} timed out", spec.ip()));
        }
        Ok(())
    }

    async fn stop(&self, spec: &VmSpec, instance: MockInstance) -> Result<()> {
        assert_eq!(spec.id, instance.ordinal(), "instance stopped with foreign spec");
        if self.fail_stop == Some(spec.id) {
            return Err(anyhow!("vm{} refused to stop", spec.id));
        }
        let mut log = self.log.lock().unwrap();
        log.stopped.push(spec.id);
        log.live.remove(&spec.id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GuestState {
    commands: BTreeMap<usize, Vec<String>>,
    modules: BTreeMap<usize, Vec<String>>,
    numa_balancing: BTreeMap<usize, bool>,
}

#[derive(Debug, Clone)]
struct FailRule {
    ordinal: usize,
    needle: String,
    /// Matching commands that still succeed before failures start
    successes: usize,
}

/// Guest shell emulating module loading and sysctl, with scripted output
#[derive(Debug, Default)]
pub struct MockGuest {
    responses: Vec<(String, String)>,
    failures: Vec<FailRule>,
    state: Mutex<GuestState>,
}

impl MockGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `needle` print `stdout`.
    pub fn respond(mut self, needle: &str, stdout: &str) -> Self {
        self.responses.push((needle.to_string(), stdout.to_string()));
        self
    }

    /// Commands on `ordinal` containing `needle` exit with status 1.
    pub fn fail_on(self, ordinal: usize, needle: &str) -> Self {
        self.fail_after(ordinal, needle, 0)
    }

    /// Like [`MockGuest::fail_on`], after `successes` matching commands succeeded.
    pub fn fail_after(mut self, ordinal: usize, needle: &str, successes: usize) -> Self {
        self.failures.push(FailRule {
            ordinal,
            needle: needle.to_string(),
            successes,
        });
        self
    }

    /// Every command issued to `ordinal`, arguments joined by spaces.
    pub fn commands_for(&self, ordinal: usize) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.commands.get(&ordinal).cloned().unwrap_or_default()
    }

    pub fn loaded_modules(&self, ordinal: usize) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.modules.get(&ordinal).cloned().unwrap_or_default()
    }

    pub fn numa_balancing(&self, ordinal: usize) -> Option<bool> {
        let state = self.state.lock().unwrap();
        state.numa_balancing.get(&ordinal).copied()
    }

    fn execute(&self, ordinal: usize, args: &[String]) -> CommandOutput {
        let command = args.join(" ");
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .entry(ordinal)
            .or_default()
            .push(command.clone());

        let failing = self.failures.iter().any(|rule| {
            rule.ordinal == ordinal && command.contains(&rule.needle) && {
                let seen = state.commands[&ordinal]
                    .iter()
                    .filter(|issued| issued.contains(&rule.needle))
                    .count();
                seen > rule.successes
            }
        });
        if failing {
            return CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("injected failure: {command}"),
            };
        }

        let succeed = |stdout: &str| CommandOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["test", "-d", path] => {
                let name = path.trim_start_matches("/sys/module/");
                let loaded = state
                    .modules
                    .get(&ordinal)
                    .is_some_and(|modules| modules.iter().any(|module| module == name));
                CommandOutput {
                    status: Some(if loaded { 0 } else { 1 }),
                    ..CommandOutput::default()
                }
            }
            ["sudo", "insmod", path, ..] => {
                let name = Path::new(path)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                state.modules.entry(ordinal).or_default().push(name);
                succeed("")
            }
            ["sudo", "rmmod", name] => {
                if let Some(modules) = state.modules.get_mut(&ordinal) {
                    modules.retain(|module| module != name);
                }
                succeed("")
            }
            ["sudo", "sysctl", "-w", setting] => {
                let enabled = setting.trim_start_matches("kernel.numa_balancing=") == "1";
                state.numa_balancing.insert(ordinal, enabled);
                succeed("")
            }
            _ => {
                let stdout = self
                    .responses
                    .iter()
                    .find(|(needle, _)| command.contains(needle.as_str()))
                    .map(|(_, stdout)| stdout.as_str())
                    .unwrap_or_default();
                succeed(stdout)
            }
        }
    }
}

#[async_trait::async_trait]
impl GuestShell for MockGuest {
    async fn run(&self, vm: &VmSpec, args: &[String]) -> Result<CommandOutput> {
        Ok(self.execute(vm.id, args))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Host command runner recording every invocation
#[derive(Debug, Default)]
pub struct MockHost {
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    calls: Mutex<Vec<HostCall>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations whose program or arguments contain `needle` print `stdout`.
    pub fn respond(mut self, needle: &str, stdout: &str) -> Self {
        self.responses.push((needle.to_string(), stdout.to_string()));
        self
    }

    /// Invocations whose program or arguments contain `needle` exit with status 1.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HostShell for MockHost {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(HostCall {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
        });
        let command = format!("{program} {}", args.join(" "));
        if self.failures.iter().any(|needle| command.contains(needle)) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("injected failure: {command}"),
            });
        }
        let stdout = self
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Event sink remembering every event it received
#[derive(Debug, Default, Clone)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<BenchmarkEvent>>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<BenchmarkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|event| match event {
                BenchmarkEvent::Started { .. } => "started",
                BenchmarkEvent::Finished { .. } => "finished",
                BenchmarkEvent::Failed { .. } => "failed",
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: BenchmarkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Scratch project and run directories for benchmark tests.
pub struct TestBench {
    project: TempDir,
    run: TempDir,
    layout: HostLayout,
    client_cpus: Vec<u32>,
}

impl TestBench {
    pub fn new() -> Self {
        let project = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let args = HostArgs {
            project_dir: Some(project.path().to_path_buf()),
            kernel: PathBuf::from("vmlinux.bin"),
            image: PathBuf::from("clr.img"),
            gap_graph: "kronecker-s25d24.sg".to_string(),
            ..Default::default()
        };
        let layout = HostLayout::from_args(&args).unwrap();
        Self {
            project,
            run,
            layout,
            client_cpus: vec![0, 1, 2, 3],
        }
    }

    pub fn project_dir(&self) -> &Path {
        self.project.path()
    }

    pub fn run_dir(&self) -> &Path {
        self.run.path()
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn context<'a, I>(
        &'a self,
        fleet: &'a Fleet<I>,
        guest: &'a dyn GuestShell,
        host: &'a dyn HostShell,
    ) -> BenchmarkContext<'a, I> {
        BenchmarkContext {
            fleet,
            guest,
            host,
            layout: &self.layout,
            run_dir: self.run.path(),
            ncpus: 2,
            perf_event: None,
            client_cpus: &self.client_cpus,
            client_membind: 2,
            preload: PreloadTiming {
                grace: Duration::ZERO,
                poll_interval: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            },
        }
    }
}
