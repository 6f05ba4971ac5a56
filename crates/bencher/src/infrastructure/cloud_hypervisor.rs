//! cloud-hypervisor guests backed by two virtiofsd daemons each.
//!
//! Every VM runs in `<project>/vm<id>` where its api and virtiofsd sockets
//! live. Process output is captured under the VM's artifact directory.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::network::TapNetwork;
use crate::config::HostLayout;
use crate::domain::traits::args;
use crate::domain::traits::GuestShell;
use crate::domain::traits::Hypervisor;
use crate::domain::traits::VmInstance;
use crate::domain::vm::VmSpec;
use crate::domain::vm::API_SOCKET;
use crate::domain::vm::VIRTIOFSD_OUTPUT_SOCKET;
use crate::domain::vm::VIRTIOFSD_SOCKET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTiming {
    /// virtiofsd must have created its socket before the VM connects to it
    pub virtiofsd_settle: Duration,
    pub boot_timeout: Duration,
    pub boot_poll: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
}

impl Default for LaunchTiming {
    fn default() -> Self {
        Self {
            virtiofsd_settle: Duration::from_secs(1),
            boot_timeout: Duration::from_secs(300),
            boot_poll: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Processes backing one running guest.
pub struct ChInstance {
    cloud_hypervisor: Mutex<Child>,
    virtiofsd: Mutex<Vec<Child>>,
}

#[async_trait::async_trait]
impl VmInstance for ChInstance {
    async fn wait_exit(&self) -> Result<()> {
        let status = self.cloud_hypervisor.lock().await.wait().await?;
        info!("cloud-hypervisor exited with {status}");
        Ok(())
    }
}

pub struct CloudHypervisor {
    layout: HostLayout,
    network: TapNetwork,
    guest: Arc<dyn GuestShell>,
    timing: LaunchTiming,
}

impl CloudHypervisor {
    pub fn new(
        layout: HostLayout,
        network: TapNetwork,
        guest: Arc<dyn GuestShell>,
        timing: LaunchTiming,
    ) -> Self {
        Self {
            layout,
            network,
            guest,
            timing,
        }
    }

    fn spawn(
        &self,
        argv: &[String],
        cwd: &Path,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<Child> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;
        debug!(program, ?rest, "spawning");
        Command::new(program)
            .args(rest)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))
    }

    /// Starts both virtiofsd daemons and the VM, stopping whatever already
    /// started when a later step fails.
    async fn spawn_processes(&self, spec: &VmSpec) -> Result<ChInstance> {
        let cwd = self.layout.vm_working_dir(spec.id);
        std::fs::create_dir_all(&cwd)
            .with_context(|| format!("failed to create {}", cwd.display()))?;
        std::fs::create_dir_all(&spec.output_dir)
            .with_context(|| format!("failed to create {}", spec.output_dir.display()))?;
        let log = |name: &str| -> Result<Stdio> {
            let path = spec.output_dir.join(name);
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Stdio::from(file))
        };

        let mut virtiofsd = Vec::with_capacity(2);
        for (argv, name) in [
            (spec.virtiofsd_args(&self.layout), "virtiofsd.log"),
            (
                spec.virtiofsd_output_args(&self.layout),
                "virtiofsd-output.log",
            ),
        ] {
            let spawned =
                log(name).and_then(|stderr| self.spawn(&argv, &cwd, Stdio::null(), stderr));
            match spawned {
                Ok(child) => virtiofsd.push(child),
                Err(err) => {
                    self.terminate_all(virtiofsd).await;
                    return Err(err);
                }
            }
        }
        tokio::time::sleep(self.timing.virtiofsd_settle).await;

        let argv = spec.cloud_hypervisor_args(&self.layout);
        let args_file = spec.output_dir.join("cloud-hypervisor.args");
        let spawned = std::fs::write(&args_file, argv.join("\n"))
            .context("failed to record cloud-hypervisor arguments")
            .and_then(|()| {
                self.spawn(
                    &argv,
                    &cwd,
                    log("cloud-hypervisor.stdout")?,
                    log("cloud-hypervisor.stderr")?,
                )
            });
        match spawned {
            Ok(child) => Ok(ChInstance {
                cloud_hypervisor: Mutex::new(child),
                virtiofsd: Mutex::new(virtiofsd),
            }),
            Err(err) => {
                self.terminate_all(virtiofsd).await;
                Err(err)
            }
        }
    }

    async fn terminate_all(&self, children: Vec<Child>) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for child in children {
            if let Err(err) = terminate(child, self.timing.stop_timeout).await {
                warn!("failed to terminate child: {err:#}");
                errors.push(err);
            }
        }
        errors
    }
}

#[async_trait::async_trait]
impl Hypervisor for CloudHypervisor {
    type Instance = ChInstance;

    async fn launch(&self, spec: &VmSpec) -> Result<ChInstance> {
        self.network.create(spec).await?;
        match self.spawn_processes(spec).await {
            Ok(instance) => {
                info!(ordinal = spec.id, "cloud-hypervisor started");
                Ok(instance)
            }
            Err(err) => {
                if let Err(cleanup) = self.network.remove(spec).await {
                    warn!(ordinal = spec.id, "failed to remove network: {cleanup:#}");
                }
                remove_sockets(&self.layout.vm_working_dir(spec.id));
                Err(err)
            }
        }
    }

    async fn wait_ready(&self, spec: &VmSpec, instance: &ChInstance) -> Result<()> {
        let deadline = Instant::now() + self.timing.boot_timeout;
        let probe = args(["uname", "-a"]);
        loop {
            if let Some(status) = instance.cloud_hypervisor.lock().await.try_wait()? {
                bail!("cloud-hypervisor exited during boot with {status}");
            }
            match self.guest.run(spec, &probe).await {
                Ok(output) if output.success() => {
                    info!(ordinal = spec.id, "{}", output.stdout.trim());
                    return Ok(());
                }
                _ if Instant::now() >= deadline => {
                    bail!(
                        "{} not reachable within {:?}",
                        spec.ip(),
                        self.timing.boot_timeout
                    );
                }
                _ => tokio::time::sleep(self.timing.boot_poll).await,
            }
        }
    }

    async fn stop(&self, spec: &VmSpec, instance: ChInstance) -> Result<()> {
        let ChInstance {
            cloud_hypervisor,
            virtiofsd,
        } = instance;
        let mut errors = Vec::new();
        if let Err(err) = terminate(cloud_hypervisor.into_inner(), self.timing.stop_timeout).await
        {
            errors.push(err.context("cloud-hypervisor"));
        }
        errors.extend(self.terminate_all(virtiofsd.into_inner()).await);
        remove_sockets(&self.layout.vm_working_dir(spec.id));
        if let Err(err) = self.network.remove(spec).await {
            errors.push(err.context("network"));
        }

        if errors.is_empty() {
            return Ok(());
        }
        let messages: Vec<String> = errors.iter().map(|err| format!("{err:#}")).collect();
        bail!("{}", messages.join("; "))
    }
}

/// Sends SIGTERM and waits up to `grace` before killing the process.
pub async fn terminate(mut child: Child, grace: Duration) -> Result<()> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    // SAFETY: `pid` belongs to a child we own and have not reaped yet
    let signaled = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if signaled != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context(format!("failed to signal pid {pid}"));
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(pid, "exited with {}", status?);
            Ok(())
        }
        Err(_) => {
            warn!(pid, "did not exit after SIGTERM, killing");
            child.kill().await.context("failed to kill")
        }
    }
}

/// Removes sockets left behind in a VM working directory.
pub fn remove_sockets(dir: &Path) {
    for socket in [VIRTIOFSD_SOCKET, VIRTIOFSD_OUTPUT_SOCKET, API_SOCKET] {
        match std::fs::remove_file(dir.join(socket)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(socket, "failed to remove socket: {err}"),
        }
    }
}
