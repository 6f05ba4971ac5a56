//! Capabilities the orchestrator consumes from the outside world.

use std::path::Path;

use anyhow::Result;

use crate::domain::vm::VmSpec;

/// Output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Exit code for reporting, signals map to -1.
    pub fn code(&self) -> i32 {
        self.status.unwrap_or(-1)
    }
}

/// A running VM as seen by the hypervisor that launched it.
#[async_trait::async_trait]
pub trait VmInstance: Send + Sync {
    /// Resolves once the hypervisor process has exited on its own.
    async fn wait_exit(&self) -> Result<()>;
}

/// Starts and stops single VMs.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    type Instance: VmInstance;

    /// Start the VM described by `spec`. Must not leave anything running on error.
    async fn launch(&self, spec: &VmSpec) -> Result<Self::Instance>;

    /// Wait until the guest accepts commands.
    async fn wait_ready(&self, spec: &VmSpec, instance: &Self::Instance) -> Result<()>;

    /// Stop the VM and release everything `launch` acquired.
    async fn stop(&self, spec: &VmSpec, instance: Self::Instance) -> Result<()>;
}

/// Runs commands inside a guest.
///
/// An `Err` means the command could not be issued at all, a command that ran
/// and failed is reported through [`CommandOutput::status`].
#[async_trait::async_trait]
pub trait GuestShell: Send + Sync {
    async fn run(&self, vm: &VmSpec, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the host.
#[async_trait::async_trait]
pub trait HostShell: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>)
        -> Result<CommandOutput>;
}

/// Convenience for building argument vectors from string literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
