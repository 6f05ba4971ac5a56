//! Command runners backed by local processes.

use std::path::Path;
use std::process::Output;
use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use tokio::process::Command;
use tracing::debug;

use crate::config::DEFAULT_SSH_ARGS;
use crate::domain::traits::CommandOutput;
use crate::domain::traits::GuestShell;
use crate::domain::traits::HostShell;
use crate::domain::vm::VmSpec;

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

async fn execute(program: &str, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    debug!(program, ?args, ?cwd, "running command");
    let output = command
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    Ok(output.into())
}

/// Runs programs on the host as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

#[async_trait::async_trait]
impl HostShell for LocalShell {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        execute(program, args, cwd).await
    }
}

/// Runs guest commands through the `ssh` client.
#[derive(Debug, Clone)]
pub struct SshShell {
    options: Vec<String>,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            options: DEFAULT_SSH_ARGS.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl SshShell {
    /// Full ssh argument vector for running `args` on `vm`.
    pub fn command(&self, vm: &VmSpec, args: &[String]) -> Vec<String> {
        let mut command = self.options.clone();
        command.push(vm.ip());
        command.extend_from_slice(args);
        command
    }
}

#[async_trait::async_trait]
impl GuestShell for SshShell {
    async fn run(&self, vm: &VmSpec, args: &[String]) -> Result<CommandOutput> {
        execute("ssh", &self.command(vm, args), None)
            .await
            .with_context(|| format!("ssh to {} failed", vm.name()))
    }
}
