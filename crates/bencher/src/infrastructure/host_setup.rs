//! One-off host preparation before benchmarking.
//!
//! Every step is a shell snippet with a stable name so individual steps can
//! be skipped from the command line.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use tracing::info;

use crate::config::HostLayout;
use crate::domain::traits::args;
use crate::domain::traits::HostShell;

/// Scaling cap applied to every host CPU, in kHz
pub const MAX_CPU_FREQ_KHZ: u32 = 3_000_000;

#[derive(Debug, Display)]
pub enum SetupError {
    #[display("Unknown host setup step `{name}`")]
    UnknownStep { name: String },
    #[display("Host setup step `{name}` failed")]
    StepFailed { name: &'static str },
}

impl Error for SetupError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub name: &'static str,
    pub script: String,
}

/// Setup steps in execution order.
pub fn steps(layout: &HostLayout) -> Vec<SetupStep> {
    let step = |name, script: String| SetupStep { name, script };
    vec![
        step(
            "pmem",
            "sudo daxctl reconfigure-device --human --mode=system-ram all".to_string(),
        ),
        step(
            "network",
            "sudo systemctl --no-pager --full start libvirtd".to_string(),
        ),
        step(
            "freq",
            format!(
                "echo {MAX_CPU_FREQ_KHZ} | sudo tee /sys/devices/system/cpu/cpu*/cpufreq/scaling_max_freq"
            ),
        ),
        step("numa", "sudo sysctl -w kernel.numa_balancing=0".to_string()),
        step(
            "swap",
            "sudo swapon --noheadings --show=NAME | xargs -r -n1 sudo swapoff || true".to_string(),
        ),
        step(
            "clean",
            format!(
                "find {} -name '*.socket' -delete",
                layout.project_dir.display()
            ),
        ),
    ]
}

/// Runs every step not named in `skip`, stopping at the first failure.
///
/// Returns the names of the steps that ran.
pub async fn setup_host(
    host: &dyn HostShell,
    layout: &HostLayout,
    skip: &[String],
) -> Result<Vec<&'static str>, Report<SetupError>> {
    let steps = steps(layout);
    if let Some(unknown) = skip
        .iter()
        .find(|name| !steps.iter().any(|step| step.name == name.as_str()))
    {
        return Err(Report::new(SetupError::UnknownStep {
            name: unknown.clone(),
        })
        .attach_printable(format!(
            "known steps: {}",
            steps
                .iter()
                .map(|step| step.name)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let mut ran = Vec::new();
    for step in steps {
        if skip.iter().any(|name| name == step.name) {
            info!(step = step.name, "skipped");
            continue;
        }
        info!(step = step.name, script = %step.script, "running host setup step");
        let failed = |attachment: String| {
            Report::new(SetupError::StepFailed { name: step.name }).attach_printable(attachment)
        };
        let output = host
            .run("sh", &args(["-c", step.script.as_str()]), None)
            .await
            .map_err(|err| failed(format!("{err:#}")))?;
        if !output.success() {
            return Err(failed(format!(
                "exit status {}: {}",
                output.code(),
                output.stderr.trim()
            )));
        }
        ran.push(step.name);
    }
    Ok(ran)
}
