//! gapbs betweenness centrality, one trial at a time on every guest.

use error_stack::Report;
use futures::future::join_all;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::BenchmarkContext;
use super::BenchmarkDetail;
use crate::config::HostLayout;
use crate::domain::traits::args;
use crate::error::BenchmarkError;

const TRIAL_TIME: &str = "Trial Time:";

fn trial_command(layout: &HostLayout, iterations: u32) -> Vec<String> {
    vec![
        "/bin/time".to_string(),
        "-v".to_string(),
        "--".to_string(),
        layout.gapbs_dir.join("bc").display().to_string(),
        "-n".to_string(),
        "1".to_string(),
        "-i".to_string(),
        iterations.to_string(),
        "-f".to_string(),
        layout.gapbs_dir.join(&layout.gap_graph).display().to_string(),
    ]
}

/// Every `Trial Time:` value printed by gapbs, in seconds.
fn trial_times(output: &str) -> Vec<f64> {
    output
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(TRIAL_TIME))
        .filter_map(|time| time.trim().parse().ok())
        .collect()
}

pub(super) async fn run<I>(
    ctx: &BenchmarkContext<'_, I>,
    trials: u32,
    iterations: u32,
) -> Result<BenchmarkDetail, Report<BenchmarkError>> {
    let command = trial_command(ctx.layout, iterations);
    let mut logs = vec![String::new(); ctx.fleet.len()];
    let mut times = vec![Vec::new(); ctx.fleet.len()];

    let mut outcome = Ok(());
    for trial in 0..trials {
        info!(trial, trials, "gap_bc trial started");
        if let Err(report) = run_trial(ctx, &command, trial, &mut logs, &mut times).await {
            outcome = Err(report);
            break;
        }
    }

    let cleanup = cleanup(ctx, &logs).await;
    outcome?;
    cleanup?;
    info!("gap_bc workload complete");
    Ok(BenchmarkDetail::Graph { trial_times: times })
}

async fn run_trial<I>(
    ctx: &BenchmarkContext<'_, I>,
    command: &[String],
    trial: u32,
    logs: &mut [String],
    times: &mut [Vec<f64>],
) -> Result<(), Report<BenchmarkError>> {
    let outputs = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, command))).await;

    let mut failure: Option<Report<BenchmarkError>> = None;
    for (index, (vm, output)) in ctx.fleet.specs().zip(outputs).enumerate() {
        let ordinal = vm.id;
        let report = match output {
            Ok(output) => {
                logs[index].push_str(&output.stdout);
                logs[index].push_str(&output.stderr);
                let measured = trial_times(&output.stdout);
                if output.success() && !measured.is_empty() {
                    times[index].extend(measured);
                    continue;
                }
                Report::new(BenchmarkError::NonZeroExit {
                    ordinal,
                    code: output.code(),
                })
                .attach_printable(format!("trial {trial}: {}", output.stderr.trim()))
            }
            Err(err) => Report::new(BenchmarkError::NonZeroExit { ordinal, code: -1 })
                .attach_printable(format!("trial {trial}: {err:#}")),
        };
        match failure.as_mut() {
            Some(failure) => failure.extend_one(report),
            None => failure = Some(report),
        }
    }
    failure.map_or(Ok(()), Err)
}

async fn cleanup<I>(
    ctx: &BenchmarkContext<'_, I>,
    logs: &[String],
) -> Result<(), Report<BenchmarkError>> {
    let rmmod = args(["sudo", "rmmod", "manual_events"]);
    let unloaded = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &rmmod))).await;
    for (vm, unloaded) in ctx.fleet.specs().zip(unloaded) {
        match unloaded {
            Ok(output) if output.success() => {}
            Ok(output) => debug!(
                ordinal = vm.id,
                status = output.code(),
                "manual_events not unloaded: {}",
                output.stderr.trim()
            ),
            Err(err) => debug!(ordinal = vm.id, "manual_events not unloaded: {err:#}"),
        }
    }

    let dmesg = args(["sudo", "dmesg"]);
    let dmesgs = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &dmesg))).await;

    let mut combined = String::new();
    for ((vm, log), dmesg) in ctx.fleet.specs().zip(logs).zip(dmesgs) {
        ctx.save_artifact(vm.id, "gap_bc.log", log).await?;
        match dmesg {
            Ok(output) => ctx.save_artifact(vm.id, "dmesg.log", &output.stdout).await?,
            Err(err) => warn!(ordinal = vm.id, "failed to collect dmesg: {err:#}"),
        }
        combined.push_str(&format!("vm{} gap_bc:\n{log}\n", vm.id));
    }

    let path = ctx.run_dir.join("gap_bc.log");
    tokio::fs::write(&path, combined).await.map_err(|err| {
        Report::new(BenchmarkError::Artifact {
            path: path.display().to_string(),
        })
        .attach_printable(err.to_string())
    })
}

/// Extracts trial times from a combined log with `vm<i> gap_bc:` sections,
/// one list per section in order of appearance.
pub fn parse_gap_log(log: &str) -> Vec<Vec<f64>> {
    let mut sections: Vec<Vec<f64>> = Vec::new();
    let mut in_section = false;
    for line in log.lines() {
        match section_header(line) {
            Some("gap_bc") => {
                sections.push(Vec::new());
                in_section = true;
            }
            Some(_) => in_section = false,
            None if in_section => {
                if let Some(section) = sections.last_mut() {
                    section.extend(trial_times(line));
                }
            }
            None => {}
        }
    }
    sections
}

/// Recognizes `vm<i> <kind>:` and returns `<kind>`.
fn section_header(line: &str) -> Option<&str> {
    let (vm, rest) = line.split_once(' ')?;
    let id = vm.strip_prefix("vm")?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kind = rest.strip_suffix(':')?;
    (!kind.is_empty() && !kind.contains(' ')).then_some(kind)
}
