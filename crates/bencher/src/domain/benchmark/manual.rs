//! Ad-hoc shell commands broadcast to every guest.

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::BenchmarkContext;
use super::BenchmarkDetail;
use crate::domain::traits::args;
use crate::domain::traits::VmInstance;
use crate::error::BenchmarkError;

pub(super) async fn run<I: VmInstance>(
    ctx: &BenchmarkContext<'_, I>,
    command: &str,
    wait: bool,
    hold: bool,
) -> Result<BenchmarkDetail, Report<BenchmarkError>> {
    // guests see the project directory through virtiofs, so the script is
    // written there rather than copied into each guest
    let script = write_script(&ctx.layout.project_dir, command)?;
    let script_path = script.path().display().to_string();

    let exit_codes = if wait {
        Some(run_and_wait(ctx, &script_path).await?)
    } else {
        fire_and_forget(ctx, &script_path).await;
        // the detached sessions read the script after we return
        script
            .into_temp_path()
            .keep()
            .change_context(BenchmarkError::Artifact {
                path: script_path.clone(),
            })?;
        None
    };

    if hold {
        info!("wait for manual termination of every vm");
        let exits = join_all(ctx.fleet.iter().map(|vm| vm.instance().wait_exit())).await;
        for (ordinal, exit) in exits.into_iter().enumerate() {
            if let Err(err) = exit {
                warn!(ordinal, "failed to wait for vm exit: {err:#}");
            }
        }
    }

    Ok(BenchmarkDetail::Manual { exit_codes })
}

fn write_script(dir: &Path, command: &str) -> Result<NamedTempFile, Report<BenchmarkError>> {
    let context = || BenchmarkError::Artifact {
        path: dir.display().to_string(),
    };
    let mut script = tempfile::Builder::new()
        .prefix(".manual-")
        .suffix(".sh")
        .tempfile_in(dir)
        .change_context_lazy(context)?;
    script
        .write_all(command.as_bytes())
        .and_then(|()| script.flush())
        .change_context_lazy(context)?;
    std::fs::set_permissions(script.path(), Permissions::from_mode(0o666))
        .change_context_lazy(context)?;
    Ok(script)
}

async fn run_and_wait<I>(
    ctx: &BenchmarkContext<'_, I>,
    script_path: &str,
) -> Result<Vec<i32>, Report<BenchmarkError>> {
    let command = args(["bash", script_path]);
    let outputs = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &command))).await;

    let mut codes = Vec::with_capacity(outputs.len());
    let mut failures: Option<Report<BenchmarkError>> = None;
    for (vm, output) in ctx.fleet.specs().zip(outputs) {
        let ordinal = vm.id;
        let report = match output {
            Ok(output) => {
                ctx.save_artifact(ordinal, "manual.stdout", &output.stdout)
                    .await?;
                ctx.save_artifact(ordinal, "manual.stderr", &output.stderr)
                    .await?;
                codes.push(output.code());
                if output.success() {
                    continue;
                }
                Report::new(BenchmarkError::NonZeroExit {
                    ordinal,
                    code: output.code(),
                })
                .attach_printable(output.stderr.trim().to_string())
            }
            Err(err) => {
                codes.push(-1);
                Report::new(BenchmarkError::NonZeroExit { ordinal, code: -1 })
                    .attach_printable(format!("{err:#}"))
            }
        };
        match failures.as_mut() {
            Some(failures) => failures.extend_one(report),
            None => failures = Some(report),
        }
    }

    match failures {
        Some(failures) => Err(failures),
        None => {
            info!(?codes, "manual command finished on every vm");
            Ok(codes)
        }
    }
}

/// Starts the script in a detached tmux session on every guest. Whether the
/// command eventually succeeds is never observed.
async fn fire_and_forget<I>(ctx: &BenchmarkContext<'_, I>, script_path: &str) {
    let command = args([
        "tmux".to_string(),
        "new".to_string(),
        "-d".to_string(),
        format!("bash {script_path}"),
    ]);
    let launched = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &command))).await;
    for (ordinal, launched) in launched.into_iter().enumerate() {
        match launched {
            Ok(output) => debug!(ordinal, status = output.code(), "manual command detached"),
            Err(err) => debug!(ordinal, "manual command not detached: {err:#}"),
        }
    }
    info!("manual command started without waiting");
}
