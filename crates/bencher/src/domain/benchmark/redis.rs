//! redis in every guest, loaded by one go-ycsb client per VM on the host.

use error_stack::Report;
use futures::future::join_all;
use tracing::debug;
use tracing::info;

use super::BenchmarkContext;
use super::BenchmarkDetail;
use crate::config::ycsb_preloaded;
use crate::config::YcsbWorkload;
use crate::config::YCSB_OPERATION_COUNT;
use crate::config::YCSB_RECORD_COUNT;
use crate::domain::traits::args;
use crate::domain::traits::CommandOutput;
use crate::domain::vm::VmSpec;
use crate::error::BenchmarkError;

const REDIS_PORT: u16 = 6379;

pub(super) async fn run<I>(
    ctx: &BenchmarkContext<'_, I>,
    workload: YcsbWorkload,
) -> Result<BenchmarkDetail, Report<BenchmarkError>> {
    start_servers(ctx).await?;
    info!("all redis servers started");

    wait_for_preload(ctx).await?;
    info!("ycsb preload complete");

    run_clients(ctx, workload).await?;

    if ctx.perf_event.is_some() {
        collect_perf(ctx).await?;
    }
    info!(workload = workload.name(), "redis ycsb workload complete");
    Ok(BenchmarkDetail::KeyValue {
        workload: workload.name(),
    })
}

fn server_command<I>(ctx: &BenchmarkContext<'_, I>) -> String {
    let mut command = String::new();
    if let Some(event) = ctx.perf_event {
        command.push_str(&format!(
            "sudo perf record --all-user --phys-data --data -z -vv -e {event} -- "
        ));
    }
    command.push_str(&format!(
        "redis-server --save \"\" --appendonly no --protected-mode no --dbfilename {} --dir {}",
        ycsb_preloaded(),
        ctx.layout.project_dir.display()
    ));
    command
}

async fn start_servers<I>(ctx: &BenchmarkContext<'_, I>) -> Result<(), Report<BenchmarkError>> {
    let command = args([
        "tmux".to_string(),
        "new".to_string(),
        "-d".to_string(),
        format!("'{}'", server_command(ctx)),
    ]);
    let started = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &command))).await;
    for (vm, started) in ctx.fleet.specs().zip(started) {
        check(vm, started)?;
    }
    Ok(())
}

async fn wait_for_preload<I>(ctx: &BenchmarkContext<'_, I>) -> Result<(), Report<BenchmarkError>> {
    tokio::time::sleep(ctx.preload.grace).await;

    let expected = YCSB_RECORD_COUNT.to_string();
    let dbsize = args(["redis-cli", "dbsize"]);
    let poll = async {
        loop {
            let sizes = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &dbsize))).await;
            // a server still loading the dump refuses queries
            let loaded = sizes.iter().filter(|size| {
                matches!(size, Ok(output) if output.success() && output.stdout.trim() == expected)
            });
            let loaded = loaded.count();
            if loaded == ctx.fleet.len() {
                return;
            }
            debug!(loaded, total = ctx.fleet.len(), "waiting for ycsb preload");
            tokio::time::sleep(ctx.preload.poll_interval).await;
        }
    };
    tokio::time::timeout(ctx.preload.timeout, poll)
        .await
        .map_err(|_| {
            Report::new(BenchmarkError::BenchmarkFailure { benchmark: "redis" }).attach_printable(
                format!(
                    "not every guest loaded {YCSB_RECORD_COUNT} records within {:?}",
                    ctx.preload.timeout
                ),
            )
        })
}

fn client_args<I>(ctx: &BenchmarkContext<'_, I>, vm: &VmSpec, workload: YcsbWorkload) -> Vec<String> {
    let cpus = ctx
        .client_cpus
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut client = vec![
        format!("--physcpubind={cpus}"),
        format!("--membind={}", ctx.client_membind),
        "--".to_string(),
        ctx.layout.go_ycsb.display().to_string(),
        "run".to_string(),
        "redis".to_string(),
        "-p".to_string(),
        format!("recordcount={YCSB_RECORD_COUNT}"),
        "-p".to_string(),
        format!("operationcount={YCSB_OPERATION_COUNT}"),
        "-p".to_string(),
        format!("threadcount={}", ctx.ncpus),
    ];
    client.extend(workload.go_ycsb_args());
    client.push("-p".to_string());
    client.push(format!("redis.addr={}:{REDIS_PORT}", vm.ip()));
    client
}

async fn run_clients<I>(
    ctx: &BenchmarkContext<'_, I>,
    workload: YcsbWorkload,
) -> Result<(), Report<BenchmarkError>> {
    let clients = join_all(ctx.fleet.specs().map(|vm| async move {
        let client = client_args(ctx, vm, workload);
        let cwd = ctx.layout.vm_working_dir(vm.id);
        ctx.host.run("numactl", &client, Some(cwd.as_path())).await
    }))
    .await;

    let mut outputs = Vec::with_capacity(clients.len());
    for (vm, client) in ctx.fleet.specs().zip(clients) {
        let output = client.map_err(|err| {
            Report::new(BenchmarkError::HostCommand {
                program: "go-ycsb".to_string(),
            })
            .attach_printable(format!("client for vm{}: {err:#}", vm.id))
        })?;
        ctx.save_artifact(vm.id, "ycsb.stdout", &output.stdout).await?;
        ctx.save_artifact(vm.id, "ycsb.stderr", &output.stderr).await?;
        outputs.push((vm.id, output));
    }

    for (ordinal, output) in outputs {
        if !output.success() {
            return Err(Report::new(BenchmarkError::HostCommand {
                program: "go-ycsb".to_string(),
            })
            .attach_printable(format!(
                "client for vm{ordinal} exited with status {}",
                output.code()
            )));
        }
    }
    Ok(())
}

async fn collect_perf<I>(ctx: &BenchmarkContext<'_, I>) -> Result<(), Report<BenchmarkError>> {
    let stop = args(["sudo", "pkill", "redis-server"]);
    let stopped = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &stop))).await;
    for (vm, stopped) in ctx.fleet.specs().zip(stopped) {
        check(vm, stopped)?;
    }

    let script = args([
        "sudo",
        "perf",
        "--no-pager",
        "script",
        "--header",
        "--input=perf.data",
    ]);
    let scripts = join_all(ctx.fleet.specs().map(|vm| ctx.guest.run(vm, &script))).await;
    for (vm, output) in ctx.fleet.specs().zip(scripts) {
        let output = check(vm, output)?;
        ctx.save_artifact(vm.id, "perf-script.txt", &output.stdout)
            .await?;
    }
    Ok(())
}

fn check(
    vm: &VmSpec,
    output: anyhow::Result<CommandOutput>,
) -> Result<CommandOutput, Report<BenchmarkError>> {
    match output {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(Report::new(BenchmarkError::NonZeroExit {
            ordinal: vm.id,
            code: output.code(),
        })
        .attach_printable(output.stderr.trim().to_string())),
        Err(err) => Err(Report::new(BenchmarkError::NonZeroExit {
            ordinal: vm.id,
            code: -1,
        })
        .attach_printable(format!("{err:#}"))),
    }
}
