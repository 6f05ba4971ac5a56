//! Guest preparation applied to every VM before benchmarking.
//!
//! Module insertion is best-effort: a VM that fails is reported and the
//! others are still prepared. The NUMA balancing toggle is all-or-nothing.

use std::path::Path;

use error_stack::Report;
use futures::future::join_all;
use tracing::info;
use tracing::warn;

use crate::domain::fleet::Fleet;
use crate::domain::traits::args;
use crate::domain::traits::GuestShell;
use crate::domain::vm::VmSpec;
use crate::error::GuestError;

/// A guest kernel module and its insertion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelModule {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

/// Modules backing balloon and memory tiering instrumentation, in load order.
pub const BALLOON_MODULES: &[KernelModule] = &[
    KernelModule {
        name: "balloon_events",
        params: &[],
    },
    KernelModule {
        name: "virtio_balloon",
        params: &["pebs_enabled=false"],
    },
    KernelModule {
        name: "manual_events",
        params: &[],
    },
];

/// Inserts `modules` into every guest, skipping modules already loaded.
///
/// Returns one report per VM that could not be fully prepared.
pub async fn insert_kernel_modules<I>(
    fleet: &Fleet<I>,
    shell: &dyn GuestShell,
    modules_dir: &Path,
    modules: &[KernelModule],
) -> Vec<Report<GuestError>> {
    let results = join_all(
        fleet
            .specs()
            .map(|vm| insert_into_vm(vm, shell, modules_dir, modules)),
    )
    .await;
    let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        info!("balloon module installed");
    } else {
        warn!(
            failed = failures.len(),
            total = fleet.len(),
            "kernel module insertion failed on some guests"
        );
    }
    failures
}

async fn insert_into_vm(
    vm: &VmSpec,
    shell: &dyn GuestShell,
    modules_dir: &Path,
    modules: &[KernelModule],
) -> Result<(), Report<GuestError>> {
    let failure = |module: &KernelModule| GuestError::ModuleInsertFailure {
        ordinal: vm.id,
        module: module.name.to_string(),
    };

    for module in modules {
        let probe = args([
            "test".to_string(),
            "-d".to_string(),
            format!("/sys/module/{}", module.name),
        ]);
        let loaded = shell
            .run(vm, &probe)
            .await
            .map_err(|err| Report::new(failure(module)).attach_printable(format!("{err:#}")))?;
        if loaded.success() {
            info!(ordinal = vm.id, module = module.name, "module already loaded");
            continue;
        }

        let mut insmod = args([
            "sudo".to_string(),
            "insmod".to_string(),
            modules_dir
                .join(format!("{}.ko", module.name))
                .display()
                .to_string(),
        ]);
        insmod.extend(module.params.iter().map(|param| param.to_string()));
        let output = shell
            .run(vm, &insmod)
            .await
            .map_err(|err| Report::new(failure(module)).attach_printable(format!("{err:#}")))?;
        if !output.success() {
            return Err(Report::new(failure(module))
                .attach_printable(format!("exit status {}: {}", output.code(), output.stderr.trim())));
        }
    }
    Ok(())
}

/// Sets `kernel.numa_balancing` on every guest.
pub async fn set_numa_balancing<I>(
    fleet: &Fleet<I>,
    shell: &dyn GuestShell,
    enabled: bool,
) -> Result<(), Report<GuestError>> {
    let command = args([
        "sudo".to_string(),
        "sysctl".to_string(),
        "-w".to_string(),
        format!("kernel.numa_balancing={}", u8::from(enabled)),
    ]);
    let results = join_all(fleet.specs().map(|vm| {
        let command = &command;
        async move {
            let failure = || Report::new(GuestError::NumaBalancing { ordinal: vm.id });
            match shell.run(vm, command).await {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(failure().attach_printable(format!(
                    "exit status {}: {}",
                    output.code(),
                    output.stderr.trim()
                ))),
                Err(err) => Err(failure().attach_printable(format!("{err:#}"))),
            }
        }
    }))
    .await;

    let mut failures: Option<Report<GuestError>> = None;
    for report in results.into_iter().filter_map(Result::err) {
        match failures.as_mut() {
            Some(failures) => failures.extend_one(report),
            None => failures = Some(report),
        }
    }
    if let Some(failures) = failures {
        return Err(failures);
    }
    info!("guest kernel.numa_balancing enabled: {enabled}");
    Ok(())
}
