//! Scoped provisioning of a VM fleet.
//!
//! A [`Fleet`] only ever exists inside [`Provisioner::scope`]. Provisioning is
//! all-or-nothing: when VM `k` fails to launch, VMs `0..k` are stopped in
//! reverse order and the caller never sees the partial fleet. Once the fleet
//! is handed to the body, it is torn down on every exit path, including a
//! panicking body.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::FleetConfig;
use crate::domain::resources::HostCycler;
use crate::domain::traits::Hypervisor;
use crate::domain::vm::VmSpec;
use crate::error::FleetError;
use crate::error::RunError;

/// One running VM, exclusively owned by its [`Fleet`].
pub struct VmHandle<I> {
    spec: VmSpec,
    instance: I,
}

impl<I> VmHandle<I> {
    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn ordinal(&self) -> usize {
        self.spec.id
    }

    /// Guest address for issuing commands.
    pub fn endpoint(&self) -> String {
        self.spec.ip()
    }

    pub fn instance(&self) -> &I {
        &self.instance
    }
}

/// Fully provisioned VMs, ordered by ordinal.
pub struct Fleet<I> {
    vms: Vec<VmHandle<I>>,
}

impl<I> Fleet<I> {
    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmHandle<I>> {
        self.vms.iter()
    }

    pub fn specs(&self) -> impl Iterator<Item = &VmSpec> {
        self.vms.iter().map(|vm| &vm.spec)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(vms: impl IntoIterator<Item = (VmSpec, I)>) -> Self {
        Self {
            vms: vms
                .into_iter()
                .map(|(spec, instance)| VmHandle { spec, instance })
                .collect(),
        }
    }
}

pub struct Provisioner<H: Hypervisor> {
    hypervisor: Arc<H>,
}

impl<H: Hypervisor> Provisioner<H> {
    pub fn new(hypervisor: Arc<H>) -> Self {
        Self { hypervisor }
    }

    /// Provisions `config.count` VMs, runs `body` against them and tears
    /// them down afterwards, whatever the body's outcome.
    pub async fn scope<T, F>(
        &self,
        config: &FleetConfig,
        cycler: &mut HostCycler,
        body: F,
    ) -> Result<T, Report<RunError>>
    where
        F: for<'f> FnOnce(&'f Fleet<H::Instance>) -> BoxFuture<'f, Result<T, Report<RunError>>>,
    {
        let fleet = self
            .provision(config, cycler)
            .await
            .change_context(RunError::Provision)?;
        info!(count = fleet.len(), "all vm started");
        for vm in fleet.iter() {
            info!(ordinal = vm.ordinal(), endpoint = %vm.endpoint(), "vm ready");
        }

        let outcome = AssertUnwindSafe(body(&fleet)).catch_unwind().await;
        let teardown = self.teardown(fleet).await;

        match outcome {
            Ok(Ok(value)) => {
                teardown.change_context(RunError::Teardown)?;
                Ok(value)
            }
            Ok(Err(mut report)) => {
                if let Err(teardown) = teardown {
                    report.extend_one(teardown.change_context(RunError::Teardown));
                }
                Err(report)
            }
            Err(panic) => {
                if let Err(teardown) = teardown {
                    error!("fleet teardown after panic failed: {teardown:?}");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn provision(
        &self,
        config: &FleetConfig,
        cycler: &mut HostCycler,
    ) -> Result<Fleet<H::Instance>, Report<FleetError>> {
        cycler.ensure_capacity(config)?;

        let mut vms: Vec<VmHandle<H::Instance>> = Vec::with_capacity(config.count);
        for ordinal in 0..config.count {
            let assignment = match cycler.assign(ordinal, config) {
                Ok(assignment) => assignment,
                Err(report) => {
                    self.rollback(vms).await;
                    return Err(report);
                }
            };
            let spec = VmSpec::new(config, assignment);
            info!(ordinal, affinity = %spec.affinity_arg(), "launching vm");
            match self.hypervisor.launch(&spec).await {
                Ok(instance) => vms.push(VmHandle { spec, instance }),
                Err(err) => {
                    error!(ordinal, "failed to launch vm: {err:#}");
                    self.rollback(vms).await;
                    return Err(Report::new(FleetError::ProvisionFailure { ordinal })
                        .attach_printable(format!("{err:#}")));
                }
            }
        }

        let readiness = join_all(
            vms.iter()
                .map(|vm| self.hypervisor.wait_ready(&vm.spec, &vm.instance)),
        )
        .await;
        let not_ready = readiness
            .into_iter()
            .enumerate()
            .find_map(|(ordinal, ready)| ready.err().map(|err| (ordinal, err)));
        if let Some((ordinal, err)) = not_ready {
            error!(ordinal, "vm did not become ready: {err:#}");
            self.rollback(vms).await;
            return Err(Report::new(FleetError::ReadinessFailure { ordinal })
                .attach_printable(format!("{err:#}")));
        }

        Ok(Fleet { vms })
    }

    async fn rollback(&self, vms: Vec<VmHandle<H::Instance>>) {
        if vms.is_empty() {
            return;
        }
        warn!(count = vms.len(), "rolling back partially provisioned fleet");
        if let Err(report) = self.stop_all(vms).await {
            error!("rollback failed: {report:?}");
        }
    }

    async fn teardown(&self, fleet: Fleet<H::Instance>) -> Result<(), Report<FleetError>> {
        info!(count = fleet.len(), "tearing down fleet");
        self.stop_all(fleet.vms).await
    }

    /// Stops VMs in reverse creation order, attempting every one of them.
    async fn stop_all(&self, vms: Vec<VmHandle<H::Instance>>) -> Result<(), Report<FleetError>> {
        let mut failures: Option<Report<FleetError>> = None;
        for VmHandle { spec, instance } in vms.into_iter().rev() {
            let ordinal = spec.id;
            match self.hypervisor.stop(&spec, instance).await {
                Ok(()) => info!(ordinal, "vm stopped"),
                Err(err) => {
                    error!(ordinal, "failed to stop vm: {err:#}");
                    let report = Report::new(FleetError::Teardown { ordinal })
                        .attach_printable(format!("{err:#}"));
                    match failures.as_mut() {
                        Some(failures) => failures.extend_one(report),
                        None => failures = Some(report),
                    }
                }
            }
        }
        failures.map_or(Ok(()), Err)
    }
}
