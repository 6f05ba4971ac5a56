//! Per-VM tap devices and static DHCP leases on the libvirt default network.

use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use tracing::info;
use tracing::warn;

use crate::domain::traits::args;
use crate::domain::traits::HostShell;
use crate::domain::vm::VmSpec;

pub const LIBVIRT_NETWORK: &str = "default";
pub const BRIDGE: &str = "virbr0";

pub struct TapNetwork {
    host: Arc<dyn HostShell>,
}

impl TapNetwork {
    pub fn new(host: Arc<dyn HostShell>) -> Self {
        Self { host }
    }

    fn dhcp_host(vm: &VmSpec) -> String {
        format!("<host mac='{}' ip='{}' />", vm.mac(), vm.ip())
    }

    fn dhcp_update(vm: &VmSpec, command: &str) -> Vec<String> {
        args([
            "virsh".to_string(),
            "--connect".to_string(),
            "qemu:///system".to_string(),
            "net-update".to_string(),
            LIBVIRT_NETWORK.to_string(),
            command.to_string(),
            "ip-dhcp-host".to_string(),
            Self::dhcp_host(vm),
            "--live".to_string(),
            "--config".to_string(),
        ])
    }

    async fn sudo(&self, args: Vec<String>) -> Result<()> {
        let output = self.host.run("sudo", &args, None).await?;
        if !output.success() {
            bail!(
                "`sudo {}` exited with status {}: {}",
                args.join(" "),
                output.code(),
                output.stderr.trim()
            );
        }
        Ok(())
    }

    /// Reserves the VM's address and attaches its tap device to the bridge.
    pub async fn create(&self, vm: &VmSpec) -> Result<()> {
        let tap = vm.tap();
        self.sudo(Self::dhcp_update(vm, "add-last")).await?;
        if let Err(err) = self.attach_tap(&tap).await {
            self.release_lease(vm).await;
            return Err(err);
        }
        info!(ordinal = vm.id, tap, ip = %vm.ip(), "network created");
        Ok(())
    }

    async fn attach_tap(&self, tap: &str) -> Result<()> {
        self.sudo(args(["ip", "tuntap", "add", tap, "mode", "tap"]))
            .await?;
        if let Err(err) = self.sudo(args(["brctl", "addif", BRIDGE, tap])).await {
            if let Err(cleanup) = self.sudo(args(["ip", "tuntap", "del", tap, "mode", "tap"])).await {
                warn!(tap, "failed to delete tap device: {cleanup:#}");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn release_lease(&self, vm: &VmSpec) {
        if let Err(err) = self.sudo(Self::dhcp_update(vm, "delete")).await {
            warn!(ordinal = vm.id, "failed to release dhcp lease: {err:#}");
        }
    }

    /// Undoes [`TapNetwork::create`], attempting every step.
    pub async fn remove(&self, vm: &VmSpec) -> Result<()> {
        let tap = vm.tap();
        let lease = self.sudo(Self::dhcp_update(vm, "delete")).await;
        let device = self
            .sudo(args(["ip", "tuntap", "del", tap.as_str(), "mode", "tap"]))
            .await;
        lease?;
        device
    }
}
