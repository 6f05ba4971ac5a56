pub mod cloud_hypervisor;
pub mod host_setup;
pub mod logging;
pub mod network;
pub mod shell;
