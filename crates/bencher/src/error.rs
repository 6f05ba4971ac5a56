//! Error contexts reported through `error_stack::Report`.

use core::error::Error;

use derive_more::Display;

/// Invalid user supplied configuration.
#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("Invalid fleet configuration: {message}")]
    InvalidFleet { message: String },
    #[display("Invalid host layout: {message}")]
    InvalidHost { message: String },
}

impl Error for ConfigError {}

/// Errors raised while acquiring, provisioning or releasing a fleet.
#[derive(Debug, Display)]
pub enum FleetError {
    /// The host does not have enough cores for an exclusive binding.
    #[display("Host resources exhausted: {requested} cores requested, {available} available")]
    ResourceExhausted { requested: usize, available: usize },
    #[display("Node {node} is not part of the host topology")]
    UnknownNode { node: u32 },
    #[display("No host node is available for VMs")]
    NoVmNodes,
    #[display("Failed to launch vm{ordinal}")]
    ProvisionFailure { ordinal: usize },
    #[display("vm{ordinal} did not become reachable")]
    ReadinessFailure { ordinal: usize },
    #[display("Failed to stop vm{ordinal}")]
    Teardown { ordinal: usize },
}

impl Error for FleetError {}

/// Errors raised while mutating guest state.
#[derive(Debug, Display)]
pub enum GuestError {
    #[display("Failed to insert module {module} into vm{ordinal}")]
    ModuleInsertFailure { ordinal: usize, module: String },
    #[display("Failed to set kernel.numa_balancing on vm{ordinal}")]
    NumaBalancing { ordinal: usize },
}

impl Error for GuestError {}

/// Errors raised by the active benchmark variant.
#[derive(Debug, Display)]
pub enum BenchmarkError {
    #[display("Benchmark {benchmark} failed")]
    BenchmarkFailure { benchmark: &'static str },
    #[display("Command on vm{ordinal} exited with status {code}")]
    NonZeroExit { ordinal: usize, code: i32 },
    #[display("Host command `{program}` failed")]
    HostCommand { program: String },
    #[display("Failed to write artifact {path}")]
    Artifact { path: String },
}

impl Error for BenchmarkError {}

/// Top level context of one orchestrated run.
#[derive(Debug, Display)]
pub enum RunError {
    #[display("Invalid configuration")]
    Config,
    #[display("Fleet provisioning failed")]
    Provision,
    #[display("Guest preparation failed")]
    GuestPreparation,
    #[display("Benchmark failed")]
    Benchmark,
    #[display("Fleet teardown failed")]
    Teardown,
    #[display("Failed to write run artifacts")]
    Artifacts,
}

impl Error for RunError {}
