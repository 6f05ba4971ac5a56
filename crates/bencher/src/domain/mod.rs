pub mod benchmark;
pub mod fleet;
pub mod guest;
pub mod resources;
pub mod traits;
pub mod vm;

#[cfg(test)]
pub(crate) mod mock;

// Re-export the types the orchestrator wires together
pub use benchmark::BenchmarkSpec;
pub use benchmark::Dispatcher;
pub use fleet::Fleet;
pub use fleet::Provisioner;
pub use resources::HostCycler;
pub use resources::HostTopology;
