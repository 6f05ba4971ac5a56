pub mod cli;
pub mod fleet;
pub mod host;
pub mod ycsb;

pub use cli::*;
pub use fleet::*;
pub use host::*;
pub use ycsb::*;
