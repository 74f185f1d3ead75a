pub mod builder;
pub mod maestro;

pub use builder::{build_runtime, init_genesis, open_storage, start_node, NodeParts, NodeRuntime};
pub use maestro::Maestro;
