//! A tessera node: JSON design document, logging, runtime wiring and the
//! `tessera-node` command line.

pub mod cli;
pub mod config;
pub mod runtime;
pub mod setup;

pub use config::NodeDesign;
pub use runtime::{build_runtime, init_genesis, start_node, NodeParts, NodeRuntime};

use tessera_common::error::TesseraError;

/// Process exit code for an error that ends the node.
pub fn exit_code(err: &TesseraError) -> u8 {
    match err {
        TesseraError::Storage(_) | TesseraError::Io(_) => 2,
        TesseraError::ConsensusBroken(_) => 3,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&TesseraError::Config("threshold".into())), 1);
        assert_eq!(exit_code(&TesseraError::Storage("locked".into())), 2);
        assert_eq!(exit_code(&TesseraError::ConsensusBroken("unknown node".into())), 3);
        assert_eq!(exit_code(&TesseraError::Network("bad multiaddr".into())), 1);
    }
}
