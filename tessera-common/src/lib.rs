//! Shared building blocks for a tessera node: errors, hashing, keys,
//! hinted encoding and the consensus data model.

pub mod crypto;
pub mod encoding;
pub mod env;
pub mod error;
pub mod hint;
pub mod utils;

pub use error::{Result, TesseraError};
