use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

const MAX_ADDRESS_SIZE: usize = 100;

/// Node address. Totally ordered by its string form; round-robin suffrage
/// relies on that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let a = Address(s.into());
        a.is_valid()?;
        Ok(a)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(TesseraError::Invalid("empty address".into()));
        }
        if self.0.len() > MAX_ADDRESS_SIZE {
            return Err(TesseraError::Invalid(format!("address too long: {}", self.0.len())));
        }
        if self.0.chars().any(|c| c.is_whitespace()) {
            return Err(TesseraError::Invalid(format!("address has whitespace: {:?}", self.0)));
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        Address::new(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}
