use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("invalid hint: {0}")]
    InvalidHint(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("consensus broken: {0}")]
    ConsensusBroken(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other: {0}")]
    Other(String),
}

impl TesseraError {
    /// Invalid entities, bad signatures and unknown hints are all treated as
    /// "do not trust this" by callers.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            TesseraError::Invalid(_) | TesseraError::SignatureInvalid(_) | TesseraError::InvalidHint(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, TesseraError::Duplicate(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TesseraError::Timeout(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, TesseraError::Storage(_) | TesseraError::Io(_))
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, TesseraError::ConsensusBroken(_))
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
