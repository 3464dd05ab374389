use thiserror::Error;

use crate::models::Height;

/// Storage related errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The caller asked for something the chain layout does not allow, e.g. appending a block
    /// at a height that does not extend the tip or removing the tip of an empty chain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Could not find block at height {0}")]
    NotFound(Height),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}
