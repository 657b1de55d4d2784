//! Error types for Trellis.

use crate::contract::ContractViolation;
use crate::object::ObjectError;
#[cfg(feature = "tokio")]
use crate::promise::PromiseError;

/// The main error type for Trellis operations.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    /// A structural contract was broken.
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
    /// Object-related error.
    #[error("object error: {0}")]
    Object(#[from] ObjectError),
    /// An asynchronous operation failed.
    #[cfg(feature = "tokio")]
    #[error("promise error: {0}")]
    Promise(#[from] PromiseError),
}

/// A specialized Result type for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;
