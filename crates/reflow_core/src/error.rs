//! Error types for reflow_core

use thiserror::Error;

/// Errors surfaced by the reactive engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// A host field used a name reserved by the engine configuration
    #[error("the field name `{0}` is reserved; reactivated hosts cannot declare it")]
    ReservedField(String),

    /// The container/core has been torn down
    #[error("container is destroyed")]
    Destroyed,

    /// The core failed to wire and is unusable
    #[error("core is in the error state")]
    Errored,

    /// A handle outlived its node
    #[error("unknown container handle")]
    UnknownCell,

    /// No container with the requested field name on this core
    #[error("no field named `{0}` on this core")]
    UnknownField(String),

    /// The stored value is not of the requested type
    #[error("type mismatch reading container `{0}`")]
    TypeMismatch(String),

    /// A recompute function re-entered itself
    #[error("recompute of `{0}` re-entered itself")]
    RecomputeCycle(String),

    /// A recompute function reported failure
    #[error("recompute of `{0}` failed: {1}")]
    RecomputeFailed(String, String),

    /// Sequence index validation failed before any mutation
    #[error("index {index} out of bounds for sequence of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// `set_len` can only truncate
    #[error("cannot grow sequence from length {len} to {requested}")]
    CannotGrow { len: usize, requested: usize },

    /// A buffered stream needs a positive capacity
    #[error("buffered stream capacity must be positive")]
    InvalidCapacity,

    /// A registry name is already bound to a value of a different type
    #[error("registry entry `{0}` holds a different kind of value")]
    RegistryTypeMismatch(String),
}

/// Result type for reflow_core operations
pub type Result<T> = std::result::Result<T, ReactiveError>;
