//! Error types for the musical-time engine

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum TactusError {
    /// A persisted record is missing a required attribute or carries an
    /// out-of-range value. The whole load is aborted.
    #[error("Construction failure: {0}")]
    Construction(String),

    /// A proposed edit failed the solved-map check; the live map is untouched.
    #[error("Edit would leave the tempo map unsolved")]
    UnsolvableEdit,

    /// A section was placed somewhere it cannot legally live.
    #[error("Illegal position: {0}")]
    IllegalPosition(String),

    /// Two sections of the same kind share a pulse (load-time).
    #[error("Multiple {kind} definitions found at pulse {pulse}")]
    DuplicatePosition { kind: &'static str, pulse: f64 },

    /// A realtime-only query could not acquire the read lock.
    #[error("Could not lock tempo map")]
    Contention,
}

/// Result type alias
pub type TactusResult<T> = Result<T, TactusError>;
