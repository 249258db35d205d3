//! Error taxonomy for the engine
//!
//! Every fallible operation returns [`FfiError`]. Construction-time errors
//! surface synchronously and leave the registry untouched; resource
//! exhaustion is always reported, never degraded.

use thiserror::Error;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    /// Bad arity, bad value kind or disallowed usage at a call site
    #[error("argument error: {0}")]
    Argument(String),

    /// Duplicate name, empty aggregate, oversize type, bad alignment
    #[error("type definition error: {0}")]
    TypeDefinition(String),

    /// Unknown type name or missing symbol
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Arena pool or trampoline table exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Called code failed in a way the engine could observe
    #[error("native failure: {0}")]
    NativeFailure(String),

    /// Scratch stack of an arena ran out
    #[error("scratch stack overflow: needed {needed} bytes, {available} available")]
    StackOverflow { needed: usize, available: usize },

    /// Fatal misuse (busy arena, stale trampoline, wrong call state)
    #[error("usage error: {0}")]
    Usage(String),

    /// Invalid or frozen configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Async call cancelled before it was dispatched to a worker
    #[error("call cancelled before dispatch")]
    Cancelled,
}

/// Fieldless discriminant of [`FfiError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Argument,
    TypeDefinition,
    Resolution,
    ResourceExhausted,
    NativeFailure,
    StackOverflow,
    Usage,
    Config,
    Cancelled,
}

impl FfiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Argument(_) => ErrorKind::Argument,
            Self::TypeDefinition(_) => ErrorKind::TypeDefinition,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::NativeFailure(_) => ErrorKind::NativeFailure,
            Self::StackOverflow { .. } => ErrorKind::StackOverflow,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub(crate) fn definition(msg: impl Into<String>) -> Self {
        Self::TypeDefinition(msg.into())
    }

    pub(crate) fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub(crate) fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

impl From<libloading::Error> for FfiError {
    fn from(err: libloading::Error) -> Self {
        Self::Resolution(err.to_string())
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, FfiError>;
