//! Interoperability - native calls driven by runtime descriptors
//!
//! Design: libffi-backed calls with descriptor-driven marshaling
//!
//! Architecture:
//! - `abi.rs` - calling conventions and libffi call interfaces
//! - `library.rs` - dynamic library loading (dlopen/LoadLibrary)
//! - `marshal.rs` - host value <-> native memory conversions
//! - `call.rs` - call lifecycle (prepare, execute, complete)

pub(crate) mod abi;
pub(crate) mod call;
mod library;
pub(crate) mod marshal;

pub use abi::CallConvention;
pub use call::{Call, CallResult, CallState};
pub use library::Library;

pub(crate) use abi::CallInterface;

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by calls, relays and decoders
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub calls: AtomicU64,
    pub async_calls: AtomicU64,
    pub relays: AtomicU64,
    pub disposed: AtomicU64,
    pub failures: AtomicU64,
}

impl StatsCounters {
    pub fn snapshot(&self, libraries_loaded: u64) -> InteropStats {
        InteropStats {
            calls_made: self.calls.load(Ordering::Relaxed),
            async_calls: self.async_calls.load(Ordering::Relaxed),
            callbacks_relayed: self.relays.load(Ordering::Relaxed),
            values_disposed: self.disposed.load(Ordering::Relaxed),
            call_failures: self.failures.load(Ordering::Relaxed),
            libraries_loaded,
        }
    }
}

/// Interop statistics for monitoring
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: u64,
    pub async_calls: u64,
    pub callbacks_relayed: u64,
    pub values_disposed: u64,
    pub call_failures: u64,
    pub libraries_loaded: u64,
}
