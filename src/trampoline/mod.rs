//! Trampolines - native function pointers that call back into the host
//!
//! Architecture:
//! - `pool.rs` - fixed-capacity slot table of libffi closures
//! - `relay.rs` - the relay every closure enters through

mod pool;
mod relay;

pub(crate) use pool::CallOwner;
pub use pool::TrampolinePool;

#[cfg(test)]
mod tests;
