//! Concurrency - host thread affinity and async calls
//!
//! Architecture:
//! - `context.rs` - thread-local record of the executing native call
//! - `dispatcher.rs` - task queue drained on the host thread
//! - `async_call.rs` - worker pool running prepared calls

mod async_call;
pub(crate) mod context;
mod dispatcher;

pub use async_call::{AsyncCoordinator, AsyncHandle};
pub use dispatcher::HostDispatcher;
