//! Async call coordination
//!
//! Prepared calls run on a blocking worker pool. Completion is posted to the
//! host dispatcher, so decoding and the completion callback always happen on
//! the host thread.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use super::HostDispatcher;
use crate::config::MAX_ASYNC_CALLS;
use crate::error::{FfiError, Result};
use crate::interop::{Call, CallResult};
use crate::logging;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a submitted async call
#[derive(Clone)]
pub struct AsyncHandle {
    gate: Arc<AtomicU8>,
}

impl AsyncHandle {
    /// Cancel the call if no worker has picked it up yet
    pub fn cancel(&self) -> bool {
        self.gate
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.load(Ordering::Acquire) == CANCELLED
    }

    /// A worker has started the native call
    pub fn is_started(&self) -> bool {
        self.gate.load(Ordering::Acquire) == RUNNING
    }
}

/// Worker pool for async calls
pub struct AsyncCoordinator {
    runtime: Option<Runtime>,
    dispatcher: HostDispatcher,
}

impl AsyncCoordinator {
    pub fn new(dispatcher: HostDispatcher) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(MAX_ASYNC_CALLS)
            .thread_name("dynffi-worker")
            .build()
            .map_err(|err| FfiError::exhausted(format!("Failed to start async workers: {}", err)))?;

        Ok(Self {
            runtime: Some(runtime),
            dispatcher,
        })
    }

    /// Execute `call` on a worker; `done` runs on the host thread
    ///
    /// A call cancelled before a worker picks it up reports
    /// [`FfiError::Cancelled`] without touching native code.
    pub fn submit<F>(&self, mut call: Call, done: F) -> Result<AsyncHandle>
    where
        F: FnOnce(Result<CallResult>) + Send + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| FfiError::usage("Async workers are shut down"))?;

        let gate = Arc::new(AtomicU8::new(QUEUED));
        let handle = AsyncHandle { gate: gate.clone() };
        let dispatcher = self.dispatcher.clone();
        let name = call.function().name().to_string();
        logging::log_async(&name, "queued");

        runtime.spawn_blocking(move || {
            if gate
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                logging::log_async(&name, "cancelled");
                dispatcher.post(move || {
                    drop(call);
                    done(Err(FfiError::Cancelled));
                });
                return;
            }

            logging::log_async(&name, "running");
            let executed = call.execute();

            dispatcher.post(move || {
                logging::log_async(&name, "completed");
                let result = executed.and_then(|()| call.complete());
                drop(call);
                done(result);
            });
        });

        Ok(handle)
    }
}

impl Drop for AsyncCoordinator {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
