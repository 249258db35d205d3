//! Host-thread task queue
//!
//! Host callables only run on the thread that created the engine. Other
//! threads post work here and the host drains it by pumping, which is how
//! async completions and cross-thread callbacks reach the host.

use flume::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{FfiError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    host: ThreadId,
}

/// Queue of tasks to run on the host thread
#[derive(Clone)]
pub struct HostDispatcher {
    inner: Arc<Inner>,
}

impl HostDispatcher {
    /// Dispatcher owned by the calling thread
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver,
                host: thread::current().id(),
            }),
        }
    }

    #[inline]
    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.inner.host
    }

    /// Queue `task` for the host thread
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        // The receiver lives in `inner`, so the channel is never disconnected
        let _ = self.inner.sender.send(Box::new(task));
    }

    /// Run every task queued so far; returns how many ran
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.inner.receiver.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one task, then drain the queue
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.inner.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Pump until `done` returns true or `timeout` elapses
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;

        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump_timeout((deadline - now).min(Duration::from_millis(10)));
        }
        true
    }

    /// Run `f` on the host thread and wait for its result
    ///
    /// Runs inline when already on the host thread. From any other thread
    /// this blocks until the host pumps.
    pub fn call_on_host<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_host_thread() {
            return Ok(f());
        }

        let (tx, rx) = bounded(1);
        self.post(move || {
            let _ = tx.send(f());
        });

        rx.recv()
            .map_err(|_| FfiError::usage("Host dispatcher dropped a pending callback"))
    }

    /// Tasks waiting for the host
    pub fn pending(&self) -> usize {
        self.inner.receiver.len()
    }
}

impl Default for HostDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
