//! Per-thread record of the native call currently executing
//!
//! Relays consult it to find the arena of the call that invoked them and to
//! report failures back to that call.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::FfiError;
use crate::memory::ArenaLease;

/// First failure raised by relays on behalf of one call
///
/// Shared with the call's transient trampolines, so relays running on
/// other threads can still fail the call.
#[derive(Default)]
pub(crate) struct PendingError(Mutex<Option<FfiError>>);

impl PendingError {
    pub fn set(&self, err: FfiError) {
        let mut pending = self.0.lock();
        if pending.is_none() {
            *pending = Some(err);
        }
    }

    pub fn take(&self) -> Option<FfiError> {
        self.0.lock().take()
    }
}

/// Native call running on this thread
pub(crate) struct ActiveCall {
    pub lease: Arc<ArenaLease>,
    pending: Arc<PendingError>,
}

impl ActiveCall {
    pub fn new(lease: Arc<ArenaLease>, pending: Arc<PendingError>) -> Self {
        Self { lease, pending }
    }

    /// Record a relay failure; the first one wins
    pub fn fail(&self, err: FfiError) {
        self.pending.set(err);
    }

    pub fn take_error(&self) -> Option<FfiError> {
        self.pending.take()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<ActiveCall>>> = const { RefCell::new(None) };
}

/// Innermost active call on this thread
pub(crate) fn current() -> Option<Rc<ActiveCall>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Installs an active call, restoring the enclosing one on drop
pub(crate) struct CallScope {
    previous: Option<Rc<ActiveCall>>,
}

impl CallScope {
    pub fn enter(active: Rc<ActiveCall>) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(active));
        Self { previous }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaPool;

    #[test]
    fn scopes_nest_and_restore() {
        let pool = ArenaPool::new(2, 0);
        let outer = Rc::new(ActiveCall::new(Arc::new(pool.acquire(4096, 4096).unwrap()), Default::default()));
        let inner = Rc::new(ActiveCall::new(Arc::new(pool.acquire(4096, 4096).unwrap()), Default::default()));

        assert!(current().is_none());
        {
            let _a = CallScope::enter(outer.clone());
            {
                let _b = CallScope::enter(inner.clone());
                assert!(Rc::ptr_eq(&current().unwrap(), &inner));
            }
            assert!(Rc::ptr_eq(&current().unwrap(), &outer));
        }
        assert!(current().is_none());
    }

    #[test]
    fn first_failure_is_kept() {
        let pool = ArenaPool::new(1, 0);
        let active = ActiveCall::new(Arc::new(pool.acquire(4096, 4096).unwrap()), Default::default());

        active.fail(FfiError::usage("first"));
        active.fail(FfiError::usage("second"));
        assert!(active.take_error().unwrap().to_string().contains("first"));
        assert!(active.take_error().is_none());
    }
}
