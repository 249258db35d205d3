//! Trampoline table tests
//!
//! Test suite organized by component:
//! - Capacity: exhaustion and release
//! - Ownership: engine teardown and foreign handles

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::ErrorKind;
    use crate::value::{HostFunction, Value};
    use crate::{Engine, EngineConfig};
    use std::sync::Arc;

    fn engine_with(pool: &Arc<TrampolinePool>) -> Engine {
        let engine = Engine::with_trampolines(EngineConfig::default(), pool.clone()).unwrap();
        engine.types().define_callback_text("void Notify(int code)").unwrap();
        engine
    }

    fn noop() -> HostFunction {
        HostFunction::new(|_, _| Ok(Value::Undefined))
    }

    // ===== Capacity Tests =====

    #[test]
    fn fills_to_capacity_then_fails() {
        let pool = TrampolinePool::new(3);
        let engine = engine_with(&pool);

        let handles: Vec<_> = (0..3).map(|_| engine.register("Notify", noop(), None).unwrap()).collect();
        assert_eq!(pool.in_use(), 3);

        let err = engine.register("Notify", noop(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        engine.unregister(&handles[1]).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(engine.register("Notify", noop(), None).is_ok());
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn released_slot_keeps_its_address() {
        let pool = TrampolinePool::new(1);
        let engine = engine_with(&pool);

        let first = engine.register("Notify", noop(), None).unwrap();
        engine.unregister(&first).unwrap();
        let second = engine.register("Notify *", noop(), None).unwrap();

        assert_eq!(
            first.as_external().map(|e| e.address),
            second.as_external().map(|e| e.address)
        );
    }

    #[test]
    fn rejects_non_callback_types() {
        let pool = TrampolinePool::new(1);
        let engine = engine_with(&pool);

        let err = engine.register("int", noop(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(pool.in_use(), 0);
    }

    // ===== Ownership Tests =====

    #[test]
    fn engine_drop_releases_its_slots() {
        let pool = TrampolinePool::new(4);
        let keeper = engine_with(&pool);
        let kept = keeper.register("Notify", noop(), None).unwrap();

        {
            let engine = engine_with(&pool);
            engine.register("Notify", noop(), None).unwrap();
            engine.register("Notify", noop(), None).unwrap();
            assert_eq!(pool.in_use(), 3);
        }

        assert_eq!(pool.in_use(), 1);
        keeper.unregister(&kept).unwrap();
    }

    #[test]
    fn cannot_unregister_foreign_handles() {
        let pool = TrampolinePool::new(2);
        let owner = engine_with(&pool);
        let other = engine_with(&pool);

        let handle = owner.register("Notify", noop(), None).unwrap();
        assert_eq!(other.unregister(&handle).unwrap_err().kind(), ErrorKind::Argument);
        assert_eq!(other.unregister(&Value::from(1)).unwrap_err().kind(), ErrorKind::Argument);
        owner.unregister(&handle).unwrap();
    }

    // ===== Owner Liveness Tests =====

    fn owner_of(lease: &crate::memory::ArenaLease) -> CallOwner {
        CallOwner {
            arena: lease.downgrade(),
            generation: lease.generation(),
            pending: Default::default(),
        }
    }

    #[test]
    fn owner_dies_with_temporary_arena() {
        let pool = crate::memory::ArenaPool::new(0, 1);
        let lease = pool.acquire(4096, 4096).unwrap();
        let owner = owner_of(&lease);

        assert!(owner.is_live());
        drop(lease);
        assert!(!owner.is_live());
    }

    #[test]
    fn owner_dies_when_resident_arena_is_reused() {
        let pool = crate::memory::ArenaPool::new(1, 0);
        let lease = pool.acquire(4096, 4096).unwrap();
        let owner = owner_of(&lease);
        drop(lease);

        let _next = pool.acquire(4096, 4096).unwrap();
        assert!(!owner.is_live());
    }
}
