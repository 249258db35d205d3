//! Arena tests
//!
//! Test suite organized by component:
//! - Region: mapping and page rounding
//! - Arena: heap and stack scratch
//! - Pool: resident reuse, temporaries and exhaustion

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    const KIB: usize = 1024;

    // ===== Region Tests =====

    #[test]
    fn region_rounds_to_pages() {
        let region = Region::map(100, true).expect("map region");
        assert_eq!(region.len() % page_size(), 0);
        assert!(region.len() >= 100);

        // Usable memory is writable end to end
        unsafe {
            region.start().write(1);
            region.end().sub(1).write(2);
        }
    }

    // ===== Arena Tests =====

    #[test]
    fn arena_heap_allocations_are_aligned() {
        let arena = Arena::new(16 * KIB, 16 * KIB, false).unwrap();

        for align in [1, 2, 4, 8, 16, 32] {
            let ptr = arena.alloc_heap(3, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "not aligned to {}", align);
            assert!(arena.contains(ptr.as_ptr() as usize));
        }
    }

    #[test]
    fn arena_heap_exhaustion() {
        let arena = Arena::new(4 * KIB, 4 * KIB, false).unwrap();
        let capacity = arena.heap_capacity();

        arena.alloc_heap(capacity, 1).unwrap();
        let err = arena.alloc_heap(1, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn arena_stack_overflow_is_distinct() {
        let arena = Arena::new(4 * KIB, 4 * KIB, false).unwrap();
        let capacity = arena.stack_capacity();

        let err = arena.alloc_stack(capacity + 1, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StackOverflow);
    }

    #[test]
    fn arena_stack_mark_restore() {
        let arena = Arena::new(4 * KIB, 4 * KIB, false).unwrap();

        let mark = arena.stack_mark();
        arena.alloc_stack(256, 16).unwrap();
        arena.restore_stack(mark);
        assert_eq!(arena.stack_mark(), mark);
        assert!(arena.stack_high_water() >= 256);
    }

    #[test]
    fn arena_busy_flag() {
        let arena = Arc::new(Arena::new(4 * KIB, 4 * KIB, false).unwrap());

        let guard = arena.begin_execute().unwrap();
        assert!(arena.is_executing());

        // Nested calls on the executing thread stack up
        let nested = arena.begin_execute().unwrap();
        drop(nested);
        assert!(arena.is_executing());

        let other = arena.clone();
        let err = std::thread::spawn(move || other.begin_execute().map(|_| ()).unwrap_err())
            .join()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Usage);

        drop(guard);
        assert!(!arena.is_executing());
        assert!(arena.begin_execute().is_ok());
    }

    #[test]
    fn nested_lease_gives_scratch_back() {
        let pool = ArenaPool::new(1, 0);
        let outer = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        outer.alloc_heap(64, 8).unwrap();
        let (stack, heap) = (outer.stack_mark(), outer.heap_mark());

        let nested = outer.nest();
        assert!(nested.is_nested());
        assert!(std::ptr::eq(nested.arena(), outer.arena()));
        nested.alloc_heap(512, 8).unwrap();
        nested.alloc_stack(256, 16).unwrap();
        drop(nested);

        assert_eq!((outer.stack_mark(), outer.heap_mark()), (stack, heap));
        assert_eq!(pool.resident_count(), 1);
    }

    // ===== Pool Tests =====

    #[test]
    fn pool_reuses_resident_arenas() {
        let pool = ArenaPool::new(1, 0);

        let first = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        let address = first.arena() as *const Arena as usize;
        let generation = first.generation();
        drop(first);

        let second = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        assert_eq!(second.arena() as *const Arena as usize, address);
        assert_ne!(second.generation(), generation);
        assert_eq!(pool.resident_count(), 1);
    }

    #[test]
    fn pool_leases_are_exclusive() {
        let pool = ArenaPool::new(2, 2);

        let leases: Vec<_> = (0..4).map(|_| pool.acquire(4 * KIB, 4 * KIB).unwrap()).collect();
        for (i, a) in leases.iter().enumerate() {
            for b in &leases[i + 1..] {
                assert!(!std::ptr::eq(a.arena(), b.arena()));
            }
        }
        assert_eq!(pool.outstanding_temporaries(), 2);
    }

    #[test]
    fn pool_exhaustion_beyond_temporaries() {
        let pool = ArenaPool::new(1, 2);

        let _held: Vec<_> = (0..3).map(|_| pool.acquire(4 * KIB, 4 * KIB).unwrap()).collect();
        let err = pool.acquire(4 * KIB, 4 * KIB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn pool_temporaries_are_released() {
        let pool = ArenaPool::new(0, 1);

        let temp = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        assert!(temp.is_temporary());
        assert!(pool.acquire(4 * KIB, 4 * KIB).is_err());

        drop(temp);
        assert_eq!(pool.outstanding_temporaries(), 0);
        assert!(pool.acquire(4 * KIB, 4 * KIB).is_ok());
    }

    #[test]
    fn pool_skips_undersized_residents() {
        let pool = ArenaPool::new(2, 0);

        let small = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        drop(small);

        let large = pool.acquire(64 * KIB, 64 * KIB).unwrap();
        assert!(large.heap_capacity() >= 64 * KIB);
        assert_eq!(pool.resident_count(), 2);
    }

    #[test]
    fn pool_leases_cross_threads() {
        let pool = ArenaPool::new(1, 4);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let lease = pool.acquire(4 * KIB, 4 * KIB).unwrap();
                    lease.alloc_heap(128, 8).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.outstanding_temporaries(), 0);
    }

    #[test]
    fn sync_arena_is_outside_the_async_ceiling() {
        let pool = ArenaPool::new(0, 1);

        let temp = pool.acquire(4 * KIB, 4 * KIB).unwrap();
        assert!(pool.acquire(4 * KIB, 4 * KIB).is_err());

        let sync = pool.acquire_sync(4 * KIB, 4 * KIB).unwrap();
        assert!(!sync.is_temporary());
        assert_eq!(pool.outstanding_temporaries(), 1);

        drop((temp, sync));
        let again = pool.acquire_sync(4 * KIB, 4 * KIB).unwrap();
        assert_eq!(pool.outstanding_temporaries(), 0);
        assert_eq!(pool.resident_count(), 0);
        drop(again);
    }

    #[test]
    fn held_sync_arena_falls_back_to_pool() {
        let pool = ArenaPool::new(1, 0);

        let first = pool.acquire_sync(4 * KIB, 4 * KIB).unwrap();
        let second = pool.acquire_sync(4 * KIB, 4 * KIB).unwrap();
        assert!(!std::ptr::eq(first.arena(), second.arena()));
        assert_eq!(pool.resident_count(), 1);

        let err = pool.acquire_sync(4 * KIB, 4 * KIB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }
}
