//! Memory arenas - per-call scratch memory
//!
//! Design: Three-layer architecture:
//! 1. Bump cursors (fast path, no locking)
//! 2. Arenas: a guarded stack region plus a heap region, leased per call
//! 3. Arena pool: resident arenas reused round-robin, bounded temporaries
//!
//! A lease is exclusive: no two outstanding calls ever share an arena, except
//! for relays and nested calls running inside the call that owns the arena.
//! Synchronous calls get an arena of their own, outside the async ceiling.

mod bump;
mod region;

#[cfg(test)]
mod tests;

pub use bump::{BumpCursor, StackCursor};
pub use region::{page_size, Region};

pub(crate) use bump::align_up;

use core::ptr::NonNull;
use parking_lot::Mutex;
use std::ops::Deref;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crate::error::{FfiError, Result};
use crate::logging;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Scratch memory for one call: guarded stack region plus bump heap
pub struct Arena {
    stack_region: Region,
    heap_region: Region,
    stack: StackCursor,
    heap: BumpCursor,
    temporary: bool,
    execution: Mutex<Execution>,
    generation: AtomicU64,
}

/// Thread running native code on an arena, and how deeply nested
#[derive(Default)]
struct Execution {
    owner: Option<ThreadId>,
    depth: usize,
}

impl Arena {
    pub fn new(stack_size: usize, heap_size: usize, temporary: bool) -> Result<Self> {
        let stack_region = Region::map(stack_size, true)?;
        let heap_region = Region::map(heap_size, false)?;

        let stack = StackCursor::new(stack_region.start(), stack_region.end());
        let heap = BumpCursor::new(heap_region.start(), heap_region.end());

        Ok(Self {
            stack_region,
            heap_region,
            stack,
            heap,
            temporary,
            execution: Mutex::new(Execution::default()),
            generation: AtomicU64::new(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)),
        })
    }

    /// Heap scratch; contents are not zeroed
    pub fn alloc_heap(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.heap.try_alloc(size, align.max(1)).ok_or_else(|| {
            FfiError::exhausted(format!(
                "Excessive heap memory use: {} bytes requested, {} available",
                size,
                self.heap.remaining()
            ))
        })
    }

    /// Zero-filled heap scratch
    pub fn alloc_heap_zeroed(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc_heap(size, align)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Copy `bytes` into heap scratch
    pub fn copy_to_heap(&self, bytes: &[u8], align: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc_heap(bytes.len().max(1), align)?;
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(ptr)
    }

    /// Stack scratch; overflow is reported as [`FfiError::StackOverflow`]
    pub fn alloc_stack(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.stack
            .try_push(size, align.max(1))
            .ok_or_else(|| FfiError::StackOverflow {
                needed: size,
                available: self.stack.remaining(),
            })
    }

    #[inline]
    pub fn stack_mark(&self) -> usize {
        self.stack.mark()
    }

    #[inline]
    pub fn restore_stack(&self, mark: usize) {
        self.stack.restore(mark);
    }

    #[inline]
    pub fn heap_mark(&self) -> usize {
        self.heap.mark()
    }

    #[inline]
    pub fn rewind_heap(&self, mark: usize) {
        self.heap.rewind(mark);
    }

    /// Changes every time the arena is leased
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_executing(&self) -> bool {
        self.execution.lock().owner.is_some()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.capacity()
    }

    pub fn heap_capacity(&self) -> usize {
        self.heap.capacity()
    }

    pub fn heap_used(&self) -> usize {
        self.heap.used()
    }

    pub fn stack_high_water(&self) -> usize {
        self.stack.high_water()
    }

    /// Is `address` inside one of the regions
    pub fn contains(&self, address: usize) -> bool {
        let within = |start: *mut u8, end: *mut u8| (start as usize..end as usize).contains(&address);
        within(self.stack_region.start(), self.stack_region.end())
            || within(self.heap_region.start(), self.heap_region.end())
    }

    /// Mark the arena as executing a native call
    ///
    /// Calls nested on the executing thread stack up; any other thread is
    /// refused until the outermost call returns.
    pub(crate) fn begin_execute(&self) -> Result<ExecuteGuard<'_>> {
        let me = thread::current().id();
        let mut execution = self.execution.lock();

        match execution.owner {
            Some(owner) if owner != me => {
                return Err(FfiError::usage("Arena is already executing a call on another thread"));
            }
            _ => {
                execution.owner = Some(me);
                execution.depth += 1;
            }
        }
        Ok(ExecuteGuard { arena: self })
    }

    fn recycle(&self) {
        self.stack.reset();
        self.heap.reset();
        self.generation
            .store(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed), Ordering::Release);
    }
}

pub(crate) struct ExecuteGuard<'a> {
    arena: &'a Arena,
}

impl Drop for ExecuteGuard<'_> {
    fn drop(&mut self) {
        let mut execution = self.arena.execution.lock();
        execution.depth -= 1;
        if execution.depth == 0 {
            execution.owner = None;
        }
    }
}

impl fmt::Debug for ExecuteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteGuard")
            .field("generation", &self.arena.generation())
            .finish()
    }
}

struct Resident {
    arena: Arc<Arena>,
    leased: bool,
}

struct PoolState {
    resident: Vec<Resident>,
    next: usize,
    temporaries: usize,
    sync: Option<Resident>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    resident_limit: usize,
    max_temporaries: usize,
}

/// Pool of arenas; resident arenas are created lazily and kept mapped
#[derive(Clone)]
pub struct ArenaPool {
    shared: Arc<PoolShared>,
}

impl ArenaPool {
    pub fn new(resident_limit: usize, max_temporaries: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    resident: Vec::with_capacity(resident_limit),
                    next: 0,
                    temporaries: 0,
                    sync: None,
                }),
                resident_limit,
                max_temporaries,
            }),
        }
    }

    /// Lease an arena with at least the requested region sizes
    ///
    /// Fails with [`FfiError::ResourceExhausted`] once every resident arena
    /// is leased and `max_temporaries` temporaries are outstanding.
    pub fn acquire(&self, stack_size: usize, heap_size: usize) -> Result<ArenaLease> {
        let mut state = self.shared.state.lock();
        let count = state.resident.len();

        for step in 0..count {
            let idx = (state.next + step) % count;
            let slot = &mut state.resident[idx];
            if slot.leased
                || slot.arena.stack_capacity() < stack_size
                || slot.arena.heap_capacity() < heap_size
            {
                continue;
            }

            slot.leased = true;
            let arena = slot.arena.clone();
            state.next = (idx + 1) % count;
            drop(state);

            arena.recycle();
            logging::log_arena_acquired(Some(idx), false);
            return Ok(self.lease(arena, LeaseKind::Resident(idx)));
        }

        if count < self.shared.resident_limit {
            let arena = Arc::new(Arena::new(stack_size, heap_size, false)?);
            state.resident.push(Resident {
                arena: arena.clone(),
                leased: true,
            });
            logging::log_arena_acquired(Some(count), false);
            return Ok(self.lease(arena, LeaseKind::Resident(count)));
        }

        if state.temporaries >= self.shared.max_temporaries {
            logging::log_arena_exhausted(state.temporaries);
            return Err(FfiError::exhausted("Too many asynchronous calls are running"));
        }
        state.temporaries += 1;
        drop(state);

        match Arena::new(stack_size, heap_size, true) {
            Ok(arena) => {
                logging::log_arena_acquired(None, true);
                Ok(self.lease(Arc::new(arena), LeaseKind::Temporary))
            }
            Err(err) => {
                self.shared.state.lock().temporaries -= 1;
                Err(err)
            }
        }
    }

    /// Lease the arena reserved for synchronous calls
    ///
    /// It does not count against the async ceiling. While a caller already
    /// holds it, the lease comes from the shared pool instead.
    pub fn acquire_sync(&self, stack_size: usize, heap_size: usize) -> Result<ArenaLease> {
        let mut state = self.shared.state.lock();

        let arena = match &mut state.sync {
            Some(slot) if slot.leased => None,
            Some(slot) => {
                slot.leased = true;
                Some(slot.arena.clone())
            }
            None => {
                let arena = Arc::new(Arena::new(stack_size, heap_size, false)?);
                state.sync = Some(Resident {
                    arena: arena.clone(),
                    leased: true,
                });
                Some(arena)
            }
        };
        drop(state);

        match arena {
            Some(arena) => {
                arena.recycle();
                logging::log_arena_acquired(None, false);
                Ok(self.lease(arena, LeaseKind::Sync))
            }
            None => self.acquire(stack_size, heap_size),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.shared.state.lock().resident.len()
    }

    pub fn outstanding_temporaries(&self) -> usize {
        self.shared.state.lock().temporaries
    }

    fn lease(&self, arena: Arc<Arena>, kind: LeaseKind) -> ArenaLease {
        ArenaLease {
            arena,
            pool: self.shared.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseKind {
    Resident(usize),
    Temporary,
    Sync,
    /// Shares the arena of an enclosing call; marks to restore on drop
    Nested { stack: usize, heap: usize, generation: u64 },
}

/// Exclusive use of an arena, returned to the pool on drop
///
/// Temporary arenas are unmapped when their lease drops.
pub struct ArenaLease {
    arena: Arc<Arena>,
    pool: Arc<PoolShared>,
    kind: LeaseKind,
}

impl ArenaLease {
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Lease on the same arena for a call made while this one executes
    ///
    /// Scratch used by the nested call is given back when it drops.
    pub fn nest(&self) -> ArenaLease {
        tracing::trace!(generation = self.arena.generation(), "Nested arena lease");
        ArenaLease {
            arena: self.arena.clone(),
            pool: self.pool.clone(),
            kind: LeaseKind::Nested {
                stack: self.arena.stack_mark(),
                heap: self.arena.heap_mark(),
                generation: self.arena.generation(),
            },
        }
    }

    #[inline]
    pub fn is_nested(&self) -> bool {
        matches!(self.kind, LeaseKind::Nested { .. })
    }

    pub(crate) fn downgrade(&self) -> Weak<Arena> {
        Arc::downgrade(&self.arena)
    }
}

impl Deref for ArenaLease {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.arena
    }
}

impl fmt::Debug for ArenaLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaLease")
            .field("kind", &self.kind)
            .field("generation", &self.arena.generation())
            .field("heap_used", &self.arena.heap_used())
            .finish()
    }
}

impl Drop for ArenaLease {
    fn drop(&mut self) {
        if let LeaseKind::Nested { stack, heap, generation } = self.kind {
            // The enclosing lease may already be gone and the arena reused
            if self.arena.generation() == generation {
                self.arena.restore_stack(stack);
                self.arena.rewind_heap(heap);
            }
            return;
        }

        logging::log_arena_released(
            self.arena.is_temporary(),
            self.arena.heap_used(),
            self.arena.stack_high_water(),
        );

        let mut state = self.pool.state.lock();
        match self.kind {
            LeaseKind::Resident(idx) => {
                if let Some(slot) = state.resident.get_mut(idx) {
                    slot.leased = false;
                }
            }
            LeaseKind::Sync => {
                if let Some(slot) = state.sync.as_mut() {
                    slot.leased = false;
                }
            }
            LeaseKind::Temporary => state.temporaries -= 1,
            LeaseKind::Nested { .. } => {}
        }
    }
}
