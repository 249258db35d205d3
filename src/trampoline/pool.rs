//! Fixed-capacity table of native entry points bound to host functions
//!
//! Each slot owns one libffi closure whose code address never changes.
//! Binding a slot re-prepares its closure for the callback prototype;
//! releasing it leaves the closure in place so late invocations land in the
//! relay and get reported instead of jumping into freed memory.

use dashmap::DashMap;
use libffi::raw;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::{Arc, Weak};

use super::relay;
use crate::concurrency::context::PendingError;
use crate::config::MAX_TRAMPOLINES;
use crate::error::{FfiError, Result};
use crate::interop::CallInterface;
use crate::logging;
use crate::memory::Arena;
use crate::types::{FunctionInfo, TypeRef};
use crate::value::{HostFunction, Value};
use crate::EngineCore;

static GLOBAL: Lazy<Arc<TrampolinePool>> = Lazy::new(|| TrampolinePool::new(MAX_TRAMPOLINES));

/// Host function bound to a slot
pub(crate) struct Binding {
    pub proto: Arc<FunctionInfo>,
    pub callback: HostFunction,
    pub receiver: Option<Value>,
    /// Call a transient binding lives for; registered bindings have none
    pub owner: Option<CallOwner>,
    pub engine: Weak<EngineCore>,
    pub engine_id: u64,
}

/// Call that passed a host function as a callback argument
pub(crate) struct CallOwner {
    pub arena: Weak<Arena>,
    pub generation: u64,
    pub pending: Arc<PendingError>,
}

impl CallOwner {
    /// The owning call still holds its arena
    pub fn is_live(&self) -> bool {
        self.arena
            .upgrade()
            .is_some_and(|arena| arena.generation() == self.generation)
    }
}

/// Relay userdata: which slot of which table
pub(crate) struct SlotAnchor {
    pub pool: Weak<TrampolinePool>,
    pub index: usize,
}

struct Slot {
    closure: *mut raw::ffi_closure,
    code: usize,
    binding: Option<Arc<Binding>>,
    /// Interface the closure was last prepared with
    _retained: Option<Arc<CallInterface>>,
}

struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// Trampoline table, shared by every engine of the process by default
pub struct TrampolinePool {
    table: Mutex<SlotTable>,
    by_address: DashMap<usize, usize>,
    anchors: Box<[SlotAnchor]>,
    capacity: usize,
}

// Closure pointers are only touched under the table lock.
unsafe impl Send for TrampolinePool {}
unsafe impl Sync for TrampolinePool {}

impl TrampolinePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            table: Mutex::new(SlotTable {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            by_address: DashMap::new(),
            anchors: (0..capacity)
                .map(|index| SlotAnchor {
                    pool: weak.clone(),
                    index,
                })
                .collect(),
            capacity,
        })
    }

    /// Process-wide table
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently bound
    pub fn in_use(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free.len()
    }

    /// Bind `callback` to a free slot; returns the slot and its code address
    ///
    /// With an `owner`, the binding is transient and only valid while that
    /// call holds its arena.
    pub(crate) fn bind(
        &self,
        engine: &Arc<EngineCore>,
        ty: &TypeRef,
        callback: HostFunction,
        receiver: Option<Value>,
        owner: Option<CallOwner>,
    ) -> Result<(usize, usize)> {
        let proto = ty
            .prototype()
            .cloned()
            .ok_or_else(|| FfiError::argument(format!("Type {} is not a callback type", ty.name())))?;
        let interface = proto
            .interface
            .clone()
            .ok_or_else(|| FfiError::argument("Variadic callbacks are not supported"))?;

        let mut table = self.table.lock();
        let index = self.claim(&mut table)?;
        let slot = &mut table.slots[index];

        let status = unsafe {
            raw::ffi_prep_closure_loc(
                slot.closure,
                interface.as_raw(),
                Some(relay::relay),
                &self.anchors[index] as *const SlotAnchor as *mut c_void,
                slot.code as *mut c_void,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            table.free.push(index);
            return Err(FfiError::argument(format!(
                "Failed to prepare trampoline for {} (libffi status {})",
                ty.name(),
                status
            )));
        }

        let transient = owner.is_some();
        slot.binding = Some(Arc::new(Binding {
            proto,
            callback,
            receiver,
            owner,
            engine: Arc::downgrade(engine),
            engine_id: engine.id,
        }));
        slot._retained = Some(interface);
        let code = slot.code;
        drop(table);

        self.by_address.insert(code, index);
        logging::log_trampoline_registered(index, code, transient);
        Ok((index, code))
    }

    fn claim(&self, table: &mut SlotTable) -> Result<usize> {
        if let Some(index) = table.free.pop() {
            return Ok(index);
        }
        if table.slots.len() >= self.capacity {
            return Err(FfiError::exhausted(format!(
                "Too many callbacks are in use (max = {})",
                self.capacity
            )));
        }

        let mut code: *mut c_void = std::ptr::null_mut();
        let closure = unsafe {
            raw::ffi_closure_alloc(std::mem::size_of::<raw::ffi_closure>(), &mut code) as *mut raw::ffi_closure
        };
        if closure.is_null() {
            return Err(FfiError::exhausted("Failed to allocate trampoline memory"));
        }

        table.slots.push(Slot {
            closure,
            code: code as usize,
            binding: None,
            _retained: None,
        });
        Ok(table.slots.len() - 1)
    }

    /// Current binding of slot `index`
    pub(crate) fn binding(&self, index: usize) -> Option<Arc<Binding>> {
        self.table.lock().slots.get(index).and_then(|s| s.binding.clone())
    }

    /// Unbind slot `index`; unbound slots are ignored
    pub(crate) fn release(&self, index: usize) {
        let mut table = self.table.lock();
        let Some(slot) = table.slots.get_mut(index) else {
            return;
        };
        if slot.binding.take().is_none() {
            return;
        }
        let code = slot.code;
        table.free.push(index);
        drop(table);

        self.by_address.remove(&code);
        logging::log_trampoline_unregistered(index);
    }

    /// Unbind the slot at code `address`, if `engine_id` bound it
    pub(crate) fn release_address(&self, engine_id: u64, address: usize) -> Result<()> {
        let index = self
            .by_address
            .get(&address)
            .map(|entry| *entry.value())
            .ok_or_else(|| FfiError::argument(format!("No callback is registered at {:#x}", address)))?;

        match self.binding(index) {
            Some(binding) if binding.engine_id == engine_id => {
                self.release(index);
                Ok(())
            }
            _ => Err(FfiError::argument(format!(
                "Callback at {:#x} belongs to another engine",
                address
            ))),
        }
    }

    /// Unbind every slot bound by `engine_id`
    pub(crate) fn release_engine(&self, engine_id: u64) {
        let owned: Vec<usize> = {
            let table = self.table.lock();
            table
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.binding.as_ref().is_some_and(|b| b.engine_id == engine_id))
                .map(|(i, _)| i)
                .collect()
        };
        for index in owned {
            self.release(index);
        }
    }
}

impl Drop for TrampolinePool {
    fn drop(&mut self) {
        for slot in self.table.get_mut().slots.drain(..) {
            unsafe { raw::ffi_closure_free(slot.closure as *mut c_void) };
        }
    }
}
