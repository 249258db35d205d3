//! dynffi - dynamic foreign function invocation
//!
//! Call native functions described at runtime, without compile-time bindings.
//!
//! Architecture:
//! - `types/` - runtime type descriptors, registry and declaration parser
//! - `memory/` - guarded per-call arenas and the arena pool
//! - `interop/` - libffi call interfaces, marshaling and the call lifecycle
//! - `trampoline/` - native entry points relaying into host functions
//! - `concurrency/` - host thread dispatch and async calls
//!
//! [`Engine`] ties these together:
//!
//! ```no_run
//! use dynffi::{Engine, Value};
//!
//! let engine = Engine::new()?;
//! let libc = engine.load_library("libc.so.6")?;
//! let abs = engine.function_from_prototype(&libc, "int abs(int)")?;
//! assert_eq!(engine.call(&abs, &[Value::from(-3)])?.value, Value::Number(3.0));
//! # Ok::<(), dynffi::FfiError>(())
//! ```

pub mod concurrency;
pub mod config;
pub mod error;
pub mod interop;
pub mod logging;
pub mod memory;
pub mod trampoline;
pub mod types;
pub mod value;

pub use concurrency::{AsyncHandle, HostDispatcher};
pub use config::EngineConfig;
pub use error::{ErrorKind, FfiError, Result};
pub use interop::{Call, CallConvention, CallResult, CallState, InteropStats, Library};
pub use trampoline::TrampolinePool;
pub use types::{
    ArrayHint, Directed, Direction, FunctionInfo, MemberSpec, PrimitiveKind, TypeInfo, TypeRef, TypeRegistry,
    TypeSpec,
};
pub use value::{External, Finalizer, HostFunction, Record, UnionValue, Value};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use concurrency::{context, AsyncCoordinator};
use interop::marshal::Decoder;
use interop::StatsCounters;
use memory::ArenaPool;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by an engine, its calls and the relays it bound
pub(crate) struct EngineCore {
    pub id: u64,
    pub config: RwLock<EngineConfig>,
    pub libraries_loaded: AtomicU64,
    pub registry: TypeRegistry,
    arenas: OnceCell<ArenaPool>,
    pub trampolines: Arc<TrampolinePool>,
    pub dispatcher: HostDispatcher,
    pub stats: Arc<StatsCounters>,
    coordinator: OnceCell<AsyncCoordinator>,
}

impl EngineCore {
    /// Arena pool, sized from the configuration on first use
    ///
    /// Synchronous calls use the pool's dedicated sync arena, outside the
    /// async ceiling.
    pub fn arenas(&self) -> &ArenaPool {
        self.arenas.get_or_init(|| {
            let config = self.config.read();
            ArenaPool::new(config.resident_async_pools, config.max_temporaries())
        })
    }

    fn coordinator(&self) -> Result<&AsyncCoordinator> {
        self.coordinator
            .get_or_try_init(|| AsyncCoordinator::new(self.dispatcher.clone()))
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.trampolines.release_engine(self.id);
    }
}

/// Dynamic FFI engine
///
/// The thread creating the engine is its host thread: host functions bound
/// as callbacks and async completions always run there.
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::with_trampolines(config, TrampolinePool::global())
    }

    /// Engine drawing trampolines from `trampolines` instead of the process table
    pub fn with_trampolines(config: EngineConfig, trampolines: Arc<TrampolinePool>) -> Result<Self> {
        config.validate()?;

        let core = EngineCore {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            registry: TypeRegistry::new(config.max_type_size),
            config: RwLock::new(config),
            libraries_loaded: AtomicU64::new(0),
            arenas: OnceCell::new(),
            trampolines,
            dispatcher: HostDispatcher::new(),
            stats: Arc::new(StatsCounters::default()),
            coordinator: OnceCell::new(),
        };
        tracing::debug!(engine = core.id, "Engine created");

        Ok(Self { core: Arc::new(core) })
    }

    pub fn config(&self) -> EngineConfig {
        self.core.config.read().clone()
    }

    /// Replace the configuration; frozen once a library is loaded
    pub fn set_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;

        if self.core.libraries_loaded.load(Ordering::Acquire) > 0 || self.core.arenas.get().is_some() {
            return Err(FfiError::Config(
                "Cannot change configuration after a library was loaded or a call was made".into(),
            ));
        }

        self.core.registry.set_max_type_size(config.max_type_size);
        *self.core.config.write() = config;
        Ok(())
    }

    #[inline]
    pub fn types(&self) -> &TypeRegistry {
        &self.core.registry
    }

    /// Host-thread task queue; pump it while async calls are outstanding
    #[inline]
    pub fn dispatcher(&self) -> &HostDispatcher {
        &self.core.dispatcher
    }

    pub fn load_library(&self, path: impl AsRef<Path>) -> Result<Library> {
        let library = Library::load(path)?;
        self.core.libraries_loaded.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(path = ?library.path(), "Library loaded");
        Ok(library)
    }

    /// Symbols of the running process
    pub fn process_library(&self) -> Result<Library> {
        let library = Library::this()?;
        self.core.libraries_loaded.fetch_add(1, Ordering::AcqRel);
        Ok(library)
    }

    /// Bind `symbol` of `library`; a trailing `"..."` parameter makes it variadic
    pub fn function(
        &self,
        library: &Library,
        symbol: &str,
        ret: impl Into<TypeSpec>,
        params: &[TypeSpec],
        convention: CallConvention,
    ) -> Result<Arc<FunctionInfo>> {
        let address = library.symbol(symbol)?;
        let info = self.core.registry.function_info(symbol, ret, params, convention)?;
        Ok(Arc::new(info.bind(address, Some(library.clone()))))
    }

    /// Bind a function from a declaration such as `"int add(int a, int b)"`
    pub fn function_from_prototype(&self, library: &Library, prototype: &str) -> Result<Arc<FunctionInfo>> {
        let info = self.core.registry.function_from_text(prototype)?;
        let address = library.symbol(info.name())?;
        Ok(Arc::new(info.bind(address, Some(library.clone()))))
    }

    /// Bind the export with `ordinal` (Windows only)
    pub fn function_by_ordinal(&self, library: &Library, ordinal: u16, prototype: &str) -> Result<Arc<FunctionInfo>> {
        let address = library.ordinal(ordinal)?;
        let info = self.core.registry.function_from_text(prototype)?;
        Ok(Arc::new(info.bind(address, Some(library.clone()))))
    }

    /// Bind a raw entry address, e.g. a function pointer returned by native code
    pub fn function_at(&self, address: usize, prototype: &str) -> Result<Arc<FunctionInfo>> {
        if address == 0 {
            return Err(FfiError::argument("Cannot bind a function at null address"));
        }
        let info = self.core.registry.function_from_text(prototype)?;
        Ok(Arc::new(info.bind(address, None)))
    }

    /// Leased call, ready for [`Call::prepare`]
    ///
    /// Inside a callback the call shares the arena of the native call that
    /// invoked it, and gives its scratch back when dropped.
    pub fn prepare_call(&self, func: &Arc<FunctionInfo>) -> Result<Call> {
        let lease = match context::current() {
            Some(active) => active.lease.nest(),
            None => {
                let config = self.core.config.read();
                let (stack, heap) = (config.sync_stack_size, config.sync_heap_size);
                drop(config);
                self.core.arenas().acquire_sync(stack, heap)?
            }
        };
        Call::new(self.core.clone(), func.clone(), Arc::new(lease))
    }

    /// Call `func` synchronously on the current thread
    pub fn call(&self, func: &Arc<FunctionInfo>, args: &[Value]) -> Result<CallResult> {
        let mut call = self.prepare_call(func)?;
        call.prepare(args)?;
        call.execute()?;
        call.complete()
    }

    /// Call `func` on a worker thread; `done` runs on the host thread
    ///
    /// Arguments are encoded before this returns. Host functions passed as
    /// callbacks are invoked on the host thread, so keep pumping
    /// [`Engine::dispatcher`] until `done` has run.
    pub fn call_async<F>(&self, func: &Arc<FunctionInfo>, args: &[Value], done: F) -> Result<AsyncHandle>
    where
        F: FnOnce(Result<CallResult>) + Send + 'static,
    {
        let (stack, heap) = {
            let config = self.core.config.read();
            (config.async_stack_size, config.async_heap_size)
        };
        let coordinator = self.core.coordinator()?;

        let lease = self.core.arenas().acquire(stack, heap)?;
        let mut call = Call::new(self.core.clone(), func.clone(), Arc::new(lease))?;
        call.prepare(args)?;
        self.core.stats.async_calls.fetch_add(1, Ordering::Relaxed);
        coordinator.submit(call, done)
    }

    /// Bind `callback` to a trampoline until [`Engine::unregister`]
    ///
    /// `ty` names a callback type or its prototype. The returned external
    /// handle is the native entry address, usable as a callback argument.
    pub fn register(
        &self,
        ty: impl Into<TypeSpec>,
        callback: HostFunction,
        receiver: Option<Value>,
    ) -> Result<Value> {
        let mut ty = self.core.registry.resolve(ty)?;
        if ty.primitive() == PrimitiveKind::Prototype {
            ty = self.core.registry.resolve(format!("{} *", ty.name()))?;
        }
        if ty.primitive() != PrimitiveKind::Callback {
            return Err(FfiError::argument(format!(
                "Unexpected {} type, expected callback",
                ty.primitive().name()
            )));
        }

        let (_, address) = self.core.trampolines.bind(&self.core, &ty, callback, receiver, None)?;
        Ok(Value::wrap_external(address, Some(ty.id())))
    }

    /// Release a registered callback by its handle
    pub fn unregister(&self, handle: &Value) -> Result<()> {
        let ext = handle
            .as_external()
            .ok_or_else(|| FfiError::argument(format!("Unexpected {} value, expected callback", handle.kind_name())))?;
        self.core.trampolines.release_address(self.core.id, ext.address)
    }

    /// Decode the value of type `ty` stored at `address`
    ///
    /// With `len`, arrays and strings use that length and other types are
    /// read as `len` consecutive elements.
    pub fn decode(&self, address: &Value, ty: impl Into<TypeSpec>, len: Option<usize>) -> Result<Value> {
        let address = match address {
            Value::External(ext) => ext.address,
            v if v.is_number() => v.as_u64().unwrap_or(0) as usize,
            v => return Err(FfiError::argument(format!("Unexpected {} value, expected pointer", v.kind_name()))),
        };
        if address == 0 {
            return Ok(Value::Null);
        }

        let mut ty = self.core.registry.resolve(ty)?;
        let read_as_array = len.is_some()
            && !matches!(
                ty.primitive(),
                PrimitiveKind::Array | PrimitiveKind::String | PrimitiveKind::String16
            );
        if read_as_array {
            ty = self.core.registry.define_array(ty, len.unwrap_or(0), None)?;
        }

        let decoder = Decoder::new(&self.core.stats);
        Ok(decoder.decode(address as *const u8, &ty, len))
    }

    /// Free memory that native code allocated with the C allocator
    ///
    /// Only external handles are accepted; a null handle is a no-op. The
    /// handle must not be freed twice.
    pub fn free(&self, handle: &Value) -> Result<()> {
        let ext = handle.as_external().ok_or_else(|| {
            FfiError::argument(format!("Unexpected {} value, expected external", handle.kind_name()))
        })?;
        if ext.address != 0 {
            tracing::trace!(address = format_args!("{:#x}", ext.address), "Freeing native allocation");
            unsafe { libc::free(ext.address as *mut libc::c_void) };
        }
        Ok(())
    }

    pub fn stats(&self) -> InteropStats {
        self.core
            .stats
            .snapshot(self.core.libraries_loaded.load(Ordering::Relaxed))
    }

    /// Trampolines bound by any engine sharing this engine's table
    pub fn trampolines_in_use(&self) -> usize {
        self.core.trampolines.in_use()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.core.id)
            .field("types", &self.core.registry.len())
            .finish()
    }
}
