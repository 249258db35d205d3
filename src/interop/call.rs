//! Call lifecycle: prepare, execute, complete
//!
//! A call owns one arena lease from preparation until it is dropped. All
//! argument slots, string copies and output backing live in that arena, so
//! the native side sees stable addresses for the whole call.

use smallvec::SmallVec;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::marshal::{CallbackBinder, Decoder, Encoder};
use super::CallInterface;
use crate::concurrency::context::{ActiveCall, CallScope, PendingError};
use crate::error::{FfiError, Result};
use crate::logging;
use crate::memory::{Arena, ArenaLease};
use crate::trampoline::CallOwner;
use crate::types::{FunctionInfo, ParameterInfo, PrimitiveKind, TypeRef};
use crate::value::{HostFunction, Value};
use crate::EngineCore;

/// Where a call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Prepared,
    Executing,
    Executed,
    Completed,
    Failed,
}

enum OutputKind {
    /// Pointee decoded with its descriptor
    Value(TypeRef),
    /// Raw bytes copied back into a buffer
    Bytes(usize),
    /// NUL-terminated text within `capacity` units
    Text { wide: bool, capacity: usize },
}

struct OutputSlot {
    position: usize,
    address: usize,
    kind: OutputKind,
}

/// Decoded return value plus the out/inout parameters, by argument position
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub value: Value,
    pub outputs: SmallVec<[(usize, Value); 4]>,
}

impl CallResult {
    /// Updated value of the out/inout argument at `position`
    pub fn output(&self, position: usize) -> Option<&Value> {
        self.outputs.iter().find(|(p, _)| *p == position).map(|(_, v)| v)
    }

    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// One native call in flight
pub struct Call {
    core: Arc<EngineCore>,
    func: Arc<FunctionInfo>,
    /// `func` itself, or a per-call descriptor carrying the variadic extras
    effective: Arc<FunctionInfo>,
    lease: Arc<ArenaLease>,
    /// Failures raised by relays of this call, from any thread
    pending: Arc<PendingError>,
    state: CallState,
    args: Vec<*mut c_void>,
    ret: *mut u8,
    outputs: SmallVec<[OutputSlot; 4]>,
    transients: SmallVec<[usize; 2]>,
    holds_variadic: bool,
}

// Raw pointers all point into the arena owned through `lease`.
unsafe impl Send for Call {}

impl Call {
    pub(crate) fn new(core: Arc<EngineCore>, func: Arc<FunctionInfo>, lease: Arc<ArenaLease>) -> Result<Self> {
        if func.address() == 0 {
            return Err(FfiError::usage(format!(
                "Cannot call prototype '{}' without an entry point",
                func.name()
            )));
        }

        Ok(Self {
            core,
            effective: func.clone(),
            func,
            lease,
            pending: Arc::default(),
            state: CallState::Idle,
            args: Vec::new(),
            ret: std::ptr::null_mut(),
            outputs: SmallVec::new(),
            transients: SmallVec::new(),
            holds_variadic: false,
        })
    }

    #[inline]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[inline]
    pub fn function(&self) -> &FunctionInfo {
        &self.func
    }

    /// Arena backing this call
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.lease
    }

    /// Validate arity and encode every argument into the arena
    pub fn prepare(&mut self, args: &[Value]) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(FfiError::usage(format!("Cannot prepare call in state {:?}", self.state)));
        }

        let mut transients = SmallVec::new();
        let result = self.prepare_inner(args, &mut transients);
        self.transients = transients;

        match result {
            Ok(()) => {
                self.state = CallState::Prepared;
                Ok(())
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    fn prepare_inner(&mut self, args: &[Value], transients: &mut SmallVec<[usize; 2]>) -> Result<()> {
        let required = self.func.parameters().len();

        if self.func.is_variadic() {
            if args.len() < required {
                return Err(FfiError::argument(format!(
                    "Expected {} arguments or more, got {}",
                    required,
                    args.len()
                )));
            }
            if (args.len() - required) % 2 != 0 {
                return Err(FfiError::argument(
                    "Variadic arguments must come in pairs of type and value",
                ));
            }
            self.effective = Arc::new(self.variadic_descriptor(args)?);
        } else if args.len() != required {
            return Err(FfiError::argument(format!(
                "Expected {} arguments, got {}",
                required,
                args.len()
            )));
        }

        let interface = self.interface()?;
        let lease = self.lease.clone();
        let arena: &Arena = &lease;

        let mut binder = TransientBinder {
            core: &self.core,
            lease: &lease,
            pending: &self.pending,
            slots: transients,
        };
        let mut encoder = Encoder::new(arena, Some(&mut binder));
        let mut outputs = SmallVec::new();
        let mut slots = Vec::with_capacity(self.effective.parameters().len());

        for param in self.effective.parameters() {
            let value = &args[param.position];
            let slot = arena.alloc_stack(param.ty.size().max(1), param.ty.align())?.as_ptr();

            if param.direction.writes() {
                let address = encode_output(&mut encoder, param, value, &mut outputs)?;
                unsafe { std::ptr::write_unaligned(slot as *mut usize, address) };
            } else {
                encoder.encode(value, &param.ty, slot)?;
            }
            slots.push(slot as *mut c_void);
        }

        self.ret = arena.alloc_heap_zeroed(interface.return_slot_size(), 16)?.as_ptr();
        self.args = slots;
        self.outputs = outputs;
        Ok(())
    }

    /// Per-call descriptor; the variadic function is held until the call ends
    fn variadic_descriptor(&mut self, args: &[Value]) -> Result<FunctionInfo> {
        if self
            .func
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FfiError::usage(format!(
                "Variadic function '{}' is already used by another call",
                self.func.name()
            )));
        }
        self.holds_variadic = true;

        let required = self.func.parameters().len();
        let mut extras = Vec::with_capacity((args.len() - required) / 2);

        for (k, pair) in args[required..].chunks_exact(2).enumerate() {
            let Value::Type(spec) = &pair[0] else {
                return Err(FfiError::argument(format!(
                    "Expected type specifier for variadic argument {}, got {}",
                    k + 1,
                    pair[0].kind_name()
                )));
            };
            let directed = self.core.registry.resolve_directed(spec.clone())?;

            extras.push(ParameterInfo {
                ty: self.promote(directed.ty)?,
                direction: directed.direction,
                variadic: true,
                position: required + 2 * k + 1,
            });
        }

        self.func.with_variadic(extras)
    }

    /// Default argument promotions for variadic extras
    fn promote(&self, ty: TypeRef) -> Result<TypeRef> {
        let registry = &self.core.registry;

        match ty.primitive() {
            PrimitiveKind::Float32 => registry.resolve("double"),
            PrimitiveKind::Bool => registry.resolve("int32_t"),
            kind if kind.is_integer() && ty.size() < 4 => {
                registry.resolve(if kind.is_signed() { "int32_t" } else { "uint32_t" })
            }
            _ => Ok(ty),
        }
    }

    fn interface(&self) -> Result<Arc<CallInterface>> {
        self.effective
            .interface
            .clone()
            .ok_or_else(|| FfiError::usage(format!("Function '{}' has no call interface", self.func.name())))
    }

    /// Run the native function on the current thread
    pub fn execute(&mut self) -> Result<()> {
        if self.state != CallState::Prepared {
            return Err(FfiError::usage(format!("Cannot execute call in state {:?}", self.state)));
        }

        let interface = self.interface()?;
        let lease = self.lease.clone();
        let active = Rc::new(ActiveCall::new(lease.clone(), self.pending.clone()));
        {
            let _busy = lease.begin_execute()?;
            let _perf = logging::perf::track(&self.effective);
            logging::log_ffi_call(self.func.name(), self.args.len());
            tracing::trace!(signature = %self.effective, address = format_args!("{:#x}", self.effective.address()), "Executing native call");

            self.state = CallState::Executing;
            let _scope = CallScope::enter(active.clone());
            unsafe {
                interface.call(self.effective.address(), self.ret as *mut c_void, self.args.as_mut_ptr());
            }
        }
        self.core.stats.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(err) = active.take_error() {
            logging::log_ffi_error(self.func.name(), &err.to_string());
            self.fail();
            return Err(err);
        }

        logging::log_ffi_return(self.func.name());
        self.state = CallState::Executed;
        Ok(())
    }

    /// Decode the return value and outputs, then release call resources
    pub fn complete(&mut self) -> Result<CallResult> {
        if self.state != CallState::Executed {
            return Err(FfiError::usage(format!("Cannot complete call in state {:?}", self.state)));
        }

        let decoder = Decoder::new(&self.core.stats);
        let value = decoder.decode_return(self.ret, self.effective.return_type());

        let outputs = self
            .outputs
            .iter()
            .map(|out| {
                let ptr = out.address as *const u8;
                let value = match &out.kind {
                    OutputKind::Value(ty) => decoder.decode(ptr, ty, None),
                    OutputKind::Bytes(len) => {
                        Value::Buffer(unsafe { std::slice::from_raw_parts(ptr, *len) }.to_vec())
                    }
                    OutputKind::Text { wide: false, capacity } => {
                        let bytes = unsafe { std::slice::from_raw_parts(ptr, *capacity) };
                        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                        Value::String(String::from_utf8_lossy(&bytes[..len]).into_owned())
                    }
                    OutputKind::Text { wide: true, capacity } => {
                        let units: Vec<u16> = (0..*capacity)
                            .map(|i| unsafe { std::ptr::read_unaligned((ptr as *const u16).add(i)) })
                            .take_while(|&u| u != 0)
                            .collect();
                        Value::String(String::from_utf16_lossy(&units))
                    }
                };
                (out.position, value)
            })
            .collect();

        self.release();
        self.state = CallState::Completed;
        Ok(CallResult { value, outputs })
    }

    fn fail(&mut self) {
        self.state = CallState::Failed;
        self.core.stats.failures.fetch_add(1, Ordering::Relaxed);
        self.release();
    }

    fn release(&mut self) {
        for slot in self.transients.drain(..) {
            self.core.trampolines.release(slot);
        }
        if std::mem::take(&mut self.holds_variadic) {
            self.func.busy.store(false, Ordering::Release);
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("function", &self.effective.to_string())
            .field("state", &self.state)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Binds host functions passed as callback arguments for one call only
struct TransientBinder<'a> {
    core: &'a Arc<EngineCore>,
    lease: &'a ArenaLease,
    pending: &'a Arc<PendingError>,
    slots: &'a mut SmallVec<[usize; 2]>,
}

impl CallbackBinder for TransientBinder<'_> {
    fn bind(&mut self, ty: &TypeRef, func: &HostFunction) -> Result<usize> {
        let owner = CallOwner {
            arena: self.lease.downgrade(),
            generation: self.lease.generation(),
            pending: self.pending.clone(),
        };
        let (slot, address) = self
            .core
            .trampolines
            .bind(self.core, ty, func.clone(), None, Some(owner))?;
        self.slots.push(slot);
        Ok(address)
    }
}

/// Backing memory for an out/inout argument; returns the address to pass
fn encode_output(
    encoder: &mut Encoder<'_>,
    param: &ParameterInfo,
    value: &Value,
    outputs: &mut SmallVec<[OutputSlot; 4]>,
) -> Result<usize> {
    let arena = encoder.arena();
    let ty = &param.ty;
    let position = param.position;

    if value.is_nullish() {
        return Ok(0);
    }

    match ty.primitive() {
        PrimitiveKind::Pointer => {
            let target = ty.target().filter(|t| t.size() > 0).cloned();

            let (address, kind) = match value {
                Value::External(ext) => match target {
                    Some(target) => (ext.address, OutputKind::Value(target)),
                    None => return Ok(ext.address),
                },
                Value::Buffer(bytes) => {
                    let align = target.as_ref().map_or(1, |t| t.align());
                    let ptr = if param.direction.reads() {
                        arena.copy_to_heap(bytes, align)?
                    } else {
                        arena.alloc_heap_zeroed(bytes.len().max(1), align)?
                    };
                    (ptr.as_ptr() as usize, OutputKind::Bytes(bytes.len()))
                }
                _ => {
                    let target = target.ok_or_else(|| {
                        FfiError::argument(format!("Cannot use {} as an output parameter here", ty.name()))
                    })?;
                    let ptr = arena.alloc_heap_zeroed(target.size(), target.align())?;
                    if param.direction.reads() {
                        encoder.encode(value, &target, ptr.as_ptr())?;
                    }
                    (ptr.as_ptr() as usize, OutputKind::Value(target))
                }
            };

            outputs.push(OutputSlot { position, address, kind });
            Ok(address)
        }
        PrimitiveKind::String | PrimitiveKind::String16 => {
            let wide = ty.primitive() == PrimitiveKind::String16;
            let unit = if wide { 2 } else { 1 };

            let (capacity, initial) = match value {
                Value::String(_) | Value::String16(_) => {
                    let units: Vec<u8> = if wide {
                        value.to_utf16().unwrap_or_default().iter().flat_map(|u| u.to_ne_bytes()).collect()
                    } else {
                        value.to_utf8().unwrap_or_default().into_bytes()
                    };
                    (units.len() / unit + 1, units)
                }
                v if v.is_number() => {
                    let capacity = v.as_u64().unwrap_or(0) as usize;
                    if capacity == 0 {
                        return Err(FfiError::argument("Output string capacity must be positive"));
                    }
                    (capacity, Vec::new())
                }
                _ => {
                    return Err(FfiError::argument(format!(
                        "Unexpected {} value for {} output, expected string or capacity",
                        value.kind_name(),
                        ty.name()
                    )));
                }
            };

            let ptr = arena.alloc_heap_zeroed(capacity * unit, unit)?;
            if param.direction.reads() {
                unsafe { std::ptr::copy_nonoverlapping(initial.as_ptr(), ptr.as_ptr(), initial.len()) };
            }

            outputs.push(OutputSlot {
                position,
                address: ptr.as_ptr() as usize,
                kind: OutputKind::Text { wide, capacity },
            });
            Ok(ptr.as_ptr() as usize)
        }
        _ => Err(FfiError::argument(format!(
            "Type {} cannot be used as an output parameter",
            ty.name()
        ))),
    }
}
