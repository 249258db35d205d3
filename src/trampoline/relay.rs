//! Native -> host relay shared by every trampoline
//!
//! Panics and host errors never unwind into native frames: the return slot
//! is zeroed and the failure is recorded on the call that owns the binding,
//! or else on the call active on this thread.

use libffi::raw;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::pool::{Binding, SlotAnchor};
use crate::concurrency::context::{self, PendingError};
use crate::error::{FfiError, ErrorKind, Result};
use crate::interop::abi::FFI_ARG_SIZE;
use crate::interop::marshal::{Decoder, Encoder};
use crate::logging;
use crate::memory::{Arena, ArenaLease};
use crate::types::{PrimitiveKind, TypeRef};
use crate::value::Value;
use crate::EngineCore;

pub(super) unsafe extern "C" fn relay(
    cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let anchor = &*(userdata as *const SlotAnchor);

    let mut owner = None;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(anchor, ret as *mut u8, args, &mut owner)));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(_) => FfiError::NativeFailure("Callback panicked".into()),
    };

    zero_return(cif, ret as *mut u8);
    if err.kind() != ErrorKind::Usage {
        logging::log_ffi_error("callback", &err.to_string());
    }
    match owner {
        Some(pending) => pending.set(err),
        None => {
            if let Some(active) = context::current() {
                active.fail(err);
            }
        }
    }
}

unsafe fn zero_return(cif: *mut raw::ffi_cif, ret: *mut u8) {
    let rtype = (*cif).rtype;
    if rtype.is_null() || (*rtype).type_ as u32 == raw::FFI_TYPE_VOID {
        return;
    }
    ptr::write_bytes(ret, 0, (*rtype).size.max(FFI_ARG_SIZE));
}

fn stale(index: usize, reason: &str) -> FfiError {
    logging::log_stale_trampoline(index, reason);
    FfiError::usage(format!("Trampoline {} invoked {}", index, reason))
}

unsafe fn dispatch(
    anchor: &SlotAnchor,
    ret: *mut u8,
    args: *mut *mut c_void,
    owner: &mut Option<Arc<PendingError>>,
) -> Result<()> {
    let index = anchor.index;
    let pool = anchor
        .pool
        .upgrade()
        .ok_or_else(|| stale(index, "after its table was dropped"))?;
    let binding = pool
        .binding(index)
        .ok_or_else(|| stale(index, "after it was released"))?;
    let engine = binding
        .engine
        .upgrade()
        .ok_or_else(|| stale(index, "after its engine was dropped"))?;

    if let Some(call) = &binding.owner {
        if !call.is_live() {
            return Err(stale(index, "after the call it was passed to"));
        }
        *owner = Some(call.pending.clone());
    }

    // Scratch of the call running on this thread is reused only when the
    // relay belongs to it; foreign threads get their own arena
    let active = context::current();
    let same_call = match (&active, &binding.owner) {
        (Some(active), Some(call)) => active.lease.generation() == call.generation,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let lease: Arc<ArenaLease> = match active {
        Some(active) if same_call => active.lease.clone(),
        _ => {
            let config = engine.config.read().clone();
            Arc::new(engine.arenas().acquire(config.async_stack_size, config.async_heap_size)?)
        }
    };

    // Heap spills stay alive until the owning call ends; native code may
    // still read a returned string
    let mark = lease.stack_mark();
    let result = invoke(&engine, &binding, index, &lease, ret, args);
    lease.restore_stack(mark);
    result
}

unsafe fn invoke(
    engine: &Arc<EngineCore>,
    binding: &Binding,
    index: usize,
    arena: &Arena,
    ret: *mut u8,
    args: *mut *mut c_void,
) -> Result<()> {
    let proto = &binding.proto;
    let decoder = Decoder::new(&engine.stats);
    let values: Vec<Value> = proto
        .parameters()
        .iter()
        .enumerate()
        .map(|(i, param)| decoder.decode(*args.add(i) as *const u8, &param.ty, None))
        .collect();

    let cross_thread = !engine.dispatcher.is_host_thread();
    logging::log_relay(index, cross_thread);

    let callback = binding.callback.clone();
    let receiver = binding.receiver.clone();
    let value = engine
        .dispatcher
        .call_on_host(move || callback.call(receiver.as_ref(), &values))??;
    engine.stats.relays.fetch_add(1, Ordering::Relaxed);

    let ret_ty = proto.return_type();
    if ret_ty.primitive() == PrimitiveKind::Void {
        return Ok(());
    }
    encode_return(&mut Encoder::new(arena, None), &value, ret_ty, ret)
}

/// libffi expects integral returns narrower than `ffi_arg` widened to it
fn encode_return(encoder: &mut Encoder<'_>, value: &Value, ty: &TypeRef, ret: *mut u8) -> Result<()> {
    let kind = ty.primitive();
    if !(kind.is_integer() || kind == PrimitiveKind::Bool) || ty.size() >= FFI_ARG_SIZE {
        return encoder.encode(value, ty, ret);
    }

    let mut tmp = [0u8; 8];
    encoder.encode(value, ty, tmp.as_mut_ptr())?;

    let signed = kind.is_signed();
    let wide: i64 = match ty.size() {
        1 if signed => tmp[0] as i8 as i64,
        1 => tmp[0] as i64,
        2 if signed => i16::from_ne_bytes([tmp[0], tmp[1]]) as i64,
        2 => u16::from_ne_bytes([tmp[0], tmp[1]]) as i64,
        4 if signed => i32::from_ne_bytes([tmp[0], tmp[1], tmp[2], tmp[3]]) as i64,
        _ => u32::from_ne_bytes([tmp[0], tmp[1], tmp[2], tmp[3]]) as i64,
    };
    unsafe { ptr::write_unaligned(ret as *mut raw::ffi_arg, wide as raw::ffi_arg) };
    Ok(())
}
