//! Value marshaling - host values <-> native memory
//!
//! Design: descriptors drive every conversion. Encoding writes exactly
//! `size` bytes at the destination, spilling strings and pointees into the
//! arena heap; decoding produces owned host values and runs finalizers of
//! disposable types once per decoded occurrence.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::abi::FFI_ARG_SIZE;
use super::StatsCounters;
use crate::error::{FfiError, Result};
use crate::logging;
use crate::memory::Arena;
use crate::types::{ArrayHint, PrimitiveKind, TypeInfo, TypeRef};
use crate::value::{External, HostFunction, UnionValue, Value, MAX_SAFE_INTEGER};

#[inline]
fn read<T: Copy>(ptr: *const u8) -> T {
    unsafe { ptr::read_unaligned(ptr as *const T) }
}

#[inline]
fn write<T: Copy>(ptr: *mut u8, value: T) {
    unsafe { ptr::write_unaligned(ptr as *mut T, value) }
}

fn int64_value(v: i64) -> Value {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
        Value::Number(v as f64)
    } else {
        Value::Int64(v)
    }
}

fn uint64_value(v: u64) -> Value {
    if v <= MAX_SAFE_INTEGER as u64 {
        Value::Number(v as f64)
    } else {
        Value::UInt64(v)
    }
}

fn unexpected(value: &Value, expected: &str) -> FfiError {
    FfiError::argument(format!("Unexpected {} value, expected {}", value.kind_name(), expected))
}

/// Native memory -> host values
pub(crate) struct Decoder<'a> {
    stats: &'a Arc<StatsCounters>,
}

impl<'a> Decoder<'a> {
    pub fn new(stats: &'a Arc<StatsCounters>) -> Self {
        Self { stats }
    }

    /// Decode the value of type `ty` stored at `ptr`
    ///
    /// `len` overrides the element count of arrays and the length of strings.
    pub fn decode(&self, ptr: *const u8, ty: &TypeRef, len: Option<usize>) -> Value {
        use PrimitiveKind::*;

        match ty.primitive() {
            Void | Prototype => Value::Undefined,
            Bool => Value::Bool(read::<u8>(ptr) != 0),
            Int8 => Value::Number(read::<i8>(ptr) as f64),
            UInt8 => Value::Number(read::<u8>(ptr) as f64),
            Int16 => Value::Number(read::<i16>(ptr) as f64),
            Int16Swapped => Value::Number(read::<i16>(ptr).swap_bytes() as f64),
            UInt16 => Value::Number(read::<u16>(ptr) as f64),
            UInt16Swapped => Value::Number(read::<u16>(ptr).swap_bytes() as f64),
            Int32 => Value::Number(read::<i32>(ptr) as f64),
            Int32Swapped => Value::Number(read::<i32>(ptr).swap_bytes() as f64),
            UInt32 => Value::Number(read::<u32>(ptr) as f64),
            UInt32Swapped => Value::Number(read::<u32>(ptr).swap_bytes() as f64),
            Int64 => int64_value(read::<i64>(ptr)),
            Int64Swapped => int64_value(read::<i64>(ptr).swap_bytes()),
            UInt64 => uint64_value(read::<u64>(ptr)),
            UInt64Swapped => uint64_value(read::<u64>(ptr).swap_bytes()),
            Float32 => Value::Number(read::<f32>(ptr) as f64),
            Float64 => Value::Number(read::<f64>(ptr)),
            String | String16 => {
                let address = read::<usize>(ptr);
                let value = match address {
                    0 => Value::Null,
                    _ if ty.primitive() == String => read_text8(address as *const u8, len),
                    _ => read_text16(address as *const u16, len),
                };
                self.dispose(ty, address);
                value
            }
            Pointer => {
                let address = read::<usize>(ptr);
                if address == 0 {
                    return Value::Null;
                }
                let target = ty.target();
                let value = match target {
                    // Owned pointee is copied out before the memory is released
                    Some(target) if ty.is_disposable() && target.size() > 0 => {
                        self.decode(address as *const u8, target, len)
                    }
                    _ => Value::External(External {
                        address,
                        tag: target.map(|t| t.id()),
                    }),
                };
                self.dispose(ty, address);
                value
            }
            Callback => match read::<usize>(ptr) {
                0 => Value::Null,
                address => Value::wrap_external(address, Some(ty.id())),
            },
            Record => {
                let members = ty
                    .members()
                    .iter()
                    .map(|m| (m.name.clone(), self.decode(ptr.wrapping_add(m.offset), &m.ty, None)))
                    .collect();
                Value::Record(members)
            }
            Union => {
                let raw = unsafe { std::slice::from_raw_parts(ptr, ty.size()) };
                Value::Union(UnionValue::from_raw(ty.clone(), raw, self.stats.clone()))
            }
            Array => self.decode_array(ptr, ty, len),
        }
    }

    /// Decode a return slot, where libffi widens small integers to `ffi_arg`
    pub fn decode_return(&self, ptr: *const u8, ty: &TypeRef) -> Value {
        let widened = (ty.primitive().is_integer() || ty.primitive() == PrimitiveKind::Bool)
            && ty.size() < FFI_ARG_SIZE;

        if widened && cfg!(target_endian = "big") {
            self.decode(ptr.wrapping_add(FFI_ARG_SIZE - ty.size()), ty, None)
        } else {
            self.decode(ptr, ty, None)
        }
    }

    fn decode_array(&self, ptr: *const u8, ty: &TypeRef, len: Option<usize>) -> Value {
        let Some(element) = ty.target() else {
            return Value::Undefined;
        };
        let count = len.unwrap_or(ty.length());

        match ty.hint() {
            ArrayHint::String if element.size() == 1 => read_text8(ptr, Some(count)),
            ArrayHint::String if element.size() == 2 => read_text16(ptr as *const u16, Some(count)),
            ArrayHint::Typed if element.primitive().is_number() => {
                let bytes = unsafe { std::slice::from_raw_parts(ptr, count * element.size()) };
                Value::Buffer(bytes.to_vec())
            }
            _ => Value::Array(
                (0..count)
                    .map(|i| self.decode(ptr.wrapping_add(i * element.size()), element, None))
                    .collect(),
            ),
        }
    }

    fn dispose(&self, ty: &TypeInfo, address: usize) {
        if address == 0 {
            return;
        }
        if let Some(finalizer) = ty.finalizer() {
            finalizer.run(address);
            self.stats.disposed.fetch_add(1, Ordering::Relaxed);
            logging::log_disposal(ty.name(), address);
        }
    }
}

/// NUL-terminated (or `len`-bounded, stopping at NUL) narrow text
fn read_text8(ptr: *const u8, len: Option<usize>) -> Value {
    let len = match len {
        Some(max) => (0..max).find(|&i| read::<u8>(ptr.wrapping_add(i)) == 0).unwrap_or(max),
        None => unsafe { libc::strlen(ptr as *const libc::c_char) },
    };
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

fn read_text16(ptr: *const u16, len: Option<usize>) -> Value {
    let at = |i: usize| read::<u16>(ptr.wrapping_add(i) as *const u8);
    let len = match len {
        Some(max) => (0..max).find(|&i| at(i) == 0).unwrap_or(max),
        None => (0..).find(|&i| at(i) == 0).unwrap_or(0),
    };
    let units: Vec<u16> = (0..len).map(at).collect();
    Value::String(String::from_utf16_lossy(&units))
}

/// Binds host functions passed where a callback is expected
pub(crate) trait CallbackBinder {
    fn bind(&mut self, ty: &TypeRef, func: &HostFunction) -> Result<usize>;
}

/// Host values -> native memory
pub(crate) struct Encoder<'a> {
    arena: &'a Arena,
    binder: Option<&'a mut dyn CallbackBinder>,
}

impl<'a> Encoder<'a> {
    pub fn new(arena: &'a Arena, binder: Option<&'a mut dyn CallbackBinder>) -> Self {
        Self { arena, binder }
    }

    #[inline]
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Write `value` as type `ty` into the `ty.size()` bytes at `dest`
    pub fn encode(&mut self, value: &Value, ty: &TypeRef, dest: *mut u8) -> Result<()> {
        use PrimitiveKind::*;

        if let Value::Cast(inner, cast) = value {
            return self.encode_cast(inner, cast, ty, dest);
        }

        match ty.primitive() {
            Void | Prototype => {
                return Err(FfiError::argument(format!("Cannot encode value of type {}", ty.name())));
            }
            Bool => match value {
                Value::Bool(b) => write::<u8>(dest, *b as u8),
                _ => return Err(unexpected(value, "boolean")),
            },
            Float32 => write::<f32>(dest, self.number(value)? as f32),
            Float64 => write::<f64>(dest, self.number(value)?),
            kind if kind.is_integer() => self.encode_integer(value, kind, dest)?,
            String => {
                let address = self.text8(value)?;
                write::<usize>(dest, address);
            }
            String16 => {
                let address = self.text16(value)?;
                write::<usize>(dest, address);
            }
            Pointer => {
                let address = self.pointer(value, ty)?;
                write::<usize>(dest, address);
            }
            Callback => {
                let address = self.callback(value, ty)?;
                write::<usize>(dest, address);
            }
            Record => self.encode_record(value, ty, dest)?,
            Union => self.encode_union(value, ty, dest)?,
            Array => self.encode_array(value, ty, dest)?,
            _ => unreachable!("integer kinds handled above"),
        }

        Ok(())
    }

    /// Reinterpret through another pointer type at a pointer position
    fn encode_cast(&mut self, inner: &Value, cast: &TypeRef, ty: &TypeRef, dest: *mut u8) -> Result<()> {
        let pointerish = |t: &TypeInfo| {
            matches!(
                t.primitive(),
                PrimitiveKind::Pointer | PrimitiveKind::String | PrimitiveKind::String16 | PrimitiveKind::Callback
            )
        };
        if !pointerish(ty) || !pointerish(cast) {
            return Err(FfiError::argument(format!(
                "Cannot cast to {} where {} is expected",
                cast.name(),
                ty.name()
            )));
        }
        self.encode(inner, cast, dest)
    }

    fn number(&self, value: &Value) -> Result<f64> {
        value.as_f64().ok_or_else(|| unexpected(value, "number"))
    }

    fn encode_integer(&self, value: &Value, kind: PrimitiveKind, dest: *mut u8) -> Result<()> {
        use PrimitiveKind::*;

        let v = match kind {
            UInt64 | UInt64Swapped => value.as_u64(),
            _ => value.as_i64().map(|v| v as u64),
        }
        .ok_or_else(|| unexpected(value, "number"))?;

        match kind {
            Int8 | UInt8 => write::<u8>(dest, v as u8),
            Int16 | UInt16 => write::<u16>(dest, v as u16),
            Int16Swapped | UInt16Swapped => write::<u16>(dest, (v as u16).swap_bytes()),
            Int32 | UInt32 => write::<u32>(dest, v as u32),
            Int32Swapped | UInt32Swapped => write::<u32>(dest, (v as u32).swap_bytes()),
            Int64 => write::<i64>(dest, v as i64),
            UInt64 => write::<u64>(dest, v),
            Int64Swapped => write::<i64>(dest, (v as i64).swap_bytes()),
            UInt64Swapped => write::<u64>(dest, v.swap_bytes()),
            _ => unreachable!("not an integer kind"),
        }
        Ok(())
    }

    /// Copy narrow text into the heap, returning its address
    pub fn text8(&mut self, value: &Value) -> Result<usize> {
        match value {
            Value::Null | Value::Undefined => Ok(0),
            Value::String(_) | Value::String16(_) => {
                let text = value.to_utf8().unwrap_or_default();
                self.copy_terminated(text.as_bytes(), 1)
            }
            Value::Buffer(bytes) => Ok(self.arena.copy_to_heap(bytes, 1)?.as_ptr() as usize),
            Value::External(ext) => Ok(ext.address),
            _ => Err(unexpected(value, "string")),
        }
    }

    /// Copy wide text into the heap, returning its address
    pub fn text16(&mut self, value: &Value) -> Result<usize> {
        match value {
            Value::Null | Value::Undefined => Ok(0),
            Value::String(_) | Value::String16(_) => {
                let units = value.to_utf16().unwrap_or_default();
                let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_ne_bytes()).collect();
                self.copy_terminated(&bytes, 2)
            }
            Value::Buffer(bytes) => Ok(self.arena.copy_to_heap(bytes, 2)?.as_ptr() as usize),
            Value::External(ext) => Ok(ext.address),
            _ => Err(unexpected(value, "string")),
        }
    }

    fn copy_terminated(&self, bytes: &[u8], unit: usize) -> Result<usize> {
        let ptr = self.arena.alloc_heap(bytes.len() + unit, unit)?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            ptr.as_ptr().add(bytes.len()).write_bytes(0, unit);
        }
        Ok(ptr.as_ptr() as usize)
    }

    /// Address for a pointer-typed position, spilling pointees to the heap
    pub fn pointer(&mut self, value: &Value, ty: &TypeRef) -> Result<usize> {
        let target = ty.target().cloned();

        match value {
            Value::Null | Value::Undefined => Ok(0),
            Value::External(ext) => {
                check_tag(ext, ty)?;
                Ok(ext.address)
            }
            Value::Buffer(bytes) => {
                let needed = target.as_ref().map_or(0, |t| t.size());
                if bytes.len() < needed {
                    return Err(FfiError::argument(format!(
                        "Buffer is too small for {} (expected at least {} bytes, got {})",
                        ty.name(),
                        needed,
                        bytes.len()
                    )));
                }
                let align = target.as_ref().map_or(1, |t| t.align());
                Ok(self.arena.copy_to_heap(bytes, align)?.as_ptr() as usize)
            }
            Value::String(_) | Value::String16(_) => match target.as_ref().map(|t| t.size()) {
                Some(2) => self.text16(value),
                _ => self.text8(value),
            },
            _ => {
                let target = target
                    .filter(|t| t.size() > 0)
                    .ok_or_else(|| unexpected(value, &format!("{}", ty.name())))?;
                let ptr = self.arena.alloc_heap_zeroed(target.size(), target.align())?;
                self.encode(value, &target, ptr.as_ptr())?;
                Ok(ptr.as_ptr() as usize)
            }
        }
    }

    fn callback(&mut self, value: &Value, ty: &TypeRef) -> Result<usize> {
        match value {
            Value::Null | Value::Undefined => Ok(0),
            Value::External(ext) => Ok(ext.address),
            Value::Function(func) => match self.binder.as_deref_mut() {
                Some(binder) => binder.bind(ty, func),
                None => Err(FfiError::argument(format!(
                    "Cannot use a transient function as {} here",
                    ty.name()
                ))),
            },
            _ => Err(unexpected(value, "function")),
        }
    }

    fn encode_record(&mut self, value: &Value, ty: &TypeRef, dest: *mut u8) -> Result<()> {
        let Value::Record(record) = value else {
            return Err(unexpected(value, "object"));
        };

        unsafe { dest.write_bytes(0, ty.size()) };
        for member in ty.members() {
            if let Some(v) = record.get(&member.name) {
                self.encode(v, &member.ty, dest.wrapping_add(member.offset))?;
            }
        }
        Ok(())
    }

    fn encode_union(&mut self, value: &Value, ty: &TypeRef, dest: *mut u8) -> Result<()> {
        unsafe { dest.write_bytes(0, ty.size()) };

        match value {
            Value::Union(union) if union.type_info().id() == ty.id() => {
                if let Some((idx, v)) = union.active_index() {
                    let member = &ty.members()[idx];
                    return self.encode(v, &member.ty, dest);
                }
                match union.raw() {
                    Some(raw) => {
                        unsafe { ptr::copy_nonoverlapping(raw.as_ptr(), dest, raw.len().min(ty.size())) };
                        Ok(())
                    }
                    None => Err(FfiError::argument("Cannot encode empty union value")),
                }
            }
            Value::Record(record) if record.len() == 1 => {
                let Some((name, v)) = record.iter().next() else {
                    return Err(FfiError::argument("Cannot encode empty union value"));
                };
                let member = ty.member(name).ok_or_else(|| {
                    FfiError::argument(format!("Union '{}' has no member '{}'", ty.name(), name))
                })?;
                self.encode(v, &member.ty, dest)
            }
            _ => Err(unexpected(value, &format!("union value of {}", ty.name()))),
        }
    }

    fn encode_array(&mut self, value: &Value, ty: &TypeRef, dest: *mut u8) -> Result<()> {
        let Some(element) = ty.target() else {
            return Err(FfiError::argument("Array type without element type"));
        };
        unsafe { dest.write_bytes(0, ty.size()) };

        match value {
            Value::Array(items) => {
                if items.len() > ty.length() {
                    return Err(FfiError::argument(format!(
                        "Expected array of length <= {}, got {}",
                        ty.length(),
                        items.len()
                    )));
                }
                for (i, item) in items.iter().enumerate() {
                    self.encode(item, element, dest.wrapping_add(i * element.size()))?;
                }
                Ok(())
            }
            Value::Buffer(bytes) => {
                if bytes.len() > ty.size() {
                    return Err(FfiError::argument(format!(
                        "Buffer of {} bytes does not fit in {}",
                        bytes.len(),
                        ty.name()
                    )));
                }
                unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len()) };
                Ok(())
            }
            Value::String(_) | Value::String16(_) if matches!(element.size(), 1 | 2) => {
                // Truncated to leave room for the terminator
                let limit = ty.length().saturating_sub(1);
                if element.size() == 1 {
                    let text = value.to_utf8().unwrap_or_default();
                    let bytes = &text.as_bytes()[..text.len().min(limit)];
                    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len()) };
                } else {
                    let units = value.to_utf16().unwrap_or_default();
                    for (i, unit) in units.iter().take(limit).enumerate() {
                        write::<u16>(dest.wrapping_add(i * 2), *unit);
                    }
                }
                Ok(())
            }
            _ => Err(unexpected(value, "array")),
        }
    }
}

/// Tagged externals must point at the declared pointee, `void *` takes anything
fn check_tag(ext: &External, ty: &TypeInfo) -> Result<()> {
    let (Some(tag), Some(target)) = (ext.tag, ty.target()) else {
        return Ok(());
    };
    if target.primitive() == PrimitiveKind::Void && target.name() == "void" {
        return Ok(());
    }
    if tag != target.id() && tag != ty.id() {
        return Err(FfiError::argument(format!(
            "Cannot pass external handle as {}, its type tag does not match",
            ty.name()
        )));
    }
    Ok(())
}
