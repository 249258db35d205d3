//! ABI (Application Binary Interface) handling
//!
//! Maps descriptors onto libffi layouts and prepares call interfaces.
//! Calling conventions only differ on 32-bit x86; elsewhere every
//! convention maps to the platform default ABI.

use libffi::middle::{CodePtr, Type};
use libffi::raw;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::iter;
use std::os::raw::c_uint;

use crate::error::{FfiError, Result};
use crate::memory::align_up;
use crate::types::{PrimitiveKind, TypeInfo};

/// Calling convention specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CallConvention {
    /// C calling convention (platform default)
    #[default]
    Cdecl,
    /// Callee cleans the stack (Win32 API)
    Stdcall,
    /// First arguments in ECX/EDX
    Fastcall,
    /// Receiver in ECX (MSVC member functions)
    Thiscall,
}

impl CallConvention {
    /// Declaration keywords recognized by the prototype parser
    pub const KEYWORDS: &'static [(&'static str, CallConvention)] = &[
        ("__cdecl", CallConvention::Cdecl),
        ("__stdcall", CallConvention::Stdcall),
        ("__fastcall", CallConvention::Fastcall),
        ("__thiscall", CallConvention::Thiscall),
    ];

    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Cdecl => "__cdecl",
            Self::Stdcall => "__stdcall",
            Self::Fastcall => "__fastcall",
            Self::Thiscall => "__thiscall",
        }
    }

    #[cfg(target_arch = "x86")]
    pub(crate) fn ffi_abi(self) -> raw::ffi_abi {
        match self {
            Self::Cdecl => raw::ffi_abi_FFI_DEFAULT_ABI,
            Self::Stdcall => raw::ffi_abi_FFI_STDCALL,
            Self::Fastcall => raw::ffi_abi_FFI_FASTCALL,
            Self::Thiscall => raw::ffi_abi_FFI_THISCALL,
        }
    }

    #[cfg(not(target_arch = "x86"))]
    pub(crate) fn ffi_abi(self) -> raw::ffi_abi {
        raw::ffi_abi_FFI_DEFAULT_ABI
    }
}

/// Size of the register-wide slot libffi uses for small integer returns
pub(crate) const FFI_ARG_SIZE: usize = std::mem::size_of::<raw::ffi_arg>();

/// libffi layout for a descriptor
pub(crate) fn ffi_type(ty: &TypeInfo) -> Type {
    use PrimitiveKind::*;

    match ty.primitive() {
        Void => Type::void(),
        Bool | UInt8 => Type::u8(),
        Int8 => Type::i8(),
        Int16 | Int16Swapped => Type::i16(),
        UInt16 | UInt16Swapped => Type::u16(),
        Int32 | Int32Swapped => Type::i32(),
        UInt32 | UInt32Swapped => Type::u32(),
        Int64 | Int64Swapped => Type::i64(),
        UInt64 | UInt64Swapped => Type::u64(),
        Float32 => Type::f32(),
        Float64 => Type::f64(),
        String | String16 | Pointer | Callback | Prototype => Type::pointer(),
        Record if has_natural_layout(ty) => {
            Type::structure(ty.members().iter().map(|m| ffi_type(&m.ty)))
        }
        Record => opaque_units(ty),
        Union => union_layout(ty),
        Array => match ty.target() {
            Some(element) => Type::structure(iter::repeat_with(|| ffi_type(element)).take(ty.length())),
            None => opaque_units(ty),
        },
    }
}

/// Members sit where C would put them without packing or overrides
fn has_natural_layout(ty: &TypeInfo) -> bool {
    let mut offset = 0;
    let mut align = 1;

    for member in ty.members() {
        let member_align = member.ty.align().max(1);
        offset = align_up(offset, member_align);
        if offset != member.offset {
            return false;
        }
        offset += member.ty.size();
        align = align.max(member_align);
    }

    align == ty.align() && align_up(offset, align) == ty.size()
}

/// Unions made only of floating-point leaves are classified as floats by
/// the C ABI, so they are laid out in float units
fn union_layout(ty: &TypeInfo) -> Type {
    let mut leaves = FloatLeaves::default();
    if !leaves.collect(ty) {
        return opaque_units(ty);
    }

    let (unit, width): (fn() -> Type, usize) = match (leaves.single, leaves.double) {
        (true, false) => (Type::f32, 4),
        (false, true) => (Type::f64, 8),
        (true, true) if cfg!(target_arch = "x86_64") => (Type::f64, 8),
        _ => return opaque_units(ty),
    };
    if ty.size() % width != 0 {
        return opaque_units(ty);
    }
    Type::structure(iter::repeat_with(unit).take(ty.size() / width))
}

#[derive(Default)]
struct FloatLeaves {
    single: bool,
    double: bool,
}

impl FloatLeaves {
    /// False as soon as a non-float leaf shows up
    fn collect(&mut self, ty: &TypeInfo) -> bool {
        match ty.primitive() {
            PrimitiveKind::Float32 => {
                self.single = true;
                true
            }
            PrimitiveKind::Float64 => {
                self.double = true;
                true
            }
            PrimitiveKind::Record | PrimitiveKind::Union => {
                !ty.members().is_empty() && ty.members().iter().all(|m| self.collect(&m.ty))
            }
            PrimitiveKind::Array => ty.target().is_some_and(|element| self.collect(element)),
            _ => false,
        }
    }
}

// Integer units of the aggregate's alignment covering its size
fn opaque_units(ty: &TypeInfo) -> Type {
    let (unit, width): (fn() -> Type, usize) = match ty.align() {
        8 => (Type::u64, 8),
        4 => (Type::u32, 4),
        2 => (Type::u16, 2),
        _ => (Type::u8, 1),
    };
    let count = (ty.size() / width).max(1);
    Type::structure(iter::repeat_with(unit).take(count))
}

/// Prepared libffi call interface (`ffi_cif`) with its owned layouts
pub struct CallInterface {
    cif: Box<UnsafeCell<raw::ffi_cif>>,
    _arg_types: Vec<Type>,
    _arg_ptrs: Vec<*mut raw::ffi_type>,
    _ret_type: Type,
    ret_size: usize,
}

// The cif and the layouts it points to are immutable after preparation.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare an interface; `fixed` is the fixed argument count of a variadic call
    pub(crate) fn new(
        ret: &TypeInfo,
        params: &[&TypeInfo],
        fixed: Option<usize>,
        convention: CallConvention,
    ) -> Result<Self> {
        let ret_type = ffi_type(ret);
        let arg_types: Vec<Type> = params.iter().map(|p| ffi_type(p)).collect();
        let mut arg_ptrs: Vec<*mut raw::ffi_type> = arg_types.iter().map(Type::as_raw_ptr).collect();

        let cif = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<raw::ffi_cif>() }));
        let abi = convention.ffi_abi();
        let nargs = arg_ptrs.len() as c_uint;

        let status = unsafe {
            match fixed {
                Some(fixed) => raw::ffi_prep_cif_var(
                    cif.get(),
                    abi,
                    fixed as c_uint,
                    nargs,
                    ret_type.as_raw_ptr(),
                    arg_ptrs.as_mut_ptr(),
                ),
                None => raw::ffi_prep_cif(cif.get(), abi, nargs, ret_type.as_raw_ptr(), arg_ptrs.as_mut_ptr()),
            }
        };

        if status != raw::ffi_status_FFI_OK {
            return Err(FfiError::argument(format!(
                "Failed to prepare call interface for {} parameters (libffi status {})",
                params.len(),
                status
            )));
        }

        Ok(Self {
            cif,
            _arg_types: arg_types,
            _arg_ptrs: arg_ptrs,
            _ret_type: ret_type,
            ret_size: ret.size(),
        })
    }

    #[inline]
    pub(crate) fn as_raw(&self) -> *mut raw::ffi_cif {
        self.cif.get()
    }

    /// Bytes to reserve for the return value
    #[inline]
    pub(crate) fn return_slot_size(&self) -> usize {
        self.ret_size.max(FFI_ARG_SIZE)
    }

    /// Invoke `address`
    ///
    /// # Safety
    /// `args` must hold one valid pointer per prepared parameter, each to a
    /// value of the declared layout, and `ret` must have room for
    /// [`Self::return_slot_size`] bytes.
    #[inline]
    pub(crate) unsafe fn call(&self, address: usize, ret: *mut c_void, args: *mut *mut c_void) {
        let code = CodePtr::from_ptr(address as *const c_void);
        raw::ffi_call(self.cif.get(), Some(*code.as_safe_fun()), ret, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberSpec, TypeRegistry};

    #[test]
    fn test_keywords_round_trip() {
        for (keyword, convention) in CallConvention::KEYWORDS {
            assert_eq!(convention.keyword(), *keyword);
        }
        assert_eq!(CallConvention::default(), CallConvention::Cdecl);
    }

    #[test]
    fn test_natural_layout_detection() {
        let types = TypeRegistry::default();
        let natural = types
            .define_record(None, &[MemberSpec::new("a", "uint8_t"), MemberSpec::new("b", "int32_t")], false)
            .unwrap();
        let packed = types
            .define_record(None, &[MemberSpec::new("a", "uint8_t"), MemberSpec::new("b", "int32_t")], true)
            .unwrap();

        assert!(has_natural_layout(&natural));
        assert!(!has_natural_layout(&packed));
    }

    fn element_kinds(ty: &Type) -> Vec<u32> {
        let mut kinds = Vec::new();
        unsafe {
            let mut element = (*ty.as_raw_ptr()).elements;
            while !(*element).is_null() {
                kinds.push((**element).type_ as u32);
                element = element.add(1);
            }
        }
        kinds
    }

    #[test]
    fn test_float_union_units() {
        let types = TypeRegistry::default();
        let floats = types
            .define_union(None, &[MemberSpec::new("a", "float"), MemberSpec::new("b", "float")])
            .unwrap();
        let pair = types.define_array("double", 2, None).unwrap();
        let doubles = types
            .define_union(None, &[MemberSpec::new("a", "double"), MemberSpec::new("b", pair)])
            .unwrap();
        let mixed = types
            .define_union(None, &[MemberSpec::new("i", "int32_t"), MemberSpec::new("f", "float")])
            .unwrap();

        assert_eq!(element_kinds(&ffi_type(&floats)), vec![raw::FFI_TYPE_FLOAT]);
        assert_eq!(element_kinds(&ffi_type(&doubles)), vec![raw::FFI_TYPE_DOUBLE; 2]);
        assert_eq!(element_kinds(&ffi_type(&mixed)), vec![raw::FFI_TYPE_UINT32]);
    }

    #[test]
    fn test_prepare_aggregate_interfaces() {
        let types = TypeRegistry::default();
        let point = types
            .define_record(None, &[MemberSpec::new("x", "double"), MemberSpec::new("y", "double")], false)
            .unwrap();
        let number = types
            .define_union(None, &[MemberSpec::new("i", "int64_t"), MemberSpec::new("d", "double")])
            .unwrap();
        let int = types.resolve("int").unwrap();

        let cif = CallInterface::new(&point, &[&point, &number, &int], None, CallConvention::Cdecl).unwrap();
        assert_eq!(cif.return_slot_size(), 16);

        let var = CallInterface::new(&int, &[&int, &int], Some(1), CallConvention::Cdecl).unwrap();
        assert_eq!(var.return_slot_size(), FFI_ARG_SIZE);
    }
}
