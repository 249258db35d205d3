//! Type registry - transactional definition and name resolution
//!
//! Every definition runs inside a [`Transaction`]: descriptors and names it
//! appends are rolled back when any later validation fails, so a failed
//! definition never leaves partial state behind.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::parser::{self, ParsedParam};
use super::{
    can_store, ArrayHint, Directed, Direction, FunctionInfo, ParameterInfo, PrimitiveKind,
    RecordMember, TypeInfo, TypeIntrospection, TypeLink, TypeRef, TypeSpec, POINTER_SIZE,
};
use crate::config::MAX_POINTER_DEPTH;
use crate::error::{FfiError, Result};
use crate::interop::abi::CallConvention;
use crate::logging;
use crate::value::Finalizer;

/// Member declaration for records and unions
#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub name: String,
    pub ty: TypeSpec,
    /// Explicit alignment (1, 2, 4 or 8)
    pub align: Option<usize>,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, ty: impl Into<TypeSpec>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            align: None,
        }
    }

    pub fn aligned(mut self, align: usize) -> Self {
        self.align = Some(align);
        self
    }
}

#[derive(Default)]
struct Tables {
    types: Vec<TypeRef>,
    names: HashMap<String, TypeRef>,
}

/// Registry of type descriptors, indexed by name
pub struct TypeRegistry {
    tables: RwLock<Tables>,
    max_type_size: AtomicUsize,
}

impl TypeRegistry {
    /// Registry preloaded with the built-in primitive names
    pub fn new(max_type_size: usize) -> Self {
        let mut tables = Tables::default();
        install_builtins(&mut tables);

        Self {
            tables: RwLock::new(tables),
            max_type_size: AtomicUsize::new(max_type_size),
        }
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.tables.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set_max_type_size(&self, size: usize) {
        self.max_type_size.store(size, Ordering::Relaxed);
    }

    /// Exact name lookup, without parsing
    pub fn lookup(&self, name: &str) -> Option<TypeRef> {
        self.tables.read().names.get(name).cloned()
    }

    /// Resolve a name or handle to a descriptor
    pub fn resolve(&self, spec: impl Into<TypeSpec>) -> Result<TypeRef> {
        match spec.into() {
            TypeSpec::Type(ty) => Ok(ty),
            TypeSpec::Directed(directed) => Ok(directed.ty),
            TypeSpec::Name(name) => {
                if let Some(ty) = self.lookup(&name) {
                    return Ok(ty);
                }
                self.transaction(|tx| tx.resolve_name(&name))
            }
        }
    }

    /// Resolve keeping the direction tag (plain types resolve as input)
    pub fn resolve_directed(&self, spec: impl Into<TypeSpec>) -> Result<Directed> {
        match spec.into() {
            TypeSpec::Directed(directed) => Ok(directed),
            other => Ok(Directed::input(self.resolve(other)?)),
        }
    }

    pub fn define_record(
        &self,
        name: Option<&str>,
        members: &[MemberSpec],
        packed: bool,
    ) -> Result<TypeRef> {
        self.transaction(|tx| tx.define_aggregate(name, members, packed, PrimitiveKind::Record))
    }

    pub fn define_union(&self, name: Option<&str>, members: &[MemberSpec]) -> Result<TypeRef> {
        self.transaction(|tx| tx.define_aggregate(name, members, false, PrimitiveKind::Union))
    }

    /// Pointer type with `count` levels of indirection (1 to 4)
    pub fn define_pointer(
        &self,
        name: Option<&str>,
        target: impl Into<TypeSpec>,
        count: usize,
    ) -> Result<TypeRef> {
        if !(1..=MAX_POINTER_DEPTH).contains(&count) {
            return Err(FfiError::argument(format!(
                "Value of count must be between 1 and {}",
                MAX_POINTER_DEPTH
            )));
        }
        let target = target.into();

        self.transaction(|tx| {
            let target = tx.resolve_spec(target)?;
            let ptr = tx.make_pointer(target, count);

            match name {
                Some(name) => tx.insert_named(ptr.copy_as(name)),
                None => Ok(ptr),
            }
        })
    }

    pub fn define_array(
        &self,
        target: impl Into<TypeSpec>,
        length: usize,
        hint: Option<ArrayHint>,
    ) -> Result<TypeRef> {
        let target = target.into();
        self.transaction(|tx| {
            let element = tx.resolve_spec(target)?;
            tx.make_array(element, length, hint)
        })
    }

    /// Opaque type, usable only behind pointers
    pub fn define_opaque(&self, name: Option<&str>) -> Result<TypeRef> {
        self.transaction(|tx| {
            let ty = TypeInfo::new(name.unwrap_or("<anonymous>"), PrimitiveKind::Void, 0, 0);
            match name {
                Some(_) => tx.insert_named(ty),
                None => Ok(tx.push(ty)),
            }
        })
    }

    /// Pointer or string type whose decoded values are released by `finalizer`
    ///
    /// Without a finalizer the memory is released with the C allocator.
    pub fn define_disposable(
        &self,
        name: Option<&str>,
        target: impl Into<TypeSpec>,
        finalizer: Option<Finalizer>,
    ) -> Result<TypeRef> {
        let target = target.into();
        self.transaction(|tx| {
            let target = tx.resolve_spec(target)?;
            let ty = make_disposable(&target, name, finalizer)?;

            match name {
                Some(_) => tx.insert_named(ty),
                None => Ok(tx.push(ty)),
            }
        })
    }

    /// Named callback prototype; pointers to it are callback types
    pub fn define_callback_prototype(
        &self,
        name: &str,
        ret: impl Into<TypeSpec>,
        params: &[TypeSpec],
        convention: CallConvention,
    ) -> Result<TypeRef> {
        let ret = ret.into();
        self.transaction(|tx| {
            tx.check_unique(name)?;
            let proto = tx.function_info(name, ret, params, convention)?;
            if proto.is_variadic() {
                return Err(FfiError::definition("Variadic callbacks are not supported"));
            }
            tx.insert_prototype(proto)
        })
    }

    /// Callback prototype from a declaration such as `"int cb(int, int)"`
    pub fn define_callback_text(&self, text: &str) -> Result<TypeRef> {
        let parsed = parser::parse_prototype(text)?;
        if parsed.variadic {
            return Err(FfiError::definition("Variadic callbacks are not supported"));
        }

        self.transaction(|tx| {
            tx.check_unique(&parsed.name)?;
            let proto = tx.function_from_parsed(&parsed)?;
            tx.insert_prototype(proto)
        })
    }

    /// Extra name for an existing descriptor
    pub fn alias(&self, name: &str, target: impl Into<TypeSpec>) -> Result<TypeRef> {
        let target = target.into();
        self.transaction(|tx| {
            let ty = tx.resolve_spec(target)?;
            tx.bind_name(name, &ty)?;
            Ok(ty)
        })
    }

    pub fn sizeof(&self, spec: impl Into<TypeSpec>) -> Result<usize> {
        Ok(self.resolve(spec)?.size())
    }

    pub fn alignof(&self, spec: impl Into<TypeSpec>) -> Result<usize> {
        Ok(self.resolve(spec)?.align())
    }

    pub fn offsetof(&self, spec: impl Into<TypeSpec>, member: &str) -> Result<usize> {
        let ty = self.resolve(spec)?;
        if ty.primitive() != PrimitiveKind::Record {
            return Err(FfiError::argument(format!("Type '{}' is not a struct", ty.name())));
        }
        ty.member(member).map(|m| m.offset).ok_or_else(|| {
            FfiError::argument(format!("Struct '{}' has no member '{}'", ty.name(), member))
        })
    }

    pub fn introspect(&self, spec: impl Into<TypeSpec>) -> Result<TypeIntrospection> {
        Ok(self.resolve(spec)?.introspect())
    }

    /// Function descriptor; a trailing `"..."` parameter makes it variadic
    pub(crate) fn function_info(
        &self,
        name: &str,
        ret: impl Into<TypeSpec>,
        params: &[TypeSpec],
        convention: CallConvention,
    ) -> Result<FunctionInfo> {
        let ret = ret.into();
        self.transaction(|tx| tx.function_info(name, ret, params, convention))
    }

    /// Function descriptor from a declaration such as `"int add(int, int)"`
    pub(crate) fn function_from_text(&self, text: &str) -> Result<FunctionInfo> {
        let parsed = parser::parse_prototype(text)?;
        self.transaction(|tx| tx.function_from_parsed(&parsed))
    }

    fn transaction<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write();
        let mut tx = Transaction::new(&mut tables, self.max_type_size.load(Ordering::Relaxed));
        let value = f(&mut tx)?;
        tx.commit();
        Ok(value)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(crate::config::EngineConfig::default().max_type_size)
    }
}

/// Pending registry changes, rolled back on drop unless committed
struct Transaction<'a> {
    tables: &'a mut Tables,
    mark: usize,
    added: Vec<String>,
    max_type_size: usize,
    committed: bool,
}

impl<'a> Transaction<'a> {
    fn new(tables: &'a mut Tables, max_type_size: usize) -> Self {
        let mark = tables.types.len();
        Self {
            tables,
            mark,
            added: Vec::new(),
            max_type_size,
            committed: false,
        }
    }

    fn commit(mut self) {
        for ty in &self.tables.types[self.mark..] {
            logging::log_type_defined(ty.name(), ty.primitive().name(), ty.size());
        }
        self.committed = true;
    }

    fn push(&mut self, ty: TypeInfo) -> TypeRef {
        let ty = Arc::new(ty);
        self.tables.types.push(ty.clone());
        ty
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if self.tables.names.contains_key(name) {
            return Err(FfiError::definition(format!("Duplicate type name '{}'", name)));
        }
        Ok(())
    }

    fn bind_name(&mut self, name: &str, ty: &TypeRef) -> Result<()> {
        self.check_unique(name)?;
        self.tables.names.insert(name.to_string(), ty.clone());
        self.added.push(name.to_string());
        Ok(())
    }

    fn insert_named(&mut self, ty: TypeInfo) -> Result<TypeRef> {
        let name = ty.name.clone();
        self.check_unique(&name)?;
        let ty = self.push(ty);
        self.bind_name(&name, &ty)?;
        Ok(ty)
    }

    fn resolve_spec(&mut self, spec: TypeSpec) -> Result<TypeRef> {
        match spec {
            TypeSpec::Type(ty) => Ok(ty),
            TypeSpec::Directed(directed) => Ok(directed.ty),
            TypeSpec::Name(name) => self.resolve_name(&name),
        }
    }

    fn resolve_name(&mut self, text: &str) -> Result<TypeRef> {
        if let Some(ty) = self.tables.names.get(text) {
            return Ok(ty.clone());
        }

        let parsed = parser::parse_type_name(text)?;
        let mut ty = self
            .tables
            .names
            .get(&parsed.base)
            .cloned()
            .ok_or_else(|| FfiError::resolution(format!("Unknown or invalid type name '{}'", text)))?;

        for level in 0..=parsed.indirection {
            if parsed.disposables & (1 << level) != 0 {
                ty = self.push(make_disposable(&ty, None, None)?);
            }
            if level == parsed.indirection {
                break;
            }
            ty = self.make_pointer(ty, 1);
        }

        Ok(ty)
    }

    /// Interned pointer type, `"T *"` for one level
    fn make_pointer(&mut self, mut target: TypeRef, count: usize) -> TypeRef {
        for _ in 0..count {
            let name = if target.name().ends_with('*') {
                format!("{}*", target.name())
            } else {
                format!("{} *", target.name())
            };

            if let Some(existing) = self.tables.names.get(&name) {
                target = existing.clone();
                continue;
            }

            let info = match target.prototype() {
                Some(proto) if target.primitive() == PrimitiveKind::Prototype => {
                    TypeInfo::new(&name, PrimitiveKind::Callback, POINTER_SIZE, POINTER_SIZE)
                        .with_link(TypeLink::Prototype(proto.clone()))
                }
                _ => TypeInfo::new(&name, PrimitiveKind::Pointer, POINTER_SIZE, POINTER_SIZE)
                    .with_link(TypeLink::Target(target.clone())),
            };
            let ptr = self.push(info);
            self.tables.names.insert(name.clone(), ptr.clone());
            self.added.push(name);
            target = ptr;
        }
        target
    }

    fn make_array(&mut self, element: TypeRef, length: usize, hint: Option<ArrayHint>) -> Result<TypeRef> {
        if !can_store(&element) {
            return Err(FfiError::definition(format!(
                "Type {} cannot be used as an array element",
                element.name()
            )));
        }
        if length == 0 {
            return Err(FfiError::definition("Array length must be positive"));
        }

        let textual = matches!(element.primitive(), PrimitiveKind::Int8 | PrimitiveKind::Int16);
        let hint = match hint {
            Some(ArrayHint::String) if !textual => {
                return Err(FfiError::definition(
                    "String array hint can only be used with 8 and 16-bit signed integer types",
                ));
            }
            Some(hint) => hint,
            None if textual => ArrayHint::String,
            None => ArrayHint::Typed,
        };

        let size = element
            .size()
            .checked_mul(length)
            .filter(|size| *size <= self.max_type_size)
            .ok_or_else(|| {
                FfiError::definition(format!(
                    "Array type is too big (maximum = {} bytes)",
                    self.max_type_size
                ))
            })?;

        let name = format!("{}[{}]", element.name(), length);
        let interned = hint == default_hint(&element);
        if interned {
            if let Some(existing) = self.tables.names.get(&name) {
                return Ok(existing.clone());
            }
        }

        let mut info = TypeInfo::new(&name, PrimitiveKind::Array, size, element.align().max(1))
            .with_link(TypeLink::Target(element));
        info.hint = hint;
        info.length = length;

        let array = self.push(info);
        if interned {
            self.tables.names.insert(name.clone(), array.clone());
            self.added.push(name);
        }
        Ok(array)
    }

    fn define_aggregate(
        &mut self,
        name: Option<&str>,
        members: &[MemberSpec],
        packed: bool,
        kind: PrimitiveKind,
    ) -> Result<TypeRef> {
        let label = if kind == PrimitiveKind::Union { "union" } else { "struct" };
        if let Some(name) = name {
            self.check_unique(name)?;
        }
        if members.is_empty() {
            return Err(FfiError::definition(format!("Empty {} not allowed in C", label)));
        }

        let mut layout = Vec::with_capacity(members.len());
        let mut size = 0usize;
        let mut align = 1usize;

        for spec in members {
            if layout.iter().any(|m: &RecordMember| m.name == spec.name) {
                return Err(FfiError::definition(format!("Duplicate member '{}'", spec.name)));
            }

            let ty = self.resolve_spec(spec.ty.clone())?;
            if !can_store(&ty) {
                return Err(FfiError::definition(format!(
                    "Type {} cannot be used as a member",
                    ty.name()
                )));
            }

            let member_align = match spec.align {
                Some(a @ (1 | 2 | 4 | 8)) => a,
                Some(_) => {
                    return Err(FfiError::definition("Alignment of member must be 1, 2, 4 or 8"));
                }
                None if packed => 1,
                None => ty.align().max(1),
            };
            align = align.max(member_align);

            let offset = match kind {
                PrimitiveKind::Union => {
                    size = size.max(ty.size());
                    0
                }
                _ => {
                    let offset = align_up(size, member_align);
                    size = offset + ty.size();
                    offset
                }
            };
            if size > self.max_type_size {
                return Err(FfiError::definition(format!(
                    "Type {} is too big (maximum = {} bytes)",
                    name.unwrap_or("<anonymous>"),
                    self.max_type_size
                )));
            }

            layout.push(RecordMember {
                name: spec.name.clone(),
                ty,
                offset,
            });
        }

        let mut info = TypeInfo::new(name.unwrap_or("<anonymous>"), kind, align_up(size, align), align);
        info.members = layout;

        match name {
            Some(_) => self.insert_named(info),
            None => Ok(self.push(info)),
        }
    }

    fn parameter(&mut self, spec: TypeSpec, position: usize) -> Result<ParameterInfo> {
        let (ty, direction) = match spec {
            TypeSpec::Directed(Directed { ty, direction }) => (ty, direction),
            other => (self.resolve_spec(other)?, Direction::In),
        };
        Ok(ParameterInfo {
            ty,
            direction,
            variadic: false,
            position,
        })
    }

    fn function_info(
        &mut self,
        name: &str,
        ret: TypeSpec,
        params: &[TypeSpec],
        convention: CallConvention,
    ) -> Result<FunctionInfo> {
        let ret = self.resolve_spec(ret)?;

        let (params, variadic) = match params.split_last() {
            Some((TypeSpec::Name(last), fixed)) if last.trim() == "..." => (fixed, true),
            _ => (params, false),
        };

        let parameters = params
            .iter()
            .enumerate()
            .map(|(position, spec)| self.parameter(spec.clone(), position))
            .collect::<Result<Vec<_>>>()?;

        FunctionInfo::new(name, ret, parameters, variadic, convention)
    }

    fn function_from_parsed(&mut self, parsed: &parser::ParsedPrototype) -> Result<FunctionInfo> {
        let ret = self.resolve_name(&parsed.ret)?;

        let mut parameters = Vec::with_capacity(parsed.params.len());
        for (position, param) in parsed.params.iter().enumerate() {
            let ty = self.resolve_param(param)?;
            parameters.push(ParameterInfo {
                ty,
                direction: param.direction,
                variadic: false,
                position,
            });
        }

        FunctionInfo::new(
            &parsed.name,
            ret,
            parameters,
            parsed.variadic,
            parsed.convention.unwrap_or_default(),
        )
    }

    /// Parameter text with an optional trailing name, e.g. `"const char *fmt"`
    fn resolve_param(&mut self, param: &ParsedParam) -> Result<TypeRef> {
        match self.resolve_name(&param.text) {
            Ok(ty) => Ok(ty),
            Err(err) => match parser::strip_param_name(&param.text) {
                Some(stripped) => self.resolve_name(stripped),
                None => Err(err),
            },
        }
    }

    fn insert_prototype(&mut self, proto: FunctionInfo) -> Result<TypeRef> {
        let info = TypeInfo::new(proto.name.clone(), PrimitiveKind::Prototype, 0, 0)
            .with_link(TypeLink::Prototype(Arc::new(proto)));
        self.insert_named(info)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.tables.types.truncate(self.mark);
        for name in self.added.drain(..) {
            self.tables.names.remove(&name);
        }
    }
}

fn make_disposable(target: &TypeRef, name: Option<&str>, finalizer: Option<Finalizer>) -> Result<TypeInfo> {
    if !matches!(
        target.primitive(),
        PrimitiveKind::Pointer | PrimitiveKind::String | PrimitiveKind::String16
    ) {
        return Err(FfiError::definition(format!(
            "Cannot create disposable type for non-pointer type {}",
            target.name()
        )));
    }
    if target.is_disposable() {
        return Err(FfiError::definition(format!(
            "Type {} is already disposable",
            target.name()
        )));
    }

    let mut ty = target.copy_as(name.unwrap_or(target.name()));
    ty.dispose = Some(finalizer.unwrap_or_else(Finalizer::libc_free));
    Ok(ty)
}

fn default_hint(element: &TypeInfo) -> ArrayHint {
    match element.primitive() {
        PrimitiveKind::Int8 | PrimitiveKind::Int16 => ArrayHint::String,
        _ => ArrayHint::Typed,
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn install_builtins(tables: &mut Tables) {
    use std::mem::{align_of, size_of};
    use std::os::raw::c_long;
    use PrimitiveKind::*;

    let little = cfg!(target_endian = "little");
    let (le16, be16) = if little { (Int16, Int16Swapped) } else { (Int16Swapped, Int16) };
    let (ule16, ube16) = if little { (UInt16, UInt16Swapped) } else { (UInt16Swapped, UInt16) };
    let (le32, be32) = if little { (Int32, Int32Swapped) } else { (Int32Swapped, Int32) };
    let (ule32, ube32) = if little { (UInt32, UInt32Swapped) } else { (UInt32Swapped, UInt32) };
    let (le64, be64) = if little { (Int64, Int64Swapped) } else { (Int64Swapped, Int64) };
    let (ule64, ube64) = if little { (UInt64, UInt64Swapped) } else { (UInt64Swapped, UInt64) };

    let a64 = align_of::<u64>();
    let (long, ulong) = if size_of::<c_long>() == 8 { (Int64, UInt64) } else { (Int32, UInt32) };
    let long_align = align_of::<c_long>();
    let (iptr, uptr) = if POINTER_SIZE == 8 { (Int64, UInt64) } else { (Int32, UInt32) };

    let table: &[(&[&str], PrimitiveKind, usize, usize)] = &[
        (&["void"], Void, 0, 0),
        (&["bool"], Bool, 1, 1),
        (&["int8_t", "int8"], Int8, 1, 1),
        (&["uint8_t", "uint8"], UInt8, 1, 1),
        (&["char"], Int8, 1, 1),
        (&["unsigned char", "uchar"], UInt8, 1, 1),
        (&["char16_t", "char16"], Int16, 2, 2),
        (&["int16_t", "int16", "short"], Int16, 2, 2),
        (&["int16_le_t", "int16_le"], le16, 2, 2),
        (&["int16_be_t", "int16_be"], be16, 2, 2),
        (&["uint16_t", "uint16", "unsigned short", "ushort"], UInt16, 2, 2),
        (&["uint16_le_t", "uint16_le"], ule16, 2, 2),
        (&["uint16_be_t", "uint16_be"], ube16, 2, 2),
        (&["int32_t", "int32", "int"], Int32, 4, 4),
        (&["int32_le_t", "int32_le"], le32, 4, 4),
        (&["int32_be_t", "int32_be"], be32, 4, 4),
        (&["uint32_t", "uint32", "unsigned int", "uint"], UInt32, 4, 4),
        (&["uint32_le_t", "uint32_le"], ule32, 4, 4),
        (&["uint32_be_t", "uint32_be"], ube32, 4, 4),
        (&["int64_t", "int64", "long long", "longlong"], Int64, 8, a64),
        (&["int64_le_t", "int64_le"], le64, 8, a64),
        (&["int64_be_t", "int64_be"], be64, 8, a64),
        (&["uint64_t", "uint64", "unsigned long long", "ulonglong"], UInt64, 8, a64),
        (&["uint64_le_t", "uint64_le"], ule64, 8, a64),
        (&["uint64_be_t", "uint64_be"], ube64, 8, a64),
        (&["intptr_t", "ssize_t"], iptr, POINTER_SIZE, POINTER_SIZE),
        (&["uintptr_t", "size_t"], uptr, POINTER_SIZE, POINTER_SIZE),
        (&["long"], long, size_of::<c_long>(), long_align),
        (&["unsigned long", "ulong"], ulong, size_of::<c_long>(), long_align),
        (&["float", "float32"], Float32, 4, 4),
        (&["double", "float64"], Float64, 8, align_of::<f64>()),
    ];

    fn register(tables: &mut Tables, names: &[&str], ty: TypeRef) {
        tables.types.push(ty.clone());
        for name in names {
            tables.names.insert((*name).to_string(), ty.clone());
        }
    }

    for (names, kind, size, align) in table {
        let ty = Arc::new(TypeInfo::new(names[0], *kind, *size, *align));
        register(tables, names, ty);
    }

    let strings: [(&[&str], PrimitiveKind, &str); 2] = [
        (&["char *", "str", "string"], String, "char"),
        (&["char16_t *", "char16 *", "str16", "string16"], String16, "char16_t"),
    ];
    for (names, kind, target) in strings {
        let Some(target) = tables.names.get(target).cloned() else {
            continue;
        };
        let ty = Arc::new(
            TypeInfo::new(names[0], kind, POINTER_SIZE, POINTER_SIZE).with_link(TypeLink::Target(target)),
        );
        register(tables, names, ty);
    }
}
