//! Host boundary values
//!
//! The engine never sees the host's own object model. Everything crossing
//! the boundary is expressed with [`Value`], which exposes the capability
//! set the marshaller relies on: numbers, 64-bit integers, narrow and wide
//! text, byte buffers, tagged external handles, records, lazily decoded
//! unions and host callables.

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{FfiError, Result};
use crate::interop::marshal::Decoder;
use crate::interop::StatsCounters;
use crate::types::{PrimitiveKind, TypeRef, TypeSpec};

/// Largest integer a host number represents exactly (2^53 - 1)
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Record value: member name -> value, in declared member order
pub type Record = IndexMap<String, Value>;

/// Host value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Signed integer beyond safe-number precision
    Int64(i64),
    /// Unsigned integer beyond safe-number precision
    UInt64(u64),
    String(String),
    String16(Vec<u16>),
    /// Byte buffer with known length
    Buffer(Vec<u8>),
    External(External),
    Array(Vec<Value>),
    Record(Record),
    Union(UnionValue),
    Function(HostFunction),
    /// Type specifier, used for variadic argument pairs
    Type(TypeSpec),
    /// Value reinterpreted through another pointer type
    Cast(Box<Value>, TypeRef),
}

impl Value {
    /// Wrap a native address as a tagged external handle
    #[inline]
    pub fn wrap_external(address: usize, tag: Option<u64>) -> Self {
        Self::External(External { address, tag })
    }

    /// Build a record from `(name, value)` pairs
    pub fn record<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Record(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_) | Self::Int64(_) | Self::UInt64(_))
    }

    #[inline]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Null | Self::Undefined)
    }

    /// Integer view of a numeric value (numbers are truncated)
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Number(n) => Some(n as i64),
            Self::Int64(v) => Some(v),
            Self::UInt64(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Unsigned view of a numeric value (negative numbers wrap)
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Number(n) if n < 0.0 => Some(n as i64 as u64),
            Self::Number(n) => Some(n as u64),
            Self::Int64(v) => Some(v as u64),
            Self::UInt64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Number(n) => Some(n),
            Self::Int64(v) => Some(v as f64),
            Self::UInt64(v) => Some(v as f64),
            _ => None,
        }
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_) | Self::String16(_))
    }

    pub fn to_utf8(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::String16(units) => Some(String::from_utf16_lossy(units)),
            _ => None,
        }
    }

    pub fn to_utf16(&self) -> Option<Vec<u16>> {
        match self {
            Self::String(s) => Some(s.encode_utf16().collect()),
            Self::String16(units) => Some(units.clone()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            Self::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_external(&self) -> Option<&External> {
        match self {
            Self::External(ext) => Some(ext),
            _ => None,
        }
    }

    /// True for an external handle carrying exactly `tag`
    pub fn is_external_with_tag(&self, tag: u64) -> bool {
        matches!(self, Self::External(External { tag: Some(t), .. }) if *t == tag)
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Short description used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Int64(_) | Self::UInt64(_) => "bigint",
            Self::String(_) | Self::String16(_) => "string",
            Self::Buffer(_) => "buffer",
            Self::External(_) => "external",
            Self::Array(_) => "array",
            Self::Record(_) => "object",
            Self::Union(_) => "union",
            Self::Function(_) => "function",
            Self::Type(_) => "type",
            Self::Cast(..) => "cast",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
            Self::Number(v as f64)
        } else {
            Self::Int64(v)
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Buffer(v)
    }
}

impl From<HostFunction> for Value {
    fn from(f: HostFunction) -> Self {
        Self::Function(f)
    }
}

/// Opaque native address, optionally tagged with the id of its pointee type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct External {
    pub address: usize,
    pub tag: Option<u64>,
}

impl External {
    #[inline]
    pub fn as_ptr<T>(&self) -> *mut T {
        self.address as *mut T
    }
}

type HostFn = dyn Fn(Option<&Value>, &[Value]) -> Result<Value> + Send + Sync;

/// Host callable invoked by relays: `(receiver, args) -> result`
#[derive(Clone)]
pub struct HostFunction(Arc<HostFn>);

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    #[inline]
    pub fn call(&self, receiver: Option<&Value>, args: &[Value]) -> Result<Value> {
        (self.0)(receiver, args)
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Type-erased disposal capability, called with the native address to free
#[derive(Clone)]
pub struct Finalizer(Arc<dyn Fn(usize) + Send + Sync>);

impl Finalizer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Releases memory with the C allocator
    pub fn libc_free() -> Self {
        Self::new(|address| unsafe { libc::free(address as *mut libc::c_void) })
    }

    #[inline]
    pub fn run(&self, address: usize) {
        (self.0)(address)
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Finalizer")
    }
}

/// Tagged union wrapper
///
/// A decoded union keeps a copy of its raw bytes. The first member read is
/// decoded and frozen; reading another member is an error until a member is
/// assigned, after which the raw bytes are discarded.
#[derive(Clone)]
pub struct UnionValue {
    ty: TypeRef,
    raw: Option<Arc<[u8]>>,
    active: Option<(usize, Box<Value>)>,
    stats: Option<Arc<StatsCounters>>,
}

impl UnionValue {
    /// Empty union of type `ty`, to be filled with [`UnionValue::set`]
    pub fn new(ty: TypeRef) -> Result<Self> {
        if ty.primitive() != PrimitiveKind::Union {
            return Err(FfiError::argument(format!(
                "Expected union type, got {}",
                ty.primitive().name()
            )));
        }
        Ok(Self { ty, raw: None, active: None, stats: None })
    }

    pub(crate) fn from_raw(ty: TypeRef, raw: &[u8], stats: Arc<StatsCounters>) -> Self {
        Self {
            ty,
            raw: Some(Arc::from(raw)),
            active: None,
            stats: Some(stats),
        }
    }

    #[inline]
    pub fn type_info(&self) -> &TypeRef {
        &self.ty
    }

    /// Currently frozen member, if any
    pub fn active(&self) -> Option<(&str, &Value)> {
        self.active
            .as_ref()
            .map(|(idx, value)| (self.ty.members()[*idx].name.as_str(), value.as_ref()))
    }

    /// Read member `name`, decoding it from the raw bytes on first access
    pub fn get(&mut self, name: &str) -> Result<&Value> {
        let idx = self.member_index(name)?;

        match &self.active {
            Some((active, _)) if *active == idx => {}
            Some(_) if self.raw.is_none() => {
                return Err(FfiError::argument("Cannot convert assigned union value"));
            }
            _ => {
                let raw = self
                    .raw
                    .as_ref()
                    .ok_or_else(|| FfiError::argument("Cannot convert empty union value"))?;
                let member = &self.ty.members()[idx];
                let stats = self.stats.clone().unwrap_or_default();
                let value = Decoder::new(&stats).decode(raw.as_ptr(), &member.ty, None);
                self.active = Some((idx, Box::new(value)));
            }
        }

        Ok(self.active.as_ref().map(|(_, v)| v.as_ref()).unwrap_or(&Value::Undefined))
    }

    /// Assign member `name`; the union now encodes this member only
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let idx = self.member_index(name)?;
        self.active = Some((idx, Box::new(value)));
        self.raw = None;
        Ok(())
    }

    pub(crate) fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub(crate) fn active_index(&self) -> Option<(usize, &Value)> {
        self.active.as_ref().map(|(idx, v)| (*idx, v.as_ref()))
    }

    fn member_index(&self, name: &str) -> Result<usize> {
        self.ty
            .members()
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| {
                FfiError::argument(format!("Union '{}' has no member '{}'", self.ty.name(), name))
            })
    }
}

impl PartialEq for UnionValue {
    fn eq(&self, other: &Self) -> bool {
        self.ty.id() == other.ty.id() && self.raw == other.raw && self.active == other.active
    }
}

impl fmt::Debug for UnionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionValue")
            .field("type", &self.ty.name())
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Number(42.9).as_i64(), Some(42));
        assert_eq!(Value::Number(-1.0).as_u64(), Some(u64::MAX));
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), Some(-1));
        assert!(Value::Int64(1).is_number());
        assert_eq!(Value::from("x").as_i64(), None);
    }

    #[test]
    fn large_integers_become_int64() {
        assert_eq!(Value::from(1i64 << 40), Value::Number((1i64 << 40) as f64));
        assert_eq!(Value::from(i64::MAX), Value::Int64(i64::MAX));
    }

    #[test]
    fn text_conversions() {
        let v = Value::from("héllo");
        assert_eq!(v.to_utf16().unwrap(), "héllo".encode_utf16().collect::<Vec<_>>());
        let wide = Value::String16("wide".encode_utf16().collect());
        assert_eq!(wide.to_utf8().as_deref(), Some("wide"));
    }

    #[test]
    fn external_tags() {
        let ext = Value::wrap_external(0x1000, Some(7));
        assert!(ext.is_external_with_tag(7));
        assert!(!ext.is_external_with_tag(8));
        assert!(!Value::wrap_external(0x1000, None).is_external_with_tag(7));
    }

    #[test]
    fn host_function_identity() {
        let f = HostFunction::new(|_, args| Ok(args.first().cloned().unwrap_or(Value::Undefined)));
        let g = f.clone();
        assert_eq!(f, g);
        assert_eq!(f.call(None, &[Value::Number(1.0)]).unwrap(), Value::Number(1.0));
        let h = HostFunction::new(|_, _| Ok(Value::Null));
        assert_ne!(f, h);
    }
}
