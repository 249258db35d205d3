//! Type system - runtime descriptors for C-like types
//!
//! Architecture:
//! - `mod.rs` - descriptors (TypeInfo, FunctionInfo) and usage validators
//! - `registry.rs` - transactional definition and name resolution
//! - `parser.rs` - type-name and prototype text parsing
//!
//! Descriptors are immutable once registered and shared as [`TypeRef`].

mod parser;
mod registry;

pub use parser::{parse_prototype, parse_type_name, ParsedPrototype, ParsedType};
pub use registry::{MemberSpec, TypeRegistry};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{MAX_OUT_PARAMETERS, MAX_PARAMETERS};
use crate::error::{FfiError, Result};
use crate::interop::abi::{CallConvention, CallInterface};
use crate::interop::Library;
use crate::value::Finalizer;

/// Shared handle to a registered descriptor
pub type TypeRef = Arc<TypeInfo>;

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

/// Primitive kind of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    Int16Swapped,
    UInt16,
    UInt16Swapped,
    Int32,
    Int32Swapped,
    UInt32,
    UInt32Swapped,
    Int64,
    Int64Swapped,
    UInt64,
    UInt64Swapped,
    String,
    String16,
    Pointer,
    Record,
    Union,
    Array,
    Float32,
    Float64,
    Prototype,
    Callback,
}

impl PrimitiveKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "Void",
            Self::Bool => "Bool",
            Self::Int8 => "Int8",
            Self::UInt8 => "UInt8",
            Self::Int16 => "Int16",
            Self::Int16Swapped => "Int16S",
            Self::UInt16 => "UInt16",
            Self::UInt16Swapped => "UInt16S",
            Self::Int32 => "Int32",
            Self::Int32Swapped => "Int32S",
            Self::UInt32 => "UInt32",
            Self::UInt32Swapped => "UInt32S",
            Self::Int64 => "Int64",
            Self::Int64Swapped => "Int64S",
            Self::UInt64 => "UInt64",
            Self::UInt64Swapped => "UInt64S",
            Self::String => "String",
            Self::String16 => "String16",
            Self::Pointer => "Pointer",
            Self::Record => "Record",
            Self::Union => "Union",
            Self::Array => "Array",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::Prototype => "Prototype",
            Self::Callback => "Callback",
        }
    }

    /// Integer kinds, byte-swapped variants included
    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::Int16Swapped
                | Self::UInt16
                | Self::UInt16Swapped
                | Self::Int32
                | Self::Int32Swapped
                | Self::UInt32
                | Self::UInt32Swapped
                | Self::Int64
                | Self::Int64Swapped
                | Self::UInt64
                | Self::UInt64Swapped
        )
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int16Swapped
                | Self::Int32
                | Self::Int32Swapped
                | Self::Int64
                | Self::Int64Swapped
        )
    }

    /// Stored in reverse byte order relative to the host
    #[inline]
    pub const fn is_swapped(self) -> bool {
        matches!(
            self,
            Self::Int16Swapped
                | Self::UInt16Swapped
                | Self::Int32Swapped
                | Self::UInt32Swapped
                | Self::Int64Swapped
                | Self::UInt64Swapped
        )
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Kinds decoded to a single host scalar
    #[inline]
    pub const fn is_number(self) -> bool {
        self.is_integer() || self.is_float()
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoding hint for fixed-size arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayHint {
    /// Numeric elements decode to a byte buffer
    Typed,
    /// Elements decode to a list of values
    Array,
    /// 8/16-bit elements decode to text up to the first NUL
    String,
}

/// Parameter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Direction {
    #[default]
    In = 1,
    Out = 2,
    InOut = 3,
}

impl Direction {
    #[inline]
    pub const fn reads(self) -> bool {
        (self as u8) & 1 != 0
    }

    #[inline]
    pub const fn writes(self) -> bool {
        (self as u8) & 2 != 0
    }
}

/// Type with an explicit direction tag, used at parameter positions
#[derive(Debug, Clone, PartialEq)]
pub struct Directed {
    pub ty: TypeRef,
    pub direction: Direction,
}

impl Directed {
    pub fn new(ty: TypeRef, direction: Direction) -> Result<Self> {
        if direction.writes()
            && !matches!(
                ty.primitive(),
                PrimitiveKind::Pointer | PrimitiveKind::String | PrimitiveKind::String16
            )
        {
            return Err(FfiError::argument(format!(
                "Only pointer and string types can be used for output, not '{}'",
                ty.name()
            )));
        }
        Ok(Self { ty, direction })
    }

    pub fn input(ty: TypeRef) -> Self {
        Self { ty, direction: Direction::In }
    }

    pub fn output(ty: TypeRef) -> Result<Self> {
        Self::new(ty, Direction::Out)
    }

    pub fn inout(ty: TypeRef) -> Result<Self> {
        Self::new(ty, Direction::InOut)
    }
}

/// Anything the registry can turn into a descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Name(String),
    Type(TypeRef),
    Directed(Directed),
}

impl From<&str> for TypeSpec {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for TypeSpec {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<TypeRef> for TypeSpec {
    fn from(ty: TypeRef) -> Self {
        Self::Type(ty)
    }
}

impl From<&TypeRef> for TypeSpec {
    fn from(ty: &TypeRef) -> Self {
        Self::Type(ty.clone())
    }
}

impl From<Directed> for TypeSpec {
    fn from(directed: Directed) -> Self {
        Self::Directed(directed)
    }
}

/// Record or union member
#[derive(Debug, Clone)]
pub struct RecordMember {
    pub name: String,
    pub ty: TypeRef,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum TypeLink {
    None,
    /// Pointee, element or character type
    Target(TypeRef),
    Prototype(Arc<FunctionInfo>),
}

/// Type descriptor
#[derive(Debug)]
pub struct TypeInfo {
    id: u64,
    pub(crate) name: String,
    pub(crate) primitive: PrimitiveKind,
    pub(crate) size: usize,
    pub(crate) align: usize,
    pub(crate) link: TypeLink,
    pub(crate) members: Vec<RecordMember>,
    pub(crate) hint: ArrayHint,
    pub(crate) length: usize,
    pub(crate) dispose: Option<Finalizer>,
}

impl TypeInfo {
    pub(crate) fn new(name: impl Into<String>, primitive: PrimitiveKind, size: usize, align: usize) -> Self {
        Self {
            id: NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            primitive,
            size,
            align,
            link: TypeLink::None,
            members: Vec::new(),
            hint: ArrayHint::Typed,
            length: 0,
            dispose: None,
        }
    }

    pub(crate) fn with_link(mut self, link: TypeLink) -> Self {
        self.link = link;
        self
    }

    /// Same layout under a fresh identity and name
    pub(crate) fn copy_as(&self, name: impl Into<String>) -> Self {
        Self {
            id: NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            primitive: self.primitive,
            size: self.size,
            align: self.align,
            link: self.link.clone(),
            members: self.members.clone(),
            hint: self.hint,
            length: self.length,
            dispose: self.dispose.clone(),
        }
    }

    /// Process-unique identity, also used as external handle tag
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn primitive(&self) -> PrimitiveKind {
        self.primitive
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn members(&self) -> &[RecordMember] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&RecordMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Pointee, array element or character type
    pub fn target(&self) -> Option<&TypeRef> {
        match &self.link {
            TypeLink::Target(ty) => Some(ty),
            _ => None,
        }
    }

    /// Signature of prototype and callback types
    pub fn prototype(&self) -> Option<&Arc<FunctionInfo>> {
        match &self.link {
            TypeLink::Prototype(proto) => Some(proto),
            _ => None,
        }
    }

    #[inline]
    pub fn hint(&self) -> ArrayHint {
        self.hint
    }

    /// Element count of array types
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.dispose.is_some()
    }

    #[inline]
    pub(crate) fn finalizer(&self) -> Option<&Finalizer> {
        self.dispose.as_ref()
    }

    /// Structured description of this type
    pub fn introspect(&self) -> TypeIntrospection {
        TypeIntrospection {
            name: self.name.clone(),
            primitive: self.primitive,
            size: self.size,
            align: self.align,
            disposable: self.is_disposable(),
            target: self.target().map(|t| t.name.clone()),
            length: (self.primitive == PrimitiveKind::Array).then_some(self.length),
            hint: (self.primitive == PrimitiveKind::Array).then_some(self.hint),
            members: self
                .members
                .iter()
                .map(|m| (m.name.clone(), m.ty.name.clone(), m.offset))
                .collect(),
            prototype: self.prototype().map(|p| p.to_string()),
        }
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeInfo {}

/// Introspection result
#[derive(Debug, Clone, PartialEq)]
pub struct TypeIntrospection {
    pub name: String,
    pub primitive: PrimitiveKind,
    pub size: usize,
    pub align: usize,
    pub disposable: bool,
    pub target: Option<String>,
    pub length: Option<usize>,
    pub hint: Option<ArrayHint>,
    /// `(name, type name, offset)` per member
    pub members: Vec<(String, String, usize)>,
    pub prototype: Option<String>,
}

/// Can `ty` be passed as a parameter in `direction`
pub fn can_pass(ty: &TypeInfo, direction: Direction) -> bool {
    match ty.primitive {
        PrimitiveKind::Void | PrimitiveKind::Array | PrimitiveKind::Prototype => false,
        PrimitiveKind::Pointer | PrimitiveKind::String | PrimitiveKind::String16 => true,
        _ => !direction.writes(),
    }
}

/// Can `ty` be returned by a function
pub fn can_return(ty: &TypeInfo) -> bool {
    match ty.primitive {
        // Opaque types are Void too, only the real void can be returned
        PrimitiveKind::Void => ty.name == "void",
        PrimitiveKind::Array | PrimitiveKind::Prototype => false,
        _ => true,
    }
}

/// Can `ty` be stored as a record member or array element
pub fn can_store(ty: &TypeInfo) -> bool {
    !matches!(ty.primitive, PrimitiveKind::Void | PrimitiveKind::Prototype)
}

/// Parameter of a function descriptor
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub ty: TypeRef,
    pub direction: Direction,
    /// Extra argument of a variadic call
    pub variadic: bool,
    /// Index in the host argument list
    pub position: usize,
}

/// Function or callback signature, with a resolved entry for functions
pub struct FunctionInfo {
    pub(crate) name: String,
    pub(crate) ret: TypeRef,
    pub(crate) parameters: Vec<ParameterInfo>,
    pub(crate) required: usize,
    pub(crate) variadic: bool,
    pub(crate) convention: CallConvention,
    pub(crate) out_parameters: usize,
    pub(crate) address: usize,
    pub(crate) library: Option<Library>,
    /// Prepared call interface, absent for variadic descriptors
    pub(crate) interface: Option<Arc<CallInterface>>,
    /// Held while a variadic call runs through this descriptor
    pub(crate) busy: AtomicBool,
}

impl FunctionInfo {
    /// Validate a signature and prepare its call interface
    pub(crate) fn new(
        name: impl Into<String>,
        ret: TypeRef,
        parameters: Vec<ParameterInfo>,
        variadic: bool,
        convention: CallConvention,
    ) -> Result<Self> {
        let name = name.into();

        if !can_return(&ret) {
            return Err(FfiError::argument(format!(
                "Type {} cannot be used as a return type",
                ret.name()
            )));
        }
        if parameters.len() > MAX_PARAMETERS {
            return Err(FfiError::argument(format!(
                "Functions cannot have more than {} parameters",
                MAX_PARAMETERS
            )));
        }

        let mut out_parameters = 0;
        for param in &parameters {
            if !can_pass(&param.ty, param.direction) {
                return Err(FfiError::argument(format!(
                    "Type {} cannot be used as a parameter{}",
                    param.ty.name(),
                    if param.direction.writes() { " in output direction" } else { "" }
                )));
            }
            if param.direction.writes() {
                out_parameters += 1;
            }
        }
        if out_parameters > MAX_OUT_PARAMETERS {
            return Err(FfiError::argument(format!(
                "Functions cannot have more than {} output parameters",
                MAX_OUT_PARAMETERS
            )));
        }

        let interface = if variadic {
            None
        } else {
            let types: Vec<&TypeInfo> = parameters.iter().map(|p| p.ty.as_ref()).collect();
            Some(Arc::new(CallInterface::new(&ret, &types, None, convention)?))
        };

        Ok(Self {
            name,
            ret,
            required: parameters.len(),
            parameters,
            variadic,
            convention,
            out_parameters,
            address: 0,
            library: None,
            interface,
            busy: AtomicBool::new(false),
        })
    }

    /// Bind a native entry point, keeping its library loaded
    pub(crate) fn bind(mut self, address: usize, library: Option<Library>) -> Self {
        self.address = address;
        self.library = library;
        self
    }

    /// Per-call descriptor with the variadic extras appended
    pub(crate) fn with_variadic(&self, extras: Vec<ParameterInfo>) -> Result<Self> {
        let mut parameters = self.parameters.clone();
        parameters.extend(extras);

        if parameters.len() > MAX_PARAMETERS {
            return Err(FfiError::argument(format!(
                "Functions cannot have more than {} parameters",
                MAX_PARAMETERS
            )));
        }
        let out_parameters = parameters.iter().filter(|p| p.direction.writes()).count();
        if out_parameters > MAX_OUT_PARAMETERS {
            return Err(FfiError::argument(format!(
                "Functions cannot have more than {} output parameters",
                MAX_OUT_PARAMETERS
            )));
        }

        let types: Vec<&TypeInfo> = parameters.iter().map(|p| p.ty.as_ref()).collect();
        let interface = CallInterface::new(&self.ret, &types, Some(self.required), self.convention)?;

        Ok(Self {
            name: self.name.clone(),
            ret: self.ret.clone(),
            parameters,
            required: self.required,
            variadic: false,
            convention: self.convention,
            out_parameters,
            address: self.address,
            library: self.library.clone(),
            interface: Some(Arc::new(interface)),
            busy: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn return_type(&self) -> &TypeRef {
        &self.ret
    }

    #[inline]
    pub fn parameters(&self) -> &[ParameterInfo] {
        &self.parameters
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    #[inline]
    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    #[inline]
    pub fn out_parameters(&self) -> usize {
        self.out_parameters
    }

    /// Native entry point, zero for prototypes
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }
}

impl fmt::Display for FunctionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.ret.name())?;
        if self.convention != CallConvention::Cdecl {
            write!(f, "{} ", self.convention.keyword())?;
        }
        write!(f, "{}(", self.name)?;

        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match param.direction {
                Direction::In => {}
                Direction::Out => f.write_str("_Out_ ")?,
                Direction::InOut => f.write_str("_Inout_ ")?,
            }
            f.write_str(param.ty.name())?;
        }
        if self.variadic {
            f.write_str(if self.parameters.is_empty() { "..." } else { ", ..." })?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for FunctionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInfo")
            .field("signature", &self.to_string())
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

/// Size of the pointer-sized native integer
pub(crate) const POINTER_SIZE: usize = std::mem::size_of::<usize>();

#[cfg(test)]
mod tests;
