//! Tests for the type registry and validators

use super::*;
use crate::error::ErrorKind;

fn registry() -> TypeRegistry {
    TypeRegistry::new(64 * 1024 * 1024)
}

#[test]
fn test_pointer_spelling_is_interned() {
    let types = registry();
    let a = types.resolve("int32_t *").unwrap();
    let b = types.resolve("int32_t*").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.primitive(), PrimitiveKind::Pointer);
    assert_eq!(a.target().unwrap().name(), "int32_t");
}

#[test]
fn test_builtin_names() {
    let types = registry();
    assert_eq!(types.resolve("char *").unwrap().primitive(), PrimitiveKind::String);
    assert_eq!(types.resolve("const char*").unwrap().primitive(), PrimitiveKind::String);
    assert_eq!(types.resolve("str16").unwrap().primitive(), PrimitiveKind::String16);
    assert_eq!(types.resolve("unsigned   int").unwrap().primitive(), PrimitiveKind::UInt32);
    assert_eq!(types.sizeof("size_t").unwrap(), std::mem::size_of::<usize>());
    assert_eq!(types.sizeof("double").unwrap(), 8);

    let be = types.resolve("uint32_be").unwrap();
    if cfg!(target_endian = "little") {
        assert_eq!(be.primitive(), PrimitiveKind::UInt32Swapped);
    } else {
        assert_eq!(be.primitive(), PrimitiveKind::UInt32);
    }
}

#[test]
fn test_unknown_type() {
    let types = registry();
    let err = types.resolve("struct nothing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn test_indirection_depth_limit() {
    let types = registry();
    let before = types.len();

    assert_eq!(types.resolve("int ****").unwrap().primitive(), PrimitiveKind::Pointer);
    let grown = types.len();

    let deep = format!("int{}!", "*".repeat(32));
    assert_eq!(types.resolve(deep.as_str()).unwrap_err().kind(), ErrorKind::Resolution);
    assert_eq!(types.resolve("int *****").unwrap_err().kind(), ErrorKind::Resolution);
    assert_eq!(types.len(), grown);
    assert!(grown > before);
}

#[test]
fn test_record_layout() {
    let types = registry();
    let point = types
        .define_record(
            Some("Point"),
            &[MemberSpec::new("x", "int32_t"), MemberSpec::new("y", "double")],
            false,
        )
        .unwrap();

    assert_eq!(point.size(), 16);
    assert_eq!(point.align(), std::mem::align_of::<f64>().max(4));
    assert_eq!(types.offsetof("Point", "y").unwrap(), std::mem::align_of::<f64>().max(4));

    let packed = types
        .define_record(
            Some("Packed"),
            &[MemberSpec::new("x", "int32_t"), MemberSpec::new("y", "double")],
            true,
        )
        .unwrap();
    assert_eq!(packed.size(), 12);
    assert_eq!(packed.align(), 1);
}

#[test]
fn test_member_alignment_override() {
    let types = registry();
    let rec = types
        .define_record(
            None,
            &[MemberSpec::new("a", "uint8_t"), MemberSpec::new("b", "uint8_t").aligned(4)],
            false,
        )
        .unwrap();
    assert_eq!(rec.member("b").unwrap().offset, 4);
    assert_eq!(rec.size(), 8);

    let err = types
        .define_record(None, &[MemberSpec::new("a", "int").aligned(3)], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
}

#[test]
fn test_duplicate_member_rolls_back() {
    let types = registry();
    let before = types.len();

    let err = types
        .define_record(
            Some("Dup"),
            &[
                MemberSpec::new("a", "int *"),
                MemberSpec::new("a", "int"),
            ],
            false,
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
    assert_eq!(types.len(), before);
    assert!(types.lookup("Dup").is_none());
}

#[test]
fn test_empty_record_fails() {
    let types = registry();
    let before = types.len();
    let err = types.define_record(Some("Empty"), &[], false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
    assert_eq!(types.len(), before);
}

#[test]
fn test_duplicate_type_name() {
    let types = registry();
    types.define_opaque(Some("Handle")).unwrap();
    let err = types.define_opaque(Some("Handle")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);

    // Anonymous types bypass the name index
    types.define_opaque(None).unwrap();
    types.define_opaque(None).unwrap();
}

#[test]
fn test_oversize_type() {
    let types = TypeRegistry::new(64);
    let before = types.len();
    let err = types.define_array("int32_t", 100, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);

    assert_eq!(types.len(), before);

    let block = types.define_array("int64_t", 8, None).unwrap();
    let before = types.len();
    let err = types
        .define_record(
            Some("Big"),
            &[MemberSpec::new("a", "double"), MemberSpec::new("b", block)],
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
    assert_eq!(types.len(), before);
}

#[test]
fn test_union_layout() {
    let types = registry();
    let u = types
        .define_union(
            Some("Number"),
            &[MemberSpec::new("i", "int32_t"), MemberSpec::new("d", "double")],
        )
        .unwrap();
    assert_eq!(u.primitive(), PrimitiveKind::Union);
    assert_eq!(u.size(), 8);
    assert!(u.members().iter().all(|m| m.offset == 0));
}

#[test]
fn test_array_hints() {
    let types = registry();
    let chars = types.define_array("char", 16, None).unwrap();
    assert_eq!(chars.hint(), ArrayHint::String);

    let ints = types.define_array("int32_t", 4, None).unwrap();
    assert_eq!(ints.hint(), ArrayHint::Typed);
    assert_eq!(ints.size(), 16);
    assert_eq!(ints.length(), 4);
    assert!(Arc::ptr_eq(&ints, &types.resolve("int32_t[4]").unwrap()));

    let list = types.define_array("int32_t", 4, Some(ArrayHint::Array)).unwrap();
    assert!(!Arc::ptr_eq(&ints, &list));

    let err = types.define_array("float", 2, Some(ArrayHint::String)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
}

#[test]
fn test_disposable_types() {
    let types = registry();
    let s = types.resolve("char *!").unwrap();
    assert_eq!(s.primitive(), PrimitiveKind::String);
    assert!(s.is_disposable());

    let p = types.define_disposable(Some("OwnedInt"), "int *", None).unwrap();
    assert!(p.is_disposable());
    assert!(types.define_disposable(None, p.clone(), None).is_err());
    assert!(types.define_disposable(None, "int", None).is_err());
}

#[test]
fn test_define_pointer_counts() {
    let types = registry();
    let pp = types.define_pointer(None, "int", 2).unwrap();
    assert_eq!(pp.name(), "int32_t **");
    assert!(Arc::ptr_eq(&pp, &types.resolve("int32_t**").unwrap()));

    let named = types.define_pointer(Some("IntPtr"), "int", 1).unwrap();
    assert_eq!(named.primitive(), PrimitiveKind::Pointer);
    assert!(types.define_pointer(None, "int", 5).is_err());
    assert!(types.define_pointer(None, "int", 0).is_err());
}

#[test]
fn test_callback_prototype() {
    let types = registry();
    let proto = types
        .define_callback_prototype(
            "BinaryOp",
            "int",
            &["int".into(), "int".into()],
            CallConvention::default(),
        )
        .unwrap();
    assert_eq!(proto.primitive(), PrimitiveKind::Prototype);

    let cb = types.resolve("BinaryOp *").unwrap();
    assert_eq!(cb.primitive(), PrimitiveKind::Callback);
    assert_eq!(cb.prototype().unwrap().parameters().len(), 2);

    let err = types
        .define_callback_prototype("Log", "void", &["char *".into(), "...".into()], CallConvention::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeDefinition);
    assert!(types.lookup("Log").is_none());

    let text = types.define_callback_text("double Scale(double value, float factor)").unwrap();
    assert_eq!(text.prototype().unwrap().parameters()[1].ty.name(), "float");
}

#[test]
fn test_alias() {
    let types = registry();
    let a = types.alias("HRESULT", "int32_t").unwrap();
    assert!(Arc::ptr_eq(&a, &types.resolve("HRESULT").unwrap()));
    assert!(types.alias("HRESULT", "int").is_err());
}

#[test]
fn test_validators() {
    let types = registry();
    let void = types.resolve("void").unwrap();
    let opaque = types.define_opaque(Some("FILE")).unwrap();
    let array = types.define_array("int", 2, None).unwrap();
    let int = types.resolve("int").unwrap();
    let ptr = types.resolve("int *").unwrap();

    assert!(!can_pass(&void, Direction::In));
    assert!(!can_pass(&array, Direction::In));
    assert!(!can_pass(&int, Direction::Out));
    assert!(can_pass(&ptr, Direction::InOut));

    assert!(can_return(&void));
    assert!(!can_return(&opaque));
    assert!(!can_return(&array));

    assert!(!can_store(&void));
    assert!(can_store(&array));

    assert!(Directed::output(int).is_err());
    assert!(Directed::output(ptr).is_ok());
}

#[test]
fn test_function_display_and_limits() {
    let types = registry();
    let ptr = types.resolve("int *").unwrap();
    let func = types
        .function_info(
            "split",
            "int",
            &["double".into(), Directed::output(ptr.clone()).unwrap().into(), "...".into()],
            CallConvention::default(),
        )
        .unwrap();
    assert_eq!(func.to_string(), "int32_t split(double, _Out_ int32_t *, ...)");
    assert_eq!(func.out_parameters(), 1);
    assert!(func.is_variadic());

    let outs: Vec<TypeSpec> = (0..5).map(|_| Directed::output(ptr.clone()).unwrap().into()).collect();
    let err = types.function_info("many", "void", &outs, CallConvention::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);

    let params: Vec<TypeSpec> = (0..33).map(|_| "int".into()).collect();
    assert!(types.function_info("wide", "void", &params, CallConvention::default()).is_err());
}

#[test]
fn test_function_from_text() {
    let types = registry();
    let func = types.function_from_text("const char *getenv(const char *name)").unwrap();
    assert_eq!(func.return_type().primitive(), PrimitiveKind::String);
    assert_eq!(func.parameters().len(), 1);
}

#[test]
fn test_introspection() {
    let types = registry();
    types
        .define_record(Some("Pair"), &[MemberSpec::new("a", "int16_t"), MemberSpec::new("b", "int16_t")], false)
        .unwrap();
    let info = types.introspect("Pair").unwrap();
    assert_eq!(info.primitive, PrimitiveKind::Record);
    assert_eq!(info.size, 4);
    assert_eq!(info.members[1], ("b".to_string(), "int16_t".to_string(), 2));
}
