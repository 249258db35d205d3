//! Call overhead benchmarks
//!
//! Measures marshaling cost for scalar, record and string calls, and
//! the round trip through a callback trampoline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dynffi::{Engine, HostFunction, MemberSpec, Value};

#[repr(C)]
struct Pair {
    x: i32,
    y: f64,
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn pair_sum(p: Pair) -> f64 {
    p.x as f64 + p.y
}

extern "C" fn count_bytes(s: *const std::os::raw::c_char) -> usize {
    if s.is_null() {
        return 0;
    }
    unsafe { std::ffi::CStr::from_ptr(s).to_bytes().len() }
}

extern "C" fn apply(cb: extern "C" fn(i32) -> i32, v: i32) -> i32 {
    cb(v)
}

fn bench_scalar(c: &mut Criterion) {
    let engine = Engine::new().unwrap();
    let add = engine.function_at(add as usize, "int add(int, int)").unwrap();
    let args = [Value::from(20), Value::from(22)];

    c.bench_function("scalar_call", |b| {
        b.iter(|| engine.call(black_box(&add), black_box(&args)).unwrap())
    });
}

fn bench_record(c: &mut Criterion) {
    let engine = Engine::new().unwrap();
    engine
        .types()
        .define_record(
            Some("Pair"),
            &[MemberSpec::new("x", "int32_t"), MemberSpec::new("y", "double")],
            false,
        )
        .unwrap();
    let sum = engine.function_at(pair_sum as usize, "double pair_sum(Pair p)").unwrap();
    let args = [Value::record([("x", Value::from(1)), ("y", Value::from(2.5))])];

    c.bench_function("record_by_value", |b| {
        b.iter(|| engine.call(black_box(&sum), black_box(&args)).unwrap())
    });
}

fn bench_strings(c: &mut Criterion) {
    let engine = Engine::new().unwrap();
    let count = engine
        .function_at(count_bytes as usize, "size_t count(const char *s)")
        .unwrap();

    let mut group = c.benchmark_group("string_argument");
    for len in [8usize, 256, 4096] {
        let args = [Value::from("x".repeat(len))];
        group.bench_with_input(BenchmarkId::from_parameter(len), &args, |b, args| {
            b.iter(|| engine.call(&count, black_box(args)).unwrap())
        });
    }
    group.finish();
}

fn bench_callback(c: &mut Criterion) {
    let engine = Engine::new().unwrap();
    engine.types().define_callback_text("int Step(int v)").unwrap();
    let apply = engine.function_at(apply as usize, "int apply(Step *cb, int v)").unwrap();

    let step = HostFunction::new(|_, args| Ok(Value::from(args[0].as_i64().unwrap_or(0) + 1)));
    let registered = engine.register("Step", step.clone(), None).unwrap();

    let mut group = c.benchmark_group("callback");
    group.bench_function("registered", |b| {
        let args = [registered.clone(), Value::from(1)];
        b.iter(|| engine.call(&apply, black_box(&args)).unwrap())
    });
    group.bench_function("transient", |b| {
        let args = [Value::Function(step.clone()), Value::from(1)];
        b.iter(|| engine.call(&apply, black_box(&args)).unwrap())
    });
    group.finish();

    engine.unregister(&registered).unwrap();
}

criterion_group!(benches, bench_scalar, bench_record, bench_strings, bench_callback);
criterion_main!(benches);
