//! Argument codec benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use firebreak_core::codec::{Value, decode, encode};

fn nested_value() -> Value {
    let row = Value::map([
        ("id", Value::Int(12_345)),
        ("name", Value::Str("warm-vm".into())),
        ("weights", Value::seq((0..16).map(|i| Value::Float(f64::from(i) * 0.5)))),
        ("blob", Value::Bytes(vec![0xAB; 256])),
    ]);
    Value::seq((0..32).map(|_| row.clone()))
}

fn bench_encode(c: &mut Criterion) {
    let scalar = Value::Int(42);
    let nested = nested_value();

    c.bench_function("encode_scalar", |b| {
        b.iter(|| encode(black_box(&scalar)).unwrap());
    });
    c.bench_function("encode_nested", |b| {
        b.iter(|| encode(black_box(&nested)).unwrap());
    });
}

fn bench_decode(c: &mut Criterion) {
    let nested = encode(&nested_value()).unwrap();

    c.bench_function("decode_nested", |b| {
        b.iter(|| decode(black_box(&nested)).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
