use std::hint::black_box;
use std::sync::Arc;

use bokeh_core::{
    decode_column_data, encode_column_data, ColumnData, Document, ModelRegistry, SetOptions,
    Shapes, TypedArray, Value,
};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

const ROWS: usize = 100_000;

fn float_columns() -> ColumnData {
    let xs: Vec<f64> = (0..ROWS).map(|i| i as f64 * 0.5).collect();
    let ys: Vec<f32> = (0..ROWS).map(|i| (i % 97) as f32).collect();
    let mut data = ColumnData::new();
    data.insert("x".to_string(), Value::Array(TypedArray::from(xs)));
    data.insert("y".to_string(), Value::Array(TypedArray::from(ys)));
    data
}

fn bench_column_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Column codec");
    group.throughput(Throughput::Elements(2 * ROWS as u64));

    let data = float_columns();
    let shapes = Shapes::new();
    group.bench_function("encode_column_data", |b| {
        b.iter(|| black_box(encode_column_data(black_box(&data), &shapes)))
    });

    let encoded = encode_column_data(&data, &shapes);
    group.bench_function("decode_column_data", |b| {
        b.iter(|| black_box(decode_column_data(black_box(&encoded), &[]).unwrap()))
    });

    group.finish();
}

fn bench_patch_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document patches");
    group.throughput(Throughput::Elements(1));

    let registry = Arc::new(ModelRegistry::with_builtins());
    let doc = Document::new(registry.clone());
    let source = registry.create("ColumnDataSource").unwrap();
    doc.add_root(&source).unwrap();
    let copy = Document::from_json(&doc.to_json(true).unwrap(), registry).unwrap();

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = events.clone();
    doc.on_change(move |e| sink.lock().push(e.clone()));
    source
        .setv([("data", Value::Dict(float_columns()))], SetOptions::default())
        .unwrap();
    let patch = doc
        .create_json_patch(&events.lock())
        .unwrap()
        .to_json()
        .unwrap();

    group.bench_function("apply_column_patch", |b| {
        b.iter(|| copy.apply_json_patch(black_box(&patch), &[], Some("bench")).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_column_codec, bench_patch_roundtrip);
criterion_main!(benches);
