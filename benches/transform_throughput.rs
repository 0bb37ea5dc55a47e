//! Avalanche benchmark suite.
//!
//! Benchmarks for the per-partition hot path:
//! - Flattening scanned items into rows
//! - Encoding rows as CSV and NDJSON objects

use std::collections::{BTreeMap, HashMap};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use avalanche::config::{FieldConfig, FieldKind};
use avalanche::sink::object::{encode_csv, encode_json};
use avalanche::source::{RawItem, TaggedValue};
use avalanche::transform::RowTransformer;

/// Fields declared by a typical order export.
fn benchmark_fields() -> Vec<FieldConfig> {
    [
        ("id", FieldKind::String),
        ("customer", FieldKind::String),
        ("total", FieldKind::Number),
        ("paid", FieldKind::Boolean),
        ("lines", FieldKind::Json),
    ]
    .into_iter()
    .map(|(name, kind)| FieldConfig {
        name: name.to_string(),
        kind,
    })
    .collect()
}

/// Generate scanned items with a mix of wire types and missing fields.
fn generate_items(count: usize) -> Vec<RawItem> {
    (0..count)
        .map(|i| {
            let mut item = HashMap::from([
                ("id".to_string(), TaggedValue::String(format!("order-{i:08}"))),
                (
                    "total".to_string(),
                    TaggedValue::Number(format!("{}.{:02}", i % 1000, i % 100)),
                ),
                ("paid".to_string(), TaggedValue::Bool(i % 3 != 0)),
                (
                    "lines".to_string(),
                    TaggedValue::List(vec![TaggedValue::Map(BTreeMap::from([
                        ("sku".to_string(), TaggedValue::String(format!("sku-{}", i % 50))),
                        ("qty".to_string(), TaggedValue::Number((i % 7).to_string())),
                    ]))]),
                ),
            ]);
            // Every fifth customer name is missing, every seventh needs quoting.
            if i % 5 != 0 {
                let name = if i % 7 == 0 {
                    format!("Customer, \"{i}\"")
                } else {
                    format!("customer {i}")
                };
                item.insert("customer".to_string(), TaggedValue::String(name));
            }
            item
        })
        .collect()
}

fn flatten_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten");
    let transformer = RowTransformer::new(benchmark_fields());

    for size in [100, 1000, 10000] {
        let items = generate_items(size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("items", size), &items, |b, items| {
            b.iter(|| transformer.flatten(items).unwrap());
        });
    }

    group.finish();
}

fn encode_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let transformer = RowTransformer::new(benchmark_fields());

    for size in [1000, 10000] {
        let rows = transformer.flatten(&generate_items(size)).unwrap();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("csv", size), &rows, |b, rows| {
            b.iter(|| encode_csv(rows));
        });
        group.bench_with_input(BenchmarkId::new("json", size), &rows, |b, rows| {
            b.iter(|| encode_json(rows).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, flatten_benchmarks, encode_benchmarks);
criterion_main!(benches);
