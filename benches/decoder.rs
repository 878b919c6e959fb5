//! Benchmark suite for the sensor payload decoder.
//!
//! The decoder runs once per notification, so it is measured in isolation
//! from the state machine and the runtime.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use watering_reminder::decode_payload;

fn bench_decode_valid(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_valid");
    group.throughput(Throughput::Elements(1));

    let compact = br#"{"moisturePercent":52}"#.to_vec();
    group.bench_function("compact", |b| {
        b.iter(|| decode_payload(black_box(&compact)))
    });

    let padded = br#"{ "battery": 87, "moisturePercent": 52, "firmware": "1.0.3" }"#.to_vec();
    group.bench_function("extra_fields", |b| {
        b.iter(|| decode_payload(black_box(&padded)))
    });

    group.finish();
}

fn bench_decode_invalid(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_invalid");

    let cases: [(&str, &[u8]); 4] = [
        ("not_utf8", &[0xFF, 0xFE, 0x00]),
        ("not_json", b"moisture=52"),
        ("missing_field", br#"{"humidity":52}"#),
        ("not_integer", br#"{"moisturePercent":"52"}"#),
    ];
    for (name, data) in cases {
        group.bench_function(name, |b| b.iter(|| decode_payload(black_box(data))));
    }

    group.finish();
}

criterion_group!(benches, bench_decode_valid, bench_decode_invalid);
criterion_main!(benches);
