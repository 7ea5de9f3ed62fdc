use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pubwire::api::{message_size, outgoing_to_proto};
use pubwire::types::OutgoingMessage;
use std::collections::HashMap;

/// Create a test message with given body size
fn create_test_message(body_size: usize) -> OutgoingMessage {
    OutgoingMessage::new(vec![0u8; body_size])
}

/// Create a message with attributes
fn create_message_with_attributes(body_size: usize, attr_count: usize) -> OutgoingMessage {
    let mut attributes = HashMap::new();
    for i in 0..attr_count {
        attributes.insert(format!("attr{}", i), format!("value{}", i));
    }
    OutgoingMessage {
        data: vec![0u8; body_size].into(),
        attributes,
        ordering_key: None,
    }
}

/// Benchmark wire conversion for different payload sizes
fn bench_message_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_conversion");

    for size in [100, 1024, 10240, 102400].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let message = create_test_message(size);
                black_box(outgoing_to_proto(black_box(message)))
            });
        });
    }

    group.finish();
}

/// Benchmark encoded-size accounting used against batch thresholds
fn bench_size_accounting(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_accounting");

    for attr_count in [0, 4, 16].iter() {
        let message = outgoing_to_proto(create_message_with_attributes(1024, *attr_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(attr_count),
            &message,
            |b, message| {
                b.iter(|| black_box(message_size(black_box(message))));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_message_conversion, bench_size_accounting);
criterion_main!(benches);
