//! Benchmark for the connection pipeline.
//!
//! Drives the connection manager through discovery and subscription, then
//! feeds it a stream of notifications the way the run loop does, rendering
//! every published snapshot.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use watering_reminder::transport::{
    Attempt, CharacteristicId, CharacteristicInfo, PowerState, ServiceId,
};
use watering_reminder::{
    ConnectionManager, DeviceId, ManagerConfig, OutputFormat, SnapshotFormatter, TransportEvent,
};

const DEVICE: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
const SERVICE: ServiceId = ServiceId(0x0010);
const CHARACTERISTIC: CharacteristicId = CharacteristicId(0x0011);

/// A manager in `Subscribing`, ready for notifications.
fn subscribed_manager() -> ConnectionManager {
    let attempt = Attempt(1);
    let mut manager = ConnectionManager::new(ManagerConfig::default());
    manager.handle_event(TransportEvent::PowerChanged(PowerState::On));
    manager.handle_event(TransportEvent::DeviceDiscovered {
        id: DEVICE,
        name: Some("Watering Sensor".to_string()),
    });
    manager.select_device(DEVICE);
    manager.handle_event(TransportEvent::Connected {
        device: DEVICE,
        attempt,
    });
    manager.handle_event(TransportEvent::ServicesFound {
        device: DEVICE,
        attempt,
        services: vec![SERVICE],
    });
    manager.handle_event(TransportEvent::CharacteristicsFound {
        device: DEVICE,
        attempt,
        service: SERVICE,
        characteristics: vec![CharacteristicInfo {
            service: SERVICE,
            id: CHARACTERISTIC,
            notifiable: true,
            readable: true,
            writable: false,
        }],
    });
    manager.drain_actions();
    manager
}

fn notification(percent: u64) -> TransportEvent {
    TransportEvent::Notification {
        device: DEVICE,
        attempt: Attempt(1),
        characteristic: CHARACTERISTIC,
        value: format!(r#"{{"moisturePercent":{percent}}}"#).into_bytes(),
    }
}

/// Readings sweep through all three statuses so every publish is a change.
fn notifications(count: u64) -> Vec<TransportEvent> {
    (0..count).map(|i| notification(20 + i % 60)).collect()
}

fn bench_connect_sequence(c: &mut Criterion) {
    c.bench_function("connect_sequence", |b| {
        b.iter(|| black_box(subscribed_manager().state()))
    });
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");

    for format in [OutputFormat::Text, OutputFormat::Json] {
        let formatter = format.formatter();
        for count in [1u64, 10, 100] {
            group.throughput(Throughput::Elements(count));
            group.bench_with_input(
                BenchmarkId::new(format.to_string(), count),
                &count,
                |b, &count| {
                    let events = notifications(count);
                    b.iter(|| {
                        let mut manager = subscribed_manager();
                        let mut updates = manager.subscribe();
                        let mut out = String::with_capacity(128 * count as usize);
                        for event in events.clone() {
                            manager.handle_event(event);
                            if matches!(updates.has_changed(), Ok(true)) {
                                out.push_str(&formatter.format(&updates.borrow_and_update()));
                                out.push('\n');
                            }
                        }
                        black_box(out)
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_connect_sequence, bench_stream);
criterion_main!(benches);
