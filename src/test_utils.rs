use crate::device::DeviceId;
use crate::manager::{Action, ConnectionManager, ManagerConfig};
use crate::transport::{
    Attempt, CharacteristicId, CharacteristicInfo, Command, PowerState, ServiceId, TransportEvent,
};

/// Stable device ids for unit tests.
pub const DEVICE_A: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
pub const DEVICE_B: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);

pub const SERVICE: ServiceId = ServiceId(0x0010);
pub const CHAR_NOTIFY: CharacteristicId = CharacteristicId(0x0011);
pub const CHAR_READ: CharacteristicId = CharacteristicId(0x0014);

pub fn manager() -> ConnectionManager {
    ConnectionManager::new(ManagerConfig::default())
}

pub fn discovered(id: DeviceId, name: Option<&str>) -> TransportEvent {
    TransportEvent::DeviceDiscovered {
        id,
        name: name.map(str::to_string),
    }
}

pub fn notifiable(id: CharacteristicId) -> CharacteristicInfo {
    CharacteristicInfo {
        service: SERVICE,
        id,
        notifiable: true,
        readable: true,
        writable: false,
    }
}

pub fn readable(id: CharacteristicId) -> CharacteristicInfo {
    CharacteristicInfo {
        notifiable: false,
        ..notifiable(id)
    }
}

/// A notification on [`CHAR_NOTIFY`].
pub fn notification(device: DeviceId, attempt: Attempt, value: &[u8]) -> TransportEvent {
    TransportEvent::Notification {
        device,
        attempt,
        characteristic: CHAR_NOTIFY,
        value: value.to_vec(),
    }
}

/// Only the adapter commands, in order.
pub fn transport_commands(actions: Vec<Action>) -> Vec<Command> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            Action::Transport(command) => Some(command),
            Action::ScheduleRecovery { .. } => None,
        })
        .collect()
}

/// Drive a fresh manager through discovery of `device` up to `Subscribing`.
///
/// Queued actions are drained so tests only see what happens next.
pub fn stream_from(device: DeviceId) -> (ConnectionManager, Attempt) {
    let mut manager = manager();
    manager.handle_event(TransportEvent::PowerChanged(PowerState::On));
    manager.handle_event(discovered(device, Some("Sensor")));
    manager.select_device(device);

    let attempt = Attempt(1);
    manager.handle_event(TransportEvent::Connected { device, attempt });
    manager.handle_event(TransportEvent::ServicesFound {
        device,
        attempt,
        services: vec![SERVICE],
    });
    manager.handle_event(TransportEvent::CharacteristicsFound {
        device,
        attempt,
        service: SERVICE,
        characteristics: vec![notifiable(CHAR_NOTIFY)],
    });
    manager.drain_actions();
    (manager, attempt)
}
