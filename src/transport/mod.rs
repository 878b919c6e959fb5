//! BLE central transport abstraction.
//!
//! The connection manager never talks to a Bluetooth stack directly. It
//! queues [`Command`]s and consumes [`TransportEvent`]s; a [`Transport`]
//! implementation turns those into real adapter calls. Every command that
//! belongs to a connection attempt carries that attempt's [`Attempt`]
//! generation and the transport echoes it back on the matching events, so the
//! manager can drop completions of attempts it has already abandoned.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::device::DeviceId;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel buffer size for transport events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Monotonic connection attempt generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Attempt(pub u64);

impl Attempt {
    pub fn next(self) -> Self {
        Attempt(self.0 + 1)
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a GATT service on the connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u16);

/// Handle of a GATT characteristic on the connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(pub u16);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {:#06x}", self.0)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "characteristic {:#06x}", self.0)
    }
}

/// A discovered characteristic and the capabilities it advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service: ServiceId,
    pub id: CharacteristicId,
    pub notifiable: bool,
    pub readable: bool,
    pub writable: bool,
}

/// Radio state reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unsupported,
}

/// Requests from the connection manager to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartScan,
    StopScan,
    Connect {
        device: DeviceId,
        attempt: Attempt,
    },
    /// Tear down the link to `device`, including a connect still in flight.
    Disconnect {
        device: DeviceId,
    },
    /// Discover all services of the connected peripheral.
    DiscoverServices {
        device: DeviceId,
        attempt: Attempt,
    },
    DiscoverCharacteristics {
        device: DeviceId,
        service: ServiceId,
        attempt: Attempt,
    },
    /// Enable notifications on a characteristic.
    Subscribe {
        device: DeviceId,
        service: ServiceId,
        characteristic: CharacteristicId,
        attempt: Attempt,
    },
}

/// Asynchronous adapter callbacks, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PowerChanged(PowerState),
    DeviceDiscovered {
        id: DeviceId,
        name: Option<String>,
    },
    Connected {
        device: DeviceId,
        attempt: Attempt,
    },
    ConnectFailed {
        device: DeviceId,
        attempt: Attempt,
        reason: String,
    },
    /// The peripheral dropped an established link.
    Disconnected {
        device: DeviceId,
        attempt: Attempt,
        reason: String,
    },
    ServicesFound {
        device: DeviceId,
        attempt: Attempt,
        services: Vec<ServiceId>,
    },
    ServiceDiscoveryFailed {
        device: DeviceId,
        attempt: Attempt,
        reason: String,
    },
    CharacteristicsFound {
        device: DeviceId,
        attempt: Attempt,
        service: ServiceId,
        characteristics: Vec<CharacteristicInfo>,
    },
    CharacteristicDiscoveryFailed {
        device: DeviceId,
        attempt: Attempt,
        service: ServiceId,
        reason: String,
    },
    Subscribed {
        device: DeviceId,
        attempt: Attempt,
        characteristic: CharacteristicId,
    },
    SubscribeFailed {
        device: DeviceId,
        attempt: Attempt,
        characteristic: CharacteristicId,
        reason: String,
    },
    Notification {
        device: DeviceId,
        attempt: Attempt,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    ReadFailed {
        device: DeviceId,
        attempt: Attempt,
        characteristic: CharacteristicId,
        reason: String,
    },
}

impl TransportEvent {
    /// The attempt this event belongs to, if it is connection-scoped.
    pub fn attempt(&self) -> Option<(DeviceId, Attempt)> {
        match self {
            TransportEvent::PowerChanged(_) | TransportEvent::DeviceDiscovered { .. } => None,
            TransportEvent::Connected { device, attempt }
            | TransportEvent::ConnectFailed {
                device, attempt, ..
            }
            | TransportEvent::Disconnected {
                device, attempt, ..
            }
            | TransportEvent::ServicesFound {
                device, attempt, ..
            }
            | TransportEvent::ServiceDiscoveryFailed {
                device, attempt, ..
            }
            | TransportEvent::CharacteristicsFound {
                device, attempt, ..
            }
            | TransportEvent::CharacteristicDiscoveryFailed {
                device, attempt, ..
            }
            | TransportEvent::Subscribed {
                device, attempt, ..
            }
            | TransportEvent::SubscribeFailed {
                device, attempt, ..
            }
            | TransportEvent::Notification {
                device, attempt, ..
            }
            | TransportEvent::ReadFailed {
                device, attempt, ..
            } => Some((*device, *attempt)),
        }
    }
}

/// Errors opening or driving a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The transport stopped accepting commands.
    #[error("transport closed")]
    Closed,
}

/// An open transport: events flow out, commands flow in.
#[derive(Debug)]
pub struct TransportLink {
    pub events: mpsc::Receiver<TransportEvent>,
    pub commands: mpsc::UnboundedSender<Command>,
}

/// Transport abstraction to enable deterministic tests without Bluetooth hardware.
pub trait Transport: Send + Sync {
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<TransportLink, TransportError>> + Send + '_>>;
}
