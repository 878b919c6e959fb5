//! BLE connection state machine for the moisture sensor.
//!
//! [`ConnectionManager`] owns the whole central-role lifecycle: scanning,
//! connecting, service and characteristic discovery, subscribing and
//! streaming readings. It is synchronous and single-owner: adapter callbacks
//! go through [`ConnectionManager::handle_event`], user intents through
//! [`ConnectionManager::select_device`] and [`ConnectionManager::recover`].
//! Adapter commands and timer requests are queued as [`Action`]s for the
//! driver to execute, and every change is published as a [`Snapshot`] on a
//! `watch` channel.

use crate::decoder::decode_payload;
use crate::device::{Device, DeviceId, DeviceList};
use crate::failure::{Failure, Recovery};
use crate::reading::{MoistureStatus, SensorReading};
use crate::transport::{
    Attempt, CharacteristicId, CharacteristicInfo, Command, PowerState, ServiceId, TransportEvent,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delay before rescanning after a failed connection.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Tunables for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long `recover()` waits before rescanning after `ConnectionFailed`.
    pub retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting(DeviceId),
    DiscoveringServices(DeviceId),
    DiscoveringCharacteristics(DeviceId, ServiceId),
    Subscribing(DeviceId),
    Streaming(DeviceId),
    Failed(Failure),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting(device) => write!(f, "connecting to {device}"),
            ConnectionState::DiscoveringServices(device) => {
                write!(f, "discovering services of {device}")
            }
            ConnectionState::DiscoveringCharacteristics(device, service) => {
                write!(f, "discovering characteristics of {device} {service}")
            }
            ConnectionState::Subscribing(device) => write!(f, "subscribing to {device}"),
            ConnectionState::Streaming(device) => write!(f, "streaming from {device}"),
            ConnectionState::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// The established link to the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub device: DeviceId,
    /// Empty until every service has reported its characteristics.
    pub characteristics: Vec<CharacteristicInfo>,
    /// Characteristics with notifications confirmed active.
    pub subscribed: Vec<CharacteristicId>,
}

/// Everything the presentation layer may render.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub devices: DeviceList,
    pub connection: Option<Connection>,
    pub reading: Option<SensorReading>,
    pub status: Option<MoistureStatus>,
    pub failure: Option<Failure>,
    pub show_special_indicator: bool,
}

/// Work the driver must carry out on the manager's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transport(Command),
    /// Call [`ConnectionManager::recovery_elapsed`] with `token` after `delay`.
    ScheduleRecovery { delay: Duration, token: u64 },
}

/// Per-attempt bookkeeping. Exists from `select_device` until the attempt is
/// abandoned; `connected` marks when it also backs a [`Connection`].
#[derive(Debug)]
struct Link {
    device: DeviceId,
    attempt: Attempt,
    connected: bool,
    pending_services: Vec<ServiceId>,
    discovered: Vec<CharacteristicInfo>,
    characteristics: Vec<CharacteristicInfo>,
    requested: Vec<CharacteristicId>,
    subscribed: Vec<CharacteristicId>,
}

impl Link {
    fn new(device: DeviceId, attempt: Attempt) -> Self {
        Self {
            device,
            attempt,
            connected: false,
            pending_services: Vec::new(),
            discovered: Vec::new(),
            characteristics: Vec::new(),
            requested: Vec::new(),
            subscribed: Vec::new(),
        }
    }

    /// Every requested notification has been acknowledged.
    fn fully_subscribed(&self) -> bool {
        !self.requested.is_empty() && self.requested.iter().all(|c| self.subscribed.contains(c))
    }

    fn connection(&self) -> Option<Connection> {
        self.connected.then(|| Connection {
            device: self.device,
            characteristics: self.characteristics.clone(),
            subscribed: self.subscribed.clone(),
        })
    }
}

/// Central-role connection manager.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ManagerConfig,
    /// Operational state underneath any active failure.
    phase: ConnectionState,
    failure: Option<Failure>,
    devices: DeviceList,
    link: Option<Link>,
    /// Last device the user selected; still valid for reselection after its link is gone.
    target: Option<DeviceId>,
    reading: Option<SensorReading>,
    generation: Attempt,
    recovery_token: u64,
    pending_recovery: Option<u64>,
    actions: Vec<Action>,
    published: watch::Sender<Snapshot>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (published, _) = watch::channel(Snapshot::default());
        Self {
            config,
            phase: ConnectionState::Idle,
            failure: None,
            devices: DeviceList::new(),
            link: None,
            target: None,
            reading: None,
            generation: Attempt::default(),
            recovery_token: 0,
            pending_recovery: None,
            actions: Vec::new(),
            published,
        }
    }

    /// Receiver that is notified whenever the published snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.published.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        match &self.failure {
            Some(failure) if !failure.is_transient() => ConnectionState::Failed(failure.clone()),
            _ => self.phase.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let status = self.reading.map(|r| r.status());
        Snapshot {
            state: self.state(),
            devices: self.devices.clone(),
            connection: self.link.as_ref().and_then(Link::connection),
            reading: self.reading,
            status,
            failure: self.failure.clone(),
            show_special_indicator: status == Some(MoistureStatus::Optimal),
        }
    }

    /// Take the queued actions, oldest first.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Dispatch one adapter event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if let Some((device, attempt)) = event.attempt()
            && !self.is_current(device, attempt)
        {
            debug!(%device, %attempt, current = %self.generation, "ignoring stale event");
            return;
        }

        match event {
            TransportEvent::PowerChanged(power) => self.on_power_changed(power),
            TransportEvent::DeviceDiscovered { id, name } => self.on_device_discovered(id, name),
            TransportEvent::Connected { device, .. } => self.on_connected(device),
            TransportEvent::ConnectFailed { device, reason, .. } => {
                self.on_connect_failed(device, reason);
            }
            TransportEvent::Disconnected { device, reason, .. } => {
                self.on_disconnected(device, reason);
            }
            TransportEvent::ServicesFound {
                device, services, ..
            } => self.on_services_found(device, services),
            TransportEvent::ServiceDiscoveryFailed { device, reason, .. } => {
                if self.phase == ConnectionState::DiscoveringServices(device) {
                    self.fail(Failure::ServiceDiscoveryFailed(reason));
                }
            }
            TransportEvent::CharacteristicsFound {
                device,
                service,
                characteristics,
                ..
            } => self.on_characteristics_found(device, service, characteristics),
            TransportEvent::CharacteristicDiscoveryFailed { device, reason, .. } => {
                if matches!(self.phase, ConnectionState::DiscoveringCharacteristics(d, _) if d == device)
                {
                    self.fail(Failure::CharacteristicDiscoveryFailed(reason));
                }
            }
            TransportEvent::Subscribed {
                device,
                characteristic,
                ..
            } => self.on_subscribed(device, characteristic),
            TransportEvent::SubscribeFailed {
                characteristic,
                reason,
                ..
            } => {
                debug!(%characteristic, "subscription rejected");
                self.fail(Failure::ReadFailed(reason));
            }
            TransportEvent::Notification {
                device,
                characteristic,
                value,
                ..
            } => self.on_notification(device, characteristic, &value),
            TransportEvent::ReadFailed { reason, .. } => {
                if self.link.as_ref().is_some_and(|l| l.connected) {
                    self.fail(Failure::ReadFailed(reason));
                }
            }
        }

        self.publish();
    }

    /// User intent: connect to `device`.
    ///
    /// Supersedes any attempt or connection in progress. Unknown devices
    /// surface as [`Failure::PeripheralNotFound`].
    pub fn select_device(&mut self, device: DeviceId) {
        if self.failure == Some(Failure::RadioUnavailable) {
            warn!(%device, "cannot connect while Bluetooth is off");
            return;
        }

        if !self.devices.contains(&device) && self.target != Some(device) {
            warn!(%device, "selected device is not known");
            self.fail(Failure::PeripheralNotFound);
            self.publish();
            return;
        }

        if self.phase == ConnectionState::Scanning {
            self.command(Command::StopScan);
        }
        self.drop_link();

        let name = self
            .devices
            .get(&device)
            .map(|d| d.display_name().to_string());
        self.generation = self.generation.next();
        let attempt = self.generation;
        info!(%device, ?name, %attempt, "connecting");

        self.link = Some(Link::new(device, attempt));
        self.target = Some(device);
        self.clear_failure();
        self.devices.clear();
        self.transition(ConnectionState::Connecting(device));
        self.command(Command::Connect { device, attempt });
        self.publish();
    }

    /// User intent: act on the active failure. No-op when there is none.
    pub fn recover(&mut self) {
        let Some(failure) = &self.failure else {
            return;
        };

        match failure.recovery() {
            Recovery::None => {
                debug!(%failure, "nothing to recover; waiting for the radio");
            }
            Recovery::DelayedRescan => {
                if self.pending_recovery.is_none() {
                    self.recovery_token += 1;
                    let token = self.recovery_token;
                    self.pending_recovery = Some(token);
                    debug!(delay = ?self.config.retry_delay, token, "rescan scheduled");
                    self.actions.push(Action::ScheduleRecovery {
                        delay: self.config.retry_delay,
                        token,
                    });
                }
            }
            Recovery::Rescan => {
                self.clear_failure();
                self.restart_scan();
            }
            Recovery::Clear => {
                self.clear_failure();
            }
        }

        self.publish();
    }

    /// Timer callback for a delay requested via [`Action::ScheduleRecovery`].
    pub fn recovery_elapsed(&mut self, token: u64) {
        if self.pending_recovery != Some(token)
            || !matches!(self.failure, Some(Failure::ConnectionFailed(_)))
        {
            debug!(token, "ignoring superseded recovery timer");
            return;
        }

        self.clear_failure();
        self.restart_scan();
        self.publish();
    }

    fn is_current(&self, device: DeviceId, attempt: Attempt) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.device == device && l.attempt == attempt)
    }

    fn on_power_changed(&mut self, power: PowerState) {
        match power {
            PowerState::On => {
                let radio_was_off = self.failure == Some(Failure::RadioUnavailable);
                if radio_was_off {
                    self.clear_failure();
                }
                if self.phase == ConnectionState::Idle && (radio_was_off || self.failure.is_none())
                {
                    info!("Bluetooth powered on");
                    self.restart_scan();
                }
            }
            PowerState::Off | PowerState::Unsupported => {
                warn!(?power, "Bluetooth unavailable");
                self.link = None;
                self.reading = None;
                self.transition(ConnectionState::Idle);
                self.fail(Failure::RadioUnavailable);
            }
        }
    }

    fn on_device_discovered(&mut self, id: DeviceId, name: Option<String>) {
        if self.phase != ConnectionState::Scanning {
            debug!(%id, "discovery outside of scanning ignored");
            return;
        }
        if self.devices.insert(Device::new(id, name)) {
            debug!(%id, "device discovered");
        }
    }

    fn on_connected(&mut self, device: DeviceId) {
        if self.phase != ConnectionState::Connecting(device) {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.connected = true;
        let attempt = link.attempt;

        info!(%device, "connected");
        self.transition(ConnectionState::DiscoveringServices(device));
        self.command(Command::DiscoverServices { device, attempt });
    }

    fn on_connect_failed(&mut self, device: DeviceId, reason: String) {
        if self.phase != ConnectionState::Connecting(device) {
            return;
        }
        self.link = None;
        self.transition(ConnectionState::Idle);
        self.fail(Failure::ConnectionFailed(reason));
    }

    fn on_disconnected(&mut self, device: DeviceId, reason: String) {
        if !self.link.as_ref().is_some_and(|l| l.connected) {
            return;
        }
        info!(%device, %reason, "peripheral disconnected");
        self.link = None;
        self.reading = None;
        self.transition(ConnectionState::Idle);
        self.fail(Failure::ConnectionFailed(format!("disconnected: {reason}")));
    }

    fn on_services_found(&mut self, device: DeviceId, services: Vec<ServiceId>) {
        if self.phase != ConnectionState::DiscoveringServices(device) {
            return;
        }
        let Some(first) = services.first().copied() else {
            self.fail(Failure::ServiceDiscoveryFailed("no services".into()));
            return;
        };
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let attempt = link.attempt;
        link.pending_services = services.clone();
        debug!(%device, count = services.len(), "services found");

        self.transition(ConnectionState::DiscoveringCharacteristics(device, first));
        for service in services {
            self.command(Command::DiscoverCharacteristics {
                device,
                service,
                attempt,
            });
        }
    }

    fn on_characteristics_found(
        &mut self,
        device: DeviceId,
        service: ServiceId,
        characteristics: Vec<CharacteristicInfo>,
    ) {
        if !matches!(self.phase, ConnectionState::DiscoveringCharacteristics(d, _) if d == device) {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(index) = link.pending_services.iter().position(|s| *s == service) else {
            debug!(%service, "characteristics for unexpected service ignored");
            return;
        };
        link.pending_services.remove(index);

        let attempt = link.attempt;
        let mut subscribe = Vec::new();
        for characteristic in characteristics {
            if characteristic.notifiable {
                link.requested.push(characteristic.id);
                subscribe.push(Command::Subscribe {
                    device,
                    service: characteristic.service,
                    characteristic: characteristic.id,
                    attempt,
                });
            }
            link.discovered.push(characteristic);
        }

        let next = match link.pending_services.first() {
            Some(pending) => Some(ConnectionState::DiscoveringCharacteristics(device, *pending)),
            None => {
                link.characteristics = std::mem::take(&mut link.discovered);
                if link.fully_subscribed() {
                    Some(ConnectionState::Streaming(device))
                } else {
                    (!link.requested.is_empty()).then_some(ConnectionState::Subscribing(device))
                }
            }
        };

        for command in subscribe {
            self.command(command);
        }
        match next {
            Some(state) => self.transition(state),
            None => self.fail(Failure::CharacteristicDiscoveryFailed(
                "no notifiable characteristic".into(),
            )),
        }
    }

    fn on_subscribed(&mut self, device: DeviceId, characteristic: CharacteristicId) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.requested.contains(&characteristic) {
            debug!(%characteristic, "acknowledgement for unrequested characteristic ignored");
            return;
        }
        if !link.subscribed.contains(&characteristic) {
            debug!(%characteristic, "notifications enabled");
            link.subscribed.push(characteristic);
        }
        // Acks may arrive while other services are still being walked.
        if link.fully_subscribed() && self.phase == ConnectionState::Subscribing(device) {
            info!(%device, "subscribed, streaming");
            self.transition(ConnectionState::Streaming(device));
        }
    }

    fn on_notification(&mut self, device: DeviceId, characteristic: CharacteristicId, value: &[u8]) {
        if !matches!(
            self.phase,
            ConnectionState::Subscribing(d) | ConnectionState::Streaming(d) if d == device
        ) {
            debug!(%characteristic, "notification before subscription ignored");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.requested.contains(&characteristic) {
            debug!(%characteristic, "notification from unsubscribed characteristic ignored");
            return;
        }
        // A delivered notification proves the subscription is live.
        if !link.subscribed.contains(&characteristic) {
            link.subscribed.push(characteristic);
        }

        match decode_payload(value) {
            Ok(reading) => {
                debug!(moisture = reading.moisture_percent, "reading received");
                self.reading = Some(reading);
                if self.failure.as_ref().is_some_and(Failure::is_transient) {
                    self.failure = None;
                }
                self.transition(ConnectionState::Streaming(device));
            }
            Err(err) => {
                warn!(%err, "invalid sensor payload");
                if self.failure.as_ref().is_none_or(Failure::is_transient) {
                    self.failure = Some(err.into());
                }
            }
        }
    }

    fn restart_scan(&mut self) {
        self.drop_link();
        self.devices.clear();
        self.transition(ConnectionState::Scanning);
        self.command(Command::StartScan);
    }

    /// Abandon the current attempt, disconnecting if the adapter may hold a link.
    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            self.command(Command::Disconnect {
                device: link.device,
            });
        }
        self.reading = None;
    }

    fn fail(&mut self, failure: Failure) {
        warn!(%failure, "connection failure");
        self.pending_recovery = None;
        self.failure = Some(failure);
    }

    fn clear_failure(&mut self) {
        self.pending_recovery = None;
        self.failure = None;
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "transition");
            self.phase = next;
        }
    }

    fn command(&mut self, command: Command) {
        self.actions.push(Action::Transport(command));
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.published.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
