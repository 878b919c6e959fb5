//! BlueZ D-Bus transport.
//!
//! This backend uses the `bluer` crate to talk to the BlueZ daemon via D-Bus.
//! It requires the `bluetoothd` daemon to be running. One task owns the
//! session and processes commands in order; slow GATT operations are spawned
//! so a pending connect never blocks a scan stop or a disconnect.

use super::{
    Attempt, CharacteristicId, CharacteristicInfo, Command, EVENT_CHANNEL_BUFFER_SIZE, PowerState,
    ServiceId, Transport, TransportError, TransportEvent, TransportLink,
};
use crate::device::DeviceId;
use bluer::{Adapter, AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty, Session};
use futures::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Give up on a connect that BlueZ has not completed within this time.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// How long to wait for BlueZ to resolve the GATT database after connecting.
pub const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::Bluetooth(err.to_string())
    }
}

/// Transport backed by the default BlueZ adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluerTransport;

impl Transport for BluerTransport {
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<TransportLink, TransportError>> + Send + '_>> {
        Box::pin(open())
    }
}

/// Open the default adapter and spawn the task that owns it.
async fn open() -> Result<TransportLink, TransportError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    debug!(adapter = adapter.name(), "using Bluetooth adapter");

    let powered = adapter.is_powered().await?;
    let adapter_events = adapter.events().await?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    // Spawn a task that owns all Bluetooth state and runs the command loop
    tokio::spawn(async move {
        let _session = session;
        let backend = Backend {
            adapter,
            events: tx,
            scan: None,
            device_tasks: DeviceTasks::default(),
        };
        backend.run(command_rx, adapter_events, powered).await;
    });

    Ok(TransportLink {
        events: rx,
        commands: command_tx,
    })
}

struct Backend {
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    scan: Option<JoinHandle<()>>,
    device_tasks: DeviceTasks,
}

/// Connect, watch and notify tasks per device; aborted on disconnect.
#[derive(Debug, Default)]
struct DeviceTasks {
    tasks: Vec<(DeviceId, JoinHandle<()>)>,
}

impl DeviceTasks {
    /// Finished handles are pruned first; failed connects never get a disconnect.
    fn spawn<F>(&mut self, device: DeviceId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|(_, handle)| !handle.is_finished());
        self.tasks.push((device, tokio::spawn(task)));
    }

    fn abort(&mut self, device: DeviceId) {
        self.tasks.retain(|(id, handle)| {
            if *id == device {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// A discovery session that cannot start is reported as the radio being off.
async fn report_scan_failure(events: &mpsc::Sender<TransportEvent>, err: impl fmt::Display) {
    warn!(%err, "failed to start discovery");
    let _ = events
        .send(TransportEvent::PowerChanged(PowerState::Off))
        .await;
}

impl Backend {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        adapter_events: impl Stream<Item = AdapterEvent> + Send,
        powered: bool,
    ) {
        let mut adapter_events = Box::pin(adapter_events);
        self.send(TransportEvent::PowerChanged(power_state(powered)))
            .await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                Some(event) = adapter_events.next() => {
                    if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
                        self.send(TransportEvent::PowerChanged(power_state(on))).await;
                    }
                }
            }
        }

        self.stop_scan();
        self.device_tasks.abort_all();
    }

    async fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    async fn execute(&mut self, command: Command) {
        debug!(?command, "executing");
        match command {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => self.stop_scan(),
            Command::Connect { device, attempt } => {
                let task = connect(self.adapter.clone(), device, attempt, self.events.clone());
                self.device_tasks.spawn(device, task);
            }
            Command::Disconnect { device } => self.disconnect(device).await,
            Command::DiscoverServices { device, attempt } => {
                let adapter = self.adapter.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let event = match discover_services(&adapter, device).await {
                        Ok(services) => TransportEvent::ServicesFound {
                            device,
                            attempt,
                            services,
                        },
                        Err(reason) => TransportEvent::ServiceDiscoveryFailed {
                            device,
                            attempt,
                            reason,
                        },
                    };
                    let _ = events.send(event).await;
                });
            }
            Command::DiscoverCharacteristics {
                device,
                service,
                attempt,
            } => {
                let adapter = self.adapter.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let event = match discover_characteristics(&adapter, device, service).await {
                        Ok(characteristics) => TransportEvent::CharacteristicsFound {
                            device,
                            attempt,
                            service,
                            characteristics,
                        },
                        Err(err) => TransportEvent::CharacteristicDiscoveryFailed {
                            device,
                            attempt,
                            service,
                            reason: err.to_string(),
                        },
                    };
                    let _ = events.send(event).await;
                });
            }
            Command::Subscribe {
                device,
                service,
                characteristic,
                attempt,
            } => {
                let task = subscribe(
                    self.adapter.clone(),
                    device,
                    service,
                    characteristic,
                    attempt,
                    self.events.clone(),
                );
                self.device_tasks.spawn(device, task);
            }
        }
    }

    async fn start_scan(&mut self) {
        self.stop_scan();

        let discovery = match self.adapter.discover_devices().await {
            Ok(discovery) => discovery,
            Err(err) => {
                report_scan_failure(&self.events, err).await;
                return;
            }
        };

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.scan = Some(tokio::spawn(async move {
            let mut discovery = Box::pin(discovery);
            while let Some(event) = discovery.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    let name = match adapter.device(address) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(_) => None,
                    };
                    let discovered = TransportEvent::DeviceDiscovered {
                        id: address.into(),
                        name,
                    };
                    if events.send(discovered).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }

    /// Dropping the discovery stream ends the BlueZ discovery session.
    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
    }

    /// Runs inline so a following connect to the same device sees a clean link.
    async fn disconnect(&mut self, device: DeviceId) {
        self.device_tasks.abort(device);

        match self.adapter.device(device.into()) {
            Ok(peripheral) => {
                if let Err(err) = peripheral.disconnect().await {
                    debug!(%device, %err, "disconnect failed");
                }
            }
            Err(err) => debug!(%device, %err, "unknown device on disconnect"),
        }
    }
}

fn power_state(powered: bool) -> PowerState {
    if powered {
        PowerState::On
    } else {
        PowerState::Off
    }
}

/// Connect, report the outcome, then watch the link until it drops.
async fn connect(
    adapter: Adapter,
    id: DeviceId,
    attempt: Attempt,
    events: mpsc::Sender<TransportEvent>,
) {
    let device = match adapter.device(id.into()) {
        Ok(device) => device,
        Err(err) => {
            let _ = events
                .send(TransportEvent::ConnectFailed {
                    device: id,
                    attempt,
                    reason: err.to_string(),
                })
                .await;
            return;
        }
    };

    let outcome = match tokio::time::timeout(CONNECT_TIMEOUT, device.connect()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("timeout".to_string()),
    };
    if let Err(reason) = outcome {
        let _ = events
            .send(TransportEvent::ConnectFailed {
                device: id,
                attempt,
                reason,
            })
            .await;
        return;
    }

    let watch = device.events().await;
    if events
        .send(TransportEvent::Connected {
            device: id,
            attempt,
        })
        .await
        .is_err()
    {
        return;
    }

    let Ok(watch) = watch else {
        return;
    };
    let mut watch = Box::pin(watch);
    while let Some(event) = watch.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            let _ = events
                .send(TransportEvent::Disconnected {
                    device: id,
                    attempt,
                    reason: "peripheral disconnected".to_string(),
                })
                .await;
            return;
        }
    }
}

async fn discover_services(adapter: &Adapter, id: DeviceId) -> Result<Vec<ServiceId>, String> {
    let device = adapter.device(id.into()).map_err(|e| e.to_string())?;

    let resolved = tokio::time::timeout(SERVICES_RESOLVE_TIMEOUT, async {
        loop {
            match device.is_services_resolved().await {
                Ok(true) => return Ok(()),
                Ok(false) => tokio::time::sleep(SERVICES_RESOLVE_POLL).await,
                Err(err) => return Err(err.to_string()),
            }
        }
    })
    .await
    .map_err(|_| "timeout".to_string())?;
    resolved?;

    let services = device.services().await.map_err(|e| e.to_string())?;
    Ok(services.iter().map(|s| ServiceId(s.id())).collect())
}

async fn discover_characteristics(
    adapter: &Adapter,
    id: DeviceId,
    service: ServiceId,
) -> bluer::Result<Vec<CharacteristicInfo>> {
    let device = adapter.device(id.into())?;
    let gatt_service = device.service(service.0).await?;

    let mut found = Vec::new();
    for characteristic in gatt_service.characteristics().await? {
        let flags = characteristic.flags().await?;
        found.push(CharacteristicInfo {
            service,
            id: CharacteristicId(characteristic.id()),
            notifiable: flags.notify || flags.indicate,
            readable: flags.read,
            writable: flags.write || flags.write_without_response,
        });
    }
    Ok(found)
}

/// Enable notifications and forward every value until the stream ends.
async fn subscribe(
    adapter: Adapter,
    id: DeviceId,
    service: ServiceId,
    characteristic: CharacteristicId,
    attempt: Attempt,
    events: mpsc::Sender<TransportEvent>,
) {
    let notifications = async {
        let device = adapter.device(id.into())?;
        let gatt_service = device.service(service.0).await?;
        let gatt_characteristic = gatt_service.characteristic(characteristic.0).await?;
        gatt_characteristic.notify().await
    }
    .await;

    let notifications = match notifications {
        Ok(stream) => stream,
        Err(err) => {
            let _ = events
                .send(TransportEvent::SubscribeFailed {
                    device: id,
                    attempt,
                    characteristic,
                    reason: err.to_string(),
                })
                .await;
            return;
        }
    };

    let _ = events
        .send(TransportEvent::Subscribed {
            device: id,
            attempt,
            characteristic,
        })
        .await;

    let mut notifications = Box::pin(notifications);
    while let Some(value) = notifications.next().await {
        let notification = TransportEvent::Notification {
            device: id,
            attempt,
            characteristic,
            value,
        };
        if events.send(notification).await.is_err() {
            return;
        }
    }

    let _ = events
        .send(TransportEvent::ReadFailed {
            device: id,
            attempt,
            characteristic,
            reason: "notification stream ended".to_string(),
        })
        .await;
}
