//! JSON lines output.

use crate::manager::{ConnectionState, Snapshot};
use crate::output::SnapshotFormatter;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonSnapshot<'a> {
    state: &'static str,
    device: Option<String>,
    devices: Vec<JsonDevice<'a>>,
    moisture_percent: Option<i64>,
    status: Option<String>,
    show_special_indicator: bool,
    failure: Option<JsonFailure>,
}

#[derive(Serialize)]
struct JsonDevice<'a> {
    id: String,
    name: &'a str,
}

#[derive(Serialize)]
struct JsonFailure {
    kind: &'static str,
    message: String,
}

fn state_name(state: &ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "idle",
        ConnectionState::Scanning => "scanning",
        ConnectionState::Connecting(_) => "connecting",
        ConnectionState::DiscoveringServices(_) => "discovering_services",
        ConnectionState::DiscoveringCharacteristics(..) => "discovering_characteristics",
        ConnectionState::Subscribing(_) => "subscribing",
        ConnectionState::Streaming(_) => "streaming",
        ConnectionState::Failed(_) => "failed",
    }
}

fn state_device(state: &ConnectionState) -> Option<String> {
    match state {
        ConnectionState::Connecting(device)
        | ConnectionState::DiscoveringServices(device)
        | ConnectionState::DiscoveringCharacteristics(device, _)
        | ConnectionState::Subscribing(device)
        | ConnectionState::Streaming(device) => Some(device.to_string()),
        ConnectionState::Idle | ConnectionState::Scanning | ConnectionState::Failed(_) => None,
    }
}

impl SnapshotFormatter for JsonFormatter {
    fn format(&self, snapshot: &Snapshot) -> String {
        let view = JsonSnapshot {
            state: state_name(&snapshot.state),
            device: state_device(&snapshot.state)
                .or_else(|| snapshot.connection.as_ref().map(|c| c.device.to_string())),
            devices: snapshot
                .devices
                .iter()
                .map(|d| JsonDevice {
                    id: d.id.to_string(),
                    name: d.display_name(),
                })
                .collect(),
            moisture_percent: snapshot.reading.map(|r| r.moisture_percent),
            status: snapshot.status.map(|s| s.to_string()),
            show_special_indicator: snapshot.show_special_indicator,
            failure: snapshot.failure.as_ref().map(|f| JsonFailure {
                kind: f.kind(),
                message: f.to_string(),
            }),
        };
        // Serializing plain strings, numbers and options cannot fail.
        serde_json::to_string(&view).unwrap_or_default()
    }
}
