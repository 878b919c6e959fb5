//! Plain text status lines.

use crate::manager::{ConnectionState, Snapshot};
use crate::output::SnapshotFormatter;
use std::fmt::Write;

/// One status line per snapshot, mirroring what the sensor screen shows.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter;

impl SnapshotFormatter for TextFormatter {
    fn format(&self, snapshot: &Snapshot) -> String {
        let mut line = String::new();

        match (&snapshot.state, &snapshot.failure) {
            (ConnectionState::Failed(failure), _) => {
                let _ = write!(line, "Error: {failure}");
            }
            (ConnectionState::Scanning, _) => {
                let _ = write!(line, "Scanning: {} device(s)", snapshot.devices.len());
                for device in &snapshot.devices {
                    let _ = write!(line, ", {} {}", device.id, device.display_name());
                }
            }
            (state, failure) => {
                let _ = write!(line, "{}", capitalize(&state.to_string()));
                if let Some(reading) = snapshot.reading {
                    let _ = write!(line, ": Moisture Level: {}%", reading.moisture_percent);
                }
                if let Some(status) = snapshot.status {
                    if snapshot.show_special_indicator {
                        let _ = write!(line, " [*]");
                    }
                    let _ = write!(line, " {}", status.advice());
                } else if matches!(
                    state,
                    ConnectionState::Subscribing(_) | ConnectionState::Streaming(_)
                ) {
                    let _ = write!(line, ": Waiting for receiving data...");
                }
                if let Some(failure) = failure {
                    let _ = write!(line, " ({failure})");
                }
            }
        }

        line
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
