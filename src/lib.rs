//! `watering-reminder` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit codes.
//! The connection logic lives in [`crate::manager`] as a synchronous state machine,
//! and [`crate::app`] drives it against an injected [`Transport`] and output stream
//! so both can be tested deterministically.

pub mod app;
pub mod decoder;
pub mod device;
pub mod failure;
pub mod manager;
pub mod output;
pub mod reading;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use decoder::{DecodeError, decode_payload};
pub use device::{Device, DeviceId, DeviceList};
pub use failure::{Failure, Recovery};
pub use manager::{Action, ConnectionManager, ConnectionState, ManagerConfig, Snapshot};
pub use output::{OutputFormat, SnapshotFormatter};
pub use reading::{MoistureStatus, SensorReading};
pub use transport::{Command, Transport, TransportError, TransportEvent};
