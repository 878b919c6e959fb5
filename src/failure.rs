//! Failure taxonomy published by the connection manager.
//!
//! Failures never leave the core as `Err`; they are stored as state and the
//! presentation layer reads them from the snapshot.

use crate::decoder::DecodeError;
use thiserror::Error;

/// The single failure currently surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Bluetooth is powered off or not supported by this host.
    #[error("Bluetooth is off")]
    RadioUnavailable,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// The selected device is no longer known.
    #[error("No device found")]
    PeripheralNotFound,
    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),
    #[error("Failed to discover characteristics: {0}")]
    CharacteristicDiscoveryFailed(String),
    #[error("Failed to read data: {0}")]
    ReadFailed(String),
    #[error("Received invalid data: {0}")]
    InvalidSensorData(String),
}

/// What `recover()` does for a given failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing the core can do; the user has to act outside the app.
    None,
    /// Wait for the retry delay, then rescan.
    DelayedRescan,
    /// Rescan right away.
    Rescan,
    /// Clear the failure and return to the operational state underneath.
    Clear,
}

impl Failure {
    pub fn recovery(&self) -> Recovery {
        match self {
            Failure::RadioUnavailable => Recovery::None,
            Failure::ConnectionFailed(_) => Recovery::DelayedRescan,
            Failure::PeripheralNotFound => Recovery::Rescan,
            Failure::ServiceDiscoveryFailed(_)
            | Failure::CharacteristicDiscoveryFailed(_)
            | Failure::ReadFailed(_)
            | Failure::InvalidSensorData(_) => Recovery::Clear,
        }
    }

    /// Short machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::RadioUnavailable => "radio_unavailable",
            Failure::ConnectionFailed(_) => "connection_failed",
            Failure::PeripheralNotFound => "peripheral_not_found",
            Failure::ServiceDiscoveryFailed(_) => "service_discovery_failed",
            Failure::CharacteristicDiscoveryFailed(_) => "characteristic_discovery_failed",
            Failure::ReadFailed(_) => "read_failed",
            Failure::InvalidSensorData(_) => "invalid_sensor_data",
        }
    }

    /// Transient failures annotate the state without replacing it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Failure::InvalidSensorData(_))
    }
}

impl From<DecodeError> for Failure {
    fn from(err: DecodeError) -> Self {
        Failure::InvalidSensorData(err.to_string())
    }
}
