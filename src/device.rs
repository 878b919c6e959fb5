//! Peripheral identity and the discovered-device list.
//!
//! A [`DeviceId`] is a compact 6-byte Bluetooth address. It is treated as an
//! opaque handle by the connection manager: the manager only compares ids and
//! hands them back to the transport.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// Display name used when a peripheral does not advertise one.
pub const PLACEHOLDER_NAME: &str = "Unnamed device";

/// A Bluetooth device address stored as a compact 6-byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; 6]);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a device address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseDeviceIdError {
    #[error("invalid device address: expected 6 parts, got {0}")]
    InvalidLength(usize),
    #[error("invalid device address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid device address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(ParseDeviceIdError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, (part, byte)) in parts.iter().zip(bytes.iter_mut()).enumerate() {
            if part.len() != 2 {
                return Err(ParseDeviceIdError::InvalidPartLength(i));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ParseDeviceIdError::InvalidHex((*part).to_string()))?;
        }

        Ok(DeviceId(bytes))
    }
}

impl From<[u8; 6]> for DeviceId {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for DeviceId {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<DeviceId> for bluer::Address {
    fn from(id: DeviceId) -> Self {
        bluer::Address(id.0)
    }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Advertised name, if any. Use [`Device::display_name`] for rendering.
    pub name: Option<String>,
}

impl Device {
    pub fn new(id: DeviceId, name: Option<String>) -> Self {
        Self { id, name }
    }

    /// Advertised name, or [`PLACEHOLDER_NAME`] when the peripheral has none.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(PLACEHOLDER_NAME)
    }
}

/// Discovered devices in first-seen order, unique by [`DeviceId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    devices: Vec<Device>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `device` unless its id has been seen already.
    ///
    /// Returns `true` if the list changed. A later sighting never replaces
    /// the first one, even if it carries a name the first one lacked.
    pub fn insert(&mut self, device: Device) -> bool {
        if self.contains(&device.id) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.iter().any(|d| d.id == *id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == *id)
    }

    /// First device whose display name equals `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.display_name() == name)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

impl FromIterator<Device> for DeviceList {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut list = DeviceList::new();
        for device in iter {
            list.insert(device);
        }
        list
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}
