//! Moisture reading and the watering status derived from it.

use std::fmt;

/// Lowest moisture percentage that still counts as [`MoistureStatus::Optimal`].
pub const OPTIMAL_MIN: i64 = 44;
/// Highest moisture percentage that still counts as [`MoistureStatus::Optimal`].
pub const OPTIMAL_MAX: i64 = 60;

/// A single decoded notification from the sensor.
///
/// The percentage is expected to be within 0-100 but is kept exactly as the
/// sensor sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub moisture_percent: i64,
}

impl SensorReading {
    pub fn new(moisture_percent: i64) -> Self {
        Self { moisture_percent }
    }

    pub fn status(&self) -> MoistureStatus {
        MoistureStatus::from_percent(self.moisture_percent)
    }
}

/// Watering advice for a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoistureStatus {
    Underwatered,
    Optimal,
    Overwatered,
}

impl MoistureStatus {
    pub fn from_percent(value: i64) -> Self {
        if value < OPTIMAL_MIN {
            MoistureStatus::Underwatered
        } else if value <= OPTIMAL_MAX {
            MoistureStatus::Optimal
        } else {
            MoistureStatus::Overwatered
        }
    }

    /// Message shown to the user for this status.
    pub fn advice(&self) -> &'static str {
        match self {
            MoistureStatus::Underwatered => "The plant is underwatered! Please water it soon.",
            MoistureStatus::Optimal => "This is the best condition for your plant! Keep it up.",
            MoistureStatus::Overwatered => {
                "The plant is overwatered! Reduce watering to avoid root rot."
            }
        }
    }
}

impl fmt::Display for MoistureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoistureStatus::Underwatered => write!(f, "underwatered"),
            MoistureStatus::Optimal => write!(f, "optimal"),
            MoistureStatus::Overwatered => write!(f, "overwatered"),
        }
    }
}
