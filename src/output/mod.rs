//! Renderers for published connection snapshots.
//!
//! The binary stands in for a presentation layer: every time the manager
//! publishes a new [`Snapshot`] it is rendered to one output line.

pub mod json;
pub mod text;

use crate::manager::Snapshot;
use std::fmt;

/// Trait for turning a snapshot into a single output line.
pub trait SnapshotFormatter: Send + Sync {
    fn format(&self, snapshot: &Snapshot) -> String;
}

/// Output format selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable status lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl OutputFormat {
    pub fn formatter(self) -> Box<dyn SnapshotFormatter> {
        match self {
            OutputFormat::Text => Box::new(text::TextFormatter),
            OutputFormat::Json => Box::new(json::JsonFormatter),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}
