//! Runtime driver and command-line front end for `watering-reminder`.
//!
//! This module is decoupled from process exit codes and from any particular
//! Bluetooth stack so the whole loop can be tested with an injected transport.
//! It owns the only `tokio::select!` loop: adapter events, recovery timers
//! and the command-line "user" all feed the connection manager from here, one
//! at a time.

use crate::device::DeviceId;
use crate::failure::Failure;
use crate::manager::{Action, ConnectionManager, ConnectionState, ManagerConfig, Snapshot};
use crate::output::{OutputFormat, SnapshotFormatter};
use crate::transport::{Command, Transport, TransportError, TransportLink};
use clap::Parser;
use std::io;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Connect to the sensor with this address as soon as it is discovered.
    /// Format: --device DE:AD:BE:EF:00:00
    #[arg(long, value_name = "ADDR")]
    pub device: Option<DeviceId>,

    /// Connect to the first discovered device with this name.
    #[arg(long, conflicts_with = "device")]
    pub name: Option<String>,

    /// Wait this long before rescanning after a failed connection.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub retry_delay: Duration,

    /// Recover from every failure automatically instead of just reporting it
    #[arg(long)]
    pub auto_recover: bool,

    /// Output format for state updates
    #[arg(long, default_value_t, value_enum)]
    pub format: OutputFormat,

    /// Verbose output, log state transitions and ignored events
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            retry_delay: self.retry_delay,
        }
    }
}

/// Errors returned by the run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parse a duration such as `3s`, `1m`, `500ms` or `2h`.
///
/// A bare number is interpreted as seconds.
///
/// # Examples
/// ```
/// use watering_reminder::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (digits, unit) = match src.find(|c: char| !c.is_ascii_digit()) {
        Some(index) => src.split_at(index),
        None => (src, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    let seconds = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {src}"))
    };

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(3600),
        other => Err(format!("unknown duration unit '{other}' in {src}")),
    }
}

/// Stands in for a user: picks the configured sensor and optionally presses
/// "recover" whenever a new failure shows up.
#[derive(Debug)]
struct Autopilot {
    device: Option<DeviceId>,
    name: Option<String>,
    auto_recover: bool,
    handled: Option<Failure>,
}

impl Autopilot {
    fn new(options: &Options) -> Self {
        Self {
            device: options.device,
            name: options.name.clone(),
            auto_recover: options.auto_recover,
            handled: None,
        }
    }

    fn wanted(&self, snapshot: &Snapshot) -> Option<DeviceId> {
        if let Some(id) = self.device {
            return snapshot.devices.contains(&id).then_some(id);
        }
        let name = self.name.as_deref()?;
        snapshot.devices.find_by_name(name).map(|d| d.id)
    }

    fn apply(&mut self, manager: &mut ConnectionManager) {
        let snapshot = manager.snapshot();

        if self.auto_recover {
            match &snapshot.failure {
                Some(failure) if self.handled.as_ref() != Some(failure) => {
                    debug!(%failure, "recovering automatically");
                    self.handled = Some(failure.clone());
                    manager.recover();
                    return;
                }
                Some(_) => {}
                None => self.handled = None,
            }
        }

        if snapshot.state == ConnectionState::Scanning
            && let Some(id) = self.wanted(&snapshot)
        {
            manager.select_device(id);
        }
    }
}

/// Execute queued manager actions: adapter commands go to the transport,
/// recovery delays become timers that report back on `timers`.
fn dispatch(
    manager: &mut ConnectionManager,
    commands: &mpsc::UnboundedSender<Command>,
    timers: &mpsc::UnboundedSender<u64>,
) -> Result<(), TransportError> {
    for action in manager.drain_actions() {
        match action {
            Action::Transport(command) => {
                debug!(?command, "sending command");
                commands.send(command).map_err(|_| TransportError::Closed)?;
            }
            Action::ScheduleRecovery { delay, token } => {
                let timers = timers.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = timers.send(token);
                });
            }
        }
    }
    Ok(())
}

fn write_snapshot(
    formatter: &dyn SnapshotFormatter,
    snapshot: &Snapshot,
    out: &mut dyn Write,
) -> io::Result<()> {
    let line = formatter.format(snapshot);
    writeln!(out, "{line}")
}

/// Run the connection manager against `transport` until the transport closes,
/// writing one formatted line to `out` per published state change.
pub async fn run_with_io(
    options: Options,
    transport: &dyn Transport,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    let formatter = options.format.formatter();
    let mut manager = ConnectionManager::new(options.manager_config());
    let mut autopilot = Autopilot::new(&options);
    let mut updates = manager.subscribe();

    let TransportLink {
        mut events,
        commands,
    } = transport.open().await?;
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<u64>();

    write_snapshot(formatter.as_ref(), &manager.snapshot(), out)?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    debug!(?event, "transport event");
                    manager.handle_event(event);
                }
                None => break,
            },
            Some(token) = timer_rx.recv() => manager.recovery_elapsed(token),
        }

        autopilot.apply(&mut manager);
        dispatch(&mut manager, &commands, &timer_tx)?;

        if matches!(updates.has_changed(), Ok(true)) {
            let snapshot = updates.borrow_and_update().clone();
            write_snapshot(formatter.as_ref(), &snapshot, out)?;
        }
    }

    Ok(())
}
