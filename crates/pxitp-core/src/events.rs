//! Event system for UI decoupling.
//!
//! Allows the CLI (or a host daemon) to follow an update without tight
//! coupling to the core logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Update phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Nothing started yet.
    Idle,
    /// Switching into bootloader mode and invalidating the old image.
    Detach,
    /// Erasing and programming flash.
    Write,
    /// Comparing device-computed CRCs.
    Verify,
    /// Switching back to runtime mode.
    Attach,
    /// Leaving bootloader and re-enumerating.
    Cleanup,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "Idle"),
            UpdatePhase::Detach => write!(f, "Detach"),
            UpdatePhase::Write => write!(f, "Write"),
            UpdatePhase::Verify => write!(f, "Verify"),
            UpdatePhase::Attach => write!(f, "Attach"),
            UpdatePhase::Cleanup => write!(f, "Cleanup"),
            UpdatePhase::Complete => write!(f, "Complete"),
            UpdatePhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// A section is about to be written.
    SectionStarted {
        index: usize,
        target: u32,
        length: u32,
    },
    /// Write progress in percent of all selected section bytes.
    Progress { phase: UpdatePhase, percent: u8 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Feature report sent/received.
    Report {
        direction: ReportDirection,
        report_id: u8,
        length: usize,
    },
    /// Error occurred.
    Error { message: String },
    /// Update finished and verified.
    Complete,
}

/// Feature report direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDirection {
    Set, // Host -> Device
    Get, // Device -> Host
}

impl fmt::Display for ReportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportDirection::Set => write!(f, "SET"),
            ReportDirection::Get => write!(f, "GET"),
        }
    }
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::SectionStarted {
                index,
                target,
                length,
            } => {
                tracing::info!(
                    section = index,
                    target = %format!("0x{:08X}", target),
                    length,
                    "Writing section"
                );
            }
            UpdateEvent::Progress { phase, percent } => {
                tracing::debug!(phase = %phase, progress = %format!("{}%", percent), "Progress");
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Report {
                direction,
                report_id,
                length,
            } => {
                tracing::trace!(
                    dir = %direction,
                    id = %format!("0x{:02X}", report_id),
                    len = length,
                    "Feature report"
                );
            }
            UpdateEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            UpdateEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}

/// Observer that records every event; handy in tests and for post-mortems.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<UpdateEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// All progress percentages reported, in order.
    pub fn progress(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UpdateEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl UpdateObserver for RecordingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
