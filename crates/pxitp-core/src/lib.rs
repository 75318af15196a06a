//! PixArt touchpad firmware updater.
//!
//! Parses FWHD firmware containers and writes them to the controller's
//! SPI-NOR flash through HID feature reports.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Register map, report ids, feature report encoding
//! - **Transport**: HID feature report abstraction (hidraw, mock)
//! - **Register**: Single, user and burst register access
//! - **Firmware**: FWHD container parsing, serialization and building
//! - **Flash**: Erase/program state machine over the register layer
//! - **Device**: Mode switching, version and device-side CRC
//! - **Session**: Detach, write, verify, attach and cleanup
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pxitp_core::TracingObserver;
//! use pxitp_core::session::{SessionConfig, run};
//!
//! let config = SessionConfig {
//!     device_path: "/dev/hidraw3".into(),
//!     firmware_path: "pxi_tp.bin".into(),
//!     ..Default::default()
//! };
//!
//! run(&config, Arc::new(TracingObserver)).expect("update failed");
//! ```

pub mod device;
pub mod events;
pub mod firmware;
pub mod flash;
pub mod poll;
pub mod protocol;
pub mod register;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use device::{DeviceConfig, DeviceFlags, ResetMode, TouchDevice};
pub use events::{LogLevel, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
pub use firmware::{FirmwareContainer, FirmwareError, FirmwareFormat, ParseFlags};
pub use flash::{FlashEngine, FlashError};
pub use register::{RegisterAccess, RegisterError, Registers};
pub use session::{SessionConfig, UpdateError, UpdatePlan, UpdateSession};
pub use transport::{HidTransport, HidrawTransport, MockTransport, TransportError};
