//! HID transport layer abstraction.
//!
//! Defines the `HidTransport` trait for feature-report I/O,
//! allowing different implementations (hidraw, mock, etc.).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Set feature failed: {0}")]
    SetFeatureFailed(String),

    #[error("Get feature failed: {0}")]
    GetFeatureFailed(String),

    #[error("Rebind failed: {0}")]
    RebindFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract HID feature-report interface.
///
/// This trait enables:
/// - Production implementation over Linux hidraw
/// - Mock implementation for unit testing
/// - Wrappers that observe traffic
pub trait HidTransport: Send + Sync {
    /// Send one feature report. The first byte is the report id.
    fn set_feature(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Fetch one feature report into `buf`.
    ///
    /// `buf[0]` must hold the requested report id on entry. Returns the
    /// number of bytes the device filled in.
    fn get_feature(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Force the host to re-enumerate the device so a fresh handle with
    /// current descriptors is obtained.
    fn rebind(&self) -> Result<(), TransportError>;

    /// Human-readable transport name for logs.
    fn name(&self) -> String;
}

impl<T: HidTransport + ?Sized> HidTransport for Box<T> {
    fn set_feature(&self, data: &[u8]) -> Result<(), TransportError> {
        (**self).set_feature(data)
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).get_feature(buf)
    }

    fn rebind(&self) -> Result<(), TransportError> {
        (**self).rebind()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
