//! Register access over HID feature reports.
//!
//! Each single/user register operation is one outbound 4-byte report; reads
//! are followed by one inbound report whose fourth byte carries the value.
//! Nothing is retried here: the first failure is returned to the caller.

use std::fmt;

use thiserror::Error;
use tracing::trace;

use crate::protocol::constants::{
    BURST_PAYLOAD_LEN, BURST_REPORT_LEN, REPORT_ID_BURST, SINGLE_REPORT_LEN,
};
use crate::protocol::{RegisterReport, RegisterSpace, ReportError, burst_report};
use crate::transport::{HidTransport, TransportError};

/// Which register primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    Write,
    Read,
    UserWrite,
    UserRead,
    BurstWrite,
    BurstRead,
}

impl fmt::Display for RegisterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterOp::Write => write!(f, "write"),
            RegisterOp::Read => write!(f, "read"),
            RegisterOp::UserWrite => write!(f, "user write"),
            RegisterOp::UserRead => write!(f, "user read"),
            RegisterOp::BurstWrite => write!(f, "burst write"),
            RegisterOp::BurstRead => write!(f, "burst read"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegisterFault {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Error, Debug)]
#[error("{operation} register failed (bank 0x{bank:02x}, addr 0x{addr:02x}): {cause}")]
pub struct RegisterError {
    pub bank: u8,
    pub addr: u8,
    pub operation: RegisterOp,
    #[source]
    pub cause: RegisterFault,
}

impl RegisterError {
    fn new(operation: RegisterOp, bank: u8, addr: u8, cause: impl Into<RegisterFault>) -> Self {
        Self {
            bank,
            addr,
            operation,
            cause: cause.into(),
        }
    }
}

/// Register read/write primitives used by the flash engine and device logic.
pub trait RegisterAccess {
    fn write(&self, bank: u8, addr: u8, value: u8) -> Result<(), RegisterError>;
    fn read(&self, bank: u8, addr: u8) -> Result<u8, RegisterError>;
    fn user_write(&self, bank: u8, addr: u8, value: u8) -> Result<(), RegisterError>;
    fn user_read(&self, bank: u8, addr: u8) -> Result<u8, RegisterError>;
    /// Send up to 256 bytes in one burst report.
    fn burst_write(&self, data: &[u8]) -> Result<(), RegisterError>;
    /// Fetch one burst report into `buf`; returns the bytes copied (≤ 256).
    fn burst_read(&self, buf: &mut [u8]) -> Result<usize, RegisterError>;
}

/// `RegisterAccess` over a HID transport.
pub struct Registers<T: HidTransport> {
    transport: T,
}

impl<T: HidTransport> Registers<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn send(&self, space: RegisterSpace, bank: u8, addr: u8, value: u8) -> Result<(), RegisterError> {
        let op = match space {
            RegisterSpace::System => RegisterOp::Write,
            RegisterSpace::User => RegisterOp::UserWrite,
        };
        let report = RegisterReport::write(space, bank, addr, value);
        trace!(op = %op, bank, addr, value, "Register write");
        self.transport
            .set_feature(&report.to_bytes())
            .map_err(|e| RegisterError::new(op, bank, addr, e))
    }

    fn fetch(&self, space: RegisterSpace, bank: u8, addr: u8) -> Result<u8, RegisterError> {
        let op = match space {
            RegisterSpace::System => RegisterOp::Read,
            RegisterSpace::User => RegisterOp::UserRead,
        };
        let request = RegisterReport::read(space, bank, addr);
        self.transport
            .set_feature(&request.to_bytes())
            .map_err(|e| RegisterError::new(op, bank, addr, e))?;

        let mut resp = [0u8; SINGLE_REPORT_LEN];
        resp[0] = space.report_id();
        let n = self
            .transport
            .get_feature(&mut resp)
            .map_err(|e| RegisterError::new(op, bank, addr, e))?;
        if n < SINGLE_REPORT_LEN {
            return Err(RegisterError::new(
                op,
                bank,
                addr,
                ReportError::TooShort {
                    expected: SINGLE_REPORT_LEN,
                    actual: n,
                },
            ));
        }
        trace!(op = %op, bank, addr, value = resp[3], "Register read");
        Ok(resp[3])
    }
}

impl<T: HidTransport> RegisterAccess for Registers<T> {
    fn write(&self, bank: u8, addr: u8, value: u8) -> Result<(), RegisterError> {
        self.send(RegisterSpace::System, bank, addr, value)
    }

    fn read(&self, bank: u8, addr: u8) -> Result<u8, RegisterError> {
        self.fetch(RegisterSpace::System, bank, addr)
    }

    fn user_write(&self, bank: u8, addr: u8, value: u8) -> Result<(), RegisterError> {
        self.send(RegisterSpace::User, bank, addr, value)
    }

    fn user_read(&self, bank: u8, addr: u8) -> Result<u8, RegisterError> {
        self.fetch(RegisterSpace::User, bank, addr)
    }

    fn burst_write(&self, data: &[u8]) -> Result<(), RegisterError> {
        let report =
            burst_report(data).map_err(|e| RegisterError::new(RegisterOp::BurstWrite, 0, 0, e))?;
        self.transport
            .set_feature(&report)
            .map_err(|e| RegisterError::new(RegisterOp::BurstWrite, 0, 0, e))
    }

    fn burst_read(&self, buf: &mut [u8]) -> Result<usize, RegisterError> {
        let mut report = [0u8; BURST_REPORT_LEN];
        report[0] = REPORT_ID_BURST;
        let n = self
            .transport
            .get_feature(&mut report)
            .map_err(|e| RegisterError::new(RegisterOp::BurstRead, 0, 0, e))?;
        let available = n.saturating_sub(1).min(BURST_PAYLOAD_LEN);
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&report[1..1 + count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_write_then_read_system_register() {
        let regs = Registers::new(MockTransport::new());
        regs.write(0x06, 0x72, 0xaa).unwrap();
        assert_eq!(regs.read(0x06, 0x72).unwrap(), 0xaa);
    }

    #[test]
    fn test_user_space_is_separate() {
        let mock = MockTransport::new();
        let regs = Registers::new(mock.clone());
        regs.user_write(0x00, 0x0b, 0x34).unwrap();
        assert_eq!(regs.user_read(0x00, 0x0b).unwrap(), 0x34);
        assert_eq!(regs.read(0x00, 0x0b).unwrap(), 0x00);
        assert_eq!(mock.device().user.get(&(0x00, 0x0b)), Some(&0x34));
    }

    #[test]
    fn test_burst_write_lands_in_sram() {
        let mock = MockTransport::new();
        let regs = Registers::new(mock.clone());
        let payload: Vec<u8> = (0..=255u8).collect();
        regs.burst_write(&payload).unwrap();
        assert_eq!(&mock.device().sram[..], &payload[..]);

        let mut back = [0u8; 256];
        assert_eq!(regs.burst_read(&mut back).unwrap(), 256);
        assert_eq!(&back[..], &payload[..]);
    }

    #[test]
    fn test_burst_write_rejects_oversize_without_io() {
        let mock = MockTransport::new();
        let regs = Registers::new(mock.clone());
        let err = regs.burst_write(&[0u8; 257]).unwrap_err();
        assert_eq!(err.operation, RegisterOp::BurstWrite);
        assert!(matches!(
            err.cause,
            RegisterFault::Report(ReportError::PayloadTooLarge { len: 257, .. })
        ));
        assert_eq!(mock.device().sets, 0);
    }

    #[test]
    fn test_transport_failure_carries_context() {
        let mock = MockTransport::new();
        mock.device().fail_after_sets = Some(0);
        let regs = Registers::new(mock);
        let err = regs.write(0x04, 0x56, 0x01).unwrap_err();
        assert_eq!(err.bank, 0x04);
        assert_eq!(err.addr, 0x56);
        assert_eq!(err.operation, RegisterOp::Write);
        assert!(err.to_string().contains("bank 0x04"));
    }

    #[test]
    fn test_read_failure_after_request() {
        let mock = MockTransport::new();
        mock.device().fail_after_sets = Some(0);
        let regs = Registers::new(mock);
        let err = regs.user_read(0x00, 0x82).unwrap_err();
        assert_eq!(err.operation, RegisterOp::UserRead);
    }
}
