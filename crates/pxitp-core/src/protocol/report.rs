//! Feature report framing for the register channel.
//!
//! Single and user register accesses travel in 4-byte reports
//! `[report_id, addr, bank | read_flag, value]`; burst transfers use a
//! 257-byte report carrying the report id followed by up to 256 payload bytes.

use thiserror::Error;

use super::constants::{
    BURST_PAYLOAD_LEN, BURST_REPORT_LEN, OP_READ, REPORT_ID_BURST, REPORT_ID_SINGLE,
    REPORT_ID_USER, SINGLE_REPORT_LEN,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("Report too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Burst payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Unknown report id 0x{0:02X}")]
    UnknownReportId(u8),
}

/// Register address space selected by the report id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSpace {
    System,
    User,
}

impl RegisterSpace {
    pub fn report_id(self) -> u8 {
        match self {
            RegisterSpace::System => REPORT_ID_SINGLE,
            RegisterSpace::User => REPORT_ID_USER,
        }
    }

    pub fn from_report_id(id: u8) -> Result<Self, ReportError> {
        match id {
            REPORT_ID_SINGLE => Ok(RegisterSpace::System),
            REPORT_ID_USER => Ok(RegisterSpace::User),
            other => Err(ReportError::UnknownReportId(other)),
        }
    }
}

/// One 4-byte register report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterReport {
    pub space: RegisterSpace,
    pub bank: u8,
    pub addr: u8,
    pub value: u8,
    pub read: bool,
}

impl RegisterReport {
    pub fn write(space: RegisterSpace, bank: u8, addr: u8, value: u8) -> Self {
        Self {
            space,
            bank,
            addr,
            value,
            read: false,
        }
    }

    pub fn read(space: RegisterSpace, bank: u8, addr: u8) -> Self {
        Self {
            space,
            bank,
            addr,
            value: 0,
            read: true,
        }
    }

    pub fn to_bytes(&self) -> [u8; SINGLE_REPORT_LEN] {
        let bank = if self.read { self.bank | OP_READ } else { self.bank };
        [self.space.report_id(), self.addr, bank, self.value]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ReportError> {
        if data.len() < SINGLE_REPORT_LEN {
            return Err(ReportError::TooShort {
                expected: SINGLE_REPORT_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            space: RegisterSpace::from_report_id(data[0])?,
            addr: data[1],
            bank: data[2] & !OP_READ,
            value: data[3],
            read: data[2] & OP_READ != 0,
        })
    }
}

/// Build a burst report; short payloads are zero-filled.
pub fn burst_report(payload: &[u8]) -> Result<[u8; BURST_REPORT_LEN], ReportError> {
    if payload.len() > BURST_PAYLOAD_LEN {
        return Err(ReportError::PayloadTooLarge {
            len: payload.len(),
            max: BURST_PAYLOAD_LEN,
        });
    }
    let mut report = [0u8; BURST_REPORT_LEN];
    report[0] = REPORT_ID_BURST;
    report[1..1 + payload.len()].copy_from_slice(payload);
    Ok(report)
}
