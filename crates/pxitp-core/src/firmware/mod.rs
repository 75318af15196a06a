//! FWHD firmware container.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! 0x00  magic "FWHD"          4
//! 0x04  header_length         2   (0x0218)
//! 0x06  header_version        2
//! 0x08  file_version          2
//! 0x0A  ic_part_id            2
//! 0x0C  flash_sector_count    2
//! 0x0E  file_crc32            4   CRC32 over [header_length, end)
//! 0x12  num_sections          2   (<= 8)
//! 0x14  section table         num_sections * 64
//! hl-4  header_crc32          4   CRC32 over [0, header_length - 4)
//! ```

mod builder;
mod container;
mod section;

use bitflags::bitflags;
use thiserror::Error;

pub use builder::FirmwareBuilder;
pub use container::{FirmwareContainer, FirmwareHeader};
pub use section::{
    EXTNAME_LEN, SECTION_RECORD_LEN, Section, UpdateInfo, UpdateType, resolve_offset,
};

pub const MAGIC: &[u8; 4] = b"FWHD";
pub const HEADER_LEN: usize = 0x0218;
pub const MAX_SECTIONS: usize = 8;

/// Offset of the first section record.
pub const SECTION_TABLE_OFFSET: usize = 0x14;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Standard (IEEE) CRC32.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Container parse failures. Every variant means the file is invalid.
#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("File too small: {actual} bytes, minimum {minimum}")]
    TooShort { actual: usize, minimum: usize },
    #[error("Invalid magic: {found:02X?}")]
    InvalidMagic { found: [u8; 4] },
    #[error("Header length 0x{found:04X}, expected 0x{expected:04X}")]
    HeaderLength { found: u16, expected: u16 },
    #[error("Header of {header_length} bytes exceeds file of {file_size} bytes")]
    HeaderOverrun {
        header_length: usize,
        file_size: usize,
    },
    #[error("Too many sections: {count}, maximum {max}")]
    TooManySections { count: usize, max: usize },
    #[error("Header CRC mismatch: computed 0x{computed:08X}, expected 0x{expected:08X}")]
    HeaderCrcMismatch { computed: u32, expected: u32 },
    #[error("Payload CRC mismatch: computed 0x{computed:08X}, expected 0x{expected:08X}")]
    PayloadCrcMismatch { computed: u32, expected: u32 },
    #[error("Section table ends at 0x{table_end:X}, past header length 0x{header_length:X}")]
    SectionTableOverrun {
        table_end: usize,
        header_length: usize,
    },
    #[error("Section {index} (start 0x{start:X}, length {length}) is out of file range")]
    SectionOutOfRange {
        index: usize,
        start: u32,
        length: u32,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Parse options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseFlags: u32 {
        /// Skip header and payload CRC verification.
        const IGNORE_CHECKSUM = 1 << 0;
    }
}

/// A binary firmware format.
pub trait FirmwareFormat: Sized {
    /// Cheap applicability check; never reports details.
    fn validate(data: &[u8]) -> bool;

    /// Fully decode and verify `data`.
    fn parse(data: &[u8], flags: ParseFlags) -> Result<Self, FirmwareError>;

    /// Encode back into the on-disk format.
    fn serialize(&self) -> Vec<u8>;
}
