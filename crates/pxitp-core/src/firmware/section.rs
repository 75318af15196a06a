//! Section table records.

use std::fmt;
use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use super::FirmwareError;
use crate::protocol::constants::SECTOR_SIZE;

/// On-disk size of one section record.
pub const SECTION_RECORD_LEN: usize = 64;
/// Length of the external file name field.
pub const EXTNAME_LEN: usize = 50;

const S_O_TYPE: usize = 0x00;
const S_O_INFO: usize = 0x01;
const S_O_EXTNAME: usize = 0x0E;

/// What a section updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Standard flash update.
    General,
    FwSection,
    Bootloader,
    Param,
    /// Secondary controller update driven through a pass-through channel.
    TfForce,
    Unknown(u8),
}

impl From<u8> for UpdateType {
    fn from(v: u8) -> Self {
        match v {
            0 => UpdateType::General,
            1 => UpdateType::FwSection,
            2 => UpdateType::Bootloader,
            3 => UpdateType::Param,
            16 => UpdateType::TfForce,
            other => UpdateType::Unknown(other),
        }
    }
}

impl From<UpdateType> for u8 {
    fn from(t: UpdateType) -> Self {
        match t {
            UpdateType::General => 0,
            UpdateType::FwSection => 1,
            UpdateType::Bootloader => 2,
            UpdateType::Param => 3,
            UpdateType::TfForce => 16,
            UpdateType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::General => write!(f, "general"),
            UpdateType::FwSection => write!(f, "fw-section"),
            UpdateType::Bootloader => write!(f, "bootloader"),
            UpdateType::Param => write!(f, "param"),
            UpdateType::TfForce => write!(f, "tf-force"),
            UpdateType::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

bitflags! {
    /// Update information bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateInfo: u8 {
        /// Execute this section.
        const VALID = 1 << 0;
        /// Payload lives in an external file.
        const EXTERNAL = 1 << 1;
    }
}

/// One entry of the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Position in the section table.
    pub index: usize,
    pub update_type: UpdateType,
    pub update_info: UpdateInfo,
    /// Absolute device flash address.
    pub target_flash_start: u32,
    /// Offset as stored in the file.
    pub internal_file_start: u32,
    pub section_length: u32,
    /// Raw name field, only meaningful for external sections.
    pub external_file_name: [u8; EXTNAME_LEN],
    /// Absolute file offset, set for valid internal sections only.
    pub resolved_offset: Option<usize>,
}

impl Section {
    pub fn is_valid_update(&self) -> bool {
        self.update_info.contains(UpdateInfo::VALID)
    }

    pub fn is_external(&self) -> bool {
        self.update_info.contains(UpdateInfo::EXTERNAL)
    }

    /// Valid, internal and non-empty.
    pub fn is_writable(&self) -> bool {
        self.is_valid_update() && !self.is_external() && self.section_length > 0
    }

    /// External file name up to the first NUL, trailing spaces removed.
    pub fn file_name(&self) -> String {
        let raw = &self.external_file_name;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end])
            .trim_end_matches(' ')
            .to_string()
    }

    /// First flash sector covered by this section.
    pub fn start_sector(&self) -> u32 {
        self.target_flash_start / SECTOR_SIZE as u32
    }

    /// Decode a 64-byte record. Offsets are not resolved here.
    pub(crate) fn parse(record: &[u8], index: usize) -> Result<Self, FirmwareError> {
        if record.len() < SECTION_RECORD_LEN {
            return Err(FirmwareError::TooShort {
                actual: record.len(),
                minimum: SECTION_RECORD_LEN,
            });
        }
        let update_type = UpdateType::from(record[S_O_TYPE]);
        if let UpdateType::Unknown(v) = update_type {
            warn!(section = index, update_type = v, "Unknown section update type");
        }
        let update_info = UpdateInfo::from_bits_retain(record[S_O_INFO]);
        let mut external_file_name = [0u8; EXTNAME_LEN];
        external_file_name.copy_from_slice(&record[S_O_EXTNAME..S_O_EXTNAME + EXTNAME_LEN]);

        let mut cursor = Cursor::new(&record[S_O_INFO + 1..S_O_EXTNAME]);
        let target_flash_start = cursor.read_u32::<LittleEndian>()?;
        let internal_file_start = cursor.read_u32::<LittleEndian>()?;
        let section_length = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            index,
            update_type,
            update_info,
            target_flash_start,
            internal_file_start,
            section_length,
            external_file_name,
            resolved_offset: None,
        })
    }

    /// Encode into a 64-byte record.
    pub(crate) fn to_bytes(&self) -> [u8; SECTION_RECORD_LEN] {
        let mut record = [0u8; SECTION_RECORD_LEN];
        record[S_O_TYPE] = self.update_type.into();
        record[S_O_INFO] = self.update_info.bits();

        let mut fields = Vec::with_capacity(12);
        // Writes into a Vec cannot fail.
        let _ = fields.write_u32::<LittleEndian>(self.target_flash_start);
        let _ = fields.write_u32::<LittleEndian>(self.internal_file_start);
        let _ = fields.write_u32::<LittleEndian>(self.section_length);
        record[S_O_INFO + 1..S_O_EXTNAME].copy_from_slice(&fields);

        record[S_O_EXTNAME..S_O_EXTNAME + EXTNAME_LEN].copy_from_slice(&self.external_file_name);
        record
    }
}

/// Zero-padded name field; longer names are cut.
pub(crate) fn encode_name(name: &str) -> [u8; EXTNAME_LEN] {
    let mut field = [0u8; EXTNAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(EXTNAME_LEN);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// Resolve where a section's bytes live in the file.
///
/// The stored start is tried first as an absolute file offset, then as an
/// offset relative to the end of the header. Returns `None` when neither
/// interpretation keeps `[offset, offset + length)` inside the file.
pub fn resolve_offset(
    internal_file_start: u32,
    section_length: u32,
    header_length: usize,
    file_size: usize,
) -> Option<usize> {
    let fits = |offset: u64| {
        offset
            .checked_add(section_length as u64)
            .is_some_and(|end| end <= file_size as u64)
    };

    let absolute = internal_file_start as u64;
    if fits(absolute) {
        return Some(absolute as usize);
    }
    let relative = header_length as u64 + internal_file_start as u64;
    if fits(relative) {
        return Some(relative as usize);
    }
    None
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:<10} valid={} external={} target=0x{:08X} start=0x{:08X} len={}",
            self.index,
            self.update_type.to_string(),
            self.is_valid_update(),
            self.is_external(),
            self.target_flash_start,
            self.internal_file_start,
            self.section_length,
        )?;
        if let Some(offset) = self.resolved_offset {
            write!(f, " offset=0x{offset:X}")?;
        }
        if self.is_external() {
            write!(f, " file={:?}", self.file_name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(update_type: u8, info: u8, target: u32, start: u32, len: u32, name: &[u8]) -> Vec<u8> {
        let mut r = vec![0u8; SECTION_RECORD_LEN];
        r[0] = update_type;
        r[1] = info;
        r[2..6].copy_from_slice(&target.to_le_bytes());
        r[6..10].copy_from_slice(&start.to_le_bytes());
        r[10..14].copy_from_slice(&len.to_le_bytes());
        r[14..14 + name.len()].copy_from_slice(name);
        r
    }

    #[test]
    fn test_parse_record_fields() {
        let r = record(0, 0x01, 0x0000_2000, 0x218, 4096, b"");
        let s = Section::parse(&r, 3).unwrap();
        assert_eq!(s.index, 3);
        assert_eq!(s.update_type, UpdateType::General);
        assert!(s.is_valid_update());
        assert!(!s.is_external());
        assert_eq!(s.target_flash_start, 0x2000);
        assert_eq!(s.internal_file_start, 0x218);
        assert_eq!(s.section_length, 4096);
        assert_eq!(s.start_sector(), 2);
        assert!(s.is_writable());
    }

    #[test]
    fn test_external_name_is_trimmed() {
        let r = record(16, 0x03, 0, 0, 0, b"tf_fw.bin   \0garbage");
        let s = Section::parse(&r, 0).unwrap();
        assert_eq!(s.update_type, UpdateType::TfForce);
        assert!(s.is_external());
        assert_eq!(s.file_name(), "tf_fw.bin");
        assert!(!s.is_writable());
    }

    #[test]
    fn test_unknown_type_and_extra_bits_are_kept() {
        let r = record(7, 0x81, 0, 0, 16, b"");
        let s = Section::parse(&r, 0).unwrap();
        assert_eq!(s.update_type, UpdateType::Unknown(7));
        assert_eq!(s.update_info.bits(), 0x81);
        assert!(s.is_valid_update());
    }

    #[test]
    fn test_record_encode_matches_decode() {
        let r = record(3, 0x01, 0x1234_5000, 0x400, 300, b"param");
        let s = Section::parse(&r, 0).unwrap();
        assert_eq!(s.to_bytes().to_vec(), r);
    }

    #[test]
    fn test_name_field_is_kept_verbatim() {
        let r = record(16, 0x03, 0, 0, 0, b"tf.bin  \0\x7f junk");
        let s = Section::parse(&r, 0).unwrap();
        assert_eq!(s.file_name(), "tf.bin");
        assert_eq!(s.to_bytes().to_vec(), r);
    }

    #[test]
    fn test_encode_name_pads_and_cuts() {
        let field = encode_name("tf.bin");
        assert_eq!(&field[..6], b"tf.bin");
        assert!(field[6..].iter().all(|&b| b == 0));
        let long = "x".repeat(EXTNAME_LEN + 10);
        assert_eq!(encode_name(&long), [b'x'; EXTNAME_LEN]);
    }

    #[test]
    fn test_resolve_prefers_absolute() {
        assert_eq!(resolve_offset(0x218, 0x100, 0x218, 0x318), Some(0x218));
        // Absolute wins even when it points below the end of the header.
        assert_eq!(resolve_offset(0x100, 0x100, 0x218, 0x418), Some(0x100));
        assert_eq!(resolve_offset(0x0, 0x100, 0x218, 0x318), Some(0x0));
    }

    #[test]
    fn test_resolve_fails_when_neither_fits() {
        assert_eq!(resolve_offset(0x218, 0x200, 0x218, 0x318), None);
        assert_eq!(resolve_offset(0x100, 0x400, 0x218, 0x400), None);
    }

    #[test]
    fn test_resolve_rejects_overflow() {
        assert_eq!(resolve_offset(u32::MAX, u32::MAX, 0x218, 0x1000), None);
    }
}
