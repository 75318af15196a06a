//! Parsed FWHD container.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, instrument};

use super::section::{SECTION_RECORD_LEN, Section, resolve_offset};
use super::{
    FirmwareError, FirmwareFormat, HEADER_LEN, MAGIC, MAX_SECTIONS, ParseFlags,
    SECTION_TABLE_OFFSET, crc32,
};

const O_HEADER_LENGTH: usize = 0x04;

/// Fixed scalar header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareHeader {
    pub header_length: u16,
    pub header_version: u16,
    pub file_version: u16,
    pub ic_part_id: u16,
    pub flash_sector_count: u16,
    /// CRC32 over the payload region.
    pub file_crc32: u32,
    pub num_sections: u16,
    /// CRC32 over the header minus this field.
    pub header_crc32: u32,
}

impl FirmwareHeader {
    /// Decode the scalar fields that precede the section table.
    /// `header_crc32` is left at zero; its position depends on `header_length`.
    fn read_scalars(data: &[u8]) -> Result<Self, FirmwareError> {
        let mut cursor = Cursor::new(&data[O_HEADER_LENGTH..SECTION_TABLE_OFFSET]);
        Ok(Self {
            header_length: cursor.read_u16::<LittleEndian>()?,
            header_version: cursor.read_u16::<LittleEndian>()?,
            file_version: cursor.read_u16::<LittleEndian>()?,
            ic_part_id: cursor.read_u16::<LittleEndian>()?,
            flash_sector_count: cursor.read_u16::<LittleEndian>()?,
            file_crc32: cursor.read_u32::<LittleEndian>()?,
            num_sections: cursor.read_u16::<LittleEndian>()?,
            header_crc32: 0,
        })
    }

    fn write_scalars(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(MAGIC);
        let mut fields = Vec::with_capacity(SECTION_TABLE_OFFSET - O_HEADER_LENGTH);
        // Writes into a Vec cannot fail.
        let _ = fields.write_u16::<LittleEndian>(self.header_length);
        let _ = fields.write_u16::<LittleEndian>(self.header_version);
        let _ = fields.write_u16::<LittleEndian>(self.file_version);
        let _ = fields.write_u16::<LittleEndian>(self.ic_part_id);
        let _ = fields.write_u16::<LittleEndian>(self.flash_sector_count);
        let _ = fields.write_u32::<LittleEndian>(self.file_crc32);
        let _ = fields.write_u16::<LittleEndian>(self.num_sections);
        out[O_HEADER_LENGTH..SECTION_TABLE_OFFSET].copy_from_slice(&fields);
    }
}

/// One parsed firmware file; immutable once built.
#[derive(Debug, Clone)]
pub struct FirmwareContainer {
    header: FirmwareHeader,
    sections: Vec<Section>,
    data: Vec<u8>,
}

impl FirmwareContainer {
    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The whole file as parsed.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total parsed size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// User-visible version, formatted like the device reports it.
    pub fn version(&self) -> String {
        format!("0x{:04x}", self.header.file_version)
    }

    /// Sections that will be flashed: valid, internal and non-empty.
    pub fn writable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.is_writable())
    }

    /// Payload bytes of a resolved internal section.
    pub fn section_bytes(&self, section: &Section) -> Option<&[u8]> {
        let start = section.resolved_offset?;
        self.data.get(start..start + section.section_length as usize)
    }

    fn header_len(&self) -> usize {
        self.header.header_length as usize
    }
}

impl FirmwareFormat for FirmwareContainer {
    fn validate(data: &[u8]) -> bool {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return false;
        }
        let header_length =
            u16::from_le_bytes([data[O_HEADER_LENGTH], data[O_HEADER_LENGTH + 1]]);
        header_length as usize == HEADER_LEN
    }

    #[instrument(level = "debug", skip(data), fields(len = data.len()))]
    fn parse(data: &[u8], flags: ParseFlags) -> Result<Self, FirmwareError> {
        if data.len() < HEADER_LEN {
            return Err(FirmwareError::TooShort {
                actual: data.len(),
                minimum: HEADER_LEN,
            });
        }
        if &data[..4] != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&data[..4]);
            return Err(FirmwareError::InvalidMagic { found });
        }

        let mut header = FirmwareHeader::read_scalars(data)?;
        let header_length = header.header_length as usize;
        if header_length != HEADER_LEN {
            return Err(FirmwareError::HeaderLength {
                found: header.header_length,
                expected: HEADER_LEN as u16,
            });
        }
        if header_length > data.len() {
            return Err(FirmwareError::HeaderOverrun {
                header_length,
                file_size: data.len(),
            });
        }

        let num_sections = header.num_sections as usize;
        if num_sections > MAX_SECTIONS {
            return Err(FirmwareError::TooManySections {
                count: num_sections,
                max: MAX_SECTIONS,
            });
        }

        let crc_offset = header_length - 4;
        header.header_crc32 =
            Cursor::new(&data[crc_offset..header_length]).read_u32::<LittleEndian>()?;

        if flags.contains(ParseFlags::IGNORE_CHECKSUM) {
            debug!("Checksum verification disabled");
        } else {
            let computed = crc32(&data[..crc_offset]);
            if computed != header.header_crc32 {
                return Err(FirmwareError::HeaderCrcMismatch {
                    computed,
                    expected: header.header_crc32,
                });
            }
            let computed = crc32(&data[header_length..]);
            if computed != header.file_crc32 {
                return Err(FirmwareError::PayloadCrcMismatch {
                    computed,
                    expected: header.file_crc32,
                });
            }
        }

        let table_end = SECTION_TABLE_OFFSET + num_sections * SECTION_RECORD_LEN;
        if table_end > header_length {
            return Err(FirmwareError::SectionTableOverrun {
                table_end,
                header_length,
            });
        }

        let mut sections = Vec::with_capacity(num_sections);
        for index in 0..num_sections {
            let start = SECTION_TABLE_OFFSET + index * SECTION_RECORD_LEN;
            let mut section = Section::parse(&data[start..start + SECTION_RECORD_LEN], index)?;
            if section.is_valid_update() && !section.is_external() {
                let offset = resolve_offset(
                    section.internal_file_start,
                    section.section_length,
                    header_length,
                    data.len(),
                )
                .ok_or(FirmwareError::SectionOutOfRange {
                    index,
                    start: section.internal_file_start,
                    length: section.section_length,
                })?;
                section.resolved_offset = Some(offset);
            }
            debug!(section = %section, "Parsed section");
            sections.push(section);
        }

        Ok(Self {
            header,
            sections,
            data: data.to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let header_length = self.header_len();
        let mut header = self.header;
        header.file_crc32 = crc32(&out[header_length..]);
        header.write_scalars(&mut out);

        for section in &self.sections {
            let start = SECTION_TABLE_OFFSET + section.index * SECTION_RECORD_LEN;
            out[start..start + SECTION_RECORD_LEN].copy_from_slice(&section.to_bytes());
        }

        let crc_offset = header_length - 4;
        let header_crc = crc32(&out[..crc_offset]);
        out[crc_offset..header_length].copy_from_slice(&header_crc.to_le_bytes());
        out
    }
}

impl fmt::Display for FirmwareContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "FWHD container ({} bytes):", self.size())?;
        writeln!(f, "  Header length:   0x{:04X}", h.header_length)?;
        writeln!(f, "  Header version:  0x{:04X}", h.header_version)?;
        writeln!(f, "  File version:    {}", self.version())?;
        writeln!(f, "  IC part id:      0x{:04X}", h.ic_part_id)?;
        writeln!(f, "  Flash sectors:   {}", h.flash_sector_count)?;
        writeln!(f, "  File CRC32:      0x{:08X}", h.file_crc32)?;
        writeln!(f, "  Header CRC32:    0x{:08X}", h.header_crc32)?;
        writeln!(f, "  Sections:        {}", h.num_sections)?;
        for section in &self.sections {
            writeln!(f, "    {section}")?;
        }
        Ok(())
    }
}
