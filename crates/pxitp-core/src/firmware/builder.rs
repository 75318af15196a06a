//! Assemble FWHD containers from raw payloads.

use super::container::FirmwareContainer;
use super::section::{SECTION_RECORD_LEN, Section, UpdateInfo, UpdateType, encode_name};
use super::{
    FirmwareError, FirmwareFormat, HEADER_LEN, MAGIC, MAX_SECTIONS, ParseFlags,
    SECTION_TABLE_OFFSET, crc32,
};

/// Builds a container with correct CRCs.
///
/// Internal sections are appended to the payload in call order and recorded
/// with absolute file offsets.
#[derive(Debug, Clone)]
pub struct FirmwareBuilder {
    header_version: u16,
    file_version: u16,
    ic_part_id: u16,
    flash_sector_count: u16,
    sections: Vec<Section>,
    payload: Vec<u8>,
}

impl Default for FirmwareBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareBuilder {
    pub fn new() -> Self {
        Self {
            header_version: 0x0001,
            file_version: 0,
            ic_part_id: 0,
            flash_sector_count: 0,
            sections: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn header_version(mut self, v: u16) -> Self {
        self.header_version = v;
        self
    }

    pub fn file_version(mut self, v: u16) -> Self {
        self.file_version = v;
        self
    }

    pub fn ic_part_id(mut self, v: u16) -> Self {
        self.ic_part_id = v;
        self
    }

    pub fn flash_sector_count(mut self, v: u16) -> Self {
        self.flash_sector_count = v;
        self
    }

    /// Append `data` to the payload and describe it as a valid internal section.
    pub fn internal_section(self, update_type: UpdateType, target: u32, data: &[u8]) -> Self {
        let start = (HEADER_LEN + self.payload.len()) as u32;
        self.raw_section(
            update_type,
            UpdateInfo::VALID,
            target,
            start,
            data.len() as u32,
            "",
        )
        .payload(data)
    }

    /// Valid section whose bytes live in a separate file.
    pub fn external_section(self, update_type: UpdateType, target: u32, name: &str) -> Self {
        self.raw_section(
            update_type,
            UpdateInfo::VALID | UpdateInfo::EXTERNAL,
            target,
            0,
            0,
            name,
        )
    }

    /// Record a section exactly as given; no payload is added.
    pub fn raw_section(
        mut self,
        update_type: UpdateType,
        update_info: UpdateInfo,
        target: u32,
        start: u32,
        length: u32,
        name: &str,
    ) -> Self {
        self.sections.push(Section {
            index: self.sections.len(),
            update_type,
            update_info,
            target_flash_start: target,
            internal_file_start: start,
            section_length: length,
            external_file_name: encode_name(name),
            resolved_offset: None,
        });
        self
    }

    /// Append bytes to the payload region.
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Encode without validating. Sections past the eighth are counted in
    /// the header but their records are dropped.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + self.payload.len()];
        out[..4].copy_from_slice(MAGIC);
        put_u16(&mut out, 0x04, HEADER_LEN as u16);
        put_u16(&mut out, 0x06, self.header_version);
        put_u16(&mut out, 0x08, self.file_version);
        put_u16(&mut out, 0x0A, self.ic_part_id);
        put_u16(&mut out, 0x0C, self.flash_sector_count);
        put_u16(&mut out, 0x12, self.sections.len() as u16);

        for section in self.sections.iter().take(MAX_SECTIONS) {
            let start = SECTION_TABLE_OFFSET + section.index * SECTION_RECORD_LEN;
            out[start..start + SECTION_RECORD_LEN].copy_from_slice(&section.to_bytes());
        }

        out[HEADER_LEN..].copy_from_slice(&self.payload);
        let file_crc = crc32(&self.payload);
        out[0x0E..0x12].copy_from_slice(&file_crc.to_le_bytes());

        let header_crc = crc32(&out[..HEADER_LEN - 4]);
        out[HEADER_LEN - 4..HEADER_LEN].copy_from_slice(&header_crc.to_le_bytes());
        out
    }

    /// Encode and parse back, so the result is known to be well formed.
    pub fn build(&self) -> Result<FirmwareContainer, FirmwareError> {
        FirmwareContainer::parse(&self.to_bytes(), ParseFlags::empty())
    }
}

fn put_u16(out: &mut [u8], offset: usize, v: u16) {
    out[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}
