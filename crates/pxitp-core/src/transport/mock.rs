//! Mock HID transport for testing.
//!
//! Decodes register feature reports and simulates the parts of the touch
//! controller the driver talks to: the system/user register files, the flash
//! command engine, the SRAM staging buffer, SPI-NOR contents, the reset keys
//! and the CRC engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{HidTransport, TransportError};
use crate::protocol::constants::*;
use crate::protocol::{RegisterReport, RegisterSpace};

/// Default simulated flash size (64 sectors).
pub const MOCK_FLASH_SIZE: usize = 64 * SECTOR_SIZE;

/// Simulated controller state.
#[derive(Debug)]
pub struct MockDevice {
    /// System registers keyed by (bank, addr).
    pub system: HashMap<(u8, u8), u8>,
    /// User registers keyed by (bank, addr).
    pub user: HashMap<(u8, u8), u8>,
    /// SPI-NOR contents.
    pub flash: Vec<u8>,
    /// SRAM staging buffer.
    pub sram: [u8; PAGE_SIZE],
    /// Sector indices erased, in order.
    pub erased_sectors: Vec<u32>,
    /// Flash addresses programmed, in order.
    pub programmed_pages: Vec<u32>,
    /// Number of read-status flash commands executed.
    pub status_polls: u32,
    /// Remaining read-status commands that report busy.
    pub busy_polls: u32,
    /// Busy bit never clears.
    pub busy_forever: bool,
    /// Write-enable latch never sets.
    pub write_enable_broken: bool,
    /// Execute register never returns to zero.
    pub execute_stuck: bool,
    /// CRC engine never clears its busy bit.
    pub crc_busy_forever: bool,
    /// Values the CRC engine reports.
    pub firmware_crc: u32,
    pub parameter_crc: u32,
    /// CRC control values written, in order.
    pub crc_requests: Vec<u8>,
    /// Second reset key values accepted, in order.
    pub resets: Vec<u8>,
    /// Number of rebind requests.
    pub rebinds: u32,
    /// Make `rebind` fail.
    pub rebind_fails: bool,
    /// Fail every `set_feature` once this many have succeeded.
    pub fail_after_sets: Option<usize>,
    /// Successful `set_feature` calls.
    pub sets: usize,
    /// Burst payloads received.
    pub bursts: Vec<Vec<u8>>,
    write_enabled: bool,
    reset_armed: bool,
    pending_read: Option<RegisterReport>,
}

impl MockDevice {
    fn new() -> Self {
        let mut user = HashMap::new();
        user.insert((USER_BANK0, REG_PART_ID0), (PART_ID_PJP239 & 0xff) as u8);
        user.insert((USER_BANK0, REG_PART_ID1), (PART_ID_PJP239 >> 8) as u8);
        Self {
            system: HashMap::new(),
            user,
            flash: vec![ERASED_BYTE; MOCK_FLASH_SIZE],
            sram: [0u8; PAGE_SIZE],
            erased_sectors: Vec::new(),
            programmed_pages: Vec::new(),
            status_polls: 0,
            busy_polls: 0,
            busy_forever: false,
            write_enable_broken: false,
            execute_stuck: false,
            crc_busy_forever: false,
            firmware_crc: 0,
            parameter_crc: 0,
            crc_requests: Vec::new(),
            resets: Vec::new(),
            rebinds: 0,
            rebind_fails: false,
            fail_after_sets: None,
            sets: 0,
            bursts: Vec::new(),
            write_enabled: false,
            reset_armed: false,
            pending_read: None,
        }
    }

    fn sys(&self, bank: u8, addr: u8) -> u8 {
        self.system.get(&(bank, addr)).copied().unwrap_or(0)
    }

    fn sys_u32(&self, bank: u8, first: u8) -> u32 {
        (0..4).fold(0u32, |acc, i| acc | (self.sys(bank, first + i) as u32) << (8 * i))
    }

    fn system_write(&mut self, bank: u8, addr: u8, value: u8) {
        self.system.insert((bank, addr), value);
        match (bank, addr) {
            (SYS_BANK_RESET, REG_RESET_KEY1) => self.reset_armed = value == RESET_KEY1_SUSPEND,
            (SYS_BANK_RESET, REG_RESET_KEY2) if self.reset_armed => {
                self.reset_armed = false;
                self.resets.push(value);
                let status = if value == RESET_KEY2_BOOTLOADER {
                    BOOT_STATUS_ROM
                } else {
                    0x00
                };
                self.user.insert((USER_BANK0, REG_BOOT_STATUS), status);
            }
            (SYS_BANK_FLASH, REG_FLASH_EXECUTE) if value == FLASH_EXECUTE_START => {
                self.execute_flash_command();
                let done = if self.execute_stuck {
                    FLASH_EXECUTE_START
                } else {
                    FLASH_EXECUTE_DONE
                };
                self.system.insert((SYS_BANK_FLASH, REG_FLASH_EXECUTE), done);
            }
            _ => {}
        }
    }

    fn execute_flash_command(&mut self) {
        let inst = self.sys(SYS_BANK_FLASH, REG_FLASH_INST_CMD);
        let ccr = self.sys_u32(SYS_BANK_FLASH, REG_FLASH_CCR0);
        let address = self.sys_u32(SYS_BANK_FLASH, REG_FLASH_ADDR0) as usize;
        match ccr {
            CCR_WRITE_ENABLE => self.write_enabled = !self.write_enable_broken,
            CCR_READ_STATUS => {
                self.status_polls += 1;
                let busy = if self.busy_forever {
                    true
                } else if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    true
                } else {
                    false
                };
                let mut status = 0;
                if busy {
                    status |= FLASH_STATUS_BUSY;
                }
                if self.write_enabled {
                    status |= FLASH_STATUS_WRITE_ENABLED;
                }
                self.system.insert((SYS_BANK_FLASH, REG_FLASH_STATUS), status);
            }
            CCR_ERASE_SECTOR if self.write_enabled => {
                let start = address - address % SECTOR_SIZE;
                if let Some(sector) = self.flash.get_mut(start..start + SECTOR_SIZE) {
                    sector.fill(ERASED_BYTE);
                }
                self.erased_sectors.push((start / SECTOR_SIZE) as u32);
                self.write_enabled = false;
            }
            CCR_PROGRAM_PAGE
                if self.write_enabled && inst & FLASH_INST_INTERNAL_SRAM_ACCESS != 0 =>
            {
                if let Some(page) = self.flash.get_mut(address..address + PAGE_SIZE) {
                    // NOR programming can only clear bits.
                    for (cell, byte) in page.iter_mut().zip(self.sram.iter()) {
                        *cell &= *byte;
                    }
                }
                self.programmed_pages.push(address as u32);
                self.write_enabled = false;
            }
            _ => {}
        }
    }

    fn user_write(&mut self, bank: u8, addr: u8, value: u8) {
        if (bank, addr) == (USER_BANK0, REG_CRC_CTRL) {
            self.crc_requests.push(value);
            let result = if value & (CRC_CTRL_FW_BANK0 | CRC_CTRL_FW_BANK1) != 0 {
                self.firmware_crc
            } else {
                self.parameter_crc
            };
            for (i, byte) in result.to_le_bytes().iter().enumerate() {
                self.user.insert((USER_BANK0, REG_CRC_RESULT0 + i as u8), *byte);
            }
            let ctrl = if self.crc_busy_forever {
                value | CRC_CTRL_BUSY
            } else {
                value & !CRC_CTRL_BUSY
            };
            self.user.insert((bank, addr), ctrl);
            return;
        }
        self.user.insert((bank, addr), value);
    }

    /// Flash contents of one sector.
    pub fn sector(&self, index: usize) -> &[u8] {
        &self.flash[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    /// Set the part id reported in user bank 0.
    pub fn set_part_id(&mut self, part_id: u16) {
        self.user.insert((USER_BANK0, REG_PART_ID0), (part_id & 0xff) as u8);
        self.user.insert((USER_BANK0, REG_PART_ID1), (part_id >> 8) as u8);
    }
}

/// Mock transport sharing one simulated device between clones.
#[derive(Clone)]
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice::new())),
        }
    }

    /// Inspect or tweak the simulated device.
    pub fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }

    /// Preload a user register.
    pub fn set_user(&self, bank: u8, addr: u8, value: u8) {
        self.device().user.insert((bank, addr), value);
    }

    /// Preload a system register.
    pub fn set_system(&self, bank: u8, addr: u8, value: u8) {
        self.device().system.insert((bank, addr), value);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HidTransport for MockTransport {
    fn set_feature(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut dev = self.device();
        if dev.fail_after_sets.is_some_and(|limit| dev.sets >= limit) {
            return Err(TransportError::SetFeatureFailed("injected failure".into()));
        }
        dev.sets += 1;

        if data.first() == Some(&REPORT_ID_BURST) {
            let payload = &data[1..];
            let n = payload.len().min(PAGE_SIZE);
            dev.sram[..n].copy_from_slice(&payload[..n]);
            dev.bursts.push(payload.to_vec());
            return Ok(());
        }

        let report = RegisterReport::from_bytes(data)
            .map_err(|e| TransportError::SetFeatureFailed(e.to_string()))?;
        if report.read {
            dev.pending_read = Some(report);
            return Ok(());
        }
        match report.space {
            RegisterSpace::System => dev.system_write(report.bank, report.addr, report.value),
            RegisterSpace::User => dev.user_write(report.bank, report.addr, report.value),
        }
        Ok(())
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut dev = self.device();
        let Some(&report_id) = buf.first() else {
            return Err(TransportError::GetFeatureFailed("empty buffer".into()));
        };

        if report_id == REPORT_ID_BURST {
            let n = (buf.len() - 1).min(PAGE_SIZE);
            buf[1..1 + n].copy_from_slice(&dev.sram[..n]);
            return Ok(n + 1);
        }

        let pending = dev
            .pending_read
            .take()
            .filter(|r| r.space.report_id() == report_id)
            .ok_or_else(|| TransportError::GetFeatureFailed("no read pending".into()))?;
        let value = match pending.space {
            RegisterSpace::System => dev.sys(pending.bank, pending.addr),
            RegisterSpace::User => dev
                .user
                .get(&(pending.bank, pending.addr))
                .copied()
                .unwrap_or(0),
        };
        let reply = [report_id, pending.addr, pending.bank, value];
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn rebind(&self) -> Result<(), TransportError> {
        let mut dev = self.device();
        dev.rebinds += 1;
        if dev.rebind_fails {
            return Err(TransportError::RebindFailed("injected failure".into()));
        }
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_register_roundtrip() {
        let mock = MockTransport::new();
        mock.set_feature(&[REPORT_ID_SINGLE, 0x72, 0x06, 0xaa]).unwrap();
        mock.set_feature(&[REPORT_ID_SINGLE, 0x72, 0x06 | OP_READ, 0x00])
            .unwrap();

        let mut buf = [REPORT_ID_SINGLE, 0, 0, 0];
        assert_eq!(mock.get_feature(&mut buf).unwrap(), 4);
        assert_eq!(buf[3], 0xaa);
    }

    #[test]
    fn test_mock_read_without_request_fails() {
        let mock = MockTransport::new();
        let mut buf = [REPORT_ID_USER, 0, 0, 0];
        assert!(mock.get_feature(&mut buf).is_err());
    }

    #[test]
    fn test_mock_reset_keys_update_boot_status() {
        let mock = MockTransport::new();
        mock.set_feature(&[REPORT_ID_SINGLE, REG_RESET_KEY1, SYS_BANK_RESET, 0xaa])
            .unwrap();
        mock.set_feature(&[REPORT_ID_SINGLE, REG_RESET_KEY2, SYS_BANK_RESET, 0xcc])
            .unwrap();
        assert_eq!(mock.device().resets, vec![0xcc]);
        assert_eq!(
            mock.device().user.get(&(USER_BANK0, REG_BOOT_STATUS)),
            Some(&BOOT_STATUS_ROM)
        );

        // Key 2 without key 1 is ignored.
        mock.set_feature(&[REPORT_ID_SINGLE, REG_RESET_KEY2, SYS_BANK_RESET, 0xbb])
            .unwrap();
        assert_eq!(mock.device().resets, vec![0xcc]);
    }

    #[test]
    fn test_mock_injected_failure() {
        let mock = MockTransport::new();
        mock.device().fail_after_sets = Some(1);
        assert!(mock.set_feature(&[REPORT_ID_SINGLE, 0, 0, 0]).is_ok());
        assert!(mock.set_feature(&[REPORT_ID_SINGLE, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_mock_rebind_counter() {
        let mock = MockTransport::new();
        mock.rebind().unwrap();
        mock.device().rebind_fails = true;
        assert!(mock.rebind().is_err());
        assert_eq!(mock.device().rebinds, 2);
    }
}
