//! SPI-NOR programming through the controller's flash command engine.
//!
//! Every command is staged in system bank 4 (instruction, CCR, data count,
//! address) and started by writing the execute register. Page data goes
//! through a 256-byte SRAM staging buffer filled by one burst report.

pub mod state;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::poll::{Poll, poll_until};
use crate::protocol::constants::*;
use crate::register::{RegisterAccess, RegisterError};

pub use state::{FlashPhase, FlashState};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(
        "Flash execute failure (inst 0x{inst:02x}, ccr 0x{ccr:08x}, address 0x{address:08x}) after {attempts} polls"
    )]
    ExecuteFailure {
        inst: u8,
        ccr: u32,
        address: u64,
        attempts: u32,
    },
    #[error("Flash write enable failure at 0x{address:08x} after {attempts} polls")]
    WriteEnableFailure { address: u64, attempts: u32 },
    #[error("Flash wait busy failure at 0x{address:08x} after {attempts} polls")]
    WaitBusyFailure { address: u64, attempts: u32 },
    #[error("Region of {total_size} bytes but only {len} bytes of data")]
    DataTooShort { len: usize, total_size: usize },
    #[error("Flash address out of range (sector {sector}, page {page})")]
    AddressOutOfRange { sector: u32, page: u32 },
}

/// Drives erase/program sequences over a register interface.
pub struct FlashEngine<'a, R: RegisterAccess> {
    regs: &'a R,
    state: FlashState,
    interval: Duration,
}

impl<'a, R: RegisterAccess> FlashEngine<'a, R> {
    pub fn new(regs: &'a R, sram_select: u8, interval: Duration) -> Self {
        Self {
            regs,
            state: FlashState::new(sram_select),
            interval,
        }
    }

    pub fn state(&self) -> &FlashState {
        &self.state
    }

    /// Load and start one flash command, then wait for the engine to finish.
    pub fn flash_execute(&mut self, inst: u8, ccr: u32, data_count: u16) -> Result<(), FlashError> {
        let regs = self.regs;
        regs.write(SYS_BANK_FLASH, REG_FLASH_INST_CMD, inst)?;
        self.write_le(REG_FLASH_CCR0, &ccr.to_le_bytes())?;
        self.write_le(REG_FLASH_DATA_CNT0, &data_count.to_le_bytes())?;
        regs.write(SYS_BANK_FLASH, REG_FLASH_EXECUTE, FLASH_EXECUTE_START)?;

        let poll = poll_until(EXECUTE_POLL_ATTEMPTS, self.interval, || {
            Ok::<_, RegisterError>(
                regs.read(SYS_BANK_FLASH, REG_FLASH_EXECUTE)? == FLASH_EXECUTE_DONE,
            )
        })?;
        match poll {
            Poll::Ready { .. } => Ok(()),
            Poll::Exhausted { attempts } => Err(FlashError::ExecuteFailure {
                inst,
                ccr,
                address: self.state.address(),
                attempts,
            }),
        }
    }

    /// Set the write-enable latch and confirm it through the status register.
    pub fn flash_write_enable(&mut self) -> Result<(), FlashError> {
        self.state.goto_phase(FlashPhase::WriteEnable);
        self.flash_execute(FLASH_INST_NONE, CCR_WRITE_ENABLE, 0)?;

        let poll = self.poll_status(WRITE_ENABLE_POLL_ATTEMPTS, |status| {
            status & FLASH_STATUS_WRITE_ENABLED != 0
        })?;
        match poll {
            Poll::Ready { .. } => Ok(()),
            Poll::Exhausted { attempts } => Err(FlashError::WriteEnableFailure {
                address: self.state.address(),
                attempts,
            }),
        }
    }

    /// Wait until the SPI-NOR busy bit clears.
    pub fn flash_wait_busy(&mut self) -> Result<(), FlashError> {
        self.state.goto_phase(FlashPhase::WaitBusy);
        let poll = self.poll_status(WAIT_BUSY_POLL_ATTEMPTS, |status| {
            status & FLASH_STATUS_BUSY == 0
        })?;
        match poll {
            Poll::Ready { attempts } => {
                if attempts > 1 {
                    debug!(attempts, "Flash busy cleared");
                }
                Ok(())
            }
            Poll::Exhausted { attempts } => Err(FlashError::WaitBusyFailure {
                address: self.state.address(),
                attempts,
            }),
        }
    }

    /// Erase one 4096-byte sector.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        self.state.seek(sector, 0);
        let address = self.cursor_address()?;
        debug!(sector, address = format_args!("0x{address:08x}"), "Erase sector");

        self.flash_wait_busy()?;
        self.flash_write_enable()?;
        self.state.goto_phase(FlashPhase::Erasing);
        self.write_le(REG_FLASH_ADDR0, &address.to_le_bytes())?;
        self.flash_execute(FLASH_INST_NONE, CCR_ERASE_SECTOR, 0)?;
        self.state.goto_phase(FlashPhase::Idle);
        Ok(())
    }

    /// Commit the staged SRAM page to `sector`/`page`.
    pub fn program_256b(&mut self, sector: u32, page: u32) -> Result<(), FlashError> {
        self.state.seek(sector, page);
        let address = self.cursor_address()?;

        self.flash_wait_busy()?;
        self.flash_write_enable()?;
        self.state.goto_phase(FlashPhase::Programming);
        self.write_le(REG_FLASH_ADDR0, &address.to_le_bytes())?;
        self.flash_execute(
            FLASH_INST_INTERNAL_SRAM_ACCESS | FLASH_INST_PROGRAM,
            CCR_PROGRAM_PAGE,
            PAGE_SIZE as u16,
        )?;
        self.state.goto_phase(FlashPhase::Idle);
        Ok(())
    }

    /// Fill the SRAM staging buffer with one page.
    pub fn write_sram_256b(&mut self, data: &[u8; PAGE_SIZE]) -> Result<(), FlashError> {
        self.state.goto_phase(FlashPhase::SramStaging);
        let regs = self.regs;
        regs.write(SYS_BANK_SRAM, REG_SRAM_ADDR0, 0x00)?;
        regs.write(SYS_BANK_SRAM, REG_SRAM_ADDR1, 0x00)?;
        regs.write(SYS_BANK_SRAM, REG_SRAM_SELECT, self.state.sram_select)?;
        regs.write(SYS_BANK_SRAM, REG_SRAM_TRIGGER, SRAM_TRIGGER_BEGIN)?;
        regs.burst_write(data)?;
        regs.write(SYS_BANK_SRAM, REG_SRAM_TRIGGER, SRAM_TRIGGER_COMMIT)?;
        Ok(())
    }

    /// Erase and program `total_size` bytes of `data` starting at `start_sector`.
    pub fn update_flash_region(
        &mut self,
        total_size: usize,
        start_sector: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        self.update_flash_region_with(total_size, start_sector, data, |_| {})
    }

    /// Like [`update_flash_region`](Self::update_flash_region), calling
    /// `progress` with the data bytes committed so far after every page.
    ///
    /// All sectors are erased first. Each sector is then programmed pages
    /// 1..15 followed by page 0, so a sector only looks valid once complete.
    /// Bytes past `total_size` are programmed as 0xFF.
    #[instrument(level = "debug", skip(self, data, progress))]
    pub fn update_flash_region_with<F>(
        &mut self,
        total_size: usize,
        start_sector: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), FlashError>
    where
        F: FnMut(usize),
    {
        if data.len() < total_size {
            return Err(FlashError::DataTooShort {
                len: data.len(),
                total_size,
            });
        }
        let data = &data[..total_size];
        let sectors = total_size.div_ceil(SECTOR_SIZE) as u32;
        self.state.written = 0;

        info!(sectors, "Erasing flash region");
        for i in 0..sectors {
            self.erase_sector(self.sector_at(start_sector, i)?)?;
        }

        info!(sectors, "Programming flash region");
        let page_order = (1..PAGES_PER_SECTOR as u32).chain(std::iter::once(0));
        for i in 0..sectors {
            let sector = self.sector_at(start_sector, i)?;
            for page in page_order.clone() {
                let offset = i as usize * SECTOR_SIZE + page as usize * PAGE_SIZE;
                let (buf, used) = page_from(data, offset);
                self.write_sram_256b(&buf)?;
                self.program_256b(sector, page)?;
                self.state.written += used;
                progress(self.state.written);
            }
        }
        Ok(())
    }

    fn sector_at(&self, start_sector: u32, i: u32) -> Result<u32, FlashError> {
        start_sector
            .checked_add(i)
            .ok_or(FlashError::AddressOutOfRange {
                sector: start_sector,
                page: 0,
            })
    }

    fn cursor_address(&self) -> Result<u32, FlashError> {
        u32::try_from(self.state.address()).map_err(|_| FlashError::AddressOutOfRange {
            sector: self.state.sector,
            page: self.state.page,
        })
    }

    fn write_le(&self, first: u8, bytes: &[u8]) -> Result<(), RegisterError> {
        for (i, byte) in bytes.iter().enumerate() {
            self.regs.write(SYS_BANK_FLASH, first + i as u8, *byte)?;
        }
        Ok(())
    }

    /// Issue read-status commands until `done(status)` holds.
    fn poll_status<P>(&mut self, attempts: u32, done: P) -> Result<Poll, FlashError>
    where
        P: Fn(u8) -> bool,
    {
        let interval = self.interval;
        poll_until(attempts, interval, || {
            self.flash_execute(FLASH_INST_RD2REG_BANK, CCR_READ_STATUS, 1)?;
            let status = self.regs.read(SYS_BANK_FLASH, REG_FLASH_STATUS)?;
            Ok::<_, FlashError>(done(status))
        })
    }
}

/// One 256-byte page at `offset`, 0xFF past the end of `data`, plus the
/// number of data bytes it carries.
fn page_from(data: &[u8], offset: usize) -> ([u8; PAGE_SIZE], usize) {
    let mut buf = [ERASED_BYTE; PAGE_SIZE];
    let used = data.len().saturating_sub(offset).min(PAGE_SIZE);
    if used > 0 {
        buf[..used].copy_from_slice(&data[offset..offset + used]);
    }
    (buf, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Registers;
    use crate::transport::MockTransport;

    fn engine_fixture() -> (MockTransport, Registers<MockTransport>) {
        let mock = MockTransport::new();
        let regs = Registers::new(mock.clone());
        (mock, regs)
    }

    fn engine(regs: &Registers<MockTransport>) -> FlashEngine<'_, Registers<MockTransport>> {
        FlashEngine::new(regs, DEFAULT_SRAM_SELECT, Duration::ZERO)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn test_single_sector_page_order() {
        let (mock, regs) = engine_fixture();
        let data = pattern(SECTOR_SIZE);
        engine(&regs).update_flash_region(SECTOR_SIZE, 0, &data).unwrap();

        let dev = mock.device();
        assert_eq!(dev.erased_sectors, vec![0]);
        let mut expected: Vec<u32> = (1..16).map(|p| p * 256).collect();
        expected.push(0);
        assert_eq!(dev.programmed_pages, expected);
        assert_eq!(dev.sector(0), &data[..]);
    }

    #[test]
    fn test_all_sectors_erased_before_programming() {
        let (mock, regs) = engine_fixture();
        let data = pattern(5000);
        engine(&regs).update_flash_region(5000, 4, &data).unwrap();

        let dev = mock.device();
        assert_eq!(dev.erased_sectors, vec![4, 5]);
        assert_eq!(dev.programmed_pages.len(), 32);
        assert_eq!(dev.programmed_pages[15], 4 * 4096);
        assert_eq!(dev.programmed_pages[16], 5 * 4096 + 256);
        assert_eq!(dev.programmed_pages[31], 5 * 4096);
        assert_eq!(&dev.flash[4 * 4096..4 * 4096 + 5000], &data[..]);
    }

    #[test]
    fn test_partial_page_is_padded_with_erased_bytes() {
        let (mock, regs) = engine_fixture();
        let data = pattern(300);
        engine(&regs).update_flash_region(300, 3, &data).unwrap();

        let dev = mock.device();
        // Page 1 is staged first and carries bytes 256..300.
        let first = &dev.bursts[0];
        assert_eq!(first.len(), PAGE_SIZE);
        assert_eq!(&first[..44], &data[256..300]);
        assert!(first[44..].iter().all(|&b| b == 0xFF));
        // Pages past the data are all 0xFF.
        assert!(dev.bursts[1].iter().all(|&b| b == 0xFF));

        let sector = dev.sector(3);
        assert_eq!(&sector[..300], &data[..]);
        assert!(sector[300..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_progress_reaches_total() {
        let (_mock, regs) = engine_fixture();
        let data = pattern(5000);
        let mut seen = Vec::new();
        engine(&regs)
            .update_flash_region_with(5000, 0, &data, |n| seen.push(n))
            .unwrap();
        assert_eq!(seen.len(), 32);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 5000);
    }

    #[test]
    fn test_data_shorter_than_region() {
        let (mock, regs) = engine_fixture();
        let err = engine(&regs).update_flash_region(4096, 0, &[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            FlashError::DataTooShort {
                len: 100,
                total_size: 4096
            }
        ));
        assert_eq!(mock.device().sets, 0);
    }

    #[test]
    fn test_wait_busy_exhausts_budget() {
        let (mock, regs) = engine_fixture();
        mock.device().busy_forever = true;
        let err = engine(&regs).flash_wait_busy().unwrap_err();
        assert!(matches!(
            err,
            FlashError::WaitBusyFailure {
                attempts: 1000,
                ..
            }
        ));
        assert_eq!(mock.device().status_polls, 1000);
    }

    #[test]
    fn test_wait_busy_clears() {
        let (mock, regs) = engine_fixture();
        mock.device().busy_polls = 5;
        engine(&regs).flash_wait_busy().unwrap();
        assert_eq!(mock.device().status_polls, 6);
    }

    #[test]
    fn test_write_enable_failure_aborts_erase() {
        let (mock, regs) = engine_fixture();
        mock.device().write_enable_broken = true;
        let err = engine(&regs).erase_sector(2).unwrap_err();
        assert!(matches!(
            err,
            FlashError::WriteEnableFailure {
                address: 0x2000,
                attempts: 10
            }
        ));
        assert!(mock.device().erased_sectors.is_empty());
    }

    #[test]
    fn test_stuck_execute() {
        let (mock, regs) = engine_fixture();
        mock.device().execute_stuck = true;
        let err = engine(&regs).flash_execute(0, CCR_WRITE_ENABLE, 0).unwrap_err();
        assert!(matches!(
            err,
            FlashError::ExecuteFailure {
                attempts: 10,
                ccr: CCR_WRITE_ENABLE,
                ..
            }
        ));
    }

    #[test]
    fn test_register_failure_stops_region_write() {
        let (mock, regs) = engine_fixture();
        mock.device().fail_after_sets = Some(20);
        let data = pattern(4096);
        let err = engine(&regs).update_flash_region(4096, 0, &data).unwrap_err();
        assert!(matches!(err, FlashError::Register(_)));
        assert!(mock.device().programmed_pages.is_empty());
    }

    #[test]
    fn test_sram_staging_sequence() {
        let (mock, regs) = engine_fixture();
        let mut eng = FlashEngine::new(&regs, 0x0e, Duration::ZERO);
        eng.write_sram_256b(&[0x5a; PAGE_SIZE]).unwrap();

        let dev = mock.device();
        assert_eq!(dev.system.get(&(SYS_BANK_SRAM, REG_SRAM_SELECT)), Some(&0x0e));
        assert_eq!(
            dev.system.get(&(SYS_BANK_SRAM, REG_SRAM_TRIGGER)),
            Some(&SRAM_TRIGGER_COMMIT)
        );
        assert_eq!(dev.sram, [0x5a; PAGE_SIZE]);
    }
}
