//! Flash engine state tracking.

use std::fmt;

use crate::protocol::constants::{DEFAULT_SRAM_SELECT, PAGE_SIZE, SECTOR_SIZE};

/// Phase of the flash engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashPhase {
    #[default]
    Idle,
    /// Polling the SPI-NOR busy bit.
    WaitBusy,
    /// Setting the write-enable latch.
    WriteEnable,
    /// Sector erase in flight.
    Erasing,
    /// Loading one page into the SRAM staging buffer.
    SramStaging,
    /// Committing the staged page to flash.
    Programming,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Idle => write!(f, "IDLE"),
            FlashPhase::WaitBusy => write!(f, "WAIT_BUSY"),
            FlashPhase::WriteEnable => write!(f, "WRITE_ENABLE"),
            FlashPhase::Erasing => write!(f, "ERASING"),
            FlashPhase::SramStaging => write!(f, "SRAM_STAGING"),
            FlashPhase::Programming => write!(f, "PROGRAMMING"),
        }
    }
}

/// Runtime state of one flash engine.
#[derive(Debug, Clone)]
pub struct FlashState {
    pub phase: FlashPhase,
    /// SRAM bank selector written before each staging burst.
    pub sram_select: u8,
    /// Sector of the current operation.
    pub sector: u32,
    /// Page within `sector`.
    pub page: u32,
    /// Data bytes committed by the current region write.
    pub written: usize,
}

impl Default for FlashState {
    fn default() -> Self {
        Self::new(DEFAULT_SRAM_SELECT)
    }
}

impl FlashState {
    pub fn new(sram_select: u8) -> Self {
        Self {
            phase: FlashPhase::Idle,
            sram_select,
            sector: 0,
            page: 0,
            written: 0,
        }
    }

    /// Transition to a new phase.
    pub fn goto_phase(&mut self, phase: FlashPhase) {
        if self.phase != phase {
            tracing::trace!(from = %self.phase, to = %phase, "Flash phase");
        }
        self.phase = phase;
    }

    /// Point the cursor at a page.
    pub fn seek(&mut self, sector: u32, page: u32) {
        self.sector = sector;
        self.page = page;
    }

    /// Flash address under the cursor.
    pub fn address(&self) -> u64 {
        self.sector as u64 * SECTOR_SIZE as u64 + self.page as u64 * PAGE_SIZE as u64
    }

    pub fn is_idle(&self) -> bool {
        self.phase == FlashPhase::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_address() {
        let mut state = FlashState::default();
        assert_eq!(state.sram_select, 0x0f);
        state.seek(2, 15);
        assert_eq!(state.address(), 2 * 4096 + 15 * 256);
    }

    #[test]
    fn test_phase_transition() {
        let mut state = FlashState::new(0x0e);
        assert!(state.is_idle());
        state.goto_phase(FlashPhase::Erasing);
        assert_eq!(state.phase, FlashPhase::Erasing);
        assert_eq!(state.phase.to_string(), "ERASING");
    }
}
