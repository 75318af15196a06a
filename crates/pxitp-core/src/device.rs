//! Touch controller driver: mode switching, version, device-side CRC.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::flash::{FlashEngine, FlashError};
use crate::poll::{Poll, poll_until, sleep_ms};
use crate::protocol::constants::*;
use crate::register::{RegisterAccess, RegisterError, Registers};
use crate::session::UpdatePlan;
use crate::transport::HidTransport;

/// Per-device tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// SRAM bank selector used when staging pages.
    pub sram_select: u8,
    /// User bank holding the firmware version.
    pub version_bank: u8,
    /// User register of the version low byte; the high byte follows it.
    pub version_addr: u8,
    /// Sleep between polls.
    pub poll_interval_ms: u64,
    /// Sleep between the two reset keys.
    pub reset_delay_ms: u64,
    /// Sleep before powering the CPU clock in bootloader mode.
    pub clock_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sram_select: DEFAULT_SRAM_SELECT,
            version_bank: DEFAULT_VERSION_BANK,
            version_addr: DEFAULT_VERSION_ADDR,
            poll_interval_ms: 1,
            reset_delay_ms: 30,
            clock_delay_ms: 10,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuirkError {
    #[error("Unsupported quirk key: {0}")]
    UnsupportedKey(String),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl DeviceConfig {
    /// Apply one quirk entry. Values are decimal or `0x`-prefixed hex and
    /// must fit in a byte.
    pub fn set_quirk_kv(&mut self, key: &str, value: &str) -> Result<(), QuirkError> {
        let slot = match key {
            "PixartTpSramSelect" => &mut self.sram_select,
            "PixartTpVersionBank" => &mut self.version_bank,
            "PixartTpVersionAddr" => &mut self.version_addr,
            _ => return Err(QuirkError::UnsupportedKey(key.to_string())),
        };
        *slot = parse_byte(value).ok_or_else(|| QuirkError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_byte(value: &str) -> Option<u8> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => value.parse::<u64>().ok()?,
    };
    u8::try_from(parsed).ok()
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// Running from ROM/bootloader.
        const IS_BOOTLOADER = 1 << 0;
        /// Last written image passed the device CRC check.
        const VERIFIED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Application,
    Bootloader,
}

/// Which image the device CRC engine checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcKind {
    Firmware,
    Parameter,
}

impl std::fmt::Display for CrcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrcKind::Firmware => write!(f, "firmware"),
            CrcKind::Parameter => write!(f, "parameter"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error("Device {kind} CRC still busy after {attempts} polls")]
    CrcTimeout { kind: CrcKind, attempts: u32 },
}

/// A PixArt touchpad reached through a HID transport.
pub struct TouchDevice<T: HidTransport> {
    regs: Registers<T>,
    config: DeviceConfig,
    flags: DeviceFlags,
    version: Option<String>,
}

impl<T: HidTransport> TouchDevice<T> {
    pub fn new(transport: T, config: DeviceConfig) -> Self {
        Self {
            regs: Registers::new(transport),
            config,
            flags: DeviceFlags::empty(),
            version: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn registers(&self) -> &Registers<T> {
        &self.regs
    }

    /// Firmware version read by the last `setup`.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_bootloader(&self) -> bool {
        self.flags.contains(DeviceFlags::IS_BOOTLOADER)
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.flags.set(DeviceFlags::VERIFIED, verified);
    }

    /// Read boot status and firmware version.
    #[instrument(level = "info", skip(self), fields(device = %self.regs.transport().name()))]
    pub fn setup(&mut self) -> Result<(), DeviceError> {
        let status = self.regs.user_read(USER_BANK0, REG_BOOT_STATUS)?;
        self.flags
            .set(DeviceFlags::IS_BOOTLOADER, status == BOOT_STATUS_ROM);

        let bank = self.config.version_bank;
        let addr = self.config.version_addr;
        let lo = self.regs.user_read(bank, addr)?;
        let hi = self.regs.user_read(bank, addr.wrapping_add(1))?;
        let version = format!("0x{:04x}", u16::from_le_bytes([lo, hi]));
        info!(
            version = %version,
            bootloader = self.is_bootloader(),
            "Device setup"
        );
        self.version = Some(version);
        Ok(())
    }

    /// Reset into application or bootloader mode.
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&mut self, mode: ResetMode) -> Result<(), DeviceError> {
        self.regs
            .write(SYS_BANK_RESET, REG_RESET_KEY1, RESET_KEY1_SUSPEND)?;
        sleep_ms(self.config.reset_delay_ms);
        match mode {
            ResetMode::Application => {
                self.regs
                    .write(SYS_BANK_RESET, REG_RESET_KEY2, RESET_KEY2_REGULAR)?;
                self.flags.remove(DeviceFlags::IS_BOOTLOADER);
            }
            ResetMode::Bootloader => {
                self.regs
                    .write(SYS_BANK_RESET, REG_RESET_KEY2, RESET_KEY2_BOOTLOADER)?;
                sleep_ms(self.config.clock_delay_ms);
                self.regs
                    .write(SYS_BANK_CLOCK, REG_CLOCKS_POWER_UP, CLOCKS_POWER_UP_CPU)?;
                self.flags.insert(DeviceFlags::IS_BOOTLOADER);
            }
        }
        Ok(())
    }

    /// Flash engine bound to this device's registers.
    pub fn flash(&self) -> FlashEngine<'_, Registers<T>> {
        FlashEngine::new(
            &self.regs,
            self.config.sram_select,
            self.config.poll_interval(),
        )
    }

    pub fn read_part_id(&self) -> Result<u16, DeviceError> {
        let lo = self.regs.user_read(USER_BANK0, REG_PART_ID0)?;
        let hi = self.regs.user_read(USER_BANK0, REG_PART_ID1)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// CRC control value for `kind`; parts with swappable banks use the
    /// bank-1 values when the swap flag is set.
    fn crc_ctrl(&self, kind: CrcKind) -> Result<u8, DeviceError> {
        let part_id = self.read_part_id()?;
        let bank1 = part_id == PART_ID_PJP274
            && self.regs.read(SYS_BANK_FLASH, REG_SWAP_FLAG)? != 0;
        debug!(part_id = %format!("0x{part_id:04x}"), bank1, "CRC bank");
        Ok(match (kind, bank1) {
            (CrcKind::Firmware, false) => CRC_CTRL_FW_BANK0,
            (CrcKind::Firmware, true) => CRC_CTRL_FW_BANK1,
            (CrcKind::Parameter, false) => CRC_CTRL_PARAM_BANK0,
            (CrcKind::Parameter, true) => CRC_CTRL_PARAM_BANK1,
        })
    }

    /// Have the device checksum an image and return the result.
    #[instrument(level = "debug", skip(self))]
    pub fn read_crc(&self, kind: CrcKind) -> Result<u32, DeviceError> {
        let ctrl = self.crc_ctrl(kind)?;
        self.regs.user_write(USER_BANK0, REG_CRC_CTRL, ctrl)?;

        let regs = &self.regs;
        let poll = poll_until(CRC_POLL_ATTEMPTS, self.config.poll_interval(), || {
            Ok::<_, RegisterError>(
                regs.user_read(USER_BANK0, REG_CRC_CTRL)? & CRC_CTRL_BUSY == 0,
            )
        })?;
        if let Poll::Exhausted { attempts } = poll {
            return Err(DeviceError::CrcTimeout { kind, attempts });
        }

        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = regs.user_read(USER_BANK0, REG_CRC_RESULT0 + i as u8)?;
        }
        let crc = u32::from_le_bytes(bytes);
        debug!(kind = %kind, crc = %format!("0x{crc:08x}"), "Device CRC");
        Ok(crc)
    }

    /// Enter bootloader mode and invalidate the image by erasing only the
    /// first sector of every planned section. The rest of each region is
    /// erased sector by sector while it is written.
    #[instrument(level = "info", skip(self, plan))]
    pub fn detach(&mut self, plan: &UpdatePlan<'_>) -> Result<(), DeviceError> {
        if self.is_bootloader() {
            debug!("Already in bootloader mode");
        } else {
            self.reset(ResetMode::Bootloader)?;
        }
        let mut flash = self.flash();
        for section in plan.sections() {
            flash.erase_sector(section.start_sector())?;
        }
        Ok(())
    }

    /// Return to application mode.
    #[instrument(level = "info", skip(self))]
    pub fn attach(&mut self) -> Result<(), DeviceError> {
        if !self.is_bootloader() {
            debug!("Already in runtime mode");
            return Ok(());
        }
        self.reset(ResetMode::Application)
    }

    /// Erase `sector` from bootloader mode so a bad image cannot boot.
    pub fn invalidate(&mut self, sector: u32) -> Result<(), DeviceError> {
        self.reset(ResetMode::Bootloader)?;
        self.flash().erase_sector(sector)?;
        Ok(())
    }

    /// Leave bootloader mode and re-enumerate. Never fails; problems are
    /// logged.
    #[instrument(level = "info", skip(self))]
    pub fn cleanup(&mut self) {
        if self.is_bootloader() {
            if let Err(e) = self.reset(ResetMode::Application) {
                warn!(error = %e, "Failed to leave bootloader mode");
            }
        }
        if let Err(e) = self.regs.transport().rebind() {
            warn!(error = %e, "Rebind failed");
            return;
        }
        if let Err(e) = self.setup() {
            warn!(error = %e, "Setup after rebind failed");
        }
    }
}
