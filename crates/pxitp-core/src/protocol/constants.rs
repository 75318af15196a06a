// Feature report ids
pub const REPORT_ID_BURST: u8 = 0x41;
pub const REPORT_ID_SINGLE: u8 = 0x42;
pub const REPORT_ID_USER: u8 = 0x43;

/// OR'd into the bank byte to request a register read.
pub const OP_READ: u8 = 0x10;

pub const SINGLE_REPORT_LEN: usize = 4;
pub const BURST_PAYLOAD_LEN: usize = 256;
pub const BURST_REPORT_LEN: usize = BURST_PAYLOAD_LEN + 1;

// Flash geometry
pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;
pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;
pub const ERASED_BYTE: u8 = 0xFF;

// Polling budgets
pub const EXECUTE_POLL_ATTEMPTS: u32 = 10;
pub const WRITE_ENABLE_POLL_ATTEMPTS: u32 = 10;
pub const WAIT_BUSY_POLL_ATTEMPTS: u32 = 1000;
pub const CRC_POLL_ATTEMPTS: u32 = 1000;

// System register banks
pub const SYS_BANK_RESET: u8 = 0x01;
pub const SYS_BANK_CLOCK: u8 = 0x02;
pub const SYS_BANK_FLASH: u8 = 0x04;
pub const SYS_BANK_SRAM: u8 = 0x06;

// System bank 1 (reset control)
pub const REG_RESET_KEY1: u8 = 0x2c;
pub const REG_RESET_KEY2: u8 = 0x2d;
pub const RESET_KEY1_SUSPEND: u8 = 0xaa;
pub const RESET_KEY2_REGULAR: u8 = 0xbb;
pub const RESET_KEY2_BOOTLOADER: u8 = 0xcc;

// System bank 2 (clocks)
pub const REG_CLOCKS_POWER_UP: u8 = 0x0d;
pub const CLOCKS_POWER_UP_CPU: u8 = 1 << 1;

// System bank 4 (flash engine)
pub const REG_FLASH_STATUS: u8 = 0x1c;
pub const REG_SWAP_FLAG: u8 = 0x29;
pub const REG_FLASH_INST_CMD: u8 = 0x2c;
pub const REG_FLASH_CCR0: u8 = 0x40;
pub const REG_FLASH_DATA_CNT0: u8 = 0x44;
pub const REG_FLASH_ADDR0: u8 = 0x48;
pub const REG_FLASH_EXECUTE: u8 = 0x56;

pub const FLASH_STATUS_BUSY: u8 = 0x01;
pub const FLASH_STATUS_WRITE_ENABLED: u8 = 0x02;
pub const FLASH_EXECUTE_START: u8 = 0x01;
pub const FLASH_EXECUTE_DONE: u8 = 0x00;

// Flash instruction bits
pub const FLASH_INST_NONE: u8 = 0;
pub const FLASH_INST_RD2REG_BANK: u8 = 1 << 0;
pub const FLASH_INST_PROGRAM: u8 = 1 << 2;
pub const FLASH_INST_INTERNAL_SRAM_ACCESS: u8 = 1 << 7;

// Flash CCR commands
pub const CCR_WRITE_ENABLE: u32 = 0x0000_0106;
pub const CCR_READ_STATUS: u32 = 0x0100_0105;
pub const CCR_ERASE_SECTOR: u32 = 0x0000_2520;
pub const CCR_PROGRAM_PAGE: u32 = 0x0100_2502;

// System bank 6 (SRAM staging buffer)
pub const REG_SRAM_SELECT: u8 = 0x09;
pub const REG_SRAM_TRIGGER: u8 = 0x0a;
pub const REG_SRAM_ADDR0: u8 = 0x10;
pub const REG_SRAM_ADDR1: u8 = 0x11;
pub const SRAM_TRIGGER_BEGIN: u8 = 0x00;
pub const SRAM_TRIGGER_COMMIT: u8 = 0x01;

// User bank 0
pub const USER_BANK0: u8 = 0x00;
pub const REG_BOOT_STATUS: u8 = 0x00;
pub const REG_PART_ID0: u8 = 0x78;
pub const REG_PART_ID1: u8 = 0x79;
pub const REG_CRC_CTRL: u8 = 0x82;
pub const REG_CRC_RESULT0: u8 = 0x84;

pub const BOOT_STATUS_ROM: u8 = 0x8c;

pub const PART_ID_PJP239: u16 = 0x0239;
pub const PART_ID_PJP274: u16 = 0x0274;

// CRC control values
pub const CRC_CTRL_FW_BANK0: u8 = 0x02;
pub const CRC_CTRL_FW_BANK1: u8 = 0x10;
pub const CRC_CTRL_PARAM_BANK0: u8 = 0x04;
pub const CRC_CTRL_PARAM_BANK1: u8 = 0x20;
pub const CRC_CTRL_BUSY: u8 = 0x01;

// Device config defaults
pub const DEFAULT_SRAM_SELECT: u8 = 0x0f;
pub const DEFAULT_VERSION_BANK: u8 = 0x00;
pub const DEFAULT_VERSION_ADDR: u8 = 0x0b;
