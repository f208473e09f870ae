//! Standard JEDEC SPI flash opcodes
//!
//! This module defines the standard SPI flash command opcodes as specified
//! by JEDEC JESD216 (SFDP) and common manufacturer conventions.

/// Write Enable - required before any write/erase operation
pub const WREN: u8 = 0x06;
/// Write Disable - clears WEL bit in status register
pub const WRDI: u8 = 0x04;

/// Read Status Register 1
pub const RDSR: u8 = 0x05;
/// Write Status Register 1
pub const WRSR: u8 = 0x01;

/// Read JEDEC ID (manufacturer + device ID)
pub const RDID: u8 = 0x9F;

/// Read Data (up to ~33 MHz)
pub const READ: u8 = 0x03;
/// Read Data with 4-byte address
pub const READ_4B: u8 = 0x13;

/// Page Program
pub const PP: u8 = 0x02;

/// Write In Progress bit in status register 1
pub const SR1_WIP: u8 = 0x01;
/// Write Enable Latch bit in status register 1
pub const SR1_WEL: u8 = 0x02;
