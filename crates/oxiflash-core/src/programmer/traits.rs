//! Programmer trait definitions

use crate::error::{Error, Result};
use crate::spi::SpiCommand;
use bitflags::bitflags;

bitflags! {
    /// SPI master feature flags
    ///
    /// These flags indicate what capabilities a programmer supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpiFeatures: u32 {
        /// Supports 4-byte addressing commands
        const FOUR_BYTE_ADDR = 1 << 0;
    }
}

impl Default for SpiFeatures {
    fn default() -> Self {
        SpiFeatures::empty()
    }
}

bitflags! {
    /// Flash bus types a programmer can drive
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BusSet: u8 {
        /// Old-style parallel flash bus
        const PARALLEL = 1 << 0;
        /// Low Pin Count bus
        const LPC      = 1 << 1;
        /// Firmware Hub bus
        const FWH      = 1 << 2;
        /// Serial Peripheral Interface bus
        const SPI      = 1 << 3;
        /// All memory-mapped (non-SPI) buses
        const NONSPI   = Self::PARALLEL.bits() | Self::LPC.bits() | Self::FWH.bits();
    }
}

/// Synchronous SPI master trait (blocking, no_std compatible)
///
/// This trait represents a programmer that can execute SPI commands.
/// Implementations should be blocking and suitable for environments
/// without an async runtime.
pub trait SpiMaster {
    /// Get the features supported by this programmer
    fn features(&self) -> SpiFeatures;

    /// Get the maximum number of bytes that can be read in a single transaction
    fn max_read_len(&self) -> usize;

    /// Get the maximum number of bytes that can be written in a single transaction
    fn max_write_len(&self) -> usize;

    /// Execute a single SPI command
    ///
    /// The command contains all the information needed for the transaction:
    /// opcode, address, and data buffers.
    fn execute(&mut self, cmd: &mut SpiCommand<'_>) -> Result<()>;

    /// Check if an opcode is supported by this programmer
    ///
    /// Some programmers have restrictions on which opcodes can be executed.
    /// Returns true if the opcode is allowed.
    fn probe_opcode(&self, opcode: u8) -> bool {
        let _ = opcode;
        true
    }

    /// Delay for the specified number of microseconds
    fn delay_us(&mut self, us: u32);
}

/// Master trait for memory-mapped (parallel/LPC/FWH) flash buses
///
/// The address space is the flash chip's own: 24-bit addresses carried as
/// `u32`. All operations are fallible so transport failures surface to the
/// caller instead of yielding stale data.
pub trait ParMaster {
    /// Write a single byte to the chip
    fn chip_writeb(&mut self, addr: u32, val: u8) -> Result<()>;

    /// Read a single byte from the chip
    fn chip_readb(&mut self, addr: u32) -> Result<u8>;

    /// Read `buf.len()` bytes starting at `addr`
    fn chip_readn(&mut self, buf: &mut [u8], addr: u32) -> Result<()>;

    /// Delay for the specified number of microseconds
    fn delay_us(&mut self, us: u32) -> Result<()>;

    /// Wait until the chip reports ready at `addr`
    ///
    /// `mask` selects the status bit(s). `data_or_toggle` negative waits for
    /// the masked bits to clear, positive waits for them to be set, zero
    /// waits for the value to stop toggling between reads. `delay_us` is the
    /// pause between polls.
    ///
    /// The provided implementation polls in software via `chip_readb`;
    /// masters with hardware polling override it.
    fn chip_poll(&mut self, addr: u32, mask: u8, data_or_toggle: i32, delay_us: u32) -> Result<()> {
        poll_via_readb(self, addr, mask, data_or_toggle, delay_us)
    }
}

/// Upper bound on software poll iterations before giving up
const MAX_POLLS: u32 = 1_000_000;

/// Software poll fallback: re-read the status location until it settles
///
/// Implements the semantics documented on [`ParMaster::chip_poll`] using
/// only `chip_readb` and `delay_us`.
pub fn poll_via_readb<M: ParMaster + ?Sized>(
    master: &mut M,
    addr: u32,
    mask: u8,
    data_or_toggle: i32,
    delay_us: u32,
) -> Result<()> {
    if data_or_toggle == 0 {
        let mut last = master.chip_readb(addr)? & mask;
        for _ in 0..MAX_POLLS {
            if delay_us > 0 {
                master.delay_us(delay_us)?;
            }
            let cur = master.chip_readb(addr)? & mask;
            if cur == last {
                return Ok(());
            }
            last = cur;
        }
    } else {
        let want = if data_or_toggle > 0 { mask } else { 0 };
        for _ in 0..MAX_POLLS {
            if master.chip_readb(addr)? & mask == want {
                return Ok(());
            }
            if delay_us > 0 {
                master.delay_us(delay_us)?;
            }
        }
    }
    Err(Error::PollTimeout)
}
