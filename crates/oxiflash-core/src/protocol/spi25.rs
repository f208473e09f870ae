//! SPI25 protocol implementation
//!
//! This module implements the common SPI flash command sequences
//! as defined by JEDEC.

use crate::error::Result;
use crate::programmer::SpiMaster;
use crate::spi::{opcodes, SpiCommand};

/// Identify the chip via the JEDEC RDID command
///
/// Returns the manufacturer byte and the two device-id bytes, packed the
/// way they arrive on the wire (big-endian).
pub fn read_jedec_id<M: SpiMaster + ?Sized>(master: &mut M) -> Result<(u8, u16)> {
    let mut id = [0u8; 3];
    master.execute(&mut SpiCommand::read_reg(opcodes::RDID, &mut id))?;
    Ok((id[0], u16::from_be_bytes([id[1], id[2]])))
}

/// Fetch status register 1
pub fn read_status1<M: SpiMaster + ?Sized>(master: &mut M) -> Result<u8> {
    let mut sr = [0u8; 1];
    master.execute(&mut SpiCommand::read_reg(opcodes::RDSR, &mut sr))?;
    Ok(sr[0])
}

/// Read `buf.len()` bytes starting at `addr` in a single READ transaction
///
/// The caller is responsible for keeping the length within the master's
/// `max_read_len`.
pub fn nbyte_read<M: SpiMaster + ?Sized>(master: &mut M, addr: u32, buf: &mut [u8]) -> Result<()> {
    let mut cmd = SpiCommand::read_3b(opcodes::READ, addr, buf);
    master.execute(&mut cmd)
}

/// Read a region of flash, chunked by the master's `max_read_len`
pub fn read<M: SpiMaster + ?Sized>(master: &mut M, start: u32, buf: &mut [u8]) -> Result<()> {
    let max_read = master.max_read_len().max(1);
    let mut off = 0;
    while off < buf.len() {
        let cur_len = max_read.min(buf.len() - off);
        nbyte_read(master, start + off as u32, &mut buf[off..off + cur_len])?;
        off += cur_len;
    }
    Ok(())
}
