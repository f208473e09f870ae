//! SPI types and command structures
//!
//! This module provides types for representing SPI transactions and the
//! standard JEDEC opcodes.

mod command;
pub mod opcodes;

pub use command::{AddressWidth, SpiCommand};
pub use opcodes::*;
