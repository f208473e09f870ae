//! Protocol implementations
//!
//! This module contains the implementations of common flash protocols
//! like SPI25 command sequences.

mod spi25;

pub use spi25::*;
