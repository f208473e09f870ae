//! oxiflash-core - Core library for flash chip programming
//!
//! This crate provides the shared pieces a flash programmer driver needs:
//! the error type, the master traits (`SpiMaster`, `ParMaster`), the SPI
//! command model, and common JEDEC command sequences. It is designed to be
//! `no_std` compatible for use in embedded environments.
//!
//! # Features
//!
//! - `std` - Enable standard library support
//!
//! # Example
//!
//! ```ignore
//! use oxiflash_core::{protocol, programmer::SpiMaster};
//!
//! fn identify<M: SpiMaster>(master: &mut M) {
//!     match protocol::read_jedec_id(master) {
//!         Ok((mfr, dev)) => println!("JEDEC ID: {:02X} {:04X}", mfr, dev),
//!         Err(e) => println!("Probe failed: {}", e),
//!     }
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod programmer;
pub mod protocol;
pub mod spi;

pub use error::{Error, Result};
