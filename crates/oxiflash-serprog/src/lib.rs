//! oxiflash-serprog - Serial Flasher Protocol support
//!
//! This crate implements the host side of the serprog protocol for
//! communication with microcontroller-based flash programmers.
//!
//! # Protocol Overview
//!
//! The Serial Flasher Protocol (serprog) is a simple request/response byte
//! protocol spoken over serial ports or TCP sockets. Commands are single
//! opcodes with little-endian parameters; the device acknowledges each one
//! with ACK or NAK. The driver pipelines acknowledgement-only commands into
//! the device's limited serial buffer, batches deferred operations into the
//! device-side operation buffer, and merges contiguous single-byte writes
//! into write-n transfers.
//!
//! # Supported Transports
//!
//! - Serial port: `/dev/ttyUSB0`, `/dev/ttyACM0`, `COM1`, etc.
//! - TCP socket: `host:port`
//!
//! # Example
//!
//! ```no_run
//! use oxiflash_serprog::{Serprog, SerialTransport};
//!
//! // Open a serial connection
//! let transport = SerialTransport::open("/dev/ttyUSB0", 115200)?;
//! let mut serprog = Serprog::new(transport)?;
//!
//! // Read JEDEC ID
//! let mut id = [0u8; 3];
//! serprog.spi_op(&[0x9F], &mut id)?;
//! println!("JEDEC ID: {:02X} {:02X} {:02X}", id[0], id[1], id[2]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod device;
pub mod error;
mod opbuf;
pub mod protocol;
mod stream;
pub mod transport;

// Re-exports
pub use device::Serprog;
pub use error::{Result, SerprogError};
pub use protocol::{bus, CommandMap, ProgrammerInfo};
pub use transport::serial::SerialTransport;
pub use transport::tcp::TcpTransport;
pub use transport::Transport;

/// Connection target for serprog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerprogConnection {
    /// Serial port connection
    Serial {
        /// Device path (e.g., "/dev/ttyUSB0" or "COM1")
        device: String,
        /// Baud rate
        baud: u32,
    },
    /// TCP socket connection
    Tcp {
        /// Hostname or IP address
        host: String,
        /// Port number
        port: u16,
    },
}

/// Parsed serprog programmer options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerprogOptions {
    /// Where to reach the programmer
    pub connection: SerprogConnection,
    /// Requested SPI clock in Hz, if any
    pub spispeed_hz: Option<u32>,
}

impl SerprogOptions {
    /// Parse a comma-separated option string
    ///
    /// Recognized keys:
    /// - `dev=/dev/device:baud` - serial port and baud rate
    /// - `ip=host:port` - TCP endpoint
    /// - `spispeed=N[k|M]` - requested SPI clock in Hz
    ///
    /// Exactly one of `dev` or `ip` must be given.
    pub fn parse(s: &str) -> Result<Self> {
        let mut connection = None;
        let mut spispeed_hz = None;

        for opt in s.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                SerprogError::InvalidParameter(format!(
                    "'{}' (expected key=value)",
                    opt
                ))
            })?;
            match key {
                "dev" => {
                    if connection.is_some() {
                        return Err(SerprogError::InvalidParameter(
                            "use either dev= or ip= but not both".into(),
                        ));
                    }
                    connection = Some(parse_dev(value)?);
                }
                "ip" => {
                    if connection.is_some() {
                        return Err(SerprogError::InvalidParameter(
                            "use either dev= or ip= but not both".into(),
                        ));
                    }
                    connection = Some(parse_ip(value)?);
                }
                "spispeed" => {
                    spispeed_hz = Some(parse_spispeed(value)?);
                }
                _ => {
                    return Err(SerprogError::InvalidParameter(format!(
                        "unknown option '{}'",
                        key
                    )));
                }
            }
        }

        let connection = connection.ok_or_else(|| {
            SerprogError::InvalidParameter(
                "neither host nor device specified; use dev=/dev/device:baud or ip=host:port"
                    .into(),
            )
        })?;

        Ok(Self {
            connection,
            spispeed_hz,
        })
    }
}

fn parse_dev(value: &str) -> Result<SerprogConnection> {
    let (device, baud_str) = value.rsplit_once(':').ok_or_else(|| {
        SerprogError::InvalidParameter("no baudrate specified; use dev=/dev/device:baud".into())
    })?;
    if device.is_empty() {
        return Err(SerprogError::InvalidParameter(
            "no device specified; use dev=/dev/device:baud".into(),
        ));
    }
    if baud_str.is_empty() {
        return Err(SerprogError::InvalidParameter(
            "no baudrate specified; use dev=/dev/device:baud".into(),
        ));
    }
    let baud = baud_str
        .parse()
        .map_err(|_| SerprogError::InvalidParameter(format!("invalid baud rate: {}", baud_str)))?;
    Ok(SerprogConnection::Serial {
        device: device.to_string(),
        baud,
    })
}

fn parse_ip(value: &str) -> Result<SerprogConnection> {
    let (host, port_str) = value.rsplit_once(':').ok_or_else(|| {
        SerprogError::InvalidParameter("no port specified; use ip=host:port".into())
    })?;
    if host.is_empty() {
        return Err(SerprogError::InvalidParameter(
            "no host specified; use ip=host:port".into(),
        ));
    }
    let port = port_str
        .parse()
        .map_err(|_| SerprogError::InvalidParameter(format!("invalid port: {}", port_str)))?;
    Ok(SerprogConnection::Tcp {
        host: host.to_string(),
        port,
    })
}

/// Parse a `spispeed` value: a number with optional `k`/`M` suffix
///
/// The numeric part follows C `strtol` base inference: `0x` prefix for
/// hexadecimal, leading `0` for octal, decimal otherwise. Anything after a
/// recognized suffix is an error.
fn parse_spispeed(value: &str) -> Result<u32> {
    let t = value.trim_start();
    let (digits, radix) = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))
    {
        (hex, 16)
    } else if t.len() > 1 && t.starts_with('0') {
        (&t[1..], 8)
    } else {
        (t, 10)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let number = if end == 0 {
        // A lone leading "0" is a valid zero; anything else never had a
        // numeric part.
        if radix != 8 {
            return Err(SerprogError::InvalidParameter(
                "could not convert 'spispeed'".into(),
            ));
        }
        0
    } else {
        u32::from_str_radix(&digits[..end], radix)
            .map_err(|_| SerprogError::InvalidParameter("could not convert 'spispeed'".into()))?
    };

    let multiplier = match &digits[end..] {
        "" => 1,
        s if s.eq_ignore_ascii_case("m") => 1_000_000,
        s if s.eq_ignore_ascii_case("k") => 1_000,
        _ => {
            return Err(SerprogError::InvalidParameter(
                "garbage following 'spispeed' value".into(),
            ));
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| SerprogError::InvalidParameter("'spispeed' value out of range".into()))
}

/// Open a serprog connection from an option string
///
/// This is a convenience function that handles both serial and TCP
/// connections and applies a requested SPI clock, returning the
/// initialized driver over a type-erased transport.
pub fn open_serprog(options: &str) -> Result<Serprog<Box<dyn Transport>>> {
    let opts = SerprogOptions::parse(options)?;

    let transport: Box<dyn Transport> = match &opts.connection {
        SerprogConnection::Serial { device, baud } => {
            Box::new(SerialTransport::open(device, *baud)?)
        }
        SerprogConnection::Tcp { host, port } => Box::new(TcpTransport::connect(host, *port)?),
    };

    match opts.spispeed_hz {
        Some(freq) => Serprog::with_spi_speed(transport, freq),
        None => Serprog::new(transport),
    }
}

/// Open a serprog connection via serial port
pub fn open_serial(device: &str, baud: u32) -> Result<Serprog<SerialTransport>> {
    let transport = SerialTransport::open(device, baud)?;
    Serprog::new(transport)
}

/// Open a serprog connection via TCP
pub fn open_tcp(host: &str, port: u16) -> Result<Serprog<TcpTransport>> {
    let transport = TcpTransport::connect(host, port)?;
    Serprog::new(transport)
}
