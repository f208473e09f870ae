//! Serprog device implementation
//!
//! This module provides the main `Serprog` struct that implements the
//! serprog protocol and the `SpiMaster`/`ParMaster` traits.
//!
//! Commands that expect only an acknowledgement are pipelined: they are
//! written without waiting for the reply, and the outstanding replies are
//! consumed later, keeping the device's serial receive buffer from
//! overrunning. Opbuf-queued writes are additionally coalesced into
//! write-n runs before they are transmitted at all.

use crate::error::{Result, SerprogError};
use crate::opbuf::{OpbufTracker, WriteCoalescer};
use crate::protocol::*;
use crate::stream::{StreamOp, StreamWindow};
use crate::transport::Transport;

use oxiflash_core::error::Result as CoreResult;
use oxiflash_core::programmer::{BusSet, ParMaster, SpiFeatures, SpiMaster};
use oxiflash_core::spi::SpiCommand;

use std::thread;
use std::time::Duration;

/// Serprog programmer
///
/// This struct represents a connection to a serprog device. It implements
/// `SpiMaster` for SPI-capable programmers and `ParMaster` for programmers
/// driving a memory-mapped (parallel/LPC/FWH) bus.
#[derive(Debug)]
pub struct Serprog<T: Transport> {
    /// Transport layer (serial or TCP)
    transport: T,
    /// Programmer capabilities
    info: ProgrammerInfo,
    /// Whether automatic command checking is enabled
    auto_check: bool,
    /// Window over commands in flight in the device serial buffer
    stream: StreamWindow,
    /// Device-side operation buffer usage
    opbuf: OpbufTracker,
    /// Pending contiguous write run
    coalescer: WriteCoalescer,
    /// Set once `shutdown` has run
    shut_down: bool,
}

impl<T: Transport> Serprog<T> {
    /// Create a new Serprog instance with the given transport
    ///
    /// This synchronizes the protocol and negotiates the programmer's
    /// capabilities (interface version, command map, bus types, buffer
    /// sizes and transfer limits), initializes the operation buffer and
    /// enables the output drivers.
    pub fn new(transport: T) -> Result<Self> {
        Self::init(transport, None)
    }

    /// Like [`Serprog::new`], but also requests the given SPI clock
    /// frequency during bus negotiation
    pub fn with_spi_speed(transport: T, spispeed_hz: u32) -> Result<Self> {
        Self::init(transport, Some(spispeed_hz))
    }

    fn init(transport: T, spispeed_hz: Option<u32>) -> Result<Self> {
        let mut serprog = Self {
            transport,
            info: ProgrammerInfo::default(),
            auto_check: false,
            stream: StreamWindow::new(ProgrammerInfo::default().serbuf_size),
            opbuf: OpbufTracker::new(),
            coalescer: WriteCoalescer::new(),
            shut_down: false,
        };

        serprog.synchronize()?;
        log::debug!("serprog: Synchronized");

        // Query interface version
        let version = serprog.query_iface()?;
        if version != SERPROG_PROTOCOL_VERSION {
            log::error!("serprog: Unknown interface version: {}", version);
            return Err(SerprogError::UnsupportedVersion(version));
        }
        log::debug!("serprog: Interface version ok");

        // Query command map and enable automatic availability checks
        serprog.info.cmdmap = serprog.query_cmdmap()?;
        serprog.auto_check = true;

        // Query bus types; fall back to the memory-mapped set on NAK
        serprog.info.bustypes = match serprog.query_bustype() {
            Ok(bt) => bt,
            Err(_) => {
                log::warn!("serprog: NAK to query supported buses");
                bus::NONSPI
            }
        };
        log::debug!(
            "serprog: Bus support: parallel={}, LPC={}, FWH={}, SPI={}",
            (serprog.info.bustypes & bus::PARALLEL) != 0,
            (serprog.info.bustypes & bus::LPC) != 0,
            (serprog.info.bustypes & bus::FWH) != 0,
            (serprog.info.bustypes & bus::SPI) != 0
        );

        if serprog.info.supports_spi() {
            serprog.init_spi(spispeed_hz)?;
        }

        if serprog.info.supports_nonspi() {
            serprog.init_parallel()?;
        }

        // Query programmer name (advisory)
        match serprog.do_command_ret::<16>(S_CMD_Q_PGMNAME) {
            Ok(name) => serprog.info.name = name,
            Err(_) => {
                log::warn!("serprog: NAK to query programmer name");
                serprog.info.name[..9].copy_from_slice(b"(unknown)");
            }
        }
        log::info!(
            "serprog: Programmer name is \"{}\"",
            serprog.info.name_str()
        );

        // Query serial buffer size and size the in-flight window to it
        match serprog.do_command_ret::<2>(S_CMD_Q_SERBUF) {
            Ok(buf) => serprog.info.serbuf_size = u16::from_le_bytes(buf),
            Err(_) => log::warn!("serprog: NAK to query serial buffer size"),
        }
        log::debug!(
            "serprog: Serial buffer size is {}",
            serprog.info.serbuf_size
        );
        serprog.stream = StreamWindow::new(serprog.info.serbuf_size);

        // Initialize the operation buffer if the device has one
        if serprog.info.supports_cmd(S_CMD_O_INIT) {
            // A device with an opbuf but no way to execute it would be
            // inconsistent.
            if !serprog.info.supports_cmd(S_CMD_O_EXEC) {
                log::error!("serprog: Execute operation buffer not supported");
                return Err(SerprogError::CommandNotSupported(S_CMD_O_EXEC));
            }

            serprog.do_command(S_CMD_O_INIT, &[], &mut []).map_err(|e| {
                log::error!("serprog: NAK to initialize operation buffer");
                e
            })?;

            match serprog.do_command_ret::<2>(S_CMD_Q_OPBUF) {
                Ok(buf) => serprog.info.opbuf_size = u16::from_le_bytes(buf),
                Err(_) => log::warn!("serprog: NAK to query operation buffer size"),
            }
            log::debug!(
                "serprog: Operation buffer size is {}",
                serprog.info.opbuf_size
            );
        }

        // Enable output drivers
        if serprog.info.supports_cmd(S_CMD_S_PIN_STATE) {
            serprog
                .do_command(S_CMD_S_PIN_STATE, &[1], &mut [])
                .map_err(|e| {
                    log::error!("serprog: Could not enable output buffers");
                    e
                })?;
            log::debug!("serprog: Output drivers enabled");
        } else {
            log::debug!("serprog: Programmer does not support toggling its output drivers");
        }

        Ok(serprog)
    }

    /// SPI side of capability negotiation
    fn init_spi(&mut self, spispeed_hz: Option<u32>) -> Result<()> {
        if !self.info.supports_cmd(S_CMD_O_SPIOP) {
            log::error!("serprog: SPI operation not supported while the bustype is SPI");
            return Err(SerprogError::CommandNotSupported(S_CMD_O_SPIOP));
        }

        self.do_command(S_CMD_S_BUSTYPE, &[bus::SPI], &mut [])?;

        // The programmer does not have to tell us its limits, but if it
        // does not, we will assume stuff, so it is in its best interest
        // to answer these.
        if let Ok(buf) = self.do_command_ret::<3>(S_CMD_Q_WRNMAXLEN) {
            self.info.spi_max_write_n = u24_to_u32(&buf);
            log::debug!(
                "serprog: Maximum SPI write length is {}",
                self.info.effective_spi_max_write()
            );
        }
        if let Ok(buf) = self.do_command_ret::<3>(S_CMD_Q_RDNMAXLEN) {
            self.info.spi_max_read_n = u24_to_u32(&buf);
            log::debug!(
                "serprog: Maximum SPI read length is {}",
                self.info.effective_spi_max_read()
            );
        }

        if let Some(freq) = spispeed_hz {
            if self.set_spi_speed(freq).is_err() {
                log::warn!("serprog: Setting SPI clock rate to {} Hz failed!", freq);
            }
        }

        // Back to the full supported set
        let bt = self.info.bustypes;
        self.do_command(S_CMD_S_BUSTYPE, &[bt], &mut [])?;
        Ok(())
    }

    /// Memory-mapped side of capability negotiation
    fn init_parallel(&mut self) -> Result<()> {
        // Minimum operational command set for memory-mapped buses.
        // Missing read-n could be translated to single byte reads, but we
        // do not support that.
        for cmd in [
            S_CMD_O_INIT,
            S_CMD_O_DELAY,
            S_CMD_R_BYTE,
            S_CMD_R_NBYTES,
            S_CMD_O_WRITEB,
        ] {
            if !self.info.supports_cmd(cmd) {
                log::error!(
                    "serprog: Required command 0x{:02X} not supported by programmer",
                    cmd
                );
                return Err(SerprogError::CommandNotSupported(cmd));
            }
        }

        match self.do_command_ret::<3>(S_CMD_Q_WRNMAXLEN) {
            Err(_) => {
                log::debug!("serprog: Write-n not supported");
                self.info.par_max_write_n = 0;
            }
            Ok(buf) => {
                let mut v = u24_to_u32(&buf);
                if v == 0 {
                    v = 1 << 24;
                }
                self.info.par_max_write_n = v;
                self.coalescer.set_max_len(v);
                log::debug!("serprog: Maximum write-n length is {}", v);
            }
        }

        let rdn = if self.info.supports_cmd(S_CMD_Q_RDNMAXLEN) {
            self.do_command_ret::<3>(S_CMD_Q_RDNMAXLEN).ok()
        } else {
            None
        };
        match rdn {
            Some(buf) => {
                self.info.par_max_read_n = u24_to_u32(&buf);
                log::debug!(
                    "serprog: Maximum read-n length is {}",
                    if self.info.par_max_read_n == 0 {
                        1 << 24
                    } else {
                        self.info.par_max_read_n
                    }
                );
            }
            None => {
                log::debug!("serprog: Maximum read-n length not reported");
                self.info.par_max_read_n = 0;
            }
        }

        Ok(())
    }

    /// Set the SPI clock frequency in Hz
    ///
    /// Returns the actual frequency set by the programmer.
    pub fn set_spi_speed(&mut self, freq_hz: u32) -> Result<u32> {
        if !self.info.supports_cmd(S_CMD_S_SPI_FREQ) {
            log::warn!("serprog: Setting the SPI clock rate is not supported!");
            return Err(SerprogError::CommandNotSupported(S_CMD_S_SPI_FREQ));
        }

        // Synchronous command: the stream must be empty first.
        self.flush_stream()?;

        let freq_bytes = freq_hz.to_le_bytes();
        let mut ret_buf = [0u8; 4];
        self.do_command(S_CMD_S_SPI_FREQ, &freq_bytes, &mut ret_buf)?;

        let actual_freq = u32::from_le_bytes(ret_buf);
        log::info!(
            "serprog: Requested to set SPI clock frequency to {} Hz. It was actually set to {} Hz",
            freq_hz,
            actual_freq
        );

        Ok(actual_freq)
    }

    /// Get programmer information
    pub fn info(&self) -> &ProgrammerInfo {
        &self.info
    }

    /// Buses the programmer advertises
    pub fn buses(&self) -> BusSet {
        BusSet::from_bits_truncate(self.info.bustypes)
    }

    /// Translate a physical mapping request into a chip address base
    ///
    /// Only the top 16 MiB window (the common BIOS flash mapping) can be
    /// serviced; the returned base is a plain address for the chip ops,
    /// which truncate it to 24 bits on the wire.
    pub fn map(&self, phys_addr: u32, len: u32) -> Option<u32> {
        if phys_addr & 0xFF00_0000 == 0xFF00_0000 {
            Some(phys_addr)
        } else {
            log::warn!(
                "serprog: incompatible mapping phys_addr 0x{:08X} len {}",
                phys_addr,
                len
            );
            None
        }
    }

    // ---- Synchronization ----

    /// Bring the serial protocol to a known waiting-for-command state
    ///
    /// The run of NOPs makes the device parser consume any pending
    /// write-n payload (NOP is opcode 0), after which the answer bytes
    /// are discarded and SYNCNOP probes confirm framing alignment.
    fn synchronize(&mut self) -> Result<()> {
        log::debug!("serprog: Attempting to synchronize");

        let nops = [S_CMD_NOP; 8];
        if !self.transport.write_nonblock(&nops, 1)? {
            return Err(SerprogError::SyncFailed);
        }
        self.transport.flush()?;

        // A second should be enough to get all the answers to the buffer
        thread::sleep(Duration::from_secs(1));
        self.transport.drain()?;

        // Up to 10 characters per probe at 50 ms each plus the confirm
        // round: worst case a few seconds, ~1s on immediate success.
        for _ in 0..8 {
            if self.test_sync()? {
                return Ok(());
            }
        }

        log::error!(
            "serprog: cannot synchronize protocol - check communications and reset device"
        );
        Err(SerprogError::SyncFailed)
    }

    /// Wait up to `timeout_ms` for one reply byte; `None` on timeout
    fn read_reply_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>> {
        let mut byte = [0u8];
        let got = self.transport.read_nonblock(&mut byte, timeout_ms)?;
        Ok((got > 0).then_some(byte[0]))
    }

    fn send_syncnop(&mut self) -> Result<()> {
        if self.transport.write_nonblock(&[S_CMD_SYNCNOP], 1)? {
            Ok(())
        } else {
            Err(SerprogError::SyncFailed)
        }
    }

    /// One synchronization probe
    ///
    /// SYNCNOP is the only command answered by NAK+ACK. The probe scans
    /// for that pair among whatever stale reply bytes are still arriving,
    /// and a second probe with relaxed deadlines must reproduce it before
    /// the channel counts as aligned.
    fn test_sync(&mut self) -> Result<bool> {
        self.send_syncnop()?;

        for _ in 0..10 {
            if self.read_reply_byte(50)? != Some(S_NAK) {
                continue;
            }
            if self.read_reply_byte(20)? != Some(S_ACK) {
                continue;
            }

            self.send_syncnop()?;
            let confirmed = self.read_reply_byte(500)? == Some(S_NAK)
                && self.read_reply_byte(100)? == Some(S_ACK);
            return Ok(confirmed);
        }

        Ok(false)
    }

    // ---- Synchronous command path ----

    /// Execute a command and wait for its reply in-line
    ///
    /// Only used while the stream is empty (during init/shutdown, or after
    /// an explicit flush): the ACK read here must not race in-flight
    /// acknowledgements.
    fn do_command(&mut self, cmd: u8, params: &[u8], ret_buf: &mut [u8]) -> Result<()> {
        if self.auto_check && !self.info.supports_cmd(cmd) {
            log::debug!(
                "serprog: Automatic command availability check failed for cmd 0x{:02X} - won't execute",
                cmd
            );
            return Err(SerprogError::CommandNotSupported(cmd));
        }

        self.transport.write(&[cmd])?;
        if !params.is_empty() {
            self.transport.write(params)?;
        }

        let mut response = [0u8];
        self.transport.read(&mut response)?;

        if response[0] == S_NAK {
            return Err(SerprogError::Nak(cmd));
        }
        if response[0] != S_ACK {
            log::error!(
                "serprog: Invalid response 0x{:02X} from device (to command 0x{:02X})",
                response[0],
                cmd
            );
            return Err(SerprogError::InvalidResponse {
                command: cmd,
                response: response[0],
            });
        }

        if !ret_buf.is_empty() {
            self.transport.read(ret_buf)?;
        }

        Ok(())
    }

    /// Execute a command and return the result in a fixed-size array
    fn do_command_ret<const N: usize>(&mut self, cmd: u8) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.do_command(cmd, &[], &mut buf)?;
        Ok(buf)
    }

    /// Query interface version
    fn query_iface(&mut self) -> Result<u16> {
        // Don't use auto_check for Q_IFACE
        let saved = self.auto_check;
        self.auto_check = false;
        let result = self.do_command_ret::<2>(S_CMD_Q_IFACE);
        self.auto_check = saved;
        Ok(u16::from_le_bytes(result?))
    }

    /// Query command map
    fn query_cmdmap(&mut self) -> Result<CommandMap> {
        let mut cmdmap = CommandMap::new();
        // Don't use auto_check for Q_CMDMAP
        let saved = self.auto_check;
        self.auto_check = false;
        let result = self.do_command(S_CMD_Q_CMDMAP, &[], &mut cmdmap.bitmap);
        self.auto_check = saved;
        result?;
        Ok(cmdmap)
    }

    /// Query bus type
    fn query_bustype(&mut self) -> Result<u8> {
        let buf = self.do_command_ret::<1>(S_CMD_Q_BUSTYPE)?;
        Ok(buf[0])
    }

    // ---- Streamed command path ----

    /// Consume acknowledgements until at least `len_to_be_sent` bytes of
    /// the device serial buffer are free
    fn check_stream_free(&mut self, len_to_be_sent: u32) -> Result<()> {
        let target = (self.info.serbuf_size as u32).saturating_sub(len_to_be_sent);
        while self.stream.inflight_ops() > 0 && self.stream.inflight_bytes() > target {
            let mut c = [0u8];
            self.transport.read(&mut c).map_err(|e| {
                log::error!("serprog: cannot read from device (draining stream)");
                e
            })?;
            let (op, _size) = match self.stream.pop() {
                Some(entry) => entry,
                None => break,
            };
            if c[0] == S_NAK {
                log::error!("serprog: NAK to a stream buffer operation: {}", op.name());
                return Err(SerprogError::StreamNak(op.name()));
            }
            if c[0] != S_ACK {
                log::error!(
                    "serprog: Invalid reply 0x{:02X} from device as reply to op: {}",
                    c[0],
                    op.name()
                );
                return Err(SerprogError::StreamReply {
                    op: op.name(),
                    reply: c[0],
                });
            }
        }

        if self.stream.inflight_ops() == 0 {
            let leftover = self.stream.clamp_bytes();
            if leftover != 0 {
                log::warn!(
                    "serprog: streamop accounting error: {} bytes not accounted for",
                    leftover
                );
            }
        }

        Ok(())
    }

    /// Drain every outstanding acknowledgement
    fn flush_stream(&mut self) -> Result<()> {
        let serbuf = self.info.serbuf_size as u32;
        self.check_stream_free(serbuf)
    }

    /// Transmit a command without waiting for its acknowledgement
    fn stream_op(&mut self, cmd: u8, params: &[u8], opid: StreamOp) -> Result<()> {
        if self.auto_check && !self.info.supports_cmd(cmd) {
            log::debug!(
                "serprog: Automatic command availability check failed for cmd 0x{:02X} - won't execute",
                cmd
            );
            return Err(SerprogError::CommandNotSupported(cmd));
        }

        let len = 1 + params.len() as u32;
        self.check_stream_free(len)?;

        let mut buf = Vec::with_capacity(len as usize);
        buf.push(cmd);
        buf.extend_from_slice(params);
        self.transport.write(&buf)?;
        self.stream.put(opid, len);
        Ok(())
    }

    // ---- Operation buffer management ----

    /// Execute the opbuf early if queueing `bytes_to_be_added` would fill it
    fn check_opbuf_usage(&mut self, bytes_to_be_added: u32) -> Result<()> {
        if self.opbuf.would_fill(bytes_to_be_added, self.info.opbuf_size) {
            // If this happens in the middle of a page load the page load
            // will probably fail.
            log::warn!("serprog: executed operation buffer due to size reasons");
            self.execute_opbuf_noflush()?;
        }
        Ok(())
    }

    /// Move the pending write run into the device operation buffer
    fn pass_writen(&mut self) -> Result<()> {
        let (addr, data) = match self.coalescer.take_run() {
            Some(run) => run,
            None => return Ok(()),
        };
        log::trace!(
            "serprog: Passing write-n bytes={} addr=0x{:x}",
            data.len(),
            addr
        );

        // In case it's just a single byte send it as a single write.
        if data.len() == 1 {
            self.check_opbuf_usage(5)?;
            let a = u24_bytes(addr);
            let params = [a[0], a[1], a[2], data[0]];
            self.stream_op(S_CMD_O_WRITEB, &params, StreamOp::WriteB)?;
            self.opbuf.add(5);
            return Ok(());
        }

        let total = 7 + data.len() as u32;
        self.check_opbuf_usage(total)?;
        self.check_stream_free(total)?;

        let l = u24_bytes(data.len() as u32);
        let a = u24_bytes(addr);
        let header = [S_CMD_O_WRITEN, l[0], l[1], l[2], a[0], a[1], a[2]];
        self.transport.write(&header).map_err(|e| {
            log::error!("serprog: cannot write write-n command");
            e
        })?;
        self.transport.write(&data).map_err(|e| {
            log::error!("serprog: cannot write write-n data");
            e
        })?;
        self.stream.put(StreamOp::WriteN, total);
        self.opbuf.add(total);
        Ok(())
    }

    /// Queue `O_EXEC`, leaving its acknowledgement in flight
    fn execute_opbuf_noflush(&mut self) -> Result<()> {
        if self.coalescer.pending() {
            self.pass_writen().map_err(|e| {
                log::error!("serprog: could not transfer write buffer");
                e
            })?;
        }
        self.stream_op(S_CMD_O_EXEC, &[], StreamOp::ExecOpbuf)
            .map_err(|e| {
                log::error!("serprog: could not execute command buffer");
                e
            })?;
        log::trace!(
            "serprog: Executed operation buffer of {} bytes",
            self.opbuf.usage()
        );
        self.opbuf.reset();
        Ok(())
    }

    /// Execute the opbuf and wait for everything outstanding
    fn execute_opbuf(&mut self) -> Result<()> {
        self.execute_opbuf_noflush()?;
        self.flush_stream()
    }

    /// Anything queued device-side (or coalesced host-side) that a read
    /// must not overtake?
    fn opbuf_dirty(&self) -> bool {
        self.opbuf.usage() > 0 || self.coalescer.pending()
    }

    // ---- Chip operations (memory-mapped buses) ----

    /// Write a single byte to the chip
    ///
    /// Consecutive writes at ascending addresses are merged host-side and
    /// transmitted as one write-n.
    pub fn chip_writeb(&mut self, addr: u32, val: u8) -> Result<()> {
        let addr = addr & 0x00FF_FFFF;
        if self.coalescer.enabled() {
            if self.coalescer.extends(addr) {
                self.coalescer.append(val);
            } else {
                if self.coalescer.pending() {
                    self.pass_writen()?;
                }
                self.coalescer.start(addr, val);
            }
            self.check_opbuf_usage(7 + self.coalescer.len())?;
            if self.coalescer.is_full() {
                self.pass_writen()?;
            }
            Ok(())
        } else {
            // We will have to do single writeb ops.
            self.check_opbuf_usage(5)?;
            let a = u24_bytes(addr);
            let params = [a[0], a[1], a[2], val];
            self.stream_op(S_CMD_O_WRITEB, &params, StreamOp::WriteB)?;
            self.opbuf.add(5);
            Ok(())
        }
    }

    /// Read a single byte from the chip
    pub fn chip_readb(&mut self, addr: u32) -> Result<u8> {
        let addr = addr & 0x00FF_FFFF;
        // Stream the read operation - add it to the stream buffer, flush
        // the buffer, then read the answer.
        if self.opbuf_dirty() {
            self.execute_opbuf_noflush()?;
        }
        self.stream_op(S_CMD_R_BYTE, &u24_bytes(addr), StreamOp::ReadB)?;
        self.flush_stream()?;
        let mut c = [0u8];
        self.transport.read(&mut c)?;
        log::trace!("serprog: readb 0x{:06x} returning 0x{:02X}", addr, c[0]);
        Ok(c[0])
    }

    /// One read-n transaction, length unchecked against the device limit
    fn do_read_n(&mut self, buf: &mut [u8], addr: u32) -> Result<()> {
        log::trace!("serprog: read-n addr=0x{:06x} len={}", addr, buf.len());
        if self.opbuf_dirty() {
            self.execute_opbuf_noflush()?;
        }
        let a = u24_bytes(addr);
        let l = u24_bytes(buf.len() as u32);
        let params = [a[0], a[1], a[2], l[0], l[1], l[2]];
        self.stream_op(S_CMD_R_NBYTES, &params, StreamOp::ReadN)?;
        self.flush_stream()?;
        self.transport.read(buf).map_err(|e| {
            log::error!("serprog: cannot read read-n data");
            e
        })?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `addr`, chunked by the device's
    /// maximum read-n length
    pub fn chip_readn(&mut self, buf: &mut [u8], addr: u32) -> Result<()> {
        let addr = addr & 0x00FF_FFFF;
        let max = self.info.par_max_read_n as usize;
        if max == 0 {
            return self.do_read_n(buf, addr);
        }
        let mut off = 0;
        while off < buf.len() {
            let cur_len = max.min(buf.len() - off);
            self.do_read_n(&mut buf[off..off + cur_len], addr + off as u32)?;
            off += cur_len;
        }
        Ok(())
    }

    /// Queue a hardware poll for chip ready, or fall back to polling in
    /// software
    ///
    /// Only single-bit masks can be accelerated; the device tests the bit
    /// at the mask's position against the condition encoded in the flags
    /// byte.
    pub fn chip_poll(
        &mut self,
        addr: u32,
        mask: u8,
        data_or_toggle: i32,
        delay_us: u32,
    ) -> Result<()> {
        let addr = addr & 0x00FF_FFFF;
        let cmd = if delay_us != 0 {
            S_CMD_O_POLL_DLY
        } else {
            S_CMD_O_POLL
        };

        let shift = match single_bit_shift(mask) {
            Some(shift) if self.info.supports_cmd(cmd) => shift,
            _ => {
                // Multi-bit mask or no hardware poll: fall back to reading
                // the status location ourselves.
                return oxiflash_core::programmer::poll_via_readb(
                    self,
                    addr,
                    mask,
                    data_or_toggle,
                    delay_us,
                )
                .map_err(|e| match e {
                    oxiflash_core::Error::PollTimeout => SerprogError::PollTimeout,
                    _ => SerprogError::IoError("software poll failed".into()),
                });
            }
        };

        if self.coalescer.pending() {
            self.pass_writen().map_err(|e| {
                log::error!("serprog: could not transfer write buffer");
                e
            })?;
        }

        let mut flags = shift;
        if data_or_toggle < 0 {
            flags |= POLL_BIT_CLEAR;
        } else if data_or_toggle > 0 {
            flags |= POLL_BIT_SET;
        }
        let a = u24_bytes(addr);

        if delay_us != 0 {
            self.check_opbuf_usage(9)?;
            let d = delay_us.to_le_bytes();
            let params = [flags, a[0], a[1], a[2], d[0], d[1], d[2], d[3]];
            self.stream_op(S_CMD_O_POLL_DLY, &params, StreamOp::PollDelay)?;
            self.opbuf.add(9);
        } else {
            self.check_opbuf_usage(5)?;
            let params = [flags, a[0], a[1], a[2]];
            self.stream_op(S_CMD_O_POLL, &params, StreamOp::Poll)?;
            self.opbuf.add(5);
        }

        // The software loop this replaces was a natural exec point, so if
        // the opbuf is more than 1/3 full, do the exec.
        if self.opbuf.usage() >= self.info.opbuf_size as u32 / 3 {
            self.execute_opbuf_noflush()?;
        }
        Ok(())
    }

    /// Delay for `usecs` microseconds, queued to the opbuf when the device
    /// supports it and slept locally otherwise
    pub fn delay(&mut self, usecs: u32) -> Result<()> {
        log::trace!("serprog: delay usecs={}", usecs);

        if self.coalescer.pending() {
            self.pass_writen()?;
        }

        if !self.info.supports_cmd(S_CMD_O_DELAY) {
            if self.opbuf.usage() > 0 {
                self.execute_opbuf()?;
            }
            log::debug!("serprog: programmer doesn't support delays natively - emulating");
            thread::sleep(Duration::from_micros(usecs as u64));
            return Ok(());
        }

        self.check_opbuf_usage(5)?;
        self.stream_op(S_CMD_O_DELAY, &usecs.to_le_bytes(), StreamOp::Delay)?;
        self.opbuf.add(5);
        Ok(())
    }

    // ---- SPI operations ----

    /// Perform an SPI operation
    ///
    /// This is the core function for SPI communication, implementing
    /// `S_CMD_O_SPIOP`. The op itself is streamed; the stream is only
    /// flushed when there is read data to collect.
    pub fn spi_op(&mut self, write_data: &[u8], read_buf: &mut [u8]) -> Result<()> {
        let writecnt = write_data.len();
        let readcnt = read_buf.len();
        log::trace!("serprog: spi op writecnt={} readcnt={}", writecnt, readcnt);

        // Parallel ops and SPI ops share the stream; bring the chip state
        // up to date first.
        if self.opbuf_dirty() {
            self.execute_opbuf_noflush().map_err(|e| {
                log::error!(
                    "serprog: could not execute command buffer before sending SPI commands"
                );
                e
            })?;
        }

        // Parameter block: 3 bytes write count + 3 bytes read count + data
        let mut params = Vec::with_capacity(6 + writecnt);
        params.extend_from_slice(&u24_bytes(writecnt as u32));
        params.extend_from_slice(&u24_bytes(readcnt as u32));
        params.extend_from_slice(write_data);

        self.stream_op(S_CMD_O_SPIOP, &params, StreamOp::SpiOp)?;

        if readcnt > 0 {
            self.flush_stream()?;
            self.transport.read(read_buf).map_err(|e| {
                log::error!("serprog: SPI reply read failed");
                e
            })?;
        }

        Ok(())
    }

    // ---- Shutdown ----

    /// Flush all queued work and park the programmer
    ///
    /// Executes any pending opbuf content, disables the output drivers
    /// (best effort) and marks the session finished. Calling it again is a
    /// no-op; `Drop` calls it as well.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.opbuf_dirty() && self.execute_opbuf().is_err() {
            log::warn!("serprog: Could not flush command buffer");
        }

        // Acknowledgements may still be in flight (an SPI op without read
        // data leaves its ACK pending); the synchronous pin-state command
        // below must not consume one of those as its reply.
        if self.flush_stream().is_err() {
            log::warn!("serprog: Could not drain outstanding acknowledgements");
        }

        if self.info.supports_cmd(S_CMD_S_PIN_STATE) {
            match self.do_command(S_CMD_S_PIN_STATE, &[0], &mut []) {
                Ok(()) => log::debug!("serprog: Output drivers disabled"),
                Err(_) => log::warn!("serprog: could not disable output buffers"),
            }
        }
    }
}

impl<T: Transport> Drop for Serprog<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport> SpiMaster for Serprog<T> {
    fn features(&self) -> SpiFeatures {
        // 4-byte addressing is handled in software by the wire format
        SpiFeatures::FOUR_BYTE_ADDR
    }

    fn max_read_len(&self) -> usize {
        self.info.effective_spi_max_read()
    }

    fn max_write_len(&self) -> usize {
        self.info.effective_spi_max_write()
    }

    fn execute(&mut self, cmd: &mut SpiCommand<'_>) -> CoreResult<()> {
        // Build the write data: opcode + address + write_data
        let header_len = cmd.header_len();
        let mut write_data = vec![0u8; header_len + cmd.write_data.len()];
        cmd.encode_header(&mut write_data);
        write_data[header_len..].copy_from_slice(cmd.write_data);

        self.spi_op(&write_data, cmd.read_buf).map_err(Into::into)
    }

    fn delay_us(&mut self, us: u32) {
        if let Err(e) = self.delay(us) {
            log::error!("serprog: delay failed: {}", e);
        }
    }
}

impl<T: Transport> ParMaster for Serprog<T> {
    fn chip_writeb(&mut self, addr: u32, val: u8) -> CoreResult<()> {
        self.chip_writeb(addr, val).map_err(Into::into)
    }

    fn chip_readb(&mut self, addr: u32) -> CoreResult<u8> {
        self.chip_readb(addr).map_err(Into::into)
    }

    fn chip_readn(&mut self, buf: &mut [u8], addr: u32) -> CoreResult<()> {
        self.chip_readn(buf, addr).map_err(Into::into)
    }

    fn delay_us(&mut self, us: u32) -> CoreResult<()> {
        self.delay(us).map_err(Into::into)
    }

    fn chip_poll(&mut self, addr: u32, mask: u8, data_or_toggle: i32, delay_us: u32) -> CoreResult<()> {
        self.chip_poll(addr, mask, data_or_toggle, delay_us)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// An operation sitting in the emulated device's opbuf
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum QueuedOp {
        WriteB { addr: u32, val: u8 },
        WriteN { addr: u32, data: Vec<u8> },
        Delay { usecs: u32 },
        Poll { flags: u8, addr: u32 },
        PollDelay { flags: u8, addr: u32, delay: u32 },
    }

    /// In-memory serprog firmware standing in for real hardware
    ///
    /// Parses whatever the host writes and queues the replies the firmware
    /// would send, byte for byte. Writes land in `mem` when the opbuf is
    /// executed, so write-then-read sequences round-trip.
    #[derive(Debug)]
    struct EmuState {
        cmdmap: CommandMap,
        iface_version: u16,
        bustypes: u8,
        serbuf_size: u16,
        opbuf_size: u16,
        wrn_max: Option<u32>,
        rdn_max: Option<u32>,
        name: [u8; 16],
        mem: Vec<u8>,
        spi_response: Vec<u8>,
        rx: Vec<u8>,
        tx: VecDeque<u8>,
        wire: Vec<u8>,
        opbuf: Vec<QueuedOp>,
        executed: Vec<QueuedOp>,
        exec_count: usize,
        pin_states: Vec<u8>,
        spi_writes: Vec<Vec<u8>>,
        spi_freq_requests: Vec<u32>,
        nak_next_op: bool,
        bad_reply_next: Option<u8>,
    }

    impl EmuState {
        fn new() -> Self {
            let mut cmdmap = CommandMap::new();
            for cmd in 0x00..=0x17u8 {
                cmdmap.set_supported(cmd);
            }
            let mut name = [0u8; 16];
            name[..8].copy_from_slice(b"emuprog1");
            let mut mem = vec![0u8; 0x10000];
            for (i, b) in mem.iter_mut().enumerate() {
                *b = i as u8;
            }
            Self {
                cmdmap,
                iface_version: SERPROG_PROTOCOL_VERSION,
                bustypes: bus::SPI | bus::PARALLEL,
                serbuf_size: 64,
                opbuf_size: 300,
                wrn_max: Some(256),
                rdn_max: Some(4096),
                name,
                mem,
                spi_response: vec![0xEF, 0x40, 0x18],
                rx: Vec::new(),
                tx: VecDeque::new(),
                wire: Vec::new(),
                opbuf: Vec::new(),
                executed: Vec::new(),
                exec_count: 0,
                pin_states: Vec::new(),
                spi_writes: Vec::new(),
                spi_freq_requests: Vec::new(),
                nak_next_op: false,
                bad_reply_next: None,
            }
        }

        fn unsupport(&mut self, cmd: u8) {
            let byte_idx = (cmd / 8) as usize;
            self.cmdmap.bitmap[byte_idx] &= !(1 << (cmd % 8));
        }

        fn mem_at(&self, addr: u32) -> u8 {
            self.mem[addr as usize % self.mem.len()]
        }

        /// Acknowledge an operation, honoring fault injection
        fn op_reply(&mut self) -> bool {
            if let Some(b) = self.bad_reply_next.take() {
                self.tx.push_back(b);
                false
            } else if core::mem::take(&mut self.nak_next_op) {
                self.tx.push_back(S_NAK);
                false
            } else {
                self.tx.push_back(S_ACK);
                true
            }
        }

        fn push_u16(&mut self, v: u16) {
            self.tx.extend(v.to_le_bytes());
        }

        fn push_u24(&mut self, v: u32) {
            self.tx.extend(u24_bytes(v));
        }

        fn process(&mut self) {
            loop {
                let Some(&cmd) = self.rx.first() else { return };
                let need = match cmd {
                    S_CMD_S_BUSTYPE | S_CMD_S_PIN_STATE => 2,
                    S_CMD_S_SPI_FREQ => 5,
                    S_CMD_O_WRITEB | S_CMD_O_DELAY | S_CMD_O_POLL => 5,
                    S_CMD_O_POLL_DLY => 9,
                    S_CMD_R_BYTE => 4,
                    S_CMD_R_NBYTES => 7,
                    S_CMD_O_WRITEN => {
                        if self.rx.len() < 4 {
                            return;
                        }
                        7 + u24_to_u32(&[self.rx[1], self.rx[2], self.rx[3]]) as usize
                    }
                    S_CMD_O_SPIOP => {
                        if self.rx.len() < 7 {
                            return;
                        }
                        7 + u24_to_u32(&[self.rx[1], self.rx[2], self.rx[3]]) as usize
                    }
                    _ => 1,
                };
                if self.rx.len() < need {
                    return;
                }
                let frame: Vec<u8> = self.rx.drain(..need).collect();
                self.handle(&frame);
            }
        }

        fn handle(&mut self, frame: &[u8]) {
            let cmd = frame[0];
            match cmd {
                S_CMD_NOP => self.tx.push_back(S_ACK),
                S_CMD_SYNCNOP => {
                    self.tx.push_back(S_NAK);
                    self.tx.push_back(S_ACK);
                }
                _ if !self.cmdmap.is_supported(cmd) => self.tx.push_back(S_NAK),
                S_CMD_Q_IFACE => {
                    self.tx.push_back(S_ACK);
                    let v = self.iface_version;
                    self.push_u16(v);
                }
                S_CMD_Q_CMDMAP => {
                    self.tx.push_back(S_ACK);
                    let bitmap = self.cmdmap.bitmap;
                    self.tx.extend(bitmap);
                }
                S_CMD_Q_PGMNAME => {
                    self.tx.push_back(S_ACK);
                    let name = self.name;
                    self.tx.extend(name);
                }
                S_CMD_Q_SERBUF => {
                    self.tx.push_back(S_ACK);
                    let v = self.serbuf_size;
                    self.push_u16(v);
                }
                S_CMD_Q_BUSTYPE => {
                    self.tx.push_back(S_ACK);
                    let bt = self.bustypes;
                    self.tx.push_back(bt);
                }
                S_CMD_Q_OPBUF => {
                    self.tx.push_back(S_ACK);
                    let v = self.opbuf_size;
                    self.push_u16(v);
                }
                S_CMD_Q_WRNMAXLEN => match self.wrn_max {
                    Some(v) => {
                        self.tx.push_back(S_ACK);
                        self.push_u24(v);
                    }
                    None => self.tx.push_back(S_NAK),
                },
                S_CMD_Q_RDNMAXLEN => match self.rdn_max {
                    Some(v) => {
                        self.tx.push_back(S_ACK);
                        self.push_u24(v);
                    }
                    None => self.tx.push_back(S_NAK),
                },
                S_CMD_S_BUSTYPE => {
                    self.tx.push_back(S_ACK);
                }
                S_CMD_S_SPI_FREQ => {
                    let req = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
                    self.spi_freq_requests.push(req);
                    self.tx.push_back(S_ACK);
                    self.tx.extend(req.to_le_bytes());
                }
                S_CMD_S_PIN_STATE => {
                    self.pin_states.push(frame[1]);
                    self.tx.push_back(S_ACK);
                }
                S_CMD_O_INIT => {
                    self.opbuf.clear();
                    self.tx.push_back(S_ACK);
                }
                S_CMD_O_EXEC => {
                    if self.op_reply() {
                        let ops: Vec<QueuedOp> = self.opbuf.drain(..).collect();
                        for op in &ops {
                            match op {
                                QueuedOp::WriteB { addr, val } => {
                                    let idx = *addr as usize % self.mem.len();
                                    self.mem[idx] = *val;
                                }
                                QueuedOp::WriteN { addr, data } => {
                                    for (i, b) in data.iter().enumerate() {
                                        let idx = (*addr as usize + i) % self.mem.len();
                                        self.mem[idx] = *b;
                                    }
                                }
                                _ => {}
                            }
                        }
                        self.executed.extend(ops);
                        self.exec_count += 1;
                    }
                }
                S_CMD_O_WRITEB => {
                    if self.op_reply() {
                        self.opbuf.push(QueuedOp::WriteB {
                            addr: u24_to_u32(&[frame[1], frame[2], frame[3]]),
                            val: frame[4],
                        });
                    }
                }
                S_CMD_O_WRITEN => {
                    if self.op_reply() {
                        let len = u24_to_u32(&[frame[1], frame[2], frame[3]]) as usize;
                        self.opbuf.push(QueuedOp::WriteN {
                            addr: u24_to_u32(&[frame[4], frame[5], frame[6]]),
                            data: frame[7..7 + len].to_vec(),
                        });
                    }
                }
                S_CMD_O_DELAY => {
                    if self.op_reply() {
                        self.opbuf.push(QueuedOp::Delay {
                            usecs: u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]),
                        });
                    }
                }
                S_CMD_O_POLL => {
                    if self.op_reply() {
                        self.opbuf.push(QueuedOp::Poll {
                            flags: frame[1],
                            addr: u24_to_u32(&[frame[2], frame[3], frame[4]]),
                        });
                    }
                }
                S_CMD_O_POLL_DLY => {
                    if self.op_reply() {
                        self.opbuf.push(QueuedOp::PollDelay {
                            flags: frame[1],
                            addr: u24_to_u32(&[frame[2], frame[3], frame[4]]),
                            delay: u32::from_le_bytes([
                                frame[5], frame[6], frame[7], frame[8],
                            ]),
                        });
                    }
                }
                S_CMD_R_BYTE => {
                    if self.op_reply() {
                        let addr = u24_to_u32(&[frame[1], frame[2], frame[3]]);
                        let b = self.mem_at(addr);
                        self.tx.push_back(b);
                    }
                }
                S_CMD_R_NBYTES => {
                    if self.op_reply() {
                        let addr = u24_to_u32(&[frame[1], frame[2], frame[3]]);
                        let len = u24_to_u32(&[frame[4], frame[5], frame[6]]);
                        for i in 0..len {
                            let b = self.mem_at(addr + i);
                            self.tx.push_back(b);
                        }
                    }
                }
                S_CMD_O_SPIOP => {
                    if self.op_reply() {
                        let readcnt = u24_to_u32(&[frame[4], frame[5], frame[6]]) as usize;
                        self.spi_writes.push(frame[7..].to_vec());
                        for i in 0..readcnt {
                            let b = self.spi_response.get(i).copied().unwrap_or(0);
                            self.tx.push_back(b);
                        }
                    }
                }
                _ => self.tx.push_back(S_NAK),
            }
        }
    }

    /// Transport handle over the shared emulator state
    #[derive(Debug, Clone)]
    struct EmuTransport(Rc<RefCell<EmuState>>);

    impl Transport for EmuTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            let mut s = self.0.borrow_mut();
            s.wire.extend_from_slice(data);
            s.rx.extend_from_slice(data);
            s.process();
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            let mut s = self.0.borrow_mut();
            for b in buf.iter_mut() {
                *b = s
                    .tx
                    .pop_front()
                    .ok_or_else(|| SerprogError::IoError("unexpected EOF from device".into()))?;
            }
            Ok(())
        }

        fn read_nonblock(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            let mut s = self.0.borrow_mut();
            let mut n = 0;
            while n < buf.len() {
                match s.tx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_nonblock(&mut self, data: &[u8], _timeout_ms: u32) -> Result<bool> {
            self.write(data)?;
            Ok(true)
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn emu() -> Rc<RefCell<EmuState>> {
        Rc::new(RefCell::new(EmuState::new()))
    }

    fn connect(state: &Rc<RefCell<EmuState>>) -> Serprog<EmuTransport> {
        let sp = Serprog::new(EmuTransport(state.clone())).expect("init failed");
        state.borrow_mut().wire.clear();
        sp
    }

    /// Transport that never produces data; synchronization cannot succeed
    #[derive(Debug)]
    struct DeadTransport;

    impl Transport for DeadTransport {
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _buf: &mut [u8]) -> Result<()> {
            Err(SerprogError::IoError("no data".into()))
        }
        fn read_nonblock(&mut self, _buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            Ok(0)
        }
        fn write_nonblock(&mut self, _data: &[u8], _timeout_ms: u32) -> Result<bool> {
            Ok(true)
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_init_negotiation() {
        let state = emu();
        state.borrow_mut().serbuf_size = 128;
        state.borrow_mut().opbuf_size = 1024;
        let sp = connect(&state);

        let info = sp.info();
        assert_eq!(info.name_str(), "emuprog1");
        assert_eq!(info.serbuf_size, 128);
        assert_eq!(info.opbuf_size, 1024);
        assert_eq!(info.bustypes, bus::SPI | bus::PARALLEL);
        assert_eq!(info.par_max_write_n, 256);
        assert_eq!(info.par_max_read_n, 4096);
        assert_eq!(info.spi_max_write_n, 256);
        assert_eq!(sp.buses(), BusSet::SPI | BusSet::PARALLEL);
        // Output drivers came up exactly once
        assert_eq!(state.borrow().pin_states, vec![1]);
    }

    #[test]
    fn test_init_rejects_unknown_version() {
        let state = emu();
        state.borrow_mut().iface_version = 2;
        let err = Serprog::new(EmuTransport(state.clone())).unwrap_err();
        assert!(matches!(err, SerprogError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_init_defaults_buses_on_nak() {
        let state = emu();
        state.borrow_mut().unsupport(S_CMD_Q_BUSTYPE);
        let sp = connect(&state);
        assert_eq!(sp.info().bustypes, bus::NONSPI);
    }

    #[test]
    fn test_sync_failure_reported() {
        let err = Serprog::new(DeadTransport).unwrap_err();
        assert!(matches!(err, SerprogError::SyncFailed));
    }

    #[test]
    fn test_sync_on_noisy_channel() {
        let state = emu();
        // Garbage from a previous session sits in the receive path
        state
            .borrow_mut()
            .tx
            .extend([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x15, 0x06]);
        let sp = connect(&state);
        assert_eq!(sp.info().name_str(), "emuprog1");
    }

    #[test]
    fn test_spi_speed_request() {
        let state = emu();
        let sp = Serprog::with_spi_speed(EmuTransport(state.clone()), 2_000_000).unwrap();
        assert_eq!(state.borrow().spi_freq_requests, vec![2_000_000]);
        drop(sp);
    }

    #[test]
    fn test_contiguous_writes_coalesce() {
        let state = emu();
        state.borrow_mut().opbuf_size = 1024;
        let mut sp = connect(&state);

        sp.chip_writeb(0x100, 0x01).unwrap();
        sp.chip_writeb(0x101, 0x02).unwrap();
        sp.chip_writeb(0x102, 0x03).unwrap();
        // Nothing is emitted until the read forces the pending run out
        assert!(state.borrow().wire.is_empty());

        let val = sp.chip_readb(0x100).unwrap();
        assert_eq!(val, 0x01);
        assert_eq!(
            state.borrow().wire,
            vec![
                S_CMD_O_WRITEN, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x02, 0x03,
                S_CMD_O_EXEC,
                S_CMD_R_BYTE, 0x00, 0x01, 0x00,
            ]
        );
        assert_eq!(
            state.borrow().executed,
            vec![QueuedOp::WriteN {
                addr: 0x100,
                data: vec![0x01, 0x02, 0x03]
            }]
        );
    }

    #[test]
    fn test_noncontiguous_write_emits_single_writeb() {
        let state = emu();
        let mut sp = connect(&state);

        sp.chip_writeb(0x100, 0x01).unwrap();
        sp.chip_writeb(0x200, 0x02).unwrap();
        // The one-byte run went out as a plain write-byte, not a write-n
        assert_eq!(
            state.borrow().wire,
            vec![S_CMD_O_WRITEB, 0x00, 0x01, 0x00, 0x01]
        );

        sp.shutdown();
        assert_eq!(
            state.borrow().executed,
            vec![
                QueuedOp::WriteB {
                    addr: 0x100,
                    val: 0x01
                },
                QueuedOp::WriteB {
                    addr: 0x200,
                    val: 0x02
                },
            ]
        );
    }

    #[test]
    fn test_writes_without_writen_support() {
        let state = emu();
        state.borrow_mut().wrn_max = None;
        let mut sp = connect(&state);
        assert_eq!(sp.info().par_max_write_n, 0);

        sp.chip_writeb(0x100, 0x01).unwrap();
        sp.chip_writeb(0x101, 0x02).unwrap();
        // No coalescing: each write is transmitted immediately
        assert_eq!(
            state.borrow().wire,
            vec![
                S_CMD_O_WRITEB, 0x00, 0x01, 0x00, 0x01,
                S_CMD_O_WRITEB, 0x01, 0x01, 0x00, 0x02,
            ]
        );
    }

    #[test]
    fn test_full_run_emitted_at_max_writen() {
        let state = emu();
        state.borrow_mut().wrn_max = Some(4);
        let mut sp = connect(&state);

        for i in 0..4u32 {
            sp.chip_writeb(0x100 + i, i as u8).unwrap();
        }
        // The run hit max_write_n and was passed on without a flush
        assert_eq!(
            state.borrow().wire,
            vec![
                S_CMD_O_WRITEN, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03,
            ]
        );
    }

    #[test]
    fn test_opbuf_threshold_triggers_early_exec() {
        let state = emu();
        state.borrow_mut().opbuf_size = 10;
        state.borrow_mut().wrn_max = None;
        let mut sp = connect(&state);

        sp.chip_writeb(0x00, 0xAA).unwrap();
        assert_eq!(state.borrow().exec_count, 0);
        // The second write would fill the opbuf: an early exec goes first
        sp.chip_writeb(0x10, 0xBB).unwrap();
        assert_eq!(state.borrow().exec_count, 1);
        assert_eq!(
            state.borrow().executed,
            vec![QueuedOp::WriteB {
                addr: 0x00,
                val: 0xAA
            }]
        );
        assert!(sp.opbuf.usage() < sp.info().opbuf_size as u32);
    }

    #[test]
    fn test_spi_roundtrip() {
        let state = emu();
        let mut sp = connect(&state);

        let mut readarr = [0u8; 3];
        sp.spi_op(&[0x9F, 0x00], &mut readarr).unwrap();
        assert_eq!(
            state.borrow().wire,
            vec![
                S_CMD_O_SPIOP, 0x02, 0x00, 0x00, 0x03, 0x00, 0x00, 0x9F, 0x00,
            ]
        );
        assert_eq!(readarr, [0xEF, 0x40, 0x18]);
        assert_eq!(state.borrow().spi_writes, vec![vec![0x9F, 0x00]]);
    }

    #[test]
    fn test_spi_op_executes_pending_opbuf_first() {
        let state = emu();
        let mut sp = connect(&state);

        sp.chip_writeb(0x100, 0x5A).unwrap();
        sp.spi_op(&[0x05], &mut []).unwrap();
        // The queued write was passed and executed before the SPI op
        assert_eq!(
            state.borrow().executed,
            vec![QueuedOp::WriteB {
                addr: 0x100,
                val: 0x5A
            }]
        );
    }

    #[test]
    fn test_jedec_id_via_spi_master() {
        let state = emu();
        let mut sp = connect(&state);

        let (mfr, dev) = oxiflash_core::protocol::read_jedec_id(&mut sp).unwrap();
        assert_eq!(mfr, 0xEF);
        assert_eq!(dev, 0x4018);
    }

    #[test]
    fn test_poll_acceleration() {
        let state = emu();
        let mut sp = connect(&state);

        sp.chip_poll(0x1234, 0x08, 1, 0).unwrap();
        assert_eq!(
            state.borrow().wire,
            vec![S_CMD_O_POLL, 0x23, 0x34, 0x12, 0x00]
        );
        assert_eq!(
            state.borrow().opbuf,
            vec![QueuedOp::Poll {
                flags: 0x23,
                addr: 0x1234
            }]
        );
    }

    #[test]
    fn test_poll_with_delay() {
        let state = emu();
        let mut sp = connect(&state);

        sp.chip_poll(0x10, 0x01, -1, 500).unwrap();
        assert_eq!(
            state.borrow().opbuf,
            vec![QueuedOp::PollDelay {
                flags: 0x10,
                addr: 0x10,
                delay: 500
            }]
        );
    }

    #[test]
    fn test_poll_multibit_mask_falls_back() {
        let state = emu();
        state.borrow_mut().mem[2] = 0xFF;
        let mut sp = connect(&state);

        sp.chip_poll(0x02, 0x0C, 1, 0).unwrap();
        // Software fallback: a read, no queued poll op
        assert_eq!(state.borrow().wire, vec![S_CMD_R_BYTE, 0x02, 0x00, 0x00]);
        assert!(state.borrow().opbuf.is_empty());
    }

    #[test]
    fn test_poll_unavailable_falls_back() {
        let state = emu();
        state.borrow_mut().unsupport(S_CMD_O_POLL);
        state.borrow_mut().mem[2] = 0xFF;
        let mut sp = connect(&state);

        sp.chip_poll(0x02, 0x01, 1, 0).unwrap();
        assert!(state.borrow().opbuf.is_empty());
        assert_eq!(state.borrow().wire, vec![S_CMD_R_BYTE, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_poll_exec_point_at_third_of_opbuf() {
        let state = emu();
        state.borrow_mut().opbuf_size = 12;
        let mut sp = connect(&state);

        sp.chip_poll(0x00, 0x01, 0, 0).unwrap();
        // 5 bytes used >= 12/3: the natural exec point fires
        assert_eq!(state.borrow().exec_count, 1);
        assert_eq!(sp.opbuf.usage(), 0);
    }

    #[test]
    fn test_native_delay_queued() {
        let state = emu();
        let mut sp = connect(&state);

        sp.delay(1000).unwrap();
        assert_eq!(
            state.borrow().wire,
            vec![S_CMD_O_DELAY, 0xE8, 0x03, 0x00, 0x00]
        );
        assert_eq!(state.borrow().opbuf, vec![QueuedOp::Delay { usecs: 1000 }]);
    }

    #[test]
    fn test_emulated_delay_when_unsupported() {
        let state = emu();
        {
            let mut s = state.borrow_mut();
            s.bustypes = bus::SPI;
            s.unsupport(S_CMD_O_DELAY);
        }
        let mut sp = connect(&state);

        sp.delay(100).unwrap();
        // Slept locally, nothing on the wire
        assert!(state.borrow().wire.is_empty());
    }

    #[test]
    fn test_readn_chunked_by_device_limit() {
        let state = emu();
        state.borrow_mut().rdn_max = Some(4);
        let mut sp = connect(&state);

        let mut buf = [0u8; 10];
        sp.chip_readn(&mut buf, 0x20).unwrap();
        let expected: Vec<u8> = (0x20..0x2A).collect();
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(
            state.borrow().wire,
            vec![
                S_CMD_R_NBYTES, 0x20, 0x00, 0x00, 0x04, 0x00, 0x00,
                S_CMD_R_NBYTES, 0x24, 0x00, 0x00, 0x04, 0x00, 0x00,
                S_CMD_R_NBYTES, 0x28, 0x00, 0x00, 0x02, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn test_readb_returns_device_data() {
        let state = emu();
        state.borrow_mut().mem[0x1234] = 0x5A;
        let mut sp = connect(&state);
        assert_eq!(sp.chip_readb(0x1234).unwrap(), 0x5A);
    }

    #[test]
    fn test_stream_window_drains_lazily() {
        let state = emu();
        state.borrow_mut().serbuf_size = 16;
        state.borrow_mut().wrn_max = None;
        let mut sp = connect(&state);

        for i in 0..4u32 {
            sp.chip_writeb(0x1000 + i * 0x10, i as u8).unwrap();
        }
        // 16-byte window, 5-byte ops: the fourth submission had to retire
        // exactly one acknowledgement
        assert_eq!(sp.stream.inflight_ops(), 3);
        assert_eq!(sp.stream.inflight_bytes(), 15);

        sp.flush_stream().unwrap();
        assert_eq!(sp.stream.inflight_ops(), 0);
        assert_eq!(sp.stream.inflight_bytes(), 0);
    }

    #[test]
    fn test_stream_nak_names_operation() {
        let state = emu();
        let mut sp = connect(&state);

        state.borrow_mut().nak_next_op = true;
        let err = sp.chip_readb(0x00).unwrap_err();
        match err {
            SerprogError::StreamNak(name) => assert_eq!(name, "Read byte"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stream_desync_reply_reported() {
        let state = emu();
        let mut sp = connect(&state);

        state.borrow_mut().bad_reply_next = Some(0x42);
        let err = sp.chip_readb(0x00).unwrap_err();
        match err {
            SerprogError::StreamReply { op, reply } => {
                assert_eq!(op, "Read byte");
                assert_eq!(reply, 0x42);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_shutdown_flushes_and_is_idempotent() {
        let state = emu();
        let mut sp = connect(&state);

        sp.chip_writeb(0x300, 0x77).unwrap();
        sp.shutdown();
        {
            let s = state.borrow();
            assert_eq!(
                s.executed,
                vec![QueuedOp::WriteB {
                    addr: 0x300,
                    val: 0x77
                }]
            );
            assert_eq!(s.pin_states, vec![1, 0]);
            assert_eq!(s.exec_count, 1);
        }

        // Second shutdown and the implicit one from Drop are no-ops
        sp.shutdown();
        drop(sp);
        let s = state.borrow();
        assert_eq!(s.pin_states, vec![1, 0]);
        assert_eq!(s.exec_count, 1);
    }

    #[test]
    fn test_drop_disables_outputs() {
        let state = emu();
        let sp = connect(&state);
        drop(sp);
        assert_eq!(state.borrow().pin_states, vec![1, 0]);
    }

    #[test]
    fn test_map_bios_window_only() {
        let state = emu();
        let sp = connect(&state);
        assert_eq!(sp.map(0xFFFF_0000, 0x10000), Some(0xFFFF_0000));
        assert_eq!(sp.map(0xFF00_0000, 1 << 24), Some(0xFF00_0000));
        assert_eq!(sp.map(0x000F_0000, 0x10000), None);
    }

    #[test]
    fn test_mapped_addresses_truncate_to_chip_space() {
        let state = emu();
        state.borrow_mut().mem[0x5678] = 0xA5;
        let mut sp = connect(&state);
        let base = sp.map(0xFF00_0000, 1 << 24).unwrap();
        assert_eq!(sp.chip_readb(base + 0x5678).unwrap(), 0xA5);
    }
}
