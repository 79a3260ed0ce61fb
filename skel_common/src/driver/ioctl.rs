//! Control-plane command numbers and fixed-layout argument records.
//!
//! Command numbers use the Linux `_IOC` layout:
//!
//! ```text
//!  31 30 29            16 15        8 7          0
//! ┌─────┬────────────────┬───────────┬────────────┐
//! │ dir │   arg size     │   type    │   number   │
//! └─────┴────────────────┴───────────┴────────────┘
//! ```
//!
//! Standard commands use type [`SKEL_MAGIC`]; any other type is a
//! hardware-specific command and goes to the callback set unmodified.
//! Argument records are `#[repr(C)]` and travel in native byte order.

use crate::consts::{
    MAX_BLOCK_ITEMS, MAX_CLIENTS, MAX_CONNECTIONS, MAX_MAPS, MODULE_VERSION_SIZE,
};
use crate::driver::error::DriverError;
use crate::driver::types::{Connection, EventRecord, HwTime};
use static_assertions::const_assert_eq;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

/// No argument transfer.
pub const IOC_NONE: u32 = 0;
/// Caller writes the argument (driver reads it).
pub const IOC_WRITE: u32 = 1;
/// Driver writes the argument back to the caller.
pub const IOC_READ: u32 = 2;

/// Compose a command number.
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | (((size as u32) & ((1 << IOC_SIZEBITS) - 1)) << IOC_SIZESHIFT)
}

/// Command without argument.
pub const fn io(ty: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

/// Command whose argument is written by the caller.
pub const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

/// Command whose argument is filled in by the driver.
pub const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// Command with an in/out argument.
pub const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// Direction bits of `cmd`.
pub const fn ioc_dir(cmd: u32) -> u32 {
    cmd >> IOC_DIRSHIFT
}

/// Type byte of `cmd`.
pub const fn ioc_type(cmd: u32) -> u8 {
    (cmd >> IOC_TYPESHIFT) as u8
}

/// Command number within its type.
pub const fn ioc_nr(cmd: u32) -> u8 {
    (cmd >> IOC_NRSHIFT) as u8
}

/// Argument size in bytes.
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize
}

/// Reject an argument buffer that cannot hold what `cmd` transfers.
///
/// # Errors
/// `InvalidArgument` when the direction needs an argument and `arg_len` is
/// smaller than the encoded size.
pub fn check_bounds(cmd: u32, arg_len: usize) -> Result<(), DriverError> {
    let size = ioc_size(cmd);
    if ioc_dir(cmd) != IOC_NONE && arg_len < size {
        return Err(DriverError::InvalidArgument(format!(
            "{} needs {size} argument bytes, got {arg_len}",
            command_name(cmd).unwrap_or("ioctl")
        )));
    }
    Ok(())
}

// ─── Records ────────────────────────────────────────────────────────

/// Debug flags for a client; pid 0 addresses the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct DebugRecord {
    /// Target client pid (0 = caller).
    pub client_pid: u32,
    /// [`DebugFlags`](crate::driver::types::DebugFlags) bits.
    pub flags: u32,
}

/// Driver and module version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VersionRecord {
    /// Driver build date, `YYYYMMDD`.
    pub driver_version: u32,
    /// NUL-padded module version string.
    pub module_version: [u8; MODULE_VERSION_SIZE],
}

impl Default for VersionRecord {
    fn default() -> Self {
        Self {
            driver_version: 0,
            module_version: [0; MODULE_VERSION_SIZE],
        }
    }
}

impl VersionRecord {
    /// Build a record, truncating the module version to fit.
    pub fn new(driver_version: u32, module_version: &str) -> Self {
        let mut record = Self {
            driver_version,
            ..Self::default()
        };
        let bytes = module_version.as_bytes();
        let len = bytes.len().min(MODULE_VERSION_SIZE - 1);
        record.module_version[..len].copy_from_slice(&bytes[..len]);
        record
    }

    /// Module version up to the first NUL.
    pub fn module_version_str(&self) -> &str {
        let end = self
            .module_version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MODULE_VERSION_SIZE);
        std::str::from_utf8(&self.module_version[..end]).unwrap_or("")
    }
}

/// Standard and hardware-specific status words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct StatusRecord {
    /// [`StandardStatus`](crate::driver::types::StandardStatus) bits.
    pub standard: u32,
    /// Board-specific status word.
    pub hardware: u32,
}

/// Pids of all open clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ClientList {
    /// Number of valid entries in `pids`.
    pub size: u32,
    /// Client pids.
    pub pids: [u32; MAX_CLIENTS],
}

impl Default for ClientList {
    fn default() -> Self {
        Self {
            size: 0,
            pids: [0; MAX_CLIENTS],
        }
    }
}

/// Connections of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ClientConnections {
    /// Client pid (0 = caller). Written by the caller.
    pub pid: u32,
    /// Number of valid entries in `connections`.
    pub size: u32,
    /// Module and source mask pairs.
    pub connections: [Connection; MAX_CONNECTIONS],
}

/// Single register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RawIoBlock {
    /// Address space number.
    pub space: u32,
    /// Byte offset within the space.
    pub offset: u32,
    /// Access width in bits (8/16/32). Zero uses the space's width.
    pub width: u32,
    /// Value read or to be written.
    pub data: u32,
}

/// Block register transfer of `count` items.
///
/// Item `i` lives at `offset + i * increment * width / 8`: an increment of
/// 0 hits one address repeatedly (a FIFO), 1 walks contiguous registers and
/// larger values skip between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawIoTransfer {
    /// Address space number.
    pub space: u32,
    /// Byte offset of the first item.
    pub offset: u32,
    /// Access width in bits (8/16/32). Zero uses the space's width.
    pub width: u32,
    /// Address step per item, in items.
    pub increment: u32,
    /// Items to move. Zero moves one.
    pub count: u32,
    /// One item per word, low bits significant.
    pub data: [u32; MAX_BLOCK_ITEMS],
}

impl Default for RawIoTransfer {
    fn default() -> Self {
        Self {
            space: 0,
            offset: 0,
            width: 0,
            increment: 1,
            count: 0,
            data: [0; MAX_BLOCK_ITEMS],
        }
    }
}

impl RawIoTransfer {
    /// Number of items the transfer moves.
    ///
    /// # Errors
    /// `InvalidArgument` if `count` exceeds [`MAX_BLOCK_ITEMS`].
    pub fn items(&self) -> Result<usize, DriverError> {
        match self.count as usize {
            0 => Ok(1),
            n if n <= MAX_BLOCK_ITEMS => Ok(n),
            n => Err(DriverError::InvalidArgument(format!(
                "block of {n} items exceeds {MAX_BLOCK_ITEMS}"
            ))),
        }
    }
}

/// One mapped address space of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MapInfo {
    /// Address space number.
    pub space_number: u32,
    /// Bus base address.
    pub base_address: u32,
    /// Window size in bytes.
    pub window_size: u32,
    /// Default data width in bits.
    pub data_width: u32,
}

/// Address-space map of the selected module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ModuleMaps {
    /// Number of valid entries in `maps`.
    pub count: u32,
    /// Mapped spaces.
    pub maps: [MapInfo; MAX_MAPS],
}

const_assert_eq!(core::mem::size_of::<DebugRecord>(), 8);
const_assert_eq!(core::mem::size_of::<VersionRecord>(), 4 + MODULE_VERSION_SIZE);
const_assert_eq!(core::mem::size_of::<StatusRecord>(), 8);
const_assert_eq!(core::mem::size_of::<ClientList>(), 4 + 4 * MAX_CLIENTS);
const_assert_eq!(core::mem::size_of::<ClientConnections>(), 8 + 8 * MAX_CONNECTIONS);
const_assert_eq!(core::mem::size_of::<RawIoBlock>(), 16);
const_assert_eq!(core::mem::size_of::<RawIoTransfer>(), 20 + 4 * MAX_BLOCK_ITEMS);
const_assert_eq!(core::mem::size_of::<ModuleMaps>(), 4 + 16 * MAX_MAPS);

// ─── Wire encoding ──────────────────────────────────────────────────

/// Fixed-size record exchanged through a control-command argument buffer.
pub trait WireRecord: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `buf`.
    fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::SIZE, buf.len()));
        }
        Ok(Self::read(&mut WireReader { buf, pos: 0 }))
    }

    /// Encode into the first `SIZE` bytes of `buf`.
    fn encode(&self, buf: &mut [u8]) -> Result<(), DriverError> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::SIZE, buf.len()));
        }
        self.write(&mut WireWriter { buf, pos: 0 });
        Ok(())
    }

    /// Read fields in declaration order. The buffer is long enough.
    fn read(r: &mut WireReader<'_>) -> Self;

    /// Write fields in declaration order. The buffer is long enough.
    fn write(&self, w: &mut WireWriter<'_>);
}

fn short_buffer(need: usize, got: usize) -> DriverError {
    DriverError::InvalidArgument(format!("argument buffer too short: need {need}, got {got}"))
}

/// Sequential native-endian field reader.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl WireReader<'_> {
    /// Next `u32` field.
    pub fn u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_ne_bytes(bytes)
    }

    /// Next `n` raw bytes.
    pub fn bytes(&mut self, out: &mut [u8]) {
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
    }
}

/// Sequential native-endian field writer.
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl WireWriter<'_> {
    /// Append a `u32` field.
    pub fn u32(&mut self, value: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_ne_bytes());
        self.pos += 4;
    }

    /// Append raw bytes.
    pub fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }
}

impl WireRecord for u32 {
    const SIZE: usize = 4;

    fn read(r: &mut WireReader<'_>) -> Self {
        r.u32()
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(*self);
    }
}

impl WireRecord for Connection {
    const SIZE: usize = 8;

    fn read(r: &mut WireReader<'_>) -> Self {
        Self {
            module: r.u32(),
            mask: r.u32(),
        }
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.module);
        w.u32(self.mask);
    }
}

impl WireRecord for EventRecord {
    const SIZE: usize = 16;

    fn read(r: &mut WireReader<'_>) -> Self {
        Self {
            module: r.u32(),
            source_mask: r.u32(),
            time: HwTime {
                second: r.u32(),
                nanosecond: r.u32(),
            },
        }
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.module);
        w.u32(self.source_mask);
        w.u32(self.time.second);
        w.u32(self.time.nanosecond);
    }
}

impl WireRecord for DebugRecord {
    const SIZE: usize = 8;

    fn read(r: &mut WireReader<'_>) -> Self {
        Self {
            client_pid: r.u32(),
            flags: r.u32(),
        }
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.client_pid);
        w.u32(self.flags);
    }
}

impl WireRecord for VersionRecord {
    const SIZE: usize = 4 + MODULE_VERSION_SIZE;

    fn read(r: &mut WireReader<'_>) -> Self {
        let mut record = Self {
            driver_version: r.u32(),
            ..Self::default()
        };
        r.bytes(&mut record.module_version);
        record
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.driver_version);
        w.bytes(&self.module_version);
    }
}

impl WireRecord for StatusRecord {
    const SIZE: usize = 8;

    fn read(r: &mut WireReader<'_>) -> Self {
        Self {
            standard: r.u32(),
            hardware: r.u32(),
        }
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.standard);
        w.u32(self.hardware);
    }
}

impl WireRecord for ClientList {
    const SIZE: usize = 4 + 4 * MAX_CLIENTS;

    fn read(r: &mut WireReader<'_>) -> Self {
        let mut list = Self {
            size: r.u32(),
            ..Self::default()
        };
        for pid in list.pids.iter_mut() {
            *pid = r.u32();
        }
        list
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.size);
        for pid in &self.pids {
            w.u32(*pid);
        }
    }
}

impl WireRecord for ClientConnections {
    const SIZE: usize = 8 + Connection::SIZE * MAX_CONNECTIONS;

    fn read(r: &mut WireReader<'_>) -> Self {
        let mut record = Self {
            pid: r.u32(),
            size: r.u32(),
            ..Self::default()
        };
        for conn in record.connections.iter_mut() {
            *conn = Connection::read(r);
        }
        record
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.pid);
        w.u32(self.size);
        for conn in &self.connections {
            conn.write(w);
        }
    }
}

impl WireRecord for RawIoBlock {
    const SIZE: usize = 16;

    fn read(r: &mut WireReader<'_>) -> Self {
        Self {
            space: r.u32(),
            offset: r.u32(),
            width: r.u32(),
            data: r.u32(),
        }
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.space);
        w.u32(self.offset);
        w.u32(self.width);
        w.u32(self.data);
    }
}

impl WireRecord for RawIoTransfer {
    const SIZE: usize = 20 + 4 * MAX_BLOCK_ITEMS;

    fn read(r: &mut WireReader<'_>) -> Self {
        let mut block = Self {
            space: r.u32(),
            offset: r.u32(),
            width: r.u32(),
            increment: r.u32(),
            count: r.u32(),
            ..Self::default()
        };
        for word in block.data.iter_mut() {
            *word = r.u32();
        }
        block
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.space);
        w.u32(self.offset);
        w.u32(self.width);
        w.u32(self.increment);
        w.u32(self.count);
        for word in &self.data {
            w.u32(*word);
        }
    }
}

impl WireRecord for ModuleMaps {
    const SIZE: usize = 4 + 16 * MAX_MAPS;

    fn read(r: &mut WireReader<'_>) -> Self {
        let mut record = Self {
            count: r.u32(),
            ..Self::default()
        };
        for map in record.maps.iter_mut() {
            *map = MapInfo {
                space_number: r.u32(),
                base_address: r.u32(),
                window_size: r.u32(),
                data_width: r.u32(),
            };
        }
        record
    }

    fn write(&self, w: &mut WireWriter<'_>) {
        w.u32(self.count);
        for map in &self.maps {
            w.u32(map.space_number);
            w.u32(map.base_address);
            w.u32(map.window_size);
            w.u32(map.data_width);
        }
    }
}

// ─── Standard command table ─────────────────────────────────────────

/// Type byte of the standard commands.
pub const SKEL_MAGIC: u8 = b'#';

/// Set debug flags of a client.
pub const SKEL_SET_DEBUG: u32 = iow(SKEL_MAGIC, 0, DebugRecord::SIZE);
/// Get debug flags of a client.
pub const SKEL_GET_DEBUG: u32 = iowr(SKEL_MAGIC, 1, DebugRecord::SIZE);
/// Driver and module version.
pub const SKEL_GET_VERSION: u32 = ior(SKEL_MAGIC, 2, VersionRecord::SIZE);
/// Set the caller's read timeout in milliseconds.
pub const SKEL_SET_TIMEOUT: u32 = iow(SKEL_MAGIC, 3, 4);
/// Get the caller's read timeout.
pub const SKEL_GET_TIMEOUT: u32 = ior(SKEL_MAGIC, 4, 4);
/// Set queue-off mode (1 = off, discard stale events before each read).
pub const SKEL_SET_QUEUE_FLAG: u32 = iow(SKEL_MAGIC, 5, 4);
/// Get queue-off mode.
pub const SKEL_GET_QUEUE_FLAG: u32 = ior(SKEL_MAGIC, 6, 4);
/// Number of queued events.
pub const SKEL_GET_QUEUE_SIZE: u32 = ior(SKEL_MAGIC, 7, 4);
/// Number of lost events; the counter is cleared.
pub const SKEL_GET_QUEUE_OVERFLOW: u32 = ior(SKEL_MAGIC, 8, 4);
/// Select the working module.
pub const SKEL_SET_MODULE: u32 = iow(SKEL_MAGIC, 9, 4);
/// Get the working module.
pub const SKEL_GET_MODULE: u32 = ior(SKEL_MAGIC, 10, 4);
/// Number of installed modules.
pub const SKEL_GET_MODULE_COUNT: u32 = ior(SKEL_MAGIC, 11, 4);
/// Address-space map of the working module.
pub const SKEL_GET_MODULE_MAPS: u32 = ior(SKEL_MAGIC, 12, ModuleMaps::SIZE);
/// Connect to interrupt sources.
pub const SKEL_CONNECT: u32 = iow(SKEL_MAGIC, 13, Connection::SIZE);
/// Disconnect from interrupt sources.
pub const SKEL_DISCONNECT: u32 = iow(SKEL_MAGIC, 14, Connection::SIZE);
/// Pids of open clients.
pub const SKEL_GET_CLIENT_LIST: u32 = ior(SKEL_MAGIC, 15, ClientList::SIZE);
/// Connections of a client.
pub const SKEL_GET_CLIENT_CONNECTIONS: u32 = iowr(SKEL_MAGIC, 16, ClientConnections::SIZE);
/// Enable (1) or disable (0) the working module.
pub const SKEL_ENABLE: u32 = iow(SKEL_MAGIC, 17, 4);
/// Reset the working module.
pub const SKEL_RESET: u32 = io(SKEL_MAGIC, 18);
/// Status of the working module.
pub const SKEL_GET_STATUS: u32 = ior(SKEL_MAGIC, 19, StatusRecord::SIZE);
/// Status of the working module; transient faults are cleared.
pub const SKEL_GET_CLEAR_STATUS: u32 = ior(SKEL_MAGIC, 20, StatusRecord::SIZE);
/// Read one register.
pub const SKEL_RAW_READ: u32 = iowr(SKEL_MAGIC, 21, RawIoBlock::SIZE);
/// Write one register.
pub const SKEL_RAW_WRITE: u32 = iowr(SKEL_MAGIC, 22, RawIoBlock::SIZE);
/// Open exclusive firmware access.
pub const SKEL_JTAG_OPEN: u32 = io(SKEL_MAGIC, 23);
/// Read one firmware byte.
pub const SKEL_JTAG_READ_BYTE: u32 = ior(SKEL_MAGIC, 24, 4);
/// Write one firmware byte.
pub const SKEL_JTAG_WRITE_BYTE: u32 = iow(SKEL_MAGIC, 25, 4);
/// Close exclusive firmware access and reset the module.
pub const SKEL_JTAG_CLOSE: u32 = io(SKEL_MAGIC, 26);
/// Read a block of registers.
pub const SKEL_RAW_BLOCK_READ: u32 = iowr(SKEL_MAGIC, 27, RawIoTransfer::SIZE);
/// Write a block of registers.
pub const SKEL_RAW_BLOCK_WRITE: u32 = iow(SKEL_MAGIC, 28, RawIoTransfer::SIZE);
/// First unused standard command number.
pub const SKEL_LAST_STANDARD: u8 = 29;

const STANDARD_NAMES: [&str; SKEL_LAST_STANDARD as usize] = [
    "SET_DEBUG",
    "GET_DEBUG",
    "GET_VERSION",
    "SET_TIMEOUT",
    "GET_TIMEOUT",
    "SET_QUEUE_FLAG",
    "GET_QUEUE_FLAG",
    "GET_QUEUE_SIZE",
    "GET_QUEUE_OVERFLOW",
    "SET_MODULE",
    "GET_MODULE",
    "GET_MODULE_COUNT",
    "GET_MODULE_MAPS",
    "CONNECT",
    "DISCONNECT",
    "GET_CLIENT_LIST",
    "GET_CLIENT_CONNECTIONS",
    "ENABLE",
    "RESET",
    "GET_STATUS",
    "GET_CLEAR_STATUS",
    "RAW_READ",
    "RAW_WRITE",
    "JTAG_OPEN",
    "JTAG_READ_BYTE",
    "JTAG_WRITE_BYTE",
    "JTAG_CLOSE",
    "RAW_BLOCK_READ",
    "RAW_BLOCK_WRITE",
];

/// Name of a standard command, `None` for other types or unknown numbers.
pub fn command_name(cmd: u32) -> Option<&'static str> {
    if ioc_type(cmd) != SKEL_MAGIC {
        return None;
    }
    STANDARD_NAMES.get(ioc_nr(cmd) as usize).copied()
}
