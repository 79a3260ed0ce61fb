//! Core driver data types.
//!
//! Identifiers, status/debug bitflags and the fixed-layout records shared by
//! the driver core, hardware back-ends and clients.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::MAX_CLIENTS;

/// Client identifier: the index of the client's slot in the client table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Clients are numbered from 1 in log output, like minor devices.
        write!(f, "client#{}", self.0 + 1)
    }
}

/// Set of clients, one bit per client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ClientSet(u64);

const_assert_eq!(MAX_CLIENTS, u64::BITS as usize);

impl ClientSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Raw bitmap.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether no client is in the set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of clients in the set.
    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether `client` is a member.
    #[inline]
    pub const fn contains(self, client: ClientId) -> bool {
        client.0 < MAX_CLIENTS && self.0 & (1 << client.0) != 0
    }

    /// Add `client`. Returns `true` if it was not already present.
    #[inline]
    pub fn insert(&mut self, client: ClientId) -> bool {
        debug_assert!(client.0 < MAX_CLIENTS);
        let bit = 1u64 << client.0;
        let added = self.0 & bit == 0;
        self.0 |= bit;
        added
    }

    /// Remove `client`. Returns `true` if it was present.
    #[inline]
    pub fn remove(&mut self, client: ClientId) -> bool {
        if client.0 >= MAX_CLIENTS {
            return false;
        }
        let bit = 1u64 << client.0;
        let present = self.0 & bit != 0;
        self.0 &= !bit;
        present
    }

    /// Iterate members in ascending slot order.
    pub fn iter(self) -> impl Iterator<Item = ClientId> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let idx = rest.trailing_zeros() as usize;
            rest &= rest - 1;
            Some(ClientId(idx))
        })
    }
}

/// Iterate the bit positions set in an interrupt-source mask.
pub fn mask_bits(mask: u32) -> impl Iterator<Item = usize> {
    let mut rest = mask;
    std::iter::from_fn(move || {
        if rest == 0 {
            return None;
        }
        let idx = rest.trailing_zeros() as usize;
        rest &= rest - 1;
        Some(idx)
    })
}

/// Hardware time stamp (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(C)]
pub struct HwTime {
    /// UTC second. Zero means "time not available".
    pub second: u32,
    /// Nanosecond within the second.
    pub nanosecond: u32,
}

impl HwTime {
    /// Host wall-clock time, for back-ends without a hardware clock.
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            second: since.as_secs() as u32,
            nanosecond: since.subsec_nanos(),
        }
    }
}

/// Module number plus interrupt-source mask.
///
/// Module 0 means "the caller's selected module"; a zero mask means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Connection {
    /// Module number (1..n), or 0 for the selected module.
    pub module: u32,
    /// Interrupt-source bitmask.
    pub mask: u32,
}

/// One interrupt occurrence delivered to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct EventRecord {
    /// Interrupting module.
    pub module: u32,
    /// Single interrupt-source bit.
    pub source_mask: u32,
    /// Hardware time of the interrupt.
    pub time: HwTime,
}

const_assert_eq!(core::mem::size_of::<HwTime>(), 8);
const_assert_eq!(core::mem::size_of::<Connection>(), 8);
const_assert_eq!(core::mem::size_of::<EventRecord>(), 16);

bitflags! {
    /// Standard module status. The framework owns the software flags; the
    /// hardware status hook may contribute IDLE/BUSY/READY and failures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StandardStatus: u32 {
        /// No interrupt handler installed.
        const NO_ISR        = 0x001;
        /// Bus error reported by the hardware itself.
        const BUS_ERROR     = 0x002;
        /// Hardware is not enabled.
        const DISABLED      = 0x004;
        /// Hardware has failed.
        const HARDWARE_FAIL = 0x008;
        /// Hardware watchdog time-out.
        const WATCH_DOG     = 0x010;
        /// Bus fault caught on a register access.
        const BUS_FAULT     = 0x020;
        /// Firmware (JTAG/flash) access is open.
        const FLASH_OPEN    = 0x040;
        /// Emulation mode, no hardware access.
        const EMULATION     = 0x080;
        /// No hardware has been mapped.
        const NO_HARDWARE   = 0x100;
        /// Idle.
        const IDLE          = 0x200;
        /// Busy.
        const BUSY          = 0x400;
        /// Data ready.
        const READY         = 0x800;
        /// Hardware debug mode.
        const HARDWARE_DBUG = 0x1000;
    }
}

impl StandardStatus {
    /// Fault flags cleared by a successful reset or GET_CLEAR_STATUS.
    pub const TRANSIENT: Self = Self::from_bits_truncate(
        Self::BUS_ERROR.bits()
            | Self::HARDWARE_FAIL.bits()
            | Self::WATCH_DOG.bits()
            | Self::BUS_FAULT.bits(),
    );

    /// Flags the hardware status hook is allowed to report.
    pub const HARDWARE_REPORTED: Self = Self::from_bits_truncate(
        Self::BUS_ERROR.bits()
            | Self::HARDWARE_FAIL.bits()
            | Self::WATCH_DOG.bits()
            | Self::IDLE.bits()
            | Self::BUSY.bits()
            | Self::READY.bits()
            | Self::HARDWARE_DBUG.bits(),
    );
}

/// Coarse module state derived from [`StandardStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    /// Normal operation.
    Operational,
    /// A bus fault was caught; cleared by reset.
    BusFault,
    /// Hardware disabled.
    Disabled,
    /// Exclusive firmware access in progress.
    FlashOpen,
}

impl From<StandardStatus> for ModuleState {
    fn from(status: StandardStatus) -> Self {
        if status.contains(StandardStatus::FLASH_OPEN) {
            Self::FlashOpen
        } else if status.contains(StandardStatus::BUS_FAULT) {
            Self::BusFault
        } else if status.contains(StandardStatus::DISABLED) {
            Self::Disabled
        } else {
            Self::Operational
        }
    }
}

bitflags! {
    /// Per-client and per-module debug options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Assertion violations.
        const ASSERTION   = 0x01;
        /// Trace every control command.
        const TRACE       = 0x02;
        /// Client warnings.
        const WARNING     = 0x04;
        /// Module warnings.
        const MODULE      = 0x08;
        /// Everything.
        const INFORMATION = 0x10;
        /// Emulation on, no hardware.
        const EMULATION   = 0x100;
    }
}

impl DebugFlags {
    /// Name of the lowest flag set, for log prefixes.
    pub fn name(self) -> &'static str {
        const NAMES: [(DebugFlags, &str); 6] = [
            (DebugFlags::ASSERTION, "AssertionViolation"),
            (DebugFlags::TRACE, "IoctlTrace"),
            (DebugFlags::WARNING, "ClientWarning"),
            (DebugFlags::MODULE, "ModuleWarning"),
            (DebugFlags::INFORMATION, "Information"),
            (DebugFlags::EMULATION, "EmulationOn"),
        ];
        NAMES
            .iter()
            .find(|(flag, _)| self.contains(*flag))
            .map_or(NAMES[0].1, |(_, name)| name)
    }
}

/// Register access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataWidth {
    /// 8-bit access.
    D8,
    /// 16-bit access.
    D16,
    /// 32-bit access.
    D32,
}

impl DataWidth {
    /// Width from a bit count (8, 16 or 32).
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::D8),
            16 => Some(Self::D16),
            32 => Some(Self::D32),
            _ => None,
        }
    }

    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::D8 => 8,
            Self::D16 => 16,
            Self::D32 => 32,
        }
    }

    /// Width in bytes.
    pub const fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Largest value representable at this width.
    pub const fn max_value(self) -> u32 {
        match self {
            Self::D8 => 0xFF,
            Self::D16 => 0xFFFF,
            Self::D32 => u32::MAX,
        }
    }
}

/// Byte order of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    /// Big endian (all VME modules).
    #[default]
    Big,
    /// Little endian.
    Little,
}

/// Carrier bus of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// VME crate module.
    Vme,
    /// PCI card.
    Pci,
    /// PMC mezzanine (PCI protocol).
    Pmc,
    /// Piggy-back on a carrier board.
    Carrier,
}

/// Status reported by the hardware status hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareStatus {
    /// Standard flags derived from the hardware (masked by
    /// [`StandardStatus::HARDWARE_REPORTED`]).
    pub standard: StandardStatus,
    /// Board-specific status word.
    pub raw: u32,
}

/// Pending interrupt sources read (and acknowledged) from a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptSource {
    /// Time of the interrupt.
    pub time: HwTime,
    /// Active source bits.
    pub mask: u32,
}

/// What the control plane knows about the calling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client slot.
    pub id: ClientId,
    /// Owning process id.
    pub pid: u32,
    /// Selected module number (0 if none installed).
    pub module: u32,
}
