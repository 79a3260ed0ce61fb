//! Driver and hardware error types.
//!
//! - `DriverError` - everything a client call can fail with
//! - `HwError` - what a bus back-end or callback set reports

use crate::config::ConfigError;
use thiserror::Error;

/// Error returned by hardware back-ends and callback sets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// A register access faulted on the bus.
    #[error("bus fault in space {space:#x} at offset {offset:#x}")]
    BusFault {
        /// Address space number.
        space: u32,
        /// Byte offset within the space.
        offset: u32,
    },

    /// The callback set does not implement this operation.
    #[error("not implemented")]
    NotImplemented,

    /// Any other hardware failure.
    #[error("hardware failure: {0}")]
    Failed(String),
}

/// Error returned by driver operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Malformed or out-of-range argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Module number is not installed.
    #[error("No such module: {0}")]
    NoSuchModule(u32),

    /// Client id or pid does not match an open client.
    #[error("No such client: {0}")]
    NoSuchClient(usize),

    /// Address space is not mapped for the module.
    #[error("No such address space: {0:#x}")]
    NoSuchAddressSpace(u32),

    /// The module (or driver) is locked by someone else.
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Blocking wait elapsed.
    #[error("Timed out")]
    Timeout,

    /// Blocking wait was cancelled.
    #[error("Interrupted")]
    Interrupted,

    /// Register access or interrupt acknowledge faulted.
    #[error("Hardware fault on module {module}: {detail}")]
    HardwareFault {
        /// Module the fault belongs to.
        module: u32,
        /// Underlying back-end error.
        detail: HwError,
    },

    /// Command is not handled by the driver or the callback set.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Driver is not installed or has no modules.
    #[error("No device installed")]
    NoDevice,

    /// A fixed-capacity table is full.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// A callback set hook failed.
    #[error("Hardware hook failed: {0}")]
    HookFailed(String),

    /// Configuration could not be loaded or validated.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DriverError {
    /// POSIX errno equivalent, for callers that speak the C control plane.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSuchModule(_) => libc::ENODEV,
            Self::NoSuchClient(_) => libc::EBADF,
            Self::NoSuchAddressSpace(_) => libc::ENXIO,
            Self::Busy(_) => libc::EBUSY,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Interrupted => libc::EINTR,
            Self::HardwareFault { .. } => libc::ENXIO,
            Self::NotSupported(_) => libc::ENOTTY,
            Self::NoDevice => libc::ENODEV,
            Self::Capacity(_) => libc::ENOMEM,
            Self::HookFailed(_) => libc::EIO,
            Self::Config(_) => libc::EINVAL,
        }
    }

    /// Wrap a hook failure. `NotImplemented` becomes `NotSupported(what)`.
    pub fn from_hook(what: &str, err: HwError) -> Self {
        match err {
            HwError::NotImplemented => Self::NotSupported(what.to_string()),
            HwError::Failed(msg) => Self::HookFailed(format!("{what}: {msg}")),
            HwError::BusFault { space, offset } => {
                Self::HookFailed(format!("{what}: bus fault in space {space:#x} at {offset:#x}"))
            }
        }
    }
}
