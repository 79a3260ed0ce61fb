//! Prelude module for common re-exports.
//!
//! ```rust
//! use skel_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig, Validate};
pub use crate::driver::config::{DriverConfig, DriverSettings, ModuleConfig};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::driver::error::{DriverError, HwError};

// ─── Back-end contracts ─────────────────────────────────────────────
pub use crate::driver::backend::{
    BackendFactory, BusBackend, HardwareCallbacks, InterruptHandler, MappedSpace, ModuleIo,
};

// ─── Data types ─────────────────────────────────────────────────────
pub use crate::driver::types::{
    ClientId, ClientInfo, ClientSet, Connection, DataWidth, DebugFlags, EventRecord,
    HardwareStatus, HwTime, InterruptSource, ModuleState, StandardStatus,
};
