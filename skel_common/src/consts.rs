//! System-wide constants for the skel workspace.
//!
//! Single source of truth for all fixed capacities and defaults.
//! Runtime limits taken from the configuration may be lower, never higher.

/// Maximum number of installed modules per driver.
pub const MAX_MODULES: usize = 32;

/// Maximum number of simultaneously open clients.
///
/// Client sets are stored as `u64` bitmaps, so this cannot exceed 64.
pub const MAX_CLIENTS: usize = 64;

/// Number of interrupt sources per module (one bit each in a `u32` mask).
pub const MAX_INTERRUPTS: usize = 32;

/// Maximum event queue depth per client.
pub const MAX_QUEUE_SIZE: usize = 256;

/// Maximum connections returned by one GET_CLIENT_CONNECTIONS call.
pub const MAX_CONNECTIONS: usize = 16;

/// Maximum address-space entries returned by GET_MODULE_MAPS.
pub const MAX_MAPS: usize = 10;

/// Maximum address spaces per module.
pub const MAX_SPACES: usize = 8;

/// Maximum items moved by one RAW_BLOCK_READ or RAW_BLOCK_WRITE.
pub const MAX_BLOCK_ITEMS: usize = 64;

/// Size of the module version string in the GET_VERSION record.
pub const MODULE_VERSION_SIZE: usize = 64;

/// Default number of client slots.
pub const DEFAULT_CLIENT_CAPACITY: usize = 32;

/// Default event queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default client read timeout in milliseconds (0 = wait forever).
pub const DEFAULT_CLIENT_TIMEOUT_MS: u32 = 2000;

/// Default module lock timeout in milliseconds (0 = wait forever).
pub const DEFAULT_MODULE_TIMEOUT_MS: u32 = 100;

/// Driver version reported by GET_VERSION (build date, `YYYYMMDD`).
pub const DRIVER_VERSION: u32 = 2026_10_16;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/skel/driver.toml";
