//! Driver installation configuration.
//!
//! ```toml
//! [shared]
//! service_name = "ctrv"
//!
//! [driver]
//! backend = "simulation"
//! queue_capacity = 32
//!
//! [[modules]]
//! module_number = 1
//! bus = "vme"
//! isr = { vector = 0xB8, level = 2 }
//!
//! [[modules.spaces]]
//! space_number = 0x39
//! base_address = 0xC00000
//! window_size = 0x10000
//! data_width = 16
//! ```

use crate::config::{ConfigError, SharedConfig, Validate};
use crate::consts::{
    DEFAULT_CLIENT_CAPACITY, DEFAULT_CLIENT_TIMEOUT_MS, DEFAULT_MODULE_TIMEOUT_MS,
    DEFAULT_QUEUE_CAPACITY, MAX_CLIENTS, MAX_MODULES, MAX_QUEUE_SIZE, MAX_SPACES,
};
use crate::driver::types::{BusType, DataWidth, DebugFlags, Endian};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Complete driver configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Common fields (log level, service name).
    pub shared: SharedConfig,

    /// Driver-wide settings.
    #[serde(default)]
    pub driver: DriverSettings,

    /// Installed modules, in install order.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Driver-wide settings (`[driver]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Back-end name looked up in the back-end registry.
    pub backend: String,

    /// Debug flag bits applied to every module at install.
    pub debug_flags: u32,

    /// Install every module without hardware access.
    pub emulation: bool,

    /// Number of client slots.
    pub client_capacity: usize,

    /// Event queue depth per client.
    pub queue_capacity: usize,

    /// Default client read timeout in milliseconds (0 = forever).
    pub client_timeout_ms: u32,

    /// Module lock timeout in milliseconds (0 = forever).
    pub module_timeout_ms: u32,

    /// Discard queued events when a read times out.
    pub discard_on_timeout: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            backend: "simulation".to_string(),
            debug_flags: 0,
            emulation: false,
            client_capacity: DEFAULT_CLIENT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
            module_timeout_ms: DEFAULT_MODULE_TIMEOUT_MS,
            discard_on_timeout: true,
        }
    }
}

impl DriverSettings {
    /// Debug flags as typed bits; unknown bits are dropped.
    pub fn debug(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.debug_flags)
    }

    /// Whether modules run without hardware.
    pub fn emulated(&self) -> bool {
        self.emulation || self.debug().contains(DebugFlags::EMULATION)
    }
}

/// One module (`[[modules]]` entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Logical module number, 1..=MAX_MODULES.
    pub module_number: u32,

    /// Carrier bus.
    pub bus: BusType,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Interrupt wiring; `None` installs the module without an ISR.
    #[serde(default)]
    pub isr: Option<IsrConfig>,

    /// Address spaces to map.
    #[serde(default)]
    pub spaces: Vec<AddressSpaceConfig>,
}

/// Interrupt vector and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsrConfig {
    /// Interrupt vector.
    pub vector: u32,
    /// Interrupt level.
    pub level: u32,
}

/// One address space of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceConfig {
    /// Address space number (e.g. VME address modifier 0x39, 0x29).
    pub space_number: u32,

    /// Bus base address.
    pub base_address: u32,

    /// Window size in bytes.
    pub window_size: u32,

    /// Default data width in bits (8, 16 or 32).
    pub data_width: u32,

    /// Byte order.
    #[serde(default)]
    pub endian: Endian,

    /// Unmap after the module init hook has run.
    #[serde(default)]
    pub free_after_init: bool,
}

impl AddressSpaceConfig {
    /// Typed data width. Only meaningful after validation.
    pub fn width(&self) -> DataWidth {
        DataWidth::from_bits(self.data_width).unwrap_or(DataWidth::D32)
    }
}

impl Validate for DriverConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let d = &self.driver;
        if d.backend.trim().is_empty() {
            return Err(invalid("driver.backend cannot be empty"));
        }
        if d.client_capacity == 0 || d.client_capacity > MAX_CLIENTS {
            return Err(invalid(format!(
                "driver.client_capacity must be 1..={MAX_CLIENTS}, got {}",
                d.client_capacity
            )));
        }
        if d.queue_capacity == 0 || d.queue_capacity > MAX_QUEUE_SIZE {
            return Err(invalid(format!(
                "driver.queue_capacity must be 1..={MAX_QUEUE_SIZE}, got {}",
                d.queue_capacity
            )));
        }

        if self.modules.is_empty() {
            return Err(invalid("at least one module must be configured"));
        }
        if self.modules.len() > MAX_MODULES {
            return Err(invalid(format!(
                "{} modules configured, at most {MAX_MODULES} supported",
                self.modules.len()
            )));
        }

        let mut numbers = HashSet::new();
        for module in &self.modules {
            module.validate()?;
            if !numbers.insert(module.module_number) {
                return Err(invalid(format!(
                    "duplicate module_number {}",
                    module.module_number
                )));
            }
        }
        Ok(())
    }
}

impl Validate for ModuleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let n = self.module_number;
        if n == 0 || n as usize > MAX_MODULES {
            return Err(invalid(format!(
                "module_number must be 1..={MAX_MODULES}, got {n}"
            )));
        }
        if self.spaces.len() > MAX_SPACES {
            return Err(invalid(format!(
                "module {n}: {} address spaces, at most {MAX_SPACES}",
                self.spaces.len()
            )));
        }
        let mut seen = HashSet::new();
        for space in &self.spaces {
            if DataWidth::from_bits(space.data_width).is_none() {
                return Err(invalid(format!(
                    "module {n}: space {:#x} data_width must be 8, 16 or 32, got {}",
                    space.space_number, space.data_width
                )));
            }
            if space.window_size == 0 {
                return Err(invalid(format!(
                    "module {n}: space {:#x} window_size cannot be zero",
                    space.space_number
                )));
            }
            if !seen.insert(space.space_number) {
                return Err(invalid(format!(
                    "module {n}: duplicate space_number {:#x}",
                    space.space_number
                )));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    const MINIMAL: &str = r#"
[shared]
service_name = "ctrv"

[[modules]]
module_number = 1
bus = "vme"
"#;

    #[test]
    fn defaults_applied() {
        let config = DriverConfig::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.driver.backend, "simulation");
        assert_eq!(config.driver.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.driver.client_timeout_ms, DEFAULT_CLIENT_TIMEOUT_MS);
        assert!(config.driver.discard_on_timeout);
        assert!(config.modules[0].isr.is_none());
        assert!(config.modules[0].spaces.is_empty());
    }

    #[test]
    fn emulation_from_debug_flags() {
        let mut settings = DriverSettings::default();
        assert!(!settings.emulated());
        settings.debug_flags = DebugFlags::EMULATION.bits();
        assert!(settings.emulated());
    }

    #[test]
    fn rejects_module_zero() {
        let text = MINIMAL.replace("module_number = 1", "module_number = 0");
        let config = DriverConfig::from_toml(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_bad_width() {
        let text = format!(
            "{MINIMAL}
[[modules.spaces]]
space_number = 0x39
base_address = 0
window_size = 256
data_width = 24
"
        );
        let config = DriverConfig::from_toml(&text).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("data_width"));
    }

    #[test]
    fn rejects_oversized_queue() {
        let text = format!("{MINIMAL}\n[driver]\nqueue_capacity = 100000\n");
        let config = DriverConfig::from_toml(&text).unwrap();
        assert!(config.validate().is_err());
    }
}
