//! Hardware back-end contracts.
//!
//! This module defines:
//! - `BusBackend` trait - address-space mapping, register access, interrupt wiring
//! - `HardwareCallbacks` trait - the board-specific callback set
//! - `ModuleIo` - one module's mapped spaces, handed to every callback
//! - `Backend` / `BackendFactory` - what a back-end registry entry produces
//!
//! Every fallible operation returns `Result<_, HwError>`. A register access
//! that faults on the bus returns `HwError::BusFault`; it never unwinds.

use crate::consts::MAX_SPACES;
use crate::driver::config::{AddressSpaceConfig, IsrConfig, ModuleConfig};
use crate::driver::error::HwError;
use crate::driver::types::{
    ClientInfo, DataWidth, Endian, HardwareStatus, HwTime, InterruptSource,
};
use std::sync::Arc;
use tracing::warn;

/// One address space mapped by the bus back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedSpace {
    /// Owning module.
    pub module: u32,
    /// Address space number (e.g. VME address modifier).
    pub space_number: u32,
    /// Bus base address.
    pub base_address: u32,
    /// Window size in bytes.
    pub window_size: u32,
    /// Default access width.
    pub data_width: DataWidth,
    /// Byte order of the space.
    pub endian: Endian,
    /// Unmap after the module init hook has run.
    pub free_after_init: bool,
    /// Back-end private token.
    pub handle: u64,
}

impl MappedSpace {
    /// Whether an access of `width` at `offset` lies inside the window.
    pub fn contains(&self, offset: u32, width: DataWidth) -> bool {
        (offset as u64) + (width.bytes() as u64) <= self.window_size as u64
    }
}

/// Interrupt callback registered with the bus back-end.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Bus-specific mechanics: mapping, register access and interrupt wiring.
pub trait BusBackend: Send + Sync {
    /// Back-end identifier (e.g. "simulation").
    fn name(&self) -> &'static str;

    /// Map one address space of `module`.
    fn map(&self, module: u32, space: &AddressSpaceConfig) -> Result<MappedSpace, HwError>;

    /// Release a mapping obtained from [`map`](Self::map).
    fn unmap(&self, space: &MappedSpace);

    /// Width-typed register read. Byte order follows `space.endian`.
    fn read(&self, space: &MappedSpace, offset: u32, width: DataWidth) -> Result<u32, HwError>;

    /// Width-typed register write. Byte order follows `space.endian`.
    fn write(
        &self,
        space: &MappedSpace,
        offset: u32,
        width: DataWidth,
        value: u32,
    ) -> Result<(), HwError>;

    /// Install `handler` as the interrupt callback of `module`.
    fn register_interrupt(
        &self,
        module: u32,
        isr: &IsrConfig,
        handler: InterruptHandler,
    ) -> Result<(), HwError>;

    /// Remove the interrupt callback of `module`.
    fn deregister_interrupt(&self, module: u32);

    /// Assert `mask` on the module and deliver its interrupt, where the bus
    /// can generate software interrupts.
    fn raise_interrupt(&self, _module: u32, _mask: u32) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }
}

/// Mapped address spaces of one module plus the bus they live on.
pub struct ModuleIo {
    number: u32,
    emulation: bool,
    bus: Arc<dyn BusBackend>,
    spaces: spin::RwLock<heapless::Vec<MappedSpace, MAX_SPACES>>,
}

impl ModuleIo {
    /// Create an unmapped module. An emulated module never touches the bus.
    pub fn new(number: u32, bus: Arc<dyn BusBackend>, emulation: bool) -> Self {
        Self {
            number,
            emulation,
            bus,
            spaces: spin::RwLock::new(heapless::Vec::new()),
        }
    }

    /// Module number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Whether the module runs without hardware.
    pub fn is_emulated(&self) -> bool {
        self.emulation
    }

    /// The bus back-end.
    pub fn bus(&self) -> &Arc<dyn BusBackend> {
        &self.bus
    }

    /// Map every configured space. On failure the spaces mapped so far are
    /// released again.
    pub fn map_all(&self, configs: &[AddressSpaceConfig]) -> Result<(), HwError> {
        if self.emulation {
            return Ok(());
        }
        for config in configs {
            let mapped = match self.bus.map(self.number, config) {
                Ok(mapped) => mapped,
                Err(e) => {
                    self.unmap_all();
                    return Err(e);
                }
            };
            if self.spaces.write().push(mapped).is_err() {
                self.bus.unmap(&mapped);
                self.unmap_all();
                return Err(HwError::Failed(format!(
                    "module {} has more than {MAX_SPACES} address spaces",
                    self.number
                )));
            }
        }
        Ok(())
    }

    /// Unmap every space.
    pub fn unmap_all(&self) {
        let spaces = core::mem::take(&mut *self.spaces.write());
        for space in &spaces {
            self.bus.unmap(space);
        }
    }

    /// Unmap spaces flagged `free_after_init`.
    pub fn release_init_spaces(&self) {
        let mut spaces = self.spaces.write();
        let mut kept = heapless::Vec::<MappedSpace, MAX_SPACES>::new();
        for space in spaces.iter() {
            if space.free_after_init {
                self.bus.unmap(space);
            } else if kept.push(*space).is_err() {
                warn!(module = self.number, "space table overflow while releasing");
            }
        }
        *spaces = kept;
    }

    /// Whether any space is mapped.
    pub fn has_hardware(&self) -> bool {
        !self.spaces.read().is_empty()
    }

    /// Look up a mapped space.
    pub fn space(&self, space_number: u32) -> Option<MappedSpace> {
        self.spaces
            .read()
            .iter()
            .find(|s| s.space_number == space_number)
            .copied()
    }

    /// Snapshot of the mapped spaces.
    pub fn spaces(&self) -> heapless::Vec<MappedSpace, MAX_SPACES> {
        self.spaces.read().clone()
    }

    /// Register read; `width` defaults to the space's width.
    pub fn read(
        &self,
        space_number: u32,
        offset: u32,
        width: Option<DataWidth>,
    ) -> Result<u32, HwError> {
        let space = self.mapped(space_number)?;
        self.bus
            .read(&space, offset, width.unwrap_or(space.data_width))
    }

    /// Register write; `width` defaults to the space's width.
    pub fn write(
        &self,
        space_number: u32,
        offset: u32,
        width: Option<DataWidth>,
        value: u32,
    ) -> Result<(), HwError> {
        let space = self.mapped(space_number)?;
        self.bus
            .write(&space, offset, width.unwrap_or(space.data_width), value)
    }

    fn mapped(&self, space_number: u32) -> Result<MappedSpace, HwError> {
        self.space(space_number).ok_or_else(|| {
            HwError::Failed(format!(
                "space {space_number:#x} not mapped on module {}",
                self.number
            ))
        })
    }
}

/// Board-specific callback set.
///
/// Only [`name`](Self::name) and [`interrupt_source`](Self::interrupt_source)
/// are required; every other hook defaults to `HwError::NotImplemented` (or a
/// successful no-op for lifecycle hooks).
///
/// # Contexts
///
/// | Hook | Context | May block |
/// |------|---------|-----------|
/// | `interrupt_source` | interrupt | no |
/// | `current_time` | interrupt or client | no |
/// | everything else | client, module lock held | yes |
pub trait HardwareCallbacks: Send + Sync {
    /// Callback set identifier.
    fn name(&self) -> &'static str;

    /// Module firmware/version string.
    fn module_version(&self, _io: &ModuleIo) -> Result<String, HwError> {
        Err(HwError::NotImplemented)
    }

    /// Hardware-reported status.
    fn hardware_status(&self, _io: &ModuleIo) -> Result<HardwareStatus, HwError> {
        Err(HwError::NotImplemented)
    }

    /// Read and acknowledge the pending interrupt sources.
    fn interrupt_source(&self, io: &ModuleIo) -> Result<InterruptSource, HwError>;

    /// Apply the aggregate enabled-source mask.
    fn enable_interrupts(&self, _io: &ModuleIo, _mask: u32) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }

    /// Full hardware reset.
    fn hardware_reset(&self, _io: &ModuleIo) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }

    /// Enable or disable the module.
    fn hardware_enable(&self, _io: &ModuleIo, _enable: bool) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }

    /// Current hardware time. Defaults to host wall-clock time.
    fn current_time(&self, _io: &ModuleIo) -> HwTime {
        HwTime::now()
    }

    /// Called once per module at install, after mapping.
    fn module_init(&self, _io: &ModuleIo, _config: &ModuleConfig) -> Result<(), HwError> {
        Ok(())
    }

    /// Called once per module at uninstall, before unmapping.
    fn module_release(&self, _io: &ModuleIo) -> Result<(), HwError> {
        Ok(())
    }

    /// Called when a client opens.
    fn client_init(&self, _client: &ClientInfo) -> Result<(), HwError> {
        Ok(())
    }

    /// Called when a client closes.
    fn client_release(&self, _client: &ClientInfo) -> Result<(), HwError> {
        Ok(())
    }

    /// Hardware-specific control command.
    fn ioctl(
        &self,
        _io: &ModuleIo,
        _client: &ClientInfo,
        _cmd: u32,
        _arg: &mut [u8],
    ) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }

    /// Name of a hardware-specific command, for tracing.
    fn ioctl_name(&self, _cmd: u32) -> Option<&'static str> {
        None
    }

    /// Read one byte from the firmware (JTAG) port.
    fn firmware_read_byte(&self, _io: &ModuleIo) -> Result<u8, HwError> {
        Err(HwError::NotImplemented)
    }

    /// Write one byte to the firmware (JTAG) port.
    fn firmware_write_byte(&self, _io: &ModuleIo, _byte: u8) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }
}

/// A bus back-end paired with the callback set that drives its boards.
#[derive(Clone)]
pub struct Backend {
    /// Bus mechanics.
    pub bus: Arc<dyn BusBackend>,
    /// Board callbacks.
    pub hardware: Arc<dyn HardwareCallbacks>,
}

/// Factory function type for creating back-ends.
pub type BackendFactory = fn() -> Backend;
