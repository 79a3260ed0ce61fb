//! Simulated bus: byte-array address spaces and stored interrupt handlers.

use super::SimState;
use skel_common::driver::backend::{BusBackend, InterruptHandler, MappedSpace};
use skel_common::driver::config::{AddressSpaceConfig, IsrConfig};
use skel_common::driver::error::HwError;
use skel_common::driver::types::{DataWidth, Endian};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// In-memory bus.
pub struct SimulatedBus {
    state: Arc<SimState>,
    next_handle: AtomicU64,
}

impl SimulatedBus {
    pub(super) fn new(state: Arc<SimState>) -> Self {
        Self {
            state,
            next_handle: AtomicU64::new(1),
        }
    }

    fn check(&self, space: &MappedSpace, offset: u32, width: DataWidth) -> Result<(), HwError> {
        let fault = HwError::BusFault {
            space: space.space_number,
            offset,
        };
        if self
            .state
            .faults
            .lock()
            .contains(&(space.module, space.space_number, offset))
        {
            return Err(fault);
        }
        if !space.contains(offset, width) {
            return Err(fault);
        }
        Ok(())
    }
}

impl BusBackend for SimulatedBus {
    fn name(&self) -> &'static str {
        super::NAME
    }

    fn map(&self, module: u32, space: &AddressSpaceConfig) -> Result<MappedSpace, HwError> {
        if self.state.board(module, |b| b.fail_map) {
            return Err(HwError::Failed(format!(
                "cannot map space {:#x} at {:#x}",
                space.space_number, space.base_address
            )));
        }
        self.state.files.lock().insert(
            (module, space.space_number),
            vec![0; space.window_size as usize],
        );
        debug!(module, space = space.space_number, size = space.window_size, "Mapped");
        Ok(MappedSpace {
            module,
            space_number: space.space_number,
            base_address: space.base_address,
            window_size: space.window_size,
            data_width: space.width(),
            endian: space.endian,
            free_after_init: space.free_after_init,
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn unmap(&self, space: &MappedSpace) {
        self.state
            .files
            .lock()
            .remove(&(space.module, space.space_number));
        debug!(module = space.module, space = space.space_number, "Unmapped");
    }

    fn read(&self, space: &MappedSpace, offset: u32, width: DataWidth) -> Result<u32, HwError> {
        self.check(space, offset, width)?;
        let files = self.state.files.lock();
        let file = files
            .get(&(space.module, space.space_number))
            .ok_or(HwError::BusFault {
                space: space.space_number,
                offset,
            })?;
        let start = offset as usize;
        let bytes = &file[start..start + width.bytes()];
        let mut value = 0u32;
        match space.endian {
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | b as u32;
                }
            }
            Endian::Little => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | b as u32;
                }
            }
        }
        Ok(value)
    }

    fn write(
        &self,
        space: &MappedSpace,
        offset: u32,
        width: DataWidth,
        value: u32,
    ) -> Result<(), HwError> {
        self.check(space, offset, width)?;
        let mut files = self.state.files.lock();
        let file = files
            .get_mut(&(space.module, space.space_number))
            .ok_or(HwError::BusFault {
                space: space.space_number,
                offset,
            })?;
        let start = offset as usize;
        let n = width.bytes();
        for i in 0..n {
            let shift = match space.endian {
                Endian::Big => 8 * (n - 1 - i),
                Endian::Little => 8 * i,
            };
            file[start + i] = (value >> shift) as u8;
        }
        Ok(())
    }

    fn register_interrupt(
        &self,
        module: u32,
        isr: &IsrConfig,
        handler: InterruptHandler,
    ) -> Result<(), HwError> {
        let mut handlers = self.state.handlers.lock();
        if handlers.contains_key(&module) {
            return Err(HwError::Failed(format!(
                "vector {:#x} already connected",
                isr.vector
            )));
        }
        handlers.insert(module, handler);
        debug!(module, vector = isr.vector, level = isr.level, "Interrupt connected");
        Ok(())
    }

    fn deregister_interrupt(&self, module: u32) {
        self.state.handlers.lock().remove(&module);
    }

    fn raise_interrupt(&self, module: u32, mask: u32) -> Result<(), HwError> {
        self.state.raise(module, mask)
    }
}
