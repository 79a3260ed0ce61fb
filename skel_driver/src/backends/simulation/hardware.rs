//! Simulated board callbacks.

use super::SimState;
use skel_common::driver::backend::{HardwareCallbacks, ModuleIo};
use skel_common::driver::config::ModuleConfig;
use skel_common::driver::error::HwError;
use skel_common::driver::ioctl::{ior, iow, WireRecord};
use skel_common::driver::types::{
    ClientInfo, HardwareStatus, HwTime, InterruptSource, StandardStatus,
};
use std::sync::Arc;
use tracing::info;

/// Type byte of the simulation's own commands.
pub const SIM_MAGIC: u8 = b'S';
/// Number of hardware resets of the selected module.
pub const SIM_GET_RESET_COUNT: u32 = ior(SIM_MAGIC, 0, 4);
/// Latch interrupt sources on the selected module without raising.
pub const SIM_RAISE: u32 = iow(SIM_MAGIC, 1, 4);

/// Callback set for simulated boards.
pub struct SimulatedHardware {
    state: Arc<SimState>,
}

impl SimulatedHardware {
    pub(super) fn new(state: Arc<SimState>) -> Self {
        Self { state }
    }
}

impl HardwareCallbacks for SimulatedHardware {
    fn name(&self) -> &'static str {
        super::NAME
    }

    fn module_version(&self, io: &ModuleIo) -> Result<String, HwError> {
        Ok(format!("SIM-{}.0", io.number()))
    }

    fn hardware_status(&self, io: &ModuleIo) -> Result<HardwareStatus, HwError> {
        Ok(self.state.board(io.number(), |b| HardwareStatus {
            standard: if b.pending != 0 {
                StandardStatus::READY
            } else {
                StandardStatus::IDLE
            },
            raw: b.pending,
        }))
    }

    fn interrupt_source(&self, io: &ModuleIo) -> Result<InterruptSource, HwError> {
        let (fail, mask) = self
            .state
            .board(io.number(), |b| (b.fail_ack, core::mem::take(&mut b.pending)));
        if fail {
            return Err(HwError::BusFault { space: 0, offset: 0 });
        }
        Ok(InterruptSource {
            time: HwTime::now(),
            mask,
        })
    }

    fn enable_interrupts(&self, io: &ModuleIo, mask: u32) -> Result<(), HwError> {
        self.state.board(io.number(), |b| {
            if b.reject_mask {
                Err(HwError::BusFault { space: 0, offset: 0 })
            } else {
                b.enabled_mask = mask;
                Ok(())
            }
        })
    }

    fn hardware_reset(&self, io: &ModuleIo) -> Result<(), HwError> {
        self.state.board(io.number(), |b| {
            b.resets += 1;
            b.pending = 0;
            b.firmware_cursor = 0;
        });
        Ok(())
    }

    fn hardware_enable(&self, io: &ModuleIo, enable: bool) -> Result<(), HwError> {
        self.state.board(io.number(), |b| b.enabled = enable);
        Ok(())
    }

    fn module_init(&self, io: &ModuleIo, config: &ModuleConfig) -> Result<(), HwError> {
        let number = io.number();
        if self.state.board(number, |b| b.fail_init) {
            return Err(HwError::Failed(format!("board {number} did not answer")));
        }
        self.state.board(number, |b| b.enabled = true);
        info!(module = number, name = %config.name, "Simulated board ready");
        Ok(())
    }

    fn ioctl(
        &self,
        io: &ModuleIo,
        _client: &ClientInfo,
        cmd: u32,
        arg: &mut [u8],
    ) -> Result<(), HwError> {
        let number = io.number();
        match cmd {
            SIM_GET_RESET_COUNT => {
                let resets = self.state.board(number, |b| b.resets);
                resets
                    .encode(arg)
                    .map_err(|e| HwError::Failed(e.to_string()))
            }
            SIM_RAISE => {
                let mask = u32::decode(arg).map_err(|e| HwError::Failed(e.to_string()))?;
                self.state.board(number, |b| b.pending |= mask);
                Ok(())
            }
            _ => Err(HwError::NotImplemented),
        }
    }

    fn ioctl_name(&self, cmd: u32) -> Option<&'static str> {
        match cmd {
            SIM_GET_RESET_COUNT => Some("SIM_GET_RESET_COUNT"),
            SIM_RAISE => Some("SIM_RAISE"),
            _ => None,
        }
    }

    fn firmware_read_byte(&self, io: &ModuleIo) -> Result<u8, HwError> {
        Ok(self.state.board(io.number(), |b| {
            let byte = b.firmware.get(b.firmware_cursor).copied().unwrap_or(0xFF);
            b.firmware_cursor += 1;
            byte
        }))
    }

    fn firmware_write_byte(&self, io: &ModuleIo, byte: u8) -> Result<(), HwError> {
        self.state.board(io.number(), |b| b.firmware.push(byte));
        Ok(())
    }
}
