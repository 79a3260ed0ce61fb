//! Simulation back-end.
//!
//! An in-memory bus with one byte array per mapped address space, and a
//! board model whose interrupt sources are asserted by software. Both halves
//! share one [`SimState`]; the [`Simulator`] handle drives it from tests and
//! from the `skel_driver` binary.
//!
//! Fault injection: bus faults at chosen addresses, a failing interrupt
//! acknowledge, a rejected interrupt mask, and failing map or init hooks.

mod bus;
mod hardware;

pub use bus::SimulatedBus;
pub use hardware::{SIM_GET_RESET_COUNT, SIM_MAGIC, SIM_RAISE, SimulatedHardware};

use skel_common::driver::backend::{Backend, InterruptHandler};
use skel_common::driver::error::HwError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Registry name of the simulation back-end.
pub const NAME: &str = "simulation";

/// Factory for the back-end registry.
pub fn backend() -> Backend {
    Simulator::new().backend()
}

#[derive(Debug, Default)]
struct BoardState {
    pending: u32,
    enabled_mask: u32,
    enabled: bool,
    resets: u32,
    firmware: Vec<u8>,
    firmware_cursor: usize,
    fail_ack: bool,
    reject_mask: bool,
    fail_init: bool,
    fail_map: bool,
}

/// State shared by the bus and the board model.
#[derive(Default)]
pub struct SimState {
    boards: spin::Mutex<HashMap<u32, BoardState>>,
    files: spin::Mutex<HashMap<(u32, u32), Vec<u8>>>,
    faults: spin::Mutex<HashSet<(u32, u32, u32)>>,
    handlers: spin::Mutex<HashMap<u32, InterruptHandler>>,
}

impl SimState {
    fn board<R>(&self, module: u32, f: impl FnOnce(&mut BoardState) -> R) -> R {
        f(self.boards.lock().entry(module).or_default())
    }

    /// Latch `mask` and call the module's interrupt handler.
    fn raise(&self, module: u32, mask: u32) -> Result<(), HwError> {
        self.board(module, |b| b.pending |= mask);
        let handler = self.handlers.lock().get(&module).cloned();
        match handler {
            Some(handler) => {
                handler();
                Ok(())
            }
            None => Err(HwError::Failed(format!(
                "no interrupt handler for module {module}"
            ))),
        }
    }
}

/// Control handle over a simulated bus and its boards.
#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<SimState>,
}

impl Simulator {
    /// Fresh simulation with no boards.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus and callback set sharing this simulation.
    pub fn backend(&self) -> Backend {
        Backend {
            bus: Arc::new(SimulatedBus::new(Arc::clone(&self.state))),
            hardware: Arc::new(SimulatedHardware::new(Arc::clone(&self.state))),
        }
    }

    /// Assert `mask` on `module` and deliver its interrupt on this thread.
    pub fn raise(&self, module: u32, mask: u32) -> Result<(), HwError> {
        self.state.raise(module, mask)
    }

    /// Assert `mask` without delivering an interrupt.
    pub fn assert_sources(&self, module: u32, mask: u32) {
        self.state.board(module, |b| b.pending |= mask);
    }

    /// Pending, unacknowledged sources.
    pub fn pending(&self, module: u32) -> u32 {
        self.state.board(module, |b| b.pending)
    }

    /// Interrupt mask last applied by the driver.
    pub fn enabled_mask(&self, module: u32) -> u32 {
        self.state.board(module, |b| b.enabled_mask)
    }

    /// Whether the board is enabled.
    pub fn is_enabled(&self, module: u32) -> bool {
        self.state.board(module, |b| b.enabled)
    }

    /// Number of hardware resets.
    pub fn reset_count(&self, module: u32) -> u32 {
        self.state.board(module, |b| b.resets)
    }

    /// Firmware bytes written so far.
    pub fn firmware(&self, module: u32) -> Vec<u8> {
        self.state.board(module, |b| b.firmware.clone())
    }

    /// Whether an interrupt handler is registered.
    pub fn has_handler(&self, module: u32) -> bool {
        self.state.handlers.lock().contains_key(&module)
    }

    /// Whether `space_number` of `module` is mapped.
    pub fn is_mapped(&self, module: u32, space_number: u32) -> bool {
        self.state.files.lock().contains_key(&(module, space_number))
    }

    /// Make accesses at `offset` of a space fault.
    pub fn inject_bus_fault(&self, module: u32, space_number: u32, offset: u32) {
        self.state
            .faults
            .lock()
            .insert((module, space_number, offset));
    }

    /// Remove every injected bus fault.
    pub fn clear_bus_faults(&self) {
        self.state.faults.lock().clear();
    }

    /// Make the interrupt acknowledge fault.
    pub fn fail_interrupt_ack(&self, module: u32, fail: bool) {
        self.state.board(module, |b| b.fail_ack = fail);
    }

    /// Make applying an interrupt mask fault.
    pub fn reject_mask(&self, module: u32, reject: bool) {
        self.state.board(module, |b| b.reject_mask = reject);
    }

    /// Make the module init hook fail.
    pub fn fail_init(&self, module: u32, fail: bool) {
        self.state.board(module, |b| b.fail_init = fail);
    }

    /// Make mapping the module's spaces fail.
    pub fn fail_map(&self, module: u32, fail: bool) {
        self.state.board(module, |b| b.fail_map = fail);
    }
}
