//! The driver instance.
//!
//! A [`Driver`] is a cheap clonable handle to one installed driver: its
//! module table (fixed at install), client table and back-end. Lifecycle
//! operations live in [`crate::lifecycle`], control commands in
//! [`crate::commands`] and [`crate::ioctl`].

use crate::client::{ClientContext, ClientTable};
use crate::isr::{self, Dispatch};
use crate::module::ModuleContext;
use serde::Serialize;
use skel_common::consts::MAX_MODULES;
use skel_common::driver::backend::{BusBackend, HardwareCallbacks};
use skel_common::driver::config::DriverSettings;
use skel_common::driver::error::DriverError;
use skel_common::driver::ioctl::WireRecord;
use skel_common::driver::types::{ClientId, Connection, EventRecord, ModuleState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub(crate) struct DriverShared {
    pub(crate) name: String,
    pub(crate) settings: DriverSettings,
    pub(crate) bus: Arc<dyn BusBackend>,
    pub(crate) hooks: Arc<dyn HardwareCallbacks>,
    pub(crate) modules: heapless::Vec<Arc<ModuleContext>, MAX_MODULES>,
    pub(crate) clients: ClientTable,
    pub(crate) installed: AtomicBool,
    /// Serializes open, close and uninstall.
    pub(crate) lifecycle: Mutex<()>,
}

impl DriverShared {
    /// Hold off concurrent open, close and uninstall.
    pub(crate) fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupt entry for the module at `index` in the module table.
    pub(crate) fn interrupt(&self, index: usize) -> Dispatch {
        match self.modules.get(index) {
            Some(module) if module.is_in_use() => isr::dispatch(module, &self.clients),
            _ => Dispatch::default(),
        }
    }
}

/// Handle to an installed driver.
#[derive(Clone)]
pub struct Driver {
    pub(crate) shared: Arc<DriverShared>,
}

/// Serializable snapshot of a module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    /// Module number.
    pub number: u32,
    /// Derived state.
    pub state: ModuleState,
    /// Standard status bits.
    pub status: u32,
    /// Aggregate enabled interrupt mask.
    pub enabled_mask: u32,
    /// Slot of the exclusive owner, if any.
    pub exclusive_owner: Option<usize>,
}

/// Serializable snapshot of a client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    /// Slot index.
    pub id: usize,
    /// Owning pid.
    pub pid: u32,
    /// Selected module.
    pub module: u32,
    /// Queued records.
    pub queued: usize,
    /// Records lost since the last overflow read.
    pub overflow: u32,
}

/// Serializable snapshot of the whole driver.
#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    /// Driver name.
    pub name: String,
    /// Callback set name.
    pub backend: &'static str,
    /// Whether the driver is installed.
    pub installed: bool,
    /// Installed modules.
    pub modules: Vec<ModuleSnapshot>,
    /// Open clients.
    pub clients: Vec<ClientSnapshot>,
}

impl Driver {
    /// Driver name (the configured service name).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Settings the driver was installed with.
    pub fn settings(&self) -> &DriverSettings {
        &self.shared.settings
    }

    /// Whether the driver is installed.
    pub fn is_installed(&self) -> bool {
        self.shared.installed.load(Ordering::Acquire)
    }

    /// Installed module numbers, in install order.
    pub fn module_numbers(&self) -> Vec<u32> {
        self.installed_modules().map(|m| m.number()).collect()
    }

    /// Installed module `number`.
    pub fn module_context(&self, number: u32) -> Option<Arc<ModuleContext>> {
        self.installed_modules()
            .find(|m| m.number() == number)
            .cloned()
    }

    /// Open client `id`.
    pub fn client_context(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.shared.clients.get(id)
    }

    pub(crate) fn installed_modules(&self) -> impl Iterator<Item = &Arc<ModuleContext>> {
        self.shared.modules.iter().filter(|m| m.is_in_use())
    }

    pub(crate) fn ensure_installed(&self) -> Result<(), DriverError> {
        if self.is_installed() {
            Ok(())
        } else {
            Err(DriverError::NoDevice)
        }
    }

    pub(crate) fn client(&self, id: ClientId) -> Result<Arc<ClientContext>, DriverError> {
        self.ensure_installed()?;
        self.shared
            .clients
            .get(id)
            .ok_or(DriverError::NoSuchClient(id.0))
    }

    pub(crate) fn module(&self, number: u32) -> Result<Arc<ModuleContext>, DriverError> {
        self.module_context(number)
            .ok_or(DriverError::NoSuchModule(number))
    }

    /// Module `number`, or the client's selected module for 0.
    pub(crate) fn resolve_module(
        &self,
        client: &ClientContext,
        number: u32,
    ) -> Result<Arc<ModuleContext>, DriverError> {
        match number {
            0 => self.module(client.module()),
            n => self.module(n),
        }
    }

    /// Client selected by pid (0 = `caller`).
    pub(crate) fn client_by_pid(
        &self,
        caller: &Arc<ClientContext>,
        pid: u32,
    ) -> Result<Arc<ClientContext>, DriverError> {
        if pid == 0 {
            return Ok(Arc::clone(caller));
        }
        self.shared
            .clients
            .find_pid(pid)
            .ok_or(DriverError::NoSuchClient(pid as usize))
    }

    // ─── Data path ──────────────────────────────────────────────────

    /// Wait for the client's next event.
    ///
    /// # Errors
    /// `Timeout` after the client timeout, `Interrupted` on cancellation.
    pub fn read(&self, client: ClientId) -> Result<EventRecord, DriverError> {
        self.client(client)?.read()
    }

    /// Read one event into `buf`. Returns the number of bytes written.
    pub fn read_into(&self, client: ClientId, buf: &mut [u8]) -> Result<usize, DriverError> {
        if buf.len() < EventRecord::SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "read buffer needs {} bytes",
                EventRecord::SIZE
            )));
        }
        let record = self.read(client)?;
        record.encode(buf)?;
        Ok(EventRecord::SIZE)
    }

    /// Simulate an interrupt: every subscriber of `conn.mask` on the module
    /// receives an event stamped with the module's current time.
    pub fn simulate_interrupt(
        &self,
        client: ClientId,
        conn: Connection,
    ) -> Result<Dispatch, DriverError> {
        let caller = self.client(client)?;
        let module = self.resolve_module(&caller, conn.module)?;
        let dispatch = isr::fan_out(&module, &self.shared.clients, conn.mask, module.time());
        debug!(
            %client,
            module = module.number(),
            mask = conn.mask,
            delivered = dispatch.delivered,
            "Simulated interrupt"
        );
        Ok(dispatch)
    }

    /// Byte-level write: each whole [`Connection`] record in `buf` simulates
    /// one interrupt. Returns the number of bytes consumed.
    pub fn write(&self, client: ClientId, buf: &[u8]) -> Result<usize, DriverError> {
        if buf.len() < Connection::SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "write needs at least {} bytes",
                Connection::SIZE
            )));
        }
        let mut consumed = 0;
        for chunk in buf.chunks_exact(Connection::SIZE) {
            self.simulate_interrupt(client, Connection::decode(chunk)?)?;
            consumed += Connection::SIZE;
        }
        Ok(consumed)
    }

    /// Deliver a cancellation to the client's blocked (or next) read.
    pub fn interrupt_client(&self, client: ClientId) -> Result<(), DriverError> {
        self.client(client)?.queue().interrupt();
        Ok(())
    }

    /// Whether a read would return immediately.
    pub fn poll_ready(&self, client: ClientId) -> Result<bool, DriverError> {
        Ok(self.client(client)?.queue().is_ready())
    }

    /// Snapshot for diagnostics.
    pub fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            name: self.shared.name.clone(),
            backend: self.shared.hooks.name(),
            installed: self.is_installed(),
            modules: self
                .installed_modules()
                .map(|m| ModuleSnapshot {
                    number: m.number(),
                    state: m.state(),
                    status: m.standard_status().bits(),
                    enabled_mask: m.enabled_mask(),
                    exclusive_owner: m.exclusive_owner().map(|c| c.0),
                })
                .collect(),
            clients: self
                .shared
                .clients
                .open()
                .iter()
                .map(|c| ClientSnapshot {
                    id: c.id().0,
                    pid: c.pid(),
                    module: c.module(),
                    queued: c.queue().len(),
                    overflow: c.queue().overflow_count(),
                })
                .collect(),
        }
    }
}
