//! Install, uninstall, open and close.
//!
//! Install is per-module transactional: a module whose mapping, interrupt
//! registration or init hook fails is rolled back and reported, the others
//! carry on. The driver only fails to install when no module made it.
//!
//! Open, close and uninstall run one at a time under the driver's lifecycle
//! lock, so uninstall never races a client slot being taken.

use crate::client::{ClientContext, ClientTable};
use crate::driver::{Driver, DriverShared};
use crate::module::ModuleContext;
use skel_common::config::Validate;
use skel_common::driver::backend::{Backend, InterruptHandler};
use skel_common::driver::config::DriverConfig;
use skel_common::driver::error::{DriverError, HwError};
use skel_common::driver::types::{ClientId, StandardStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

/// Result of [`Driver::install`].
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Modules that installed, in order.
    pub installed: Vec<u32>,
    /// Modules that failed, with the reason.
    pub failures: Vec<(u32, DriverError)>,
}

impl Driver {
    /// Validate `config` and install every configured module on `backend`.
    ///
    /// # Errors
    /// - `Config` if validation fails
    /// - `NoDevice` if no module installed (the report's failures are logged)
    pub fn install(
        config: DriverConfig,
        backend: Backend,
    ) -> Result<(Self, InstallReport), DriverError> {
        config.validate()?;
        let DriverConfig {
            shared,
            driver: settings,
            modules,
        } = config;

        let mut table = heapless::Vec::new();
        for module_config in modules {
            let module = ModuleContext::new(
                module_config,
                &settings,
                Arc::clone(&backend.bus),
                Arc::clone(&backend.hardware),
            );
            if table.push(Arc::new(module)).is_err() {
                return Err(DriverError::Capacity("module table full".to_string()));
            }
        }

        let shared = Arc::new(DriverShared {
            name: shared.service_name,
            clients: ClientTable::new(settings.client_capacity),
            settings,
            bus: backend.bus,
            hooks: backend.hardware,
            modules: table,
            installed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        });

        let mut report = InstallReport::default();
        for (index, module) in shared.modules.iter().enumerate() {
            match install_module(&shared, index, module) {
                Ok(()) => {
                    module.set_in_use(true);
                    report.installed.push(module.number());
                }
                Err(e) => {
                    warn!(
                        driver = %shared.name,
                        module = module.number(),
                        "Module install failed: {e}"
                    );
                    report.failures.push((module.number(), e));
                }
            }
        }

        if report.installed.is_empty() {
            return Err(DriverError::NoDevice);
        }
        shared.installed.store(true, Ordering::Release);
        info!(
            driver = %shared.name,
            backend = shared.hooks.name(),
            modules = ?report.installed,
            "Driver installed"
        );
        Ok((Self { shared }, report))
    }

    /// Release every module.
    ///
    /// # Errors
    /// - `NoDevice` if not installed
    /// - `Busy` while clients are open
    pub fn uninstall(&self) -> Result<(), DriverError> {
        let _lifecycle = self.shared.lifecycle();
        self.ensure_installed()?;
        let open = self.shared.clients.open_count();
        if open > 0 {
            return Err(DriverError::Busy(format!("{open} clients still open")));
        }
        self.shared.installed.store(false, Ordering::Release);

        for module in self.shared.modules.iter().filter(|m| m.is_in_use()) {
            module.set_in_use(false);
            if let Err(e) = module.hooks().module_release(module.io()) {
                warn!(module = module.number(), "Module release hook failed: {e}");
            }
            if !module.standard_status().contains(StandardStatus::NO_ISR) {
                self.shared.bus.deregister_interrupt(module.number());
                module.set_status(StandardStatus::NO_ISR);
            }
            module.io().unmap_all();
        }
        info!(driver = %self.shared.name, "Driver uninstalled");
        Ok(())
    }

    /// Open a client for the calling process.
    pub fn open(&self) -> Result<ClientId, DriverError> {
        self.open_with_pid(nix::unistd::getpid().as_raw() as u32)
    }

    /// Open a client owned by `pid`. The client selects the first installed
    /// module and starts with an empty queue.
    ///
    /// # Errors
    /// - `NoDevice` if not installed
    /// - `Capacity` if every client slot is taken
    /// - the client-init hook's failure
    pub fn open_with_pid(&self, pid: u32) -> Result<ClientId, DriverError> {
        let _lifecycle = self.shared.lifecycle();
        self.ensure_installed()?;
        let first = self
            .installed_modules()
            .next()
            .map(|m| m.number())
            .ok_or(DriverError::NoDevice)?;
        let settings = &self.shared.settings;
        let client = self
            .shared
            .clients
            .allocate(|id| ClientContext::new(id, pid, first, settings))?;
        client.queue().reset();

        match self.shared.hooks.client_init(&client.info()) {
            Ok(()) | Err(HwError::NotImplemented) => {}
            Err(e) => {
                self.shared.clients.release(client.id());
                return Err(DriverError::from_hook("client_init", e));
            }
        }
        info!(driver = %self.shared.name, client = %client.id(), pid, "Client opened");
        Ok(client.id())
    }

    /// Close a client: disconnect it everywhere, release any exclusive
    /// session it holds and free its slot. A blocked read returns
    /// `Interrupted`.
    pub fn close(&self, id: ClientId) -> Result<(), DriverError> {
        let _lifecycle = self.shared.lifecycle();
        let client = self.client(id)?;
        for module in self.installed_modules() {
            module.release_exclusive(id);
            module.drop_client(id);
        }
        if let Err(e) = self.shared.hooks.client_release(&client.info()) {
            if e != HwError::NotImplemented {
                warn!(client = %id, "Client release hook failed: {e}");
            }
        }
        self.shared.clients.release(id);
        client.queue().interrupt();
        info!(driver = %self.shared.name, client = %id, pid = client.pid(), "Client closed");
        Ok(())
    }
}

/// Map, wire the interrupt and run the init hook for one module, undoing
/// completed steps on failure.
fn install_module(
    shared: &Arc<DriverShared>,
    index: usize,
    module: &ModuleContext,
) -> Result<(), DriverError> {
    let number = module.number();
    let config = module.config();

    module
        .io()
        .map_all(&config.spaces)
        .map_err(|e| module.fault("map", e))?;
    if !module.io().is_emulated() && !module.io().has_hardware() {
        module.set_status(StandardStatus::NO_HARDWARE);
    }

    if let Some(isr) = &config.isr {
        let weak: Weak<DriverShared> = Arc::downgrade(shared);
        let handler: InterruptHandler = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.interrupt(index);
            }
        });
        if let Err(e) = shared.bus.register_interrupt(number, isr, handler) {
            module.io().unmap_all();
            return Err(module.fault("register_interrupt", e));
        }
        module.clear_status(StandardStatus::NO_ISR);
    }

    if let Err(e) = module.hooks().module_init(module.io(), config) {
        if !module.standard_status().contains(StandardStatus::NO_ISR) {
            shared.bus.deregister_interrupt(number);
            module.set_status(StandardStatus::NO_ISR);
        }
        module.io().unmap_all();
        return Err(module.fault("module_init", e));
    }

    module.io().release_init_spaces();
    info!(module = number, bus = ?config.bus, name = %config.name, "Module installed");
    Ok(())
}
