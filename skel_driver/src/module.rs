//! Per-module state: status flags, subscriptions, access lock and register
//! access with bus-fault containment.
//!
//! # Locks
//!
//! | Lock | Kind | Held by |
//! |------|------|---------|
//! | `connections` | spin | connect/disconnect, interrupt fan-out |
//! | `mask_update` | blocking | connect/disconnect while pushing the mask |
//! | `access` | blocking | reset, enable, raw and block I/O, firmware, user commands |
//! | queue semaphore | blocking, short | interrupt fan-out signal, client read |
//!
//! The queue semaphore is a std mutex taken after the queue's spin lock is
//! released. The interrupt path holds it only to bump a counter and notify,
//! so it can be delayed by a reader checking the count but never by one
//! that is waiting.
//!
//! The access lock doubles as the exclusive (firmware) session: while a
//! client owns it, other clients' commands wait up to the module timeout and
//! then fail with `Busy`. Status and version queries never take it.

use crate::connection::ConnectionRegistry;
use skel_common::consts::MAX_MAPS;
use skel_common::driver::backend::{BusBackend, HardwareCallbacks, MappedSpace, ModuleIo};
use skel_common::driver::config::{DriverSettings, ModuleConfig};
use skel_common::driver::error::{DriverError, HwError};
use skel_common::driver::ioctl::{MapInfo, ModuleMaps, RawIoBlock, RawIoTransfer};
use skel_common::driver::types::{
    ClientId, ClientInfo, DataWidth, DebugFlags, HardwareStatus, HwTime, ModuleState,
    StandardStatus,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct AccessState {
    owner: Option<ClientId>,
    busy: bool,
}

/// Module access lock with an optional exclusive owner.
pub struct ModuleLock {
    state: Mutex<AccessState>,
    cond: Condvar,
}

/// Held while one command runs on the module.
pub struct CommandGuard<'a> {
    lock: &'a ModuleLock,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.lock.state().busy = false;
        self.lock.cond.notify_all();
    }
}

impl Default for ModuleLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLock {
    /// Unlocked, no owner.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccessState {
                owner: None,
                busy: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, AccessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `client` may run a command: no command in flight and no
    /// exclusive owner other than `client`.
    ///
    /// # Errors
    /// `Busy` when `timeout` (`None` = forever) elapses first.
    pub fn lock_for_command(
        &self,
        client: ClientId,
        timeout: Option<Duration>,
    ) -> Result<CommandGuard<'_>, DriverError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut s = self.state();
        loop {
            let foreign_owner = s.owner.is_some_and(|owner| owner != client);
            if !s.busy && !foreign_owner {
                s.busy = true;
                return Ok(CommandGuard { lock: self });
            }
            s = match deadline {
                None => self.cond.wait(s).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::Busy(match s.owner {
                            Some(owner) if owner != client => {
                                format!("module locked by {owner}")
                            }
                            _ => "module command in progress".to_string(),
                        }));
                    }
                    self.cond
                        .wait_timeout(s, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Make `client` the exclusive owner, waiting for any in-flight command.
    ///
    /// # Errors
    /// `Busy` if an exclusive session is already open.
    pub fn open_exclusive(&self, client: ClientId) -> Result<(), DriverError> {
        let mut s = self.state();
        loop {
            if let Some(owner) = s.owner {
                return Err(DriverError::Busy(format!("exclusive access held by {owner}")));
            }
            if !s.busy {
                s.owner = Some(client);
                return Ok(());
            }
            s = self.cond.wait(s).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop any exclusive owner.
    pub fn rearm(&self) {
        self.state().owner = None;
        self.cond.notify_all();
    }

    /// Current exclusive owner.
    pub fn owner(&self) -> Option<ClientId> {
        self.state().owner
    }
}

/// Per-module context.
pub struct ModuleContext {
    config: ModuleConfig,
    status: AtomicU32,
    debug: DebugFlags,
    timeout: Option<Duration>,
    connections: spin::Mutex<ConnectionRegistry>,
    mask_update: Mutex<()>,
    access: ModuleLock,
    io: ModuleIo,
    hooks: Arc<dyn HardwareCallbacks>,
    in_use: AtomicBool,
}

impl ModuleContext {
    /// Create an unmapped module with no interrupt handler.
    pub fn new(
        config: ModuleConfig,
        settings: &DriverSettings,
        bus: Arc<dyn BusBackend>,
        hooks: Arc<dyn HardwareCallbacks>,
    ) -> Self {
        let emulated = settings.emulated();
        let mut status = StandardStatus::NO_ISR;
        if emulated {
            status |= StandardStatus::EMULATION | StandardStatus::NO_HARDWARE;
        }
        let timeout = match settings.module_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        Self {
            io: ModuleIo::new(config.module_number, bus, emulated),
            config,
            status: AtomicU32::new(status.bits()),
            debug: settings.debug(),
            timeout,
            connections: spin::Mutex::new(ConnectionRegistry::new()),
            mask_update: Mutex::new(()),
            access: ModuleLock::new(),
            hooks,
            in_use: AtomicBool::new(false),
        }
    }

    /// Whether the module completed install and has not been uninstalled.
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mark the module installed or released.
    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Module number.
    pub fn number(&self) -> u32 {
        self.config.module_number
    }

    /// Install-time configuration.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Mapped address spaces.
    pub fn io(&self) -> &ModuleIo {
        &self.io
    }

    /// The callback set.
    pub fn hooks(&self) -> &Arc<dyn HardwareCallbacks> {
        &self.hooks
    }

    // ─── Status ─────────────────────────────────────────────────────

    /// Software status flags.
    pub fn standard_status(&self) -> StandardStatus {
        StandardStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// Set status flags.
    pub fn set_status(&self, flags: StandardStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear status flags.
    pub fn clear_status(&self, flags: StandardStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Derived state.
    pub fn state(&self) -> ModuleState {
        ModuleState::from(self.standard_status())
    }

    /// Software flags merged with the hardware-reported status.
    ///
    /// A bus fault while reading the hardware flags the module and reports
    /// the software status alone.
    pub fn status(&self) -> HardwareStatus {
        let hw = match self.hooks.hardware_status(&self.io) {
            Ok(hw) => hw,
            Err(HwError::NotImplemented) => HardwareStatus::default(),
            Err(e) => {
                self.fault("hardware_status", e);
                HardwareStatus::default()
            }
        };
        HardwareStatus {
            standard: self.standard_status()
                | (hw.standard & StandardStatus::HARDWARE_REPORTED),
            raw: hw.raw,
        }
    }

    /// Report status, then clear transient fault flags.
    pub fn status_and_clear(&self) -> HardwareStatus {
        let status = self.status();
        self.clear_status(StandardStatus::TRANSIENT);
        status
    }

    /// Module version string ("" when the callback set has none).
    ///
    /// # Errors
    /// `HardwareFault` if reading the version faults on the bus.
    pub fn version(&self) -> Result<String, DriverError> {
        match self.hooks.module_version(&self.io) {
            Ok(v) => Ok(v),
            Err(HwError::NotImplemented) => Ok(String::new()),
            Err(e) => Err(self.fault("module_version", e)),
        }
    }

    /// Current hardware time.
    pub fn time(&self) -> HwTime {
        self.hooks.current_time(&self.io)
    }

    /// Address-space map.
    pub fn maps(&self) -> ModuleMaps {
        let mut maps = ModuleMaps::default();
        for (slot, space) in maps.maps.iter_mut().zip(self.io.spaces().iter()) {
            *slot = map_info(space);
            maps.count += 1;
        }
        debug_assert!(maps.count as usize <= MAX_MAPS);
        maps
    }

    // ─── Connections ────────────────────────────────────────────────

    /// Run `f` on the registry under the fast lock.
    pub fn with_connections<R>(&self, f: impl FnOnce(&ConnectionRegistry) -> R) -> R {
        f(&self.connections.lock())
    }

    /// Sources `client` is connected to.
    pub fn connections_of(&self, client: ClientId) -> u32 {
        self.connections.lock().connections_of(client)
    }

    /// Aggregate enabled mask.
    pub fn enabled_mask(&self) -> u32 {
        self.connections.lock().enabled_mask()
    }

    /// Connect `client` to `mask` and push the new aggregate mask once.
    ///
    /// # Errors
    /// If the hardware rejects the mask the registry is restored and the
    /// error returned (`HardwareFault` for a bus fault).
    pub fn connect(&self, client: ClientId, mask: u32) -> Result<u32, DriverError> {
        self.update_connections(|reg| reg.connect(client, mask), true)
    }

    /// Disconnect `client` from `mask` (0 = all) and push the mask once.
    ///
    /// # Errors
    /// As [`connect`](Self::connect).
    pub fn disconnect(&self, client: ClientId, mask: u32) -> Result<u32, DriverError> {
        self.update_connections(|reg| reg.disconnect(client, mask), true)
    }

    /// Remove every subscription of `client`. The registry change is kept
    /// even when the hardware rejects the new mask.
    ///
    /// # Errors
    /// The failed mask push (`HardwareFault` for a bus fault, which also
    /// flags the module).
    pub fn disconnect_all(&self, client: ClientId) -> Result<u32, DriverError> {
        self.update_connections(|reg| reg.disconnect(client, 0), false)
    }

    /// Remove every subscription of a closing client. Never fails; a
    /// rejected mask is logged and the client stays removed.
    pub fn drop_client(&self, client: ClientId) {
        if self.connections_of(client) == 0 {
            return;
        }
        if let Err(e) = self.disconnect_all(client) {
            warn!(module = self.number(), %client, "Mask update on close failed: {e}");
        }
    }

    fn update_connections(
        &self,
        change: impl FnOnce(&mut ConnectionRegistry) -> u32,
        rollback: bool,
    ) -> Result<u32, DriverError> {
        let _serial = self
            .mask_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (before, enabled) = {
            let mut reg = self.connections.lock();
            let before = *reg;
            (before, change(&mut reg))
        };
        match self.hooks.enable_interrupts(&self.io, enabled) {
            Ok(()) | Err(HwError::NotImplemented) => Ok(enabled),
            Err(e) => {
                if rollback {
                    *self.connections.lock() = before;
                }
                Err(self.fault("enable_interrupts", e))
            }
        }
    }

    // ─── Locked commands ────────────────────────────────────────────

    /// Acquire the access lock for one command of `client`.
    pub fn lock_for_command(&self, client: ClientId) -> Result<CommandGuard<'_>, DriverError> {
        self.access.lock_for_command(client, self.timeout)
    }

    /// Reset the module.
    pub fn reset(&self, client: ClientId) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        self.run_reset()
    }

    /// Reset hook, re-apply the enabled mask, clear transient faults and
    /// drop any exclusive session. Caller holds the access lock.
    fn run_reset(&self) -> Result<(), DriverError> {
        match self.hooks.hardware_reset(&self.io) {
            Ok(()) | Err(HwError::NotImplemented) => {}
            Err(e) => return Err(self.fault("hardware_reset", e)),
        }
        let mask = self.enabled_mask();
        match self.hooks.enable_interrupts(&self.io, mask) {
            Ok(()) | Err(HwError::NotImplemented) => {}
            Err(e) => return Err(self.fault("enable_interrupts", e)),
        }
        self.clear_status(StandardStatus::TRANSIENT | StandardStatus::FLASH_OPEN);
        self.access.rearm();
        info!(module = self.number(), "Module reset, enabled mask {mask:#x}");
        Ok(())
    }

    /// Enable or disable the module.
    ///
    /// Any hook failure, `NotSupported` included, leaves the module
    /// flagged DISABLED.
    pub fn enable(&self, client: ClientId, enable: bool) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        match self.hooks.hardware_enable(&self.io, enable) {
            Ok(()) => {
                if enable {
                    self.clear_status(StandardStatus::DISABLED);
                } else {
                    self.set_status(StandardStatus::DISABLED);
                }
                Ok(())
            }
            Err(e) => {
                self.set_status(StandardStatus::DISABLED);
                Err(self.fault("hardware_enable", e))
            }
        }
    }

    /// Raw register read. `block.data` receives the value.
    pub fn raw_read(&self, client: ClientId, block: &mut RawIoBlock) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        let (space, width) = self.check_raw(block.space, block.offset, block.width)?;
        let value = self
            .io
            .bus()
            .read(&space, block.offset, width)
            .map_err(|e| self.fault("raw read", e))?;
        block.data = value;
        Ok(())
    }

    /// Raw register write of `block.data`.
    pub fn raw_write(&self, client: ClientId, block: &RawIoBlock) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        let (space, width) = self.check_raw(block.space, block.offset, block.width)?;
        check_fits(block.data, width)?;
        self.io
            .bus()
            .write(&space, block.offset, width, block.data)
            .map_err(|e| self.fault("raw write", e))
    }

    /// Block register read into `block.data`; `block.count` is set to the
    /// number of items read.
    ///
    /// # Errors
    /// The whole range is checked against the window first. A bus fault
    /// stops the transfer and flags the module.
    pub fn raw_block_read(
        &self,
        client: ClientId,
        block: &mut RawIoTransfer,
    ) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        let plan = self.check_block(block)?;
        let mut offset = block.offset;
        for word in &mut block.data[..plan.items] {
            *word = self
                .io
                .bus()
                .read(&plan.space, offset, plan.width)
                .map_err(|e| self.fault("raw block read", e))?;
            offset = offset.wrapping_add(plan.step);
        }
        block.count = plan.items as u32;
        Ok(())
    }

    /// Block register write of `block.data`.
    ///
    /// # Errors
    /// Range and values are checked before anything is written. A bus fault
    /// stops the transfer, leaving earlier items written, and flags the
    /// module.
    pub fn raw_block_write(
        &self,
        client: ClientId,
        block: &RawIoTransfer,
    ) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client)?;
        let plan = self.check_block(block)?;
        let data = &block.data[..plan.items];
        for &value in data {
            check_fits(value, plan.width)?;
        }
        let mut offset = block.offset;
        for &value in data {
            self.io
                .bus()
                .write(&plan.space, offset, plan.width, value)
                .map_err(|e| self.fault("raw block write", e))?;
            offset = offset.wrapping_add(plan.step);
        }
        Ok(())
    }

    fn check_raw(
        &self,
        space_number: u32,
        offset: u32,
        width_bits: u32,
    ) -> Result<(MappedSpace, DataWidth), DriverError> {
        let space = self
            .io
            .space(space_number)
            .ok_or(DriverError::NoSuchAddressSpace(space_number))?;
        let width = match width_bits {
            0 => space.data_width,
            bits => DataWidth::from_bits(bits).ok_or_else(|| {
                DriverError::InvalidArgument(format!("data width {bits} not 8, 16 or 32"))
            })?,
        };
        if offset % width.bytes() as u32 != 0 || !space.contains(offset, width) {
            return Err(DriverError::InvalidArgument(format!(
                "offset {offset:#x} outside window {:#x} of space {space_number:#x}",
                space.window_size
            )));
        }
        Ok((space, width))
    }

    /// First and last item must both pass [`check_raw`](Self::check_raw).
    fn check_block(&self, block: &RawIoTransfer) -> Result<BlockPlan, DriverError> {
        let items = block.items()?;
        let (space, width) = self.check_raw(block.space, block.offset, block.width)?;
        let step = block.increment.checked_mul(width.bytes() as u32);
        let last = step
            .and_then(|step| step.checked_mul(items as u32 - 1))
            .and_then(|span| span.checked_add(block.offset));
        match (step, last) {
            (Some(step), Some(last)) if space.contains(last, width) => Ok(BlockPlan {
                space,
                width,
                step,
                items,
            }),
            _ => Err(DriverError::InvalidArgument(format!(
                "{items} items from {:#x} overrun window {:#x} of space {:#x}",
                block.offset, space.window_size, block.space
            ))),
        }
    }

    // ─── Exclusive (firmware) access ────────────────────────────────

    /// Open an exclusive session for `client` and flag FLASH_OPEN.
    pub fn open_exclusive(&self, client: ClientId) -> Result<(), DriverError> {
        self.access.open_exclusive(client)?;
        self.set_status(StandardStatus::FLASH_OPEN);
        info!(module = self.number(), %client, "Exclusive access opened");
        Ok(())
    }

    /// Close the session owned by `client`: reset and release.
    pub fn close_exclusive(&self, client: ClientId) -> Result<(), DriverError> {
        self.require_owner(client)?;
        let _guard = self.lock_for_command(client)?;
        let result = self.run_reset();
        if result.is_err() {
            // Release even when the reset failed; the fault flags stay set.
            self.clear_status(StandardStatus::FLASH_OPEN);
            self.access.rearm();
        }
        info!(module = self.number(), %client, "Exclusive access closed");
        result
    }

    /// Release a session still held by a closing client.
    pub fn release_exclusive(&self, client: ClientId) {
        if self.access.owner() != Some(client) {
            return;
        }
        if let Err(e) = self.close_exclusive(client) {
            warn!(module = self.number(), %client, "Reset on exclusive release failed: {e}");
        }
    }

    /// Current exclusive owner.
    pub fn exclusive_owner(&self) -> Option<ClientId> {
        self.access.owner()
    }

    /// Read one firmware byte. Owner only.
    pub fn firmware_read(&self, client: ClientId) -> Result<u8, DriverError> {
        self.require_owner(client)?;
        let _guard = self.lock_for_command(client)?;
        self.hooks
            .firmware_read_byte(&self.io)
            .map_err(|e| self.fault("firmware_read_byte", e))
    }

    /// Write one firmware byte. Owner only.
    pub fn firmware_write(&self, client: ClientId, byte: u8) -> Result<(), DriverError> {
        self.require_owner(client)?;
        let _guard = self.lock_for_command(client)?;
        self.hooks
            .firmware_write_byte(&self.io, byte)
            .map_err(|e| self.fault("firmware_write_byte", e))
    }

    fn require_owner(&self, client: ClientId) -> Result<(), DriverError> {
        match self.access.owner() {
            Some(owner) if owner == client => Ok(()),
            Some(owner) => Err(DriverError::Busy(format!("exclusive access held by {owner}"))),
            None => Err(DriverError::Busy("exclusive access not open".to_string())),
        }
    }

    // ─── Hardware-specific commands ─────────────────────────────────

    /// Forward a hardware-specific command to the callback set.
    pub fn user_ioctl(
        &self,
        client: &ClientInfo,
        cmd: u32,
        arg: &mut [u8],
    ) -> Result<(), DriverError> {
        let _guard = self.lock_for_command(client.id)?;
        self.hooks
            .ioctl(&self.io, client, cmd, arg)
            .map_err(|e| match e {
                HwError::NotImplemented => {
                    DriverError::NotSupported(format!("command {cmd:#010x}"))
                }
                other => self.fault("ioctl", other),
            })
    }

    /// Map a hook failure; a bus fault flags the module.
    pub fn fault(&self, what: &str, err: HwError) -> DriverError {
        match err {
            HwError::BusFault { .. } => {
                self.set_status(StandardStatus::BUS_FAULT);
                error!(module = self.number(), "Bus fault in {what}: {err}");
                DriverError::HardwareFault {
                    module: self.number(),
                    detail: err,
                }
            }
            other => {
                if self.debug.contains(DebugFlags::MODULE) {
                    debug!(module = self.number(), "{what} failed: {other}");
                }
                DriverError::from_hook(what, other)
            }
        }
    }
}

/// Validated block transfer.
struct BlockPlan {
    space: MappedSpace,
    width: DataWidth,
    step: u32,
    items: usize,
}

fn check_fits(value: u32, width: DataWidth) -> Result<(), DriverError> {
    if value > width.max_value() {
        return Err(DriverError::InvalidArgument(format!(
            "value {value:#x} does not fit {} bits",
            width.bits()
        )));
    }
    Ok(())
}

fn map_info(space: &MappedSpace) -> MapInfo {
    MapInfo {
        space_number: space.space_number,
        base_address: space.base_address,
        window_size: space.window_size,
        data_width: space.data_width.bits(),
    }
}
