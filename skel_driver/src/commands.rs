//! Typed control commands.
//!
//! One method per standard command. Module commands act on the caller's
//! selected module; a module number of 0 in a [`Connection`] means the same.

use crate::driver::Driver;
use skel_common::consts::{DRIVER_VERSION, MAX_CONNECTIONS};
use skel_common::driver::error::DriverError;
use skel_common::driver::ioctl::{
    ClientConnections, ClientList, DebugRecord, ModuleMaps, RawIoBlock, RawIoTransfer,
    VersionRecord,
};
use skel_common::driver::types::{ClientId, Connection, DebugFlags, HardwareStatus};
use tracing::{debug, info, warn};

impl Driver {
    /// Set the debug flags of the client owning `record.client_pid`
    /// (0 = caller).
    pub fn set_debug(&self, client: ClientId, record: DebugRecord) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        let target = self.client_by_pid(&caller, record.client_pid)?;
        let flags = DebugFlags::from_bits_truncate(record.flags);
        target.set_debug(flags);
        info!(client = %target.id(), pid = target.pid(), flags = ?flags, "Debug flags set");
        Ok(())
    }

    /// Debug flags of the client owning `pid` (0 = caller).
    pub fn get_debug(&self, client: ClientId, pid: u32) -> Result<DebugRecord, DriverError> {
        let caller = self.client(client)?;
        let target = self.client_by_pid(&caller, pid)?;
        Ok(DebugRecord {
            client_pid: target.pid(),
            flags: target.debug().bits(),
        })
    }

    /// Driver version and the selected module's version string.
    pub fn version(&self, client: ClientId) -> Result<VersionRecord, DriverError> {
        let caller = self.client(client)?;
        let module = self.resolve_module(&caller, 0)?;
        Ok(VersionRecord::new(DRIVER_VERSION, &module.version()?))
    }

    /// Set the caller's read timeout in milliseconds (0 = forever).
    pub fn set_timeout(&self, client: ClientId, ms: u32) -> Result<(), DriverError> {
        self.client(client)?.set_timeout_ms(ms);
        Ok(())
    }

    /// Caller's read timeout in milliseconds.
    pub fn timeout(&self, client: ClientId) -> Result<u32, DriverError> {
        Ok(self.client(client)?.timeout_ms())
    }

    /// Queue-off mode: `true` discards stale events before every read.
    pub fn set_queue_off(&self, client: ClientId, off: bool) -> Result<(), DriverError> {
        self.client(client)?.queue().set_accumulate(!off);
        Ok(())
    }

    /// Whether queue-off mode is active.
    pub fn queue_off(&self, client: ClientId) -> Result<bool, DriverError> {
        Ok(!self.client(client)?.queue().accumulate())
    }

    /// Number of queued events.
    pub fn queue_size(&self, client: ClientId) -> Result<u32, DriverError> {
        Ok(self.client(client)?.queue().len() as u32)
    }

    /// Number of lost events since the last call; the counter is cleared.
    pub fn queue_overflow(&self, client: ClientId) -> Result<u32, DriverError> {
        Ok(self.client(client)?.queue().overflow_count_and_clear())
    }

    /// Select the caller's working module.
    pub fn set_module(&self, client: ClientId, number: u32) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        let module = self.module(number)?;
        caller.set_module(module.number());
        Ok(())
    }

    /// Caller's working module.
    pub fn selected_module(&self, client: ClientId) -> Result<u32, DriverError> {
        Ok(self.client(client)?.module())
    }

    /// Number of installed modules.
    pub fn module_count(&self) -> Result<u32, DriverError> {
        self.ensure_installed()?;
        Ok(self.installed_modules().count() as u32)
    }

    /// Address-space map of the selected module.
    pub fn module_maps(&self, client: ClientId) -> Result<ModuleMaps, DriverError> {
        let caller = self.client(client)?;
        Ok(self.resolve_module(&caller, 0)?.maps())
    }

    /// Connect to `conn.mask` on `conn.module`. A zero mask disconnects
    /// instead: from that module, or from every module when `conn.module`
    /// is also zero. Returns the module's new enabled mask.
    ///
    /// # Errors
    /// Disconnecting everywhere visits every installed module even when one
    /// rejects its new mask; the client is removed from all of them and the
    /// first failure is returned afterwards.
    pub fn connect(&self, client: ClientId, conn: Connection) -> Result<u32, DriverError> {
        let caller = self.client(client)?;
        if conn.mask == 0 {
            if conn.module == 0 {
                return self.disconnect_everywhere(client);
            }
            return self.module(conn.module)?.disconnect(client, 0);
        }
        let module = self.resolve_module(&caller, conn.module)?;
        let enabled = module.connect(client, conn.mask)?;
        debug!(%client, module = module.number(), mask = conn.mask, enabled, "Connected");
        Ok(enabled)
    }

    fn disconnect_everywhere(&self, client: ClientId) -> Result<u32, DriverError> {
        let mut first_error = None;
        for module in self.installed_modules() {
            if module.connections_of(client) == 0 {
                continue;
            }
            if let Err(e) = module.disconnect_all(client) {
                warn!(%client, module = module.number(), "Disconnect failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// Disconnect from `conn.mask` (0 = every source) on `conn.module`
    /// (0 = selected). Returns the module's new enabled mask.
    pub fn disconnect(&self, client: ClientId, conn: Connection) -> Result<u32, DriverError> {
        let caller = self.client(client)?;
        let module = self.resolve_module(&caller, conn.module)?;
        let enabled = module.disconnect(client, conn.mask)?;
        debug!(%client, module = module.number(), mask = conn.mask, enabled, "Disconnected");
        Ok(enabled)
    }

    /// Pids of every open client.
    pub fn client_list(&self) -> Result<ClientList, DriverError> {
        self.ensure_installed()?;
        let mut list = ClientList::default();
        for (slot, client) in list.pids.iter_mut().zip(self.shared.clients.open()) {
            *slot = client.pid();
            list.size += 1;
        }
        Ok(list)
    }

    /// Connections of the client owning `pid` (0 = caller).
    pub fn client_connections(
        &self,
        client: ClientId,
        pid: u32,
    ) -> Result<ClientConnections, DriverError> {
        let caller = self.client(client)?;
        let target = self.client_by_pid(&caller, pid)?;
        let mut record = ClientConnections {
            pid: target.pid(),
            ..ClientConnections::default()
        };
        let connections = self
            .installed_modules()
            .map(|m| Connection {
                module: m.number(),
                mask: m.connections_of(target.id()),
            })
            .filter(|c| c.mask != 0)
            .take(MAX_CONNECTIONS);
        for (slot, conn) in record.connections.iter_mut().zip(connections) {
            *slot = conn;
            record.size += 1;
        }
        Ok(record)
    }

    /// Enable or disable the selected module.
    pub fn enable(&self, client: ClientId, enable: bool) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.enable(client, enable)
    }

    /// Reset the selected module.
    pub fn reset(&self, client: ClientId) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.reset(client)
    }

    /// Status of the selected module.
    pub fn status(&self, client: ClientId) -> Result<HardwareStatus, DriverError> {
        let caller = self.client(client)?;
        Ok(self.resolve_module(&caller, 0)?.status())
    }

    /// Status of the selected module; transient faults are cleared.
    pub fn clear_status(&self, client: ClientId) -> Result<HardwareStatus, DriverError> {
        let caller = self.client(client)?;
        Ok(self.resolve_module(&caller, 0)?.status_and_clear())
    }

    /// Read one register of the selected module.
    pub fn raw_read(&self, client: ClientId, block: RawIoBlock) -> Result<RawIoBlock, DriverError> {
        let caller = self.client(client)?;
        let mut block = block;
        self.resolve_module(&caller, 0)?.raw_read(client, &mut block)?;
        Ok(block)
    }

    /// Write one register of the selected module.
    pub fn raw_write(&self, client: ClientId, block: RawIoBlock) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.raw_write(client, &block)
    }

    /// Read a block of registers of the selected module. The returned
    /// record carries the items read and their count.
    pub fn raw_block_read(
        &self,
        client: ClientId,
        block: RawIoTransfer,
    ) -> Result<RawIoTransfer, DriverError> {
        let caller = self.client(client)?;
        let mut block = block;
        self.resolve_module(&caller, 0)?.raw_block_read(client, &mut block)?;
        Ok(block)
    }

    /// Write a block of registers of the selected module.
    pub fn raw_block_write(
        &self,
        client: ClientId,
        block: RawIoTransfer,
    ) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.raw_block_write(client, &block)
    }

    /// Open exclusive firmware access to the selected module.
    pub fn jtag_open(&self, client: ClientId) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.open_exclusive(client)
    }

    /// Read one firmware byte.
    pub fn jtag_read_byte(&self, client: ClientId) -> Result<u8, DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.firmware_read(client)
    }

    /// Write one firmware byte.
    pub fn jtag_write_byte(&self, client: ClientId, byte: u8) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.firmware_write(client, byte)
    }

    /// Close exclusive firmware access; the module is reset.
    pub fn jtag_close(&self, client: ClientId) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        self.resolve_module(&caller, 0)?.close_exclusive(client)
    }
}
