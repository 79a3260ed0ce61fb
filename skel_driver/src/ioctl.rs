//! Byte-level control-command dispatch.
//!
//! Decodes the argument record of a standard command, calls the typed
//! method and encodes the reply into the same buffer. Commands of any other
//! type are handed to the callback set unmodified.

use crate::driver::Driver;
use skel_common::driver::error::DriverError;
use skel_common::driver::ioctl::*;
use skel_common::driver::types::{ClientId, Connection, DebugFlags, HardwareStatus};
use tracing::debug;

impl Driver {
    /// Execute control command `cmd` with argument buffer `arg`.
    ///
    /// # Errors
    /// - `InvalidArgument` if `arg` is too small for the command, before
    ///   anything runs
    /// - `NotSupported` for unknown standard numbers, or hardware commands
    ///   the callback set does not implement
    /// - whatever the command itself returns
    pub fn ioctl(&self, client: ClientId, cmd: u32, arg: &mut [u8]) -> Result<(), DriverError> {
        let caller = self.client(client)?;
        check_bounds(cmd, arg.len())?;

        if caller.debug().contains(DebugFlags::TRACE) {
            let name = command_name(cmd)
                .or_else(|| self.shared.hooks.ioctl_name(cmd))
                .unwrap_or("UNKNOWN");
            debug!(
                %client,
                module = caller.module(),
                name,
                size = ioc_size(cmd),
                "ioctl {cmd:#010x}"
            );
        }

        if ioc_type(cmd) != SKEL_MAGIC {
            let module = self.resolve_module(&caller, 0)?;
            return module.user_ioctl(&caller.info(), cmd, arg);
        }

        match cmd {
            SKEL_SET_DEBUG => self.set_debug(client, DebugRecord::decode(arg)?),
            SKEL_GET_DEBUG => {
                let request = DebugRecord::decode(arg)?;
                self.get_debug(client, request.client_pid)?.encode(arg)
            }
            SKEL_GET_VERSION => self.version(client)?.encode(arg),
            SKEL_SET_TIMEOUT => self.set_timeout(client, u32::decode(arg)?),
            SKEL_GET_TIMEOUT => self.timeout(client)?.encode(arg),
            SKEL_SET_QUEUE_FLAG => self.set_queue_off(client, u32::decode(arg)? != 0),
            SKEL_GET_QUEUE_FLAG => (self.queue_off(client)? as u32).encode(arg),
            SKEL_GET_QUEUE_SIZE => self.queue_size(client)?.encode(arg),
            SKEL_GET_QUEUE_OVERFLOW => self.queue_overflow(client)?.encode(arg),
            SKEL_SET_MODULE => self.set_module(client, u32::decode(arg)?),
            SKEL_GET_MODULE => self.selected_module(client)?.encode(arg),
            SKEL_GET_MODULE_COUNT => self.module_count()?.encode(arg),
            SKEL_GET_MODULE_MAPS => self.module_maps(client)?.encode(arg),
            SKEL_CONNECT => self.connect(client, Connection::decode(arg)?).map(drop),
            SKEL_DISCONNECT => self.disconnect(client, Connection::decode(arg)?).map(drop),
            SKEL_GET_CLIENT_LIST => self.client_list()?.encode(arg),
            SKEL_GET_CLIENT_CONNECTIONS => {
                let request = ClientConnections::decode(arg)?;
                self.client_connections(client, request.pid)?.encode(arg)
            }
            SKEL_ENABLE => self.enable(client, u32::decode(arg)? != 0),
            SKEL_RESET => self.reset(client),
            SKEL_GET_STATUS => status_record(self.status(client)?).encode(arg),
            SKEL_GET_CLEAR_STATUS => status_record(self.clear_status(client)?).encode(arg),
            SKEL_RAW_READ => self.raw_read(client, RawIoBlock::decode(arg)?)?.encode(arg),
            SKEL_RAW_WRITE => self.raw_write(client, RawIoBlock::decode(arg)?),
            SKEL_JTAG_OPEN => self.jtag_open(client),
            SKEL_JTAG_READ_BYTE => (self.jtag_read_byte(client)? as u32).encode(arg),
            SKEL_JTAG_WRITE_BYTE => {
                let value = u32::decode(arg)?;
                let byte = u8::try_from(value).map_err(|_| {
                    DriverError::InvalidArgument(format!("{value:#x} is not a byte"))
                })?;
                self.jtag_write_byte(client, byte)
            }
            SKEL_JTAG_CLOSE => self.jtag_close(client),
            SKEL_RAW_BLOCK_READ => self
                .raw_block_read(client, RawIoTransfer::decode(arg)?)?
                .encode(arg),
            SKEL_RAW_BLOCK_WRITE => self.raw_block_write(client, RawIoTransfer::decode(arg)?),
            _ => Err(DriverError::NotSupported(format!(
                "standard command {} (size {})",
                ioc_nr(cmd),
                ioc_size(cmd)
            ))),
        }
    }
}

fn status_record(status: HardwareStatus) -> StatusRecord {
    StatusRecord {
        standard: status.standard.bits(),
        hardware: status.raw,
    }
}
