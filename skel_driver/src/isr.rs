//! Interrupt top half.
//!
//! Runs on whatever thread the bus back-end delivers the interrupt on. It
//! only takes spin locks (connection registry → client slot → queue) and the
//! queue semaphore's short std mutex, so it never waits on a blocked client.

use crate::client::ClientTable;
use crate::module::ModuleContext;
use skel_common::driver::error::HwError;
use skel_common::driver::types::{mask_bits, EventRecord, HwTime};
use tracing::trace;

/// Outcome of one interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatch {
    /// Active source mask read from the hardware.
    pub mask: u32,
    /// Number of records queued across all clients.
    pub delivered: usize,
}

/// Read and acknowledge the module's pending sources, then fan them out.
///
/// A bus fault while reading the source flags the module BUS_FAULT and
/// delivers nothing.
pub fn dispatch(module: &ModuleContext, clients: &ClientTable) -> Dispatch {
    let source = match module.hooks().interrupt_source(module.io()) {
        Ok(source) => source,
        Err(HwError::NotImplemented) => return Dispatch::default(),
        Err(e) => {
            module.fault("interrupt_source", e);
            return Dispatch::default();
        }
    };
    fan_out(module, clients, source.mask, source.time)
}

/// Queue one record per (active source, subscriber) pair.
pub fn fan_out(
    module: &ModuleContext,
    clients: &ClientTable,
    mask: u32,
    time: HwTime,
) -> Dispatch {
    if mask == 0 {
        return Dispatch::default();
    }
    let number = module.number();
    let delivered = module.with_connections(|reg| {
        mask_bits(mask)
            .map(|bit| {
                let subscribers = reg.active_subscribers(bit);
                if subscribers.is_empty() {
                    return 0;
                }
                let record = EventRecord {
                    module: number,
                    source_mask: 1 << bit,
                    time,
                };
                clients.deliver(subscribers, record)
            })
            .sum::<usize>()
    });
    trace!(module = number, mask, delivered, "Interrupt dispatched");
    Dispatch { mask, delivered }
}
