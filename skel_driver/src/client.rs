//! Client contexts and the client table.
//!
//! A client is one open connection to the driver. Its slot index in the
//! [`ClientTable`] is its [`ClientId`]. Slots are written only by open and
//! close; the interrupt path takes slot read locks to deliver events.

use crate::queue::EventQueue;
use skel_common::consts::MAX_CLIENTS;
use skel_common::driver::config::DriverSettings;
use skel_common::driver::error::DriverError;
use skel_common::driver::types::{ClientId, ClientInfo, ClientSet, DebugFlags, EventRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Per-open-connection state.
pub struct ClientContext {
    id: ClientId,
    pid: u32,
    module: AtomicU32,
    debug: AtomicU32,
    timeout_ms: AtomicU32,
    queue: EventQueue,
}

impl ClientContext {
    /// New client selecting `module`, with queue and timeout from `settings`.
    pub fn new(id: ClientId, pid: u32, module: u32, settings: &DriverSettings) -> Self {
        let queue = EventQueue::new(settings.queue_capacity);
        queue.set_discard_on_timeout(settings.discard_on_timeout);
        Self {
            id,
            pid,
            module: AtomicU32::new(module),
            debug: AtomicU32::new(0),
            timeout_ms: AtomicU32::new(settings.client_timeout_ms),
            queue,
        }
    }

    /// Slot index.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Owning process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Selected module number.
    pub fn module(&self) -> u32 {
        self.module.load(Ordering::Acquire)
    }

    /// Select a module. The caller has checked that it is installed.
    pub fn set_module(&self, module: u32) {
        self.module.store(module, Ordering::Release);
    }

    /// Debug flags.
    pub fn debug(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.debug.load(Ordering::Relaxed))
    }

    /// Replace the debug flags.
    pub fn set_debug(&self, flags: DebugFlags) {
        self.debug.store(flags.bits(), Ordering::Relaxed);
    }

    /// Read timeout in milliseconds (0 = forever).
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Set the read timeout in milliseconds (0 = forever).
    pub fn set_timeout_ms(&self, ms: u32) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Read timeout, `None` for "wait forever".
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms() {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    /// The client's event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Snapshot handed to hardware hooks.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            pid: self.pid,
            module: self.module(),
        }
    }

    /// Blocking read of the next event, honoring the client timeout.
    pub fn read(&self) -> Result<EventRecord, DriverError> {
        self.queue.pop(self.timeout())
    }
}

type Slot = spin::RwLock<Option<Arc<ClientContext>>>;

/// Fixed table of client slots.
pub struct ClientTable {
    slots: heapless::Vec<Slot, MAX_CLIENTS>,
}

impl ClientTable {
    /// Table with `capacity` slots (clamped to `1..=MAX_CLIENTS`).
    pub fn new(capacity: usize) -> Self {
        let mut slots = heapless::Vec::new();
        for _ in 0..capacity.clamp(1, MAX_CLIENTS) {
            if slots.push(spin::RwLock::new(None)).is_err() {
                break;
            }
        }
        Self { slots }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot and fill it with `make(id)`.
    ///
    /// # Errors
    /// `Capacity` when every slot is taken.
    pub fn allocate(
        &self,
        make: impl Fn(ClientId) -> ClientContext,
    ) -> Result<Arc<ClientContext>, DriverError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.write();
            if guard.is_none() {
                let client = Arc::new(make(ClientId(idx)));
                *guard = Some(Arc::clone(&client));
                return Ok(client);
            }
        }
        Err(DriverError::Capacity(format!(
            "all {} client slots in use",
            self.slots.len()
        )))
    }

    /// Free a slot, returning its client.
    pub fn release(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.slots.get(id.0).and_then(|slot| slot.write().take())
    }

    /// Client in slot `id`.
    pub fn get(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.slots.get(id.0).and_then(|slot| slot.read().clone())
    }

    /// First client owned by `pid`.
    pub fn find_pid(&self, pid: u32) -> Option<Arc<ClientContext>> {
        self.open().into_iter().find(|c| c.pid() == pid)
    }

    /// Every open client, in slot order.
    pub fn open(&self) -> Vec<Arc<ClientContext>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.read().clone())
            .collect()
    }

    /// Number of open clients.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.read().is_some()).count()
    }

    /// Push `record` into the queue of every open client in `set`.
    /// Returns the number of queues reached. Interrupt-safe.
    pub fn deliver(&self, set: ClientSet, record: EventRecord) -> usize {
        let mut delivered = 0;
        for id in set.iter() {
            if let Some(slot) = self.slots.get(id.0) {
                if let Some(client) = slot.read().as_ref() {
                    client.queue().push(record);
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
