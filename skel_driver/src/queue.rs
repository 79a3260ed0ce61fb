//! Per-client event queue.
//!
//! A fixed-capacity ring of [`EventRecord`]s filled from interrupt context
//! and drained by one reading client.
//!
//! - `push` never blocks: a full queue evicts its oldest record and counts
//!   the loss.
//! - `pop` blocks on a counting semaphore that is never waited on while the
//!   queue's spin lock is held.
//! - The semaphore is a std mutex plus condvar. `push` takes that mutex on
//!   the interrupt path for a counter bump only; a waiting reader has
//!   released it inside `Condvar::wait`.

use skel_common::consts::MAX_QUEUE_SIZE;
use skel_common::driver::error::DriverError;
use skel_common::driver::types::EventRecord;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct QueueState {
    entries: heapless::Deque<EventRecord, MAX_QUEUE_SIZE>,
    capacity: usize,
    missed: u32,
    accumulate: bool,
    discard_on_timeout: bool,
}

/// Bounded event queue with overflow accounting and blocking pop.
pub struct EventQueue {
    state: spin::Mutex<QueueState>,
    sem: Semaphore,
}

impl EventQueue {
    /// Create an empty queue holding at most `capacity` records
    /// (clamped to `1..=MAX_QUEUE_SIZE`).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: spin::Mutex::new(QueueState {
                entries: heapless::Deque::new(),
                capacity: capacity.clamp(1, MAX_QUEUE_SIZE),
                missed: 0,
                accumulate: true,
                discard_on_timeout: true,
            }),
            sem: Semaphore::new(),
        }
    }

    /// Append a record. Interrupt-safe, never blocks.
    ///
    /// Returns `true` if the oldest record was evicted to make room.
    pub fn push(&self, record: EventRecord) -> bool {
        let grew = {
            let mut q = self.state.lock();
            let evicted = if q.entries.len() >= q.capacity {
                q.entries.pop_front();
                q.missed = q.missed.saturating_add(1);
                true
            } else {
                false
            };
            // Capacity is at most MAX_QUEUE_SIZE and one slot is free here.
            let _ = q.entries.push_back(record);
            !evicted
        };
        if grew {
            self.sem.signal();
        }
        !grew
    }

    /// Take the oldest record, waiting up to `timeout` (`None` = forever).
    ///
    /// # Errors
    /// - `Interrupted` if a cancellation is pending; no record is consumed.
    /// - `Timeout` when the wait elapses. With discard-on-timeout the queue
    ///   and its overflow counter are cleared first.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<EventRecord, DriverError> {
        if !self.state.lock().accumulate {
            self.drain();
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.sem.take_interrupt() {
                return Err(DriverError::Interrupted);
            }
            let head = self.state.lock().entries.pop_front();
            if let Some(record) = head {
                self.sem.try_acquire();
                return Ok(record);
            }
            match self.sem.acquire(deadline) {
                Ok(()) => {
                    if let Some(record) = self.state.lock().entries.pop_front() {
                        return Ok(record);
                    }
                    // Signal outlived its record (reset or drain); wait again.
                }
                Err(DriverError::Timeout) => {
                    let mut q = self.state.lock();
                    if q.discard_on_timeout {
                        q.entries.clear();
                        q.missed = 0;
                    }
                    return Err(DriverError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Empty the queue and clear the overflow counter and any pending
    /// cancellation.
    pub fn reset(&self) {
        {
            let mut q = self.state.lock();
            q.entries.clear();
            q.missed = 0;
        }
        self.sem.reset();
    }

    /// Wake a blocked reader (or the next one) with `Interrupted`.
    pub fn interrupt(&self) {
        self.sem.interrupt();
    }

    /// Lost-record count, cleared by the read.
    pub fn overflow_count_and_clear(&self) -> u32 {
        core::mem::take(&mut self.state.lock().missed)
    }

    /// Lost-record count.
    pub fn overflow_count(&self) -> u32 {
        self.state.lock().missed
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue holds no record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a read would return without blocking.
    pub fn is_ready(&self) -> bool {
        !self.is_empty()
    }

    /// Maximum number of records held.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Keep records between reads (`true`, default) or discard stale
    /// records before each read (`false`, queue-off mode).
    pub fn set_accumulate(&self, accumulate: bool) {
        self.state.lock().accumulate = accumulate;
    }

    /// Current accumulate mode.
    pub fn accumulate(&self) -> bool {
        self.state.lock().accumulate
    }

    /// Whether a timed-out read clears the queue.
    pub fn set_discard_on_timeout(&self, discard: bool) {
        self.state.lock().discard_on_timeout = discard;
    }

    fn drain(&self) {
        self.state.lock().entries.clear();
        self.sem.clear_count();
    }
}

struct SemState {
    count: u32,
    interrupted: bool,
}

/// Counting semaphore with a pending-cancellation flag.
struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            state: Mutex::new(SemState {
                count: 0,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        let mut s = self.lock();
        s.count = s.count.saturating_add(1);
        self.cond.notify_one();
    }

    fn interrupt(&self) {
        self.lock().interrupted = true;
        self.cond.notify_all();
    }

    fn take_interrupt(&self) -> bool {
        core::mem::take(&mut self.lock().interrupted)
    }

    fn try_acquire(&self) {
        let mut s = self.lock();
        s.count = s.count.saturating_sub(1);
    }

    fn clear_count(&self) {
        self.lock().count = 0;
    }

    fn reset(&self) {
        let mut s = self.lock();
        s.count = 0;
        s.interrupted = false;
    }

    fn acquire(&self, deadline: Option<Instant>) -> Result<(), DriverError> {
        let mut s = self.lock();
        loop {
            if s.interrupted {
                s.interrupted = false;
                return Err(DriverError::Interrupted);
            }
            if s.count > 0 {
                s.count -= 1;
                return Ok(());
            }
            s = match deadline {
                None => self.cond.wait(s).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::Timeout);
                    }
                    self.cond
                        .wait_timeout(s, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skel_common::driver::types::HwTime;
    use std::sync::Arc;
    use std::thread;

    fn record(n: u32) -> EventRecord {
        EventRecord {
            module: 1,
            source_mask: 1 << (n % 32),
            time: HwTime {
                second: n,
                nanosecond: 0,
            },
        }
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn overflow_keeps_most_recent() {
        let q = EventQueue::new(4);
        for n in 0..5 {
            q.push(record(n));
        }
        assert_eq!(q.len(), 4);
        assert_eq!(q.overflow_count(), 1);
        let seconds: Vec<u32> = (0..4).map(|_| q.pop(SHORT).unwrap().time.second).collect();
        assert_eq!(seconds, vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_read_and_clear() {
        let q = EventQueue::new(2);
        for n in 0..5 {
            q.push(record(n));
        }
        assert_eq!(q.overflow_count_and_clear(), 3);
        assert_eq!(q.overflow_count_and_clear(), 0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn timeout_discards_queue() {
        let q = EventQueue::new(4);
        q.push(record(1));
        assert!(q.pop(SHORT).is_ok());
        for n in 0..6 {
            q.push(record(n));
        }
        // Drain everything, then time out with an overflow outstanding.
        for _ in 0..4 {
            q.pop(SHORT).unwrap();
        }
        assert_eq!(q.overflow_count(), 2);
        assert_eq!(q.pop(SHORT), Err(DriverError::Timeout));
        assert_eq!(q.overflow_count(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn timeout_keeps_queue_when_configured() {
        let q = EventQueue::new(2);
        q.set_discard_on_timeout(false);
        for n in 0..3 {
            q.push(record(n));
        }
        q.pop(SHORT).unwrap();
        q.pop(SHORT).unwrap();
        assert_eq!(q.pop(SHORT), Err(DriverError::Timeout));
        assert_eq!(q.overflow_count(), 1);
    }

    #[test]
    fn interrupt_leaves_queue_intact() {
        let q = EventQueue::new(4);
        q.push(record(7));
        q.interrupt();
        assert_eq!(q.pop(SHORT), Err(DriverError::Interrupted));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(SHORT).unwrap().time.second, 7);
    }

    #[test]
    fn interrupt_wakes_blocked_reader() {
        let q = Arc::new(EventQueue::new(4));
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop(None))
        };
        thread::sleep(Duration::from_millis(30));
        q.interrupt();
        assert_eq!(reader.join().unwrap(), Err(DriverError::Interrupted));
    }

    #[test]
    fn push_wakes_blocked_reader() {
        let q = Arc::new(EventQueue::new(4));
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(30));
        q.push(record(9));
        assert_eq!(reader.join().unwrap().unwrap().time.second, 9);
    }

    #[test]
    fn concurrent_pushes_each_wake_the_reader() {
        let q = Arc::new(EventQueue::new(256));
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                (0..200)
                    .map(|_| q.pop(Some(Duration::from_secs(5))))
                    .collect::<Result<Vec<_>, _>>()
            })
        };
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for n in 0..50 {
                        q.push(record(t * 50 + n));
                    }
                })
            })
            .collect();
        for pusher in pushers {
            pusher.join().unwrap();
        }
        assert_eq!(reader.join().unwrap().unwrap().len(), 200);
        assert_eq!(q.overflow_count(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_off_discards_stale_records() {
        let q = Arc::new(EventQueue::new(8));
        q.set_accumulate(false);
        q.push(record(1));
        q.push(record(2));
        let reader = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        q.push(record(3));
        assert_eq!(reader.join().unwrap().unwrap().time.second, 3);
    }

    #[test]
    fn reset_clears_everything() {
        let q = EventQueue::new(2);
        for n in 0..4 {
            q.push(record(n));
        }
        q.interrupt();
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.overflow_count(), 0);
        assert_eq!(q.pop(SHORT), Err(DriverError::Timeout));
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(EventQueue::new(0).capacity(), 1);
        assert_eq!(EventQueue::new(10_000).capacity(), MAX_QUEUE_SIZE);
    }
}
