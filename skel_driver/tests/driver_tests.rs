//! Driver integration tests on the simulation back-end.
//!
//! Every test installs a fresh driver over its own [`Simulator`] and drives
//! it through the typed command API or the byte-level `ioctl`/`read`/`write`
//! path, then checks the outcome on both the driver and the simulated board.

use skel_common::config::{ConfigLoader, Validate};
use skel_common::consts::{DRIVER_VERSION, MAX_BLOCK_ITEMS};
use skel_common::driver::backend::{Backend, HardwareCallbacks, ModuleIo};
use skel_common::driver::config::DriverConfig;
use skel_common::driver::error::{DriverError, HwError};
use skel_common::driver::ioctl::*;
use skel_common::driver::types::{
    ClientId, Connection, DebugFlags, EventRecord, HwTime, InterruptSource, ModuleState,
    StandardStatus,
};
use skel_driver::backends::simulation::{Simulator, SIM_GET_RESET_COUNT, SIM_MAGIC, SIM_RAISE};
use skel_driver::Driver;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ─── Fixtures ───────────────────────────────────────────────────────

const MODULE_SPACE: u32 = 0x39;

/// Two modules, one 32-bit space each, both with an interrupt line.
fn config_toml(queue_capacity: usize, client_timeout_ms: u32, module_timeout_ms: u32) -> String {
    format!(
        r#"
[shared]
service_name = "skel-test"

[driver]
client_capacity = 4
queue_capacity = {queue_capacity}
client_timeout_ms = {client_timeout_ms}
module_timeout_ms = {module_timeout_ms}

[[modules]]
module_number = 1
bus = "vme"
isr = {{ vector = 0xB8, level = 2 }}

[[modules.spaces]]
space_number = {MODULE_SPACE}
base_address = 0xC00000
window_size = 0x100
data_width = 32

[[modules]]
module_number = 2
bus = "vme"
isr = {{ vector = 0xB9, level = 2 }}

[[modules.spaces]]
space_number = {MODULE_SPACE}
base_address = 0xC10000
window_size = 0x100
data_width = 32
"#
    )
}

fn config(queue_capacity: usize, client_timeout_ms: u32, module_timeout_ms: u32) -> DriverConfig {
    DriverConfig::from_toml(&config_toml(queue_capacity, client_timeout_ms, module_timeout_ms))
        .unwrap()
}

fn install(config: DriverConfig) -> (Driver, Simulator) {
    let sim = Simulator::new();
    let (driver, report) = Driver::install(config, sim.backend()).unwrap();
    assert!(report.failures.is_empty());
    (driver, sim)
}

fn default_driver() -> (Driver, Simulator) {
    install(config(32, 100, 50))
}

fn conn(module: u32, mask: u32) -> Connection {
    Connection { module, mask }
}

fn assert_consistent(driver: &Driver) {
    for number in driver.module_numbers() {
        let module = driver.module_context(number).unwrap();
        assert!(module.with_connections(|reg| reg.is_consistent()));
    }
}

/// 32-bit block transfer on the module space.
fn block(offset: u32, increment: u32, count: u32) -> RawIoTransfer {
    RawIoTransfer {
        space: MODULE_SPACE,
        offset,
        width: 32,
        increment,
        count,
        ..RawIoTransfer::default()
    }
}

fn drain(driver: &Driver, client: ClientId) -> Vec<EventRecord> {
    let mut events = Vec::new();
    while driver.queue_size(client).unwrap() > 0 {
        events.push(driver.read(client).unwrap());
    }
    events
}

/// Callback set with only the mandatory hooks.
struct BareHooks;

impl HardwareCallbacks for BareHooks {
    fn name(&self) -> &'static str {
        "bare"
    }

    fn interrupt_source(&self, _io: &ModuleIo) -> Result<InterruptSource, HwError> {
        Ok(InterruptSource {
            time: HwTime::now(),
            mask: 0,
        })
    }
}

// ─── Install / uninstall ────────────────────────────────────────────

#[test]
fn install_maps_and_wires_every_module() {
    let (driver, sim) = default_driver();

    assert!(driver.is_installed());
    assert_eq!(driver.name(), "skel-test");
    assert_eq!(driver.module_numbers(), vec![1, 2]);
    assert_eq!(driver.module_count().unwrap(), 2);
    for module in [1, 2] {
        assert!(sim.has_handler(module));
        assert!(sim.is_mapped(module, MODULE_SPACE));
        assert!(sim.is_enabled(module));
        let ctx = driver.module_context(module).unwrap();
        assert!(!ctx.standard_status().contains(StandardStatus::NO_ISR));
        assert_eq!(ctx.state(), ModuleState::Operational);
    }
}

#[test]
fn sample_config_installs_and_frees_init_spaces() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/driver.toml");
    let config = DriverConfig::load_validated(&path).unwrap();
    let sim = Simulator::new();
    let (driver, report) = Driver::install(config, sim.backend()).unwrap();

    assert_eq!(report.installed, vec![1, 2]);
    assert!(sim.is_mapped(1, 0x39));
    assert!(!sim.is_mapped(1, 0x29));
    let client = driver.open().unwrap();
    assert_eq!(driver.module_maps(client).unwrap().count, 1);
}

#[test]
fn failed_module_is_rolled_back_and_reported() {
    let sim = Simulator::new();
    sim.fail_init(2, true);
    let (driver, report) = Driver::install(config(32, 100, 50), sim.backend()).unwrap();

    assert_eq!(report.installed, vec![1]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, 2);
    assert!(!sim.has_handler(2));
    assert!(!sim.is_mapped(2, MODULE_SPACE));
    assert_eq!(driver.module_numbers(), vec![1]);

    let client = driver.open().unwrap();
    assert!(matches!(
        driver.set_module(client, 2),
        Err(DriverError::NoSuchModule(2))
    ));
}

#[test]
fn install_fails_when_no_module_installs() {
    let sim = Simulator::new();
    sim.fail_map(1, true);
    sim.fail_init(2, true);

    let result = Driver::install(config(32, 100, 50), sim.backend());
    assert!(matches!(result, Err(DriverError::NoDevice)));
    assert!(!sim.has_handler(1));
    assert!(!sim.has_handler(2));
    assert!(!sim.is_mapped(2, MODULE_SPACE));
}

#[test]
fn invalid_config_is_rejected_before_install() {
    let mut config = config(32, 100, 50);
    config.modules[1].module_number = 1;
    assert!(config.validate().is_err());

    let result = Driver::install(config, Simulator::new().backend());
    assert!(matches!(result, Err(DriverError::Config(_))));
}

#[test]
fn emulation_debug_flag_skips_mapping() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    let toml = config_toml(32, 100, 50).replace("[driver]\n", "[driver]\ndebug_flags = 0x100\n");
    fs::write(&path, toml).unwrap();
    let config = DriverConfig::load_validated(&path).unwrap();
    assert!(config.driver.emulated());
    let (driver, sim) = install(config);
    let client = driver.open().unwrap();

    assert!(!sim.is_mapped(1, MODULE_SPACE));
    let status = driver.status(client).unwrap().standard;
    assert!(status.contains(StandardStatus::EMULATION | StandardStatus::NO_HARDWARE));
    let block = RawIoBlock {
        space: MODULE_SPACE,
        ..RawIoBlock::default()
    };
    assert!(matches!(
        driver.raw_read(client, block),
        Err(DriverError::NoSuchAddressSpace(MODULE_SPACE))
    ));
}

#[test]
fn uninstall_refused_while_clients_open() {
    let (driver, sim) = default_driver();
    let client = driver.open().unwrap();

    assert!(matches!(driver.uninstall(), Err(DriverError::Busy(_))));
    assert!(driver.is_installed());

    driver.close(client).unwrap();
    driver.uninstall().unwrap();
    assert!(!driver.is_installed());
    assert!(!sim.has_handler(1));
    assert!(!sim.is_mapped(1, MODULE_SPACE));
    assert!(matches!(driver.open(), Err(DriverError::NoDevice)));
    assert!(matches!(driver.uninstall(), Err(DriverError::NoDevice)));
}

#[test]
fn uninstall_never_races_an_open() {
    for round in 0..50 {
        let (driver, _sim) = default_driver();
        let start = Arc::new(Barrier::new(4));
        let openers: Vec<_> = (0..3)
            .map(|pid| {
                let driver = driver.clone();
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    driver.open_with_pid(300 + pid).ok()
                })
            })
            .collect();
        start.wait();
        let uninstalled = driver.uninstall().is_ok();
        let opened: Vec<ClientId> = openers
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        // Openers never close, so a successful uninstall means none got in.
        assert_eq!(uninstalled, opened.is_empty(), "round {round}");
        assert_eq!(driver.is_installed(), !uninstalled);
        for id in opened {
            assert!(driver.client_context(id).is_some());
        }
    }
}

// ─── Clients ────────────────────────────────────────────────────────

#[test]
fn open_selects_first_module_and_respects_capacity() {
    let (driver, _sim) = default_driver();
    let clients: Vec<_> = (0..4).map(|pid| driver.open_with_pid(100 + pid).unwrap()).collect();

    assert_eq!(driver.selected_module(clients[0]).unwrap(), 1);
    assert!(matches!(
        driver.open_with_pid(200),
        Err(DriverError::Capacity(_))
    ));

    driver.close(clients[2]).unwrap();
    let reopened = driver.open_with_pid(200).unwrap();
    assert_eq!(reopened, clients[2]);
    assert!(matches!(
        driver.read(ClientId(9)),
        Err(DriverError::NoSuchClient(9))
    ));
}

#[test]
fn client_list_and_connections_by_pid() {
    let (driver, _sim) = default_driver();
    let a = driver.open_with_pid(100).unwrap();
    let b = driver.open_with_pid(200).unwrap();
    driver.connect(b, conn(1, 0x5)).unwrap();
    driver.connect(b, conn(2, 0x8)).unwrap();

    let list = driver.client_list().unwrap();
    assert_eq!(list.size, 2);
    let mut pids = list.pids[..2].to_vec();
    pids.sort_unstable();
    assert_eq!(pids, vec![100, 200]);

    let record = driver.client_connections(a, 200).unwrap();
    assert_eq!(record.pid, 200);
    assert_eq!(record.size, 2);
    assert_eq!(record.connections[0], conn(1, 0x5));
    assert_eq!(record.connections[1], conn(2, 0x8));

    assert_eq!(driver.client_connections(a, 0).unwrap().size, 0);
    assert!(matches!(
        driver.client_connections(a, 999),
        Err(DriverError::NoSuchClient(999))
    ));
}

#[test]
fn debug_flags_set_on_another_client_by_pid() {
    let (driver, _sim) = default_driver();
    let a = driver.open_with_pid(100).unwrap();
    let _b = driver.open_with_pid(200).unwrap();

    let flags = (DebugFlags::TRACE | DebugFlags::WARNING).bits();
    driver
        .set_debug(a, DebugRecord { client_pid: 200, flags })
        .unwrap();

    assert_eq!(driver.get_debug(a, 200).unwrap().flags, flags);
    assert_eq!(driver.get_debug(a, 0).unwrap().flags, 0);
    assert!(matches!(
        driver.set_debug(a, DebugRecord { client_pid: 999, flags }),
        Err(DriverError::NoSuchClient(_))
    ));
}

// ─── Connections ────────────────────────────────────────────────────

#[test]
fn enabled_mask_tracks_every_subscription() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();

    assert_eq!(driver.connect(a, conn(1, 0x3)).unwrap(), 0x3);
    assert_consistent(&driver);
    assert_eq!(driver.connect(b, conn(1, 0x6)).unwrap(), 0x7);
    assert_eq!(sim.enabled_mask(1), 0x7);
    assert_consistent(&driver);

    // Source 1 is still held by B.
    assert_eq!(driver.disconnect(a, conn(1, 0x3)).unwrap(), 0x6);
    assert_eq!(sim.enabled_mask(1), 0x6);
    assert_consistent(&driver);

    driver.connect(a, conn(2, 0x10)).unwrap();
    assert_eq!(sim.enabled_mask(2), 0x10);

    driver.close(b).unwrap();
    assert_eq!(sim.enabled_mask(1), 0);
    assert_eq!(driver.module_context(1).unwrap().connections_of(b), 0);
    assert_eq!(sim.enabled_mask(2), 0x10);
    assert_consistent(&driver);
}

#[test]
fn zero_mask_connect_disconnects_everywhere() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    driver.connect(a, conn(2, 0x2)).unwrap();

    assert_eq!(driver.connect(a, conn(2, 0)).unwrap(), 0);
    assert_eq!(sim.enabled_mask(1), 0x1);

    driver.connect(a, conn(2, 0x2)).unwrap();
    driver.connect(a, conn(0, 0)).unwrap();
    assert_eq!(sim.enabled_mask(1), 0);
    assert_eq!(sim.enabled_mask(2), 0);
    assert_eq!(driver.client_connections(a, 0).unwrap().size, 0);
}

#[test]
fn disconnect_everywhere_continues_past_rejecting_module() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    driver.connect(a, conn(2, 0x2)).unwrap();

    sim.reject_mask(2, true);
    assert!(matches!(
        driver.connect(a, conn(0, 0)),
        Err(DriverError::HardwareFault { module: 2, .. })
    ));
    assert_eq!(sim.enabled_mask(1), 0);
    let second = driver.module_context(2).unwrap();
    assert_eq!(second.connections_of(a), 0);
    assert!(second.standard_status().contains(StandardStatus::BUS_FAULT));
    assert_eq!(driver.client_connections(a, 0).unwrap().size, 0);
    assert_consistent(&driver);

    // A failing first module does not stop the second.
    sim.reject_mask(2, false);
    driver.connect(a, conn(1, 0x4)).unwrap();
    driver.connect(a, conn(2, 0x8)).unwrap();
    sim.reject_mask(1, true);
    assert!(matches!(
        driver.connect(a, conn(0, 0)),
        Err(DriverError::HardwareFault { module: 1, .. })
    ));
    assert_eq!(sim.enabled_mask(2), 0);
    assert_eq!(driver.module_context(1).unwrap().connections_of(a), 0);
    assert_consistent(&driver);
}

#[test]
fn rejected_mask_rolls_back_the_registry() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();

    sim.reject_mask(1, true);
    let result = driver.connect(a, conn(1, 0x2));
    assert!(matches!(
        result,
        Err(DriverError::HardwareFault { module: 1, .. })
    ));
    let module = driver.module_context(1).unwrap();
    assert_eq!(module.connections_of(a), 0x1);
    assert_eq!(module.enabled_mask(), 0x1);
    assert!(module.standard_status().contains(StandardStatus::BUS_FAULT));

    // Close never fails, even when the mask cannot be pushed.
    driver.close(a).unwrap();
    assert_eq!(module.enabled_mask(), 0);

    sim.reject_mask(1, false);
    let b = driver.open().unwrap();
    assert_eq!(driver.connect(b, conn(1, 0x2)).unwrap(), 0x2);
}

// ─── Interrupt delivery ─────────────────────────────────────────────

#[test]
fn interrupt_fans_out_per_source_and_subscriber() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    driver.connect(b, conn(1, 0x3)).unwrap();

    sim.raise(1, 0x3 | 0x8).unwrap();
    assert_eq!(sim.pending(1), 0);

    let a_events = drain(&driver, a);
    let b_events = drain(&driver, b);
    assert_eq!(a_events.len(), 1);
    assert_eq!(a_events[0].source_mask, 0x1);
    assert_eq!(a_events[0].module, 1);
    let b_sources: Vec<u32> = b_events.iter().map(|e| e.source_mask).collect();
    assert_eq!(b_sources, vec![0x1, 0x2]);
    // Both records of one interrupt carry the same stamp.
    assert_eq!(b_events[0].time, b_events[1].time);
}

#[test]
fn interrupt_on_other_module_is_not_delivered() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();

    sim.raise(2, 0x1).unwrap();
    assert_eq!(driver.queue_size(a).unwrap(), 0);
    assert!(!driver.poll_ready(a).unwrap());
}

#[test]
fn failing_acknowledge_flags_bus_fault_and_delivers_nothing() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();

    sim.fail_interrupt_ack(1, true);
    sim.raise(1, 0x1).unwrap();
    assert_eq!(driver.queue_size(a).unwrap(), 0);
    assert_eq!(
        driver.module_context(1).unwrap().state(),
        ModuleState::BusFault
    );
}

#[test]
fn overflow_keeps_newest_and_counts_losses() {
    let (driver, sim) = install(config(4, 100, 50));
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1F)).unwrap();

    for bit in 0..5 {
        sim.raise(1, 1 << bit).unwrap();
    }

    assert_eq!(driver.queue_size(a).unwrap(), 4);
    let client = driver.client_context(a).unwrap();
    assert_eq!(client.queue().overflow_count(), 1);
    assert_eq!(driver.queue_overflow(a).unwrap(), 1);
    assert_eq!(driver.queue_overflow(a).unwrap(), 0);

    let sources: Vec<u32> = drain(&driver, a).iter().map(|e| e.source_mask).collect();
    assert_eq!(sources, vec![0x2, 0x4, 0x8, 0x10]);
}

#[test]
fn timeout_discards_overflow_state() {
    let (driver, sim) = install(config(1, 20, 50));
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x3)).unwrap();
    sim.raise(1, 0x3).unwrap();

    assert_eq!(driver.read(a).unwrap().source_mask, 0x2);
    let start = Instant::now();
    assert!(matches!(driver.read(a), Err(DriverError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(15));
    assert_eq!(driver.queue_overflow(a).unwrap(), 0);
}

#[test]
fn queue_off_discards_stale_events() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    driver.set_queue_off(a, true).unwrap();
    assert!(driver.queue_off(a).unwrap());
    driver.set_timeout(a, 20).unwrap();

    sim.raise(1, 0x1).unwrap();
    assert_eq!(driver.queue_size(a).unwrap(), 1);
    assert!(matches!(driver.read(a), Err(DriverError::Timeout)));
}

#[test]
fn blocked_read_wakes_on_interrupt() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x4)).unwrap();
    driver.set_timeout(a, 0).unwrap();

    let reader = {
        let driver = driver.clone();
        thread::spawn(move || driver.read(a))
    };
    thread::sleep(Duration::from_millis(20));
    sim.raise(1, 0x4).unwrap();

    let event = reader.join().unwrap().unwrap();
    assert_eq!(event.source_mask, 0x4);
}

#[test]
fn cancellation_leaves_queued_events() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    sim.raise(1, 0x1).unwrap();

    driver.interrupt_client(a).unwrap();
    assert!(matches!(driver.read(a), Err(DriverError::Interrupted)));
    assert_eq!(driver.queue_size(a).unwrap(), 1);
    assert_eq!(driver.read(a).unwrap().source_mask, 0x1);
}

#[test]
fn cancellation_wakes_blocked_reader() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    driver.set_timeout(a, 0).unwrap();

    let reader = {
        let driver = driver.clone();
        thread::spawn(move || driver.read(a))
    };
    thread::sleep(Duration::from_millis(20));
    driver.interrupt_client(a).unwrap();

    assert!(matches!(
        reader.join().unwrap(),
        Err(DriverError::Interrupted)
    ));
}

#[test]
fn write_simulates_one_interrupt_per_record() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();
    driver.connect(a, conn(1, 0x2)).unwrap();

    let mut buf = [0u8; 2 * Connection::SIZE];
    conn(1, 0x2).encode(&mut buf[..Connection::SIZE]).unwrap();
    conn(0, 0x2).encode(&mut buf[Connection::SIZE..]).unwrap();
    assert_eq!(driver.write(b, &buf).unwrap(), buf.len());
    assert_eq!(driver.queue_size(a).unwrap(), 2);

    assert!(matches!(
        driver.write(b, &buf[..4]),
        Err(DriverError::InvalidArgument(_))
    ));

    let mut out = [0u8; EventRecord::SIZE];
    assert!(matches!(
        driver.read_into(a, &mut out[..8]),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(driver.read_into(a, &mut out).unwrap(), EventRecord::SIZE);
    let event = EventRecord::decode(&out).unwrap();
    assert_eq!(event.module, 1);
    assert_eq!(event.source_mask, 0x2);
}

#[test]
fn simulated_interrupt_reports_deliveries() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();
    driver.connect(a, conn(2, 0x1)).unwrap();
    driver.connect(b, conn(2, 0x3)).unwrap();

    let dispatch = driver.simulate_interrupt(a, conn(2, 0x3)).unwrap();
    assert_eq!(dispatch.mask, 0x3);
    assert_eq!(dispatch.delivered, 3);
}

// ─── Module commands ────────────────────────────────────────────────

#[test]
fn raw_io_checks_window_and_width() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let block = RawIoBlock {
        space: MODULE_SPACE,
        offset: 0x20,
        width: 16,
        data: 0xBEEF,
    };

    driver.raw_write(a, block).unwrap();
    let read = driver
        .raw_read(a, RawIoBlock { data: 0, ..block })
        .unwrap();
    assert_eq!(read.data, 0xBEEF);

    let too_wide = RawIoBlock { data: 0x1_0000, ..block };
    assert!(matches!(
        driver.raw_write(a, too_wide),
        Err(DriverError::InvalidArgument(_))
    ));
    let outside = RawIoBlock { offset: 0x100, ..block };
    assert!(matches!(
        driver.raw_read(a, outside),
        Err(DriverError::InvalidArgument(_))
    ));
    let odd_width = RawIoBlock { width: 24, ..block };
    assert!(matches!(
        driver.raw_read(a, odd_width),
        Err(DriverError::InvalidArgument(_))
    ));
    let unknown = RawIoBlock { space: 0x2D, ..block };
    assert!(matches!(
        driver.raw_read(a, unknown),
        Err(DriverError::NoSuchAddressSpace(0x2D))
    ));
}

#[test]
fn block_io_walks_registers_or_repeats_one() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();

    let mut write = block(0x20, 1, 4);
    write.data[..4].copy_from_slice(&[1, 2, 3, 4]);
    driver.raw_block_write(a, write).unwrap();
    let read = driver.raw_block_read(a, block(0x20, 1, 4)).unwrap();
    assert_eq!(read.count, 4);
    assert_eq!(&read.data[..4], &[1, 2, 3, 4]);
    let last = RawIoBlock {
        space: MODULE_SPACE,
        offset: 0x2C,
        width: 32,
        data: 0,
    };
    assert_eq!(driver.raw_read(a, last).unwrap().data, 4);

    let skipping = driver.raw_block_read(a, block(0x20, 2, 2)).unwrap();
    assert_eq!(&skipping.data[..2], &[1, 3]);

    // Increment 0 drives a single FIFO register.
    let mut fifo = block(0x40, 0, 3);
    fifo.data[..3].copy_from_slice(&[7, 8, 9]);
    driver.raw_block_write(a, fifo).unwrap();
    let drained = driver.raw_block_read(a, block(0x40, 0, 3)).unwrap();
    assert_eq!(&drained.data[..3], &[9, 9, 9]);
    assert_eq!(driver.raw_read(a, RawIoBlock { offset: 0x44, ..last }).unwrap().data, 0);

    let single = driver.raw_block_read(a, block(0x20, 1, 0)).unwrap();
    assert_eq!(single.count, 1);
    assert_eq!(single.data[0], 1);
}

#[test]
fn block_io_is_checked_before_touching_hardware() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let first = RawIoBlock {
        space: MODULE_SPACE,
        offset: 0xF0,
        width: 32,
        data: 0,
    };

    let mut overrun = block(0xF0, 1, 5);
    overrun.data[..5].copy_from_slice(&[1, 2, 3, 4, 5]);
    assert!(matches!(
        driver.raw_block_write(a, overrun),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(matches!(
        driver.raw_block_read(a, block(0x80, 0x20, 3)),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(driver.raw_read(a, first).unwrap().data, 0);

    let mut narrow = block(0xF0, 1, 2);
    narrow.width = 8;
    narrow.data[..2].copy_from_slice(&[0x12, 0x100]);
    assert!(matches!(
        driver.raw_block_write(a, narrow),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(driver.raw_read(a, first).unwrap().data, 0);

    assert!(matches!(
        driver.raw_block_read(a, block(0, 1, MAX_BLOCK_ITEMS as u32 + 1)),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(matches!(
        driver.raw_block_read(a, RawIoTransfer { space: 0x2D, ..block(0, 1, 1) }),
        Err(DriverError::NoSuchAddressSpace(0x2D))
    ));
    assert!(matches!(
        driver.raw_block_read(a, block(0x2, 1, 1)),
        Err(DriverError::InvalidArgument(_))
    ));
}

#[test]
fn bus_fault_mid_block_stops_and_flags_module() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    sim.inject_bus_fault(1, MODULE_SPACE, 0x18);

    let mut write = block(0x10, 1, 4);
    write.data[..4].copy_from_slice(&[0xA, 0xB, 0xC, 0xD]);
    assert!(matches!(
        driver.raw_block_write(a, write),
        Err(DriverError::HardwareFault { module: 1, .. })
    ));
    let module = driver.module_context(1).unwrap();
    assert_eq!(module.state(), ModuleState::BusFault);

    driver.clear_status(a).unwrap();
    assert!(matches!(
        driver.raw_block_read(a, block(0x10, 1, 4)),
        Err(DriverError::HardwareFault { module: 1, .. })
    ));
    assert_eq!(module.state(), ModuleState::BusFault);

    sim.clear_bus_faults();
    let read = driver.raw_block_read(a, block(0x10, 1, 4)).unwrap();
    assert_eq!(&read.data[..4], &[0xA, 0xB, 0, 0]);
}

#[test]
fn bus_fault_is_contained_and_cleared_by_reset() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    sim.inject_bus_fault(1, MODULE_SPACE, 0x10);

    let block = RawIoBlock {
        space: MODULE_SPACE,
        offset: 0x10,
        width: 32,
        data: 0,
    };
    assert!(matches!(
        driver.raw_read(a, block),
        Err(DriverError::HardwareFault { module: 1, .. })
    ));
    assert!(driver
        .status(a)
        .unwrap()
        .standard
        .contains(StandardStatus::BUS_FAULT));
    assert_eq!(
        driver.module_context(1).unwrap().state(),
        ModuleState::BusFault
    );

    sim.clear_bus_faults();
    driver.reset(a).unwrap();
    assert_eq!(sim.reset_count(1), 1);
    assert_eq!(sim.enabled_mask(1), 0x1);
    assert!(!driver
        .status(a)
        .unwrap()
        .standard
        .contains(StandardStatus::BUS_FAULT));
    assert!(driver.raw_read(a, block).is_ok());
}

#[test]
fn clear_status_reports_then_clears_faults() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    sim.inject_bus_fault(1, MODULE_SPACE, 0);
    let block = RawIoBlock {
        space: MODULE_SPACE,
        ..RawIoBlock::default()
    };
    assert!(driver.raw_read(a, block).is_err());

    let reported = driver.clear_status(a).unwrap();
    assert!(reported.standard.contains(StandardStatus::BUS_FAULT));
    assert!(!driver
        .status(a)
        .unwrap()
        .standard
        .contains(StandardStatus::BUS_FAULT));
}

#[test]
fn status_merges_hardware_report() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();

    assert!(driver.status(a).unwrap().standard.contains(StandardStatus::IDLE));
    sim.assert_sources(1, 0x5);
    let status = driver.status(a).unwrap();
    assert!(status.standard.contains(StandardStatus::READY));
    assert_eq!(status.raw, 0x5);
}

#[test]
fn enable_toggles_disabled_state() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();

    driver.enable(a, false).unwrap();
    assert!(!sim.is_enabled(1));
    assert_eq!(
        driver.module_context(1).unwrap().state(),
        ModuleState::Disabled
    );
    driver.enable(a, true).unwrap();
    assert!(sim.is_enabled(1));
    assert_eq!(
        driver.module_context(1).unwrap().state(),
        ModuleState::Operational
    );
}

#[test]
fn enable_without_hook_leaves_module_disabled() {
    let sim = Simulator::new();
    let backend = Backend {
        bus: sim.backend().bus,
        hardware: Arc::new(BareHooks),
    };
    let (driver, report) = Driver::install(config(32, 100, 50), backend).unwrap();
    assert!(report.failures.is_empty());
    let a = driver.open().unwrap();
    let module = driver.module_context(1).unwrap();
    assert_eq!(module.state(), ModuleState::Operational);

    assert!(matches!(
        driver.enable(a, true),
        Err(DriverError::NotSupported(_))
    ));
    assert_eq!(module.state(), ModuleState::Disabled);
    assert!(matches!(
        driver.enable(a, false),
        Err(DriverError::NotSupported(_))
    ));
    assert_eq!(module.state(), ModuleState::Disabled);
}

#[test]
fn module_selection_routes_commands() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();

    driver.set_module(a, 2).unwrap();
    assert_eq!(driver.selected_module(a).unwrap(), 2);
    driver.reset(a).unwrap();
    assert_eq!(sim.reset_count(2), 1);
    assert_eq!(sim.reset_count(1), 0);
    assert_eq!(driver.version(a).unwrap().module_version_str(), "SIM-2.0");

    let maps = driver.module_maps(a).unwrap();
    assert_eq!(maps.count, 1);
    assert_eq!(maps.maps[0].space_number, MODULE_SPACE);
    assert_eq!(maps.maps[0].base_address, 0xC10000);

    assert!(matches!(
        driver.set_module(a, 7),
        Err(DriverError::NoSuchModule(7))
    ));
}

// ─── Exclusive access ───────────────────────────────────────────────

#[test]
fn exclusive_session_locks_out_other_clients() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();

    driver.jtag_open(a).unwrap();
    assert_eq!(
        driver.module_context(1).unwrap().state(),
        ModuleState::FlashOpen
    );

    let start = Instant::now();
    assert!(matches!(driver.reset(b), Err(DriverError::Busy(_))));
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(matches!(driver.jtag_open(b), Err(DriverError::Busy(_))));
    assert!(matches!(
        driver.jtag_write_byte(b, 0x11),
        Err(DriverError::Busy(_))
    ));

    driver.jtag_write_byte(a, 0xAB).unwrap();
    driver.jtag_write_byte(a, 0xCD).unwrap();
    assert_eq!(sim.firmware(1), vec![0xAB, 0xCD]);
    assert_eq!(driver.jtag_read_byte(a).unwrap(), 0xAB);

    driver.jtag_close(a).unwrap();
    assert_eq!(sim.reset_count(1), 1);
    let module = driver.module_context(1).unwrap();
    assert_eq!(module.exclusive_owner(), None);
    assert_eq!(module.state(), ModuleState::Operational);
    driver.reset(b).unwrap();
}

#[test]
fn status_query_bypasses_exclusive_session() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();
    driver.jtag_open(a).unwrap();

    let status = driver.status(b).unwrap();
    assert!(status.standard.contains(StandardStatus::FLASH_OPEN));
    driver.connect(b, conn(1, 0x1)).unwrap();
}

#[test]
fn closing_owner_releases_exclusive_session() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();
    driver.jtag_open(a).unwrap();

    driver.close(a).unwrap();
    assert_eq!(driver.module_context(1).unwrap().exclusive_owner(), None);
    assert_eq!(sim.reset_count(1), 1);
    driver.jtag_open(b).unwrap();
}

#[test]
fn firmware_access_requires_open_session() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();

    assert!(matches!(driver.jtag_read_byte(a), Err(DriverError::Busy(_))));
    assert!(matches!(driver.jtag_close(a), Err(DriverError::Busy(_))));
}

// ─── Byte-level control commands ────────────────────────────────────

#[test]
fn ioctl_rejects_short_argument_before_running() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();

    let mut short = [0u8; 4];
    assert!(matches!(
        driver.ioctl(a, SKEL_CONNECT, &mut short),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(sim.enabled_mask(1), 0);
}

#[test]
fn ioctl_unknown_commands_not_supported() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    let mut arg = [0u8; 4];

    assert!(matches!(
        driver.ioctl(a, iow(SKEL_MAGIC, 40, 4), &mut arg),
        Err(DriverError::NotSupported(_))
    ));
    assert!(matches!(
        driver.ioctl(a, iow(SIM_MAGIC, 9, 4), &mut arg),
        Err(DriverError::NotSupported(_))
    ));
}

#[test]
fn ioctl_encodes_standard_records() {
    let (driver, _sim) = default_driver();
    let a = driver.open_with_pid(100).unwrap();

    let mut buf = [0u8; Connection::SIZE];
    conn(1, 0x5).encode(&mut buf).unwrap();
    driver.ioctl(a, SKEL_CONNECT, &mut buf).unwrap();

    let mut buf = [0u8; ClientConnections::SIZE];
    ClientConnections::default().encode(&mut buf).unwrap();
    driver
        .ioctl(a, SKEL_GET_CLIENT_CONNECTIONS, &mut buf)
        .unwrap();
    let record = ClientConnections::decode(&buf).unwrap();
    assert_eq!(record.pid, 100);
    assert_eq!(record.size, 1);
    assert_eq!(record.connections[0], conn(1, 0x5));

    let mut buf = [0u8; VersionRecord::SIZE];
    driver.ioctl(a, SKEL_GET_VERSION, &mut buf).unwrap();
    let version = VersionRecord::decode(&buf).unwrap();
    assert_eq!(version.driver_version, DRIVER_VERSION);
    assert_eq!(version.module_version_str(), "SIM-1.0");

    let mut buf = [0u8; 4];
    250u32.encode(&mut buf).unwrap();
    driver.ioctl(a, SKEL_SET_TIMEOUT, &mut buf).unwrap();
    buf = [0; 4];
    driver.ioctl(a, SKEL_GET_TIMEOUT, &mut buf).unwrap();
    assert_eq!(u32::decode(&buf).unwrap(), 250);

    driver.ioctl(a, SKEL_GET_MODULE_COUNT, &mut buf).unwrap();
    assert_eq!(u32::decode(&buf).unwrap(), 2);
}

#[test]
fn ioctl_forwards_hardware_commands() {
    let (driver, sim) = default_driver();
    let a = driver.open().unwrap();
    driver.connect(a, conn(1, 0x1)).unwrap();
    driver.reset(a).unwrap();

    let mut buf = [0u8; 4];
    driver.ioctl(a, SIM_GET_RESET_COUNT, &mut buf).unwrap();
    assert_eq!(u32::decode(&buf).unwrap(), 1);

    0x1u32.encode(&mut buf).unwrap();
    driver.ioctl(a, SIM_RAISE, &mut buf).unwrap();
    assert_eq!(sim.pending(1), 0x1);
    assert_eq!(driver.queue_size(a).unwrap(), 0);
}

#[test]
fn ioctl_raw_read_returns_value_in_place() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();
    driver
        .raw_write(
            a,
            RawIoBlock {
                space: MODULE_SPACE,
                offset: 0x8,
                width: 32,
                data: 0x1234_5678,
            },
        )
        .unwrap();

    let mut buf = [0u8; RawIoBlock::SIZE];
    RawIoBlock {
        space: MODULE_SPACE,
        offset: 0x8,
        width: 0,
        data: 0,
    }
    .encode(&mut buf)
    .unwrap();
    driver.ioctl(a, SKEL_RAW_READ, &mut buf).unwrap();
    assert_eq!(RawIoBlock::decode(&buf).unwrap().data, 0x1234_5678);
}

#[test]
fn ioctl_block_read_returns_items_in_place() {
    let (driver, _sim) = default_driver();
    let a = driver.open().unwrap();

    let mut write = block(0x30, 1, 3);
    write.data[..3].copy_from_slice(&[0x11, 0x22, 0x33]);
    let mut buf = [0u8; RawIoTransfer::SIZE];
    write.encode(&mut buf).unwrap();
    driver.ioctl(a, SKEL_RAW_BLOCK_WRITE, &mut buf).unwrap();

    let mut buf = [0u8; RawIoTransfer::SIZE];
    block(0x30, 1, 3).encode(&mut buf).unwrap();
    driver.ioctl(a, SKEL_RAW_BLOCK_READ, &mut buf).unwrap();
    let read = RawIoTransfer::decode(&buf).unwrap();
    assert_eq!(read.count, 3);
    assert_eq!(&read.data[..3], &[0x11, 0x22, 0x33]);

    let mut short = [0u8; RawIoBlock::SIZE];
    assert!(matches!(
        driver.ioctl(a, SKEL_RAW_BLOCK_READ, &mut short),
        Err(DriverError::InvalidArgument(_))
    ));
}
