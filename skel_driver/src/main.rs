//! # Skel Driver Binary
//!
//! Installs a driver from a TOML configuration, connects a monitoring client
//! to every installed module and raises periodic interrupts through the
//! back-end until Ctrl-C (or `--events` events were read). A JSON snapshot
//! of the driver is printed on exit.
//!
//! # Usage
//!
//! ```bash
//! # Simulation back-end, one interrupt burst every 200 ms
//! skel_driver --config config/driver.toml --period-ms 200
//!
//! # Stop after 10 events, JSON logs
//! skel_driver -c config/driver.toml --events 10 --json
//! ```

use clap::Parser;
use skel_common::config::{ConfigLoader, LogLevel};
use skel_common::consts::DEFAULT_CONFIG_PATH;
use skel_common::driver::backend::BusBackend;
use skel_common::driver::config::DriverConfig;
use skel_common::driver::error::{DriverError, HwError};
use skel_common::driver::types::{ClientId, Connection};
use skel_driver::{BackendRegistry, Driver};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Skel driver - multi-client interrupt driver with pluggable back-ends
#[derive(Parser, Debug)]
#[command(name = "skel_driver")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Interrupt-driven multi-client driver skeleton")]
#[command(long_about = None)]
struct Args {
    /// Path to the driver configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Interval between simulated interrupts in milliseconds.
    #[arg(long, default_value_t = 500)]
    period_ms: u64,

    /// Interrupt sources to connect and raise.
    #[arg(long, default_value_t = 0x1)]
    mask: u32,

    /// Stop after this many events (0 = run until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    events: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("skel_driver failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = DriverConfig::load(&args.config);
    let level = config
        .as_ref()
        .map_or(LogLevel::Info, |c| c.shared.log_level);
    setup_tracing(&args, level);
    let config = config?;

    info!("Skel driver v{} starting...", env!("CARGO_PKG_VERSION"));

    let registry = BackendRegistry::with_builtin();
    info!("Available backends: {:?}", registry.names());
    let backend = registry.create(&config.driver.backend)?;
    let bus = Arc::clone(&backend.bus);

    let (driver, report) = Driver::install(config, backend)?;
    for (module, reason) in &report.failures {
        warn!(module, "Not installed: {reason}");
    }

    let monitor = driver.open()?;
    for &module in &report.installed {
        driver.connect(monitor, Connection { module, mask: args.mask })?;
    }
    let stimulus = driver.open()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        let driver = driver.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
            let _ = driver.interrupt_client(monitor);
        })?;
    }

    let source = {
        let running = Arc::clone(&running);
        let driver = driver.clone();
        let modules = report.installed.clone();
        let period = Duration::from_millis(args.period_ms.max(1));
        let mask = args.mask;
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                for &module in &modules {
                    raise(&driver, bus.as_ref(), stimulus, module, mask);
                }
                thread::sleep(period);
            }
        })
    };

    let mut count = 0u64;
    while running.load(Ordering::SeqCst) {
        match driver.read(monitor) {
            Ok(event) => {
                count += 1;
                info!(
                    module = event.module,
                    source = event.source_mask,
                    second = event.time.second,
                    nanosecond = event.time.nanosecond,
                    "Event {count}"
                );
                if args.events != 0 && count >= args.events {
                    break;
                }
            }
            Err(DriverError::Timeout) => warn!("No event within the client timeout"),
            Err(DriverError::Interrupted) => break,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    if source.join().is_err() {
        warn!("Interrupt source thread panicked");
    }

    println!("{}", serde_json::to_string_pretty(&driver.snapshot())?);

    driver.close(stimulus)?;
    driver.close(monitor)?;
    driver.uninstall()?;
    info!(events = count, "Skel driver shutdown complete");
    Ok(())
}

/// Raise `mask` on `module` through the bus, or through the driver's
/// simulated-interrupt path when the bus cannot raise interrupts.
fn raise(
    driver: &Driver,
    bus: &dyn BusBackend,
    client: ClientId,
    module: u32,
    mask: u32,
) {
    let result = match bus.raise_interrupt(module, mask) {
        Err(HwError::NotImplemented) => driver
            .simulate_interrupt(client, Connection { module, mask })
            .map(drop),
        other => other.map_err(|e| DriverError::from_hook("raise_interrupt", e)),
    };
    if let Err(e) = result {
        warn!(module, "Interrupt not raised: {e}");
    }
}

/// Setup tracing subscriber from CLI arguments and the configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        level.as_directive().parse().unwrap_or(Level::INFO)
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
