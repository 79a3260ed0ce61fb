//! # Skel Driver Library
//!
//! Generic interrupt-driven, multi-client driver core with pluggable
//! hardware back-ends. Back-ends implement `BusBackend` and
//! `HardwareCallbacks` from `skel_common::driver::backend`.
//!
//! # Module Structure
//!
//! - [`driver`] - `Driver` handle, data path, snapshots
//! - [`lifecycle`] - install/uninstall, client open/close
//! - [`commands`] - typed control commands
//! - [`ioctl`] - byte-level control-command dispatch
//! - [`module`] - per-module status, access lock, raw I/O
//! - [`connection`] - source → subscriber registry
//! - [`client`] - client contexts and table
//! - [`queue`] - bounded per-client event queue
//! - [`isr`] - interrupt top half
//! - [`backend_registry`] - back-end factory registration
//! - [`backends`] - back-end implementations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         skel_driver                              │
//! │  ┌──────────────┐   ┌───────────────┐   ┌─────────────────────┐  │
//! │  │  Lifecycle   │──►│ ModuleContext │◄──│  CommandDispatcher  │  │
//! │  └──────────────┘   │ + Connections │   │  (commands, ioctl)  │  │
//! │                     └───────┬───────┘   └──────────┬──────────┘  │
//! │   bus interrupt ──► isr ────┘                      │             │
//! │                      │                             ▼             │
//! │                      └────────► EventQueue ──► client read       │
//! │                                                                  │
//! │            BusBackend + HardwareCallbacks (trait objects)        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod backend_registry;
pub mod backends;
pub mod client;
pub mod commands;
pub mod connection;
pub mod driver;
pub mod ioctl;
pub mod isr;
pub mod lifecycle;
pub mod module;
pub mod queue;

// Re-export key types for convenience
pub use crate::backend_registry::BackendRegistry;
pub use crate::driver::{Driver, DriverSnapshot};
pub use crate::isr::Dispatch;
pub use crate::lifecycle::InstallReport;
