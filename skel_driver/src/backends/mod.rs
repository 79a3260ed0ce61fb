//! Hardware back-end implementations.
//!
//! - [`simulation`] - In-memory bus and boards for development and testing
//!
//! # Adding New Back-ends
//!
//! 1. Create a new submodule under `backends/`
//! 2. Implement `BusBackend` and `HardwareCallbacks` from `skel_common::driver::backend`
//! 3. Register its factory in `BackendRegistry::with_builtin()`

pub mod simulation;
