//! Skel Common Library
//!
//! Shared constants, configuration loading, wire records and the hardware
//! back-end contracts used by every crate of the skel driver framework.
//!
//! # Module Structure
//!
//! - [`consts`] - Fixed capacities and defaults
//! - [`config`] - Configuration loading traits and types
//! - [`driver`] - Driver data types, errors, control commands and back-end traits
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use skel_common::prelude::*;
//! use skel_common::driver::ioctl::SKEL_GET_VERSION;
//! ```

pub mod config;
pub mod consts;
pub mod driver;
pub mod prelude;
