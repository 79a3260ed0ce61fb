//! Driver framework contracts.
//!
//! This module contains the types shared between the driver core
//! (`skel_driver`), the hardware back-ends and client programs.

pub mod backend;
pub mod config;
pub mod error;
pub mod ioctl;
pub mod types;
