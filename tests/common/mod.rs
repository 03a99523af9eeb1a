//! Shared fixtures for the integration tests.
//!
//! - [`fixtures`]: small graphs (dequantized convolution, LSTM/GRU
//!   sequences, elementwise chains) and deterministic input tensors
//! - [`tempfile_helpers`]: temp dirs for program cache tests

#![allow(dead_code)]

pub mod fixtures;
pub mod tempfile_helpers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;

use graphforge::logging::{init_with_config, LogLevel, LoggingConfig};
use graphforge::DeviceInfo;

/// Quiet logging shared by every test binary.
pub fn init_test_logging() {
    let _ = init_with_config(&LoggingConfig::new().with_level(LogLevel::Warn));
}

/// Device without matrix engines: every primitive uses the reference path.
pub fn reference_device() -> DeviceInfo {
    DeviceInfo::new("reference", "host")
}

/// Device with matrix engines: accelerated implementations validate.
pub fn immad_device() -> DeviceInfo {
    DeviceInfo::new("accel", "xe-hpg").with_immad(true)
}
