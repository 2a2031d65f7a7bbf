//! gattkit CLI library
//!
//! Command-line front end for the gattkit central: argument parsing,
//! configuration, the peripheral operations behind each command and a
//! simulated sensor for running without hardware.

pub mod cli;
pub mod commands;
pub mod config;
pub mod device_info;
pub mod error;
pub mod operations;
pub mod simulate;

pub use cli::{Cli, Commands, ValueFormat};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use device_info::{DeviceInformation, ReadDeviceInformation};
pub use error::{CliError, Result};
