//! Virtual Keyboard - timer-driven emulated HID keyboard
//!
//! Exposes a one-key keyboard to the host input stack and drives it from two
//! timers: a periodic press and a one-shot release. After a bounded number of
//! cycles the device tears its transport down and goes quiet.

pub mod cli;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod report;
pub mod timer;
pub mod trace;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use device::{create_device, Cadence, Device, DeviceError, DeviceInit, DeviceState};
pub use driver::Driver;
pub use report::RunSummary;
