//! Common utilities for the USB HCI transport
//!
//! This crate provides functionality shared by the driver binary and its
//! tests: the error type, `tracing` setup (including forwarding of log lines
//! to the controlling process), and the async channel bridge that connects
//! the host link to the USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{
    BRIDGE_CAPACITY, CommandSender, ReportSender, UsbBridge, UsbCommand, UsbEvent, UsbWorker,
    create_usb_bridge,
};
pub use error::{Error, Result};
pub use logging::{HostLogLayer, bootstrap_logging, setup_logging};
