//! USB transport for a Bluetooth HCI radio
//!
//! This crate finds a USB Bluetooth controller, claims its HCI interface and
//! moves HCI packets to and from it:
//!
//! - [`locator`] picks the radio
//! - [`pool`] holds the fixed transfer slots of each endpoint
//! - [`TransportSession`] sends commands and ACL data, dispatches completions
//!   and owns the open/teardown state machine
//! - [`UsbBackend`] is the seam to the host USB stack, with [`RusbBackend`]
//!   for real hardware and [`test_utils::MockBackend`] for tests

pub mod backend;
mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod locator;
pub mod pool;
pub mod rusb_backend;
pub mod session;
pub mod test_utils;

pub use backend::{
    Completion, DeviceSummary, InterfaceSummary, TransferBuffers, TransferKind, TransferRequest,
    TransferStatus, UsbBackend,
};
pub use error::{BackendError, OpenError, PoolError, Result, SendError, TransportError};
pub use lifecycle::{LifecycleState, TeardownReport};
pub use locator::{Acceptance, Acceptor, LocatedDevice, NotFound, find_device, list_candidates};
pub use pool::{
    CONTROL_SETUP_SIZE, DEFAULT_SLOTS_PER_ENDPOINT, Endpoint, EndpointPool, EndpointPools,
    EndpointRole, HCI_MAX_BUFFER_SIZE, SlotId, SlotState,
};
pub use rusb_backend::{RusbBackend, map_rusb_error};
pub use session::{
    DEFAULT_TEARDOWN_BUDGET, HCI_COMMAND_REQUEST_TYPE, InboundKind, PacketSink, SessionConfig,
    TransportSession, fill_control_setup,
};
