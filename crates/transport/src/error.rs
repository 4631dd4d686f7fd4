//! Transport error types
//!
//! Only the outcome of `open`, the outcome of each send, and fatal device
//! loss are visible to callers. Stalls, unexpected statuses and teardown
//! leaks are handled and logged inside the session.

use crate::pool::{EndpointRole, SlotId, SlotState};
use thiserror::Error;

/// Errors reported by a [`UsbBackend`](crate::backend::UsbBackend)
///
/// Mirrors the libusb error codes so backends can map them one to one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Operation timed out")]
    Timeout,
    #[error("Endpoint stalled (pipe error)")]
    Pipe,
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    #[error("Entity not found")]
    NotFound,
    #[error("Resource busy")]
    Busy,
    #[error("Overflow")]
    Overflow,
    #[error("Input/output error")]
    Io,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Access denied (insufficient permissions)")]
    Access,
    #[error("Operation not supported on this platform")]
    NotSupported,
    #[error("System call interrupted")]
    Interrupted,
    #[error("Insufficient memory")]
    NoMem,
    #[error("{0}")]
    Other(String),
}

/// Misuse of an endpoint pool
///
/// These indicate a broken ownership hand-off, never a device condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("No free transfer slots")]
    Empty,
    #[error("Slot {slot:?} is already on the free list")]
    AlreadyFree { slot: SlotId },
    #[error("Slot {slot:?} is {state:?}, expected {expected}")]
    BadState {
        slot: SlotId,
        state: SlotState,
        expected: &'static str,
    },
    #[error("Slot {slot:?} does not belong to the {role:?} pool")]
    WrongEndpoint { slot: SlotId, role: EndpointRole },
    #[error("Slot index {index} out of range (pool has {capacity} slots)")]
    InvalidSlot { index: u8, capacity: usize },
}

/// Rejection of an outbound send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Payload does not fit the endpoint buffer; nothing was touched
    #[error("Packet too large ({size} > {max})")]
    TooLarge { size: usize, max: usize },
    /// No free slot, or the backend refused the submission; payload dropped
    #[error("Out of transfer buffers")]
    Busy,
    /// Session is not running (not opened yet, torn down, or device lost)
    #[error("Session is not running")]
    Closed,
}

/// Failure to bring a session up
///
/// Every partially acquired resource has been released by the time the
/// caller sees one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("USB subsystem initialisation failed: {0}")]
    Init(BackendError),
    #[error("No acceptable Bluetooth modules found")]
    NotFound,
    #[error("Failed to open device: {0}")]
    Open(BackendError),
    #[error("Failed to detach kernel driver: {0}")]
    DetachKernelDriver(BackendError),
    #[error("Failed to set configuration: {0}")]
    Configure(BackendError),
    #[error("Failed to claim interface: {0}")]
    Claim(BackendError),
    #[error("Failed to submit inbound transfers: {0}")]
    Prime(BackendError),
}

/// Errors surfaced by the dispatch step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The radio was removed; the session must be torn down
    #[error("Device removed")]
    DeviceLost,
    /// Dispatch was called on a session that is not in the running state
    #[error("Session is not running")]
    NotRunning,
    /// The event pump itself failed
    #[error("Event handling failed: {0}")]
    Backend(BackendError),
    /// An inbound transfer could not be put back in flight; reception would
    /// starve, so the session must be torn down
    #[error("Failed to resubmit inbound transfer: {0}")]
    ResubmitFailed(BackendError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
