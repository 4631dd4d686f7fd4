//! Downward interface to the USB host subsystem
//!
//! The session never talks to libusb (or anything else) directly. Everything
//! it needs from the host stack goes through [`UsbBackend`]: enumeration and
//! descriptors, handle management, interface ownership, and asynchronous
//! transfers.
//!
//! Transfers are identified by [`SlotId`]. A backend never owns transfer
//! memory: it is handed the pool's buffers through [`TransferBuffers`] while
//! it processes events, reads outbound payloads from them and writes inbound
//! data into them.

use crate::error::BackendError;
use crate::pool::SlotId;
use std::collections::VecDeque;
use std::time::Duration;

/// USB transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Interrupt,
    Bulk,
}

/// One transfer handed to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub slot: SlotId,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Bytes to send (OUT) or buffer capacity (IN); control transfers
    /// include the 8-byte setup packet
    pub length: usize,
}

impl TransferRequest {
    pub fn is_inbound(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// Final status of a transfer, as reported by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Stall,
    NoDevice,
    Cancelled,
    TimedOut,
    Overflow,
    Error,
}

/// A finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    /// Bytes actually transferred (setup packet excluded for control)
    pub actual_length: usize,
}

/// Identity and class triple of an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
}

/// First alternate setting of one interface in the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub number: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    /// Endpoint addresses, direction bit included
    pub endpoints: Vec<u8>,
}

/// Access to transfer memory while the backend processes events
pub trait TransferBuffers {
    /// The `length` bytes of the slot's region that are part of the transfer
    fn transfer_buffer(&self, slot: SlotId) -> &[u8];

    /// Mutable view of the same region, for inbound data
    fn transfer_buffer_mut(&mut self, slot: SlotId) -> &mut [u8];
}

/// Host USB subsystem as seen by a single transport session
///
/// A backend holds at most one open device handle. Kernel-driver operations
/// may return [`BackendError::NotSupported`] on platforms without them.
pub trait UsbBackend {
    /// Reference to an attached device; dropping it releases the reference
    type Device;

    /// Bring the subsystem up
    fn init(&mut self) -> Result<(), BackendError>;

    /// Shut the subsystem down
    fn exit(&mut self);

    /// Snapshot of every attached device
    fn devices(&mut self) -> Result<Vec<Self::Device>, BackendError>;

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, BackendError>;

    /// Interfaces of the device's active configuration
    fn interfaces(&self, device: &Self::Device) -> Result<Vec<InterfaceSummary>, BackendError>;

    fn open(&mut self, device: &Self::Device) -> Result<(), BackendError>;

    fn close(&mut self);

    fn reset(&mut self) -> Result<(), BackendError>;

    fn kernel_driver_active(&mut self, interface: u8) -> Result<bool, BackendError>;

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError>;

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError>;

    fn set_configuration(&mut self, configuration: u8) -> Result<(), BackendError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), BackendError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), BackendError>;

    /// Hand a transfer to the host stack; returns without waiting for it
    fn submit(&mut self, transfer: TransferRequest) -> Result<(), BackendError>;

    /// Ask for an in-flight transfer to finish early with `Cancelled`
    fn cancel(&mut self, slot: SlotId) -> Result<(), BackendError>;

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), BackendError>;

    /// Wait up to `timeout` for transfers to finish
    ///
    /// Finished transfers are appended to `completed` in the order the host
    /// stack produced them.
    fn handle_events(
        &mut self,
        timeout: Duration,
        buffers: &mut dyn TransferBuffers,
        completed: &mut VecDeque<Completion>,
    ) -> Result<(), BackendError>;
}
