//! [`UsbBackend`] on top of `rusb`
//!
//! `rusb` only exposes synchronous transfers, so "in flight" is emulated:
//! submitted transfers wait in a queue and are carried out from
//! [`handle_events`](UsbBackend::handle_events). Outbound transfers are
//! written with a bounded timeout. Inbound transfers are polled with a short
//! read timeout; a read that times out simply stays queued, so from the
//! session's point of view inbound transfers never time out.

use crate::backend::{
    Completion, DeviceSummary, InterfaceSummary, TransferBuffers, TransferKind, TransferRequest,
    TransferStatus, UsbBackend,
};
use crate::error::BackendError;
use crate::pool::{CONTROL_SETUP_SIZE, SlotId};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Timeout for writing one outbound transfer
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shortest inbound poll; libusb treats a zero timeout as "wait forever"
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct PendingTransfer {
    request: TransferRequest,
    cancelled: bool,
}

/// libusb host stack, through `rusb`
pub struct RusbBackend {
    context: Option<Context>,
    handle: Option<DeviceHandle<Context>>,
    pending: VecDeque<PendingTransfer>,
}

impl RusbBackend {
    pub fn new() -> Self {
        Self {
            context: None,
            handle: None,
            pending: VecDeque::new(),
        }
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, BackendError> {
        self.handle.as_ref().ok_or(BackendError::NoDevice)
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<Context>, BackendError> {
        self.handle.as_mut().ok_or(BackendError::NoDevice)
    }

    /// Report cancelled transfers, oldest first
    fn complete_cancelled(&mut self, completed: &mut VecDeque<Completion>) {
        self.pending.retain(|p| {
            if p.cancelled {
                completed.push_back(Completion {
                    slot: p.request.slot,
                    status: TransferStatus::Cancelled,
                    actual_length: 0,
                });
            }
            !p.cancelled
        });
    }

    /// Carry out every queued outbound transfer
    fn write_outbound(
        &mut self,
        buffers: &mut dyn TransferBuffers,
        completed: &mut VecDeque<Completion>,
    ) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        self.pending.retain(|p| {
            if p.request.is_inbound() {
                return true;
            }
            let data = buffers.transfer_buffer(p.request.slot);
            let (status, actual_length) = match write_transfer(handle, &p.request, data) {
                Ok(n) => (TransferStatus::Completed, n),
                Err(e) => {
                    debug!(
                        "Write to endpoint {:#04x} failed: {}",
                        p.request.endpoint, e
                    );
                    (transfer_status(&e), 0)
                }
            };
            completed.push_back(Completion {
                slot: p.request.slot,
                status,
                actual_length,
            });
            false
        });
    }

    /// Poll each inbound endpoint once, oldest queued transfer first
    fn read_inbound(
        &mut self,
        timeout: Duration,
        buffers: &mut dyn TransferBuffers,
        completed: &mut VecDeque<Completion>,
    ) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        let mut endpoints: Vec<u8> = Vec::new();
        for p in &self.pending {
            if p.request.is_inbound() && !endpoints.contains(&p.request.endpoint) {
                endpoints.push(p.request.endpoint);
            }
        }
        if endpoints.is_empty() {
            return;
        }

        let share = if completed.is_empty() {
            (timeout / endpoints.len() as u32).max(MIN_READ_TIMEOUT)
        } else {
            MIN_READ_TIMEOUT
        };

        for endpoint in endpoints {
            let mut wait = share;
            // Keep reading while the device has data and transfers are queued
            while let Some(pos) = self
                .pending
                .iter()
                .position(|p| p.request.endpoint == endpoint)
            {
                let request = self.pending[pos].request;
                let buffer = buffers.transfer_buffer_mut(request.slot);
                let result = match request.kind {
                    TransferKind::Interrupt => handle.read_interrupt(endpoint, buffer, wait),
                    _ => handle.read_bulk(endpoint, buffer, wait),
                };

                let (status, actual_length) = match result {
                    Ok(n) => (TransferStatus::Completed, n),
                    Err(rusb::Error::Timeout) => break,
                    Err(e) => {
                        debug!("Read from endpoint {:#04x} failed: {}", endpoint, e);
                        (transfer_status(&map_rusb_error(e)), 0)
                    }
                };

                self.pending.remove(pos);
                completed.push_back(Completion {
                    slot: request.slot,
                    status,
                    actual_length,
                });
                if status != TransferStatus::Completed {
                    break;
                }
                wait = MIN_READ_TIMEOUT;
            }
        }
    }
}

impl Default for RusbBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBackend for RusbBackend {
    type Device = Device<Context>;

    fn init(&mut self) -> Result<(), BackendError> {
        if self.context.is_none() {
            self.context = Some(Context::new().map_err(map_rusb_error)?);
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.close();
        // Dropping the last context reference shuts libusb down
        self.context = None;
    }

    fn devices(&mut self) -> Result<Vec<Self::Device>, BackendError> {
        let context = self.context.as_ref().ok_or(BackendError::NotFound)?;
        let list = context.devices().map_err(map_rusb_error)?;
        Ok(list.iter().collect())
    }

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, BackendError> {
        let desc = device.device_descriptor().map_err(map_rusb_error)?;
        Ok(DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class_code: desc.class_code(),
            sub_class_code: desc.sub_class_code(),
            protocol_code: desc.protocol_code(),
        })
    }

    fn interfaces(&self, device: &Self::Device) -> Result<Vec<InterfaceSummary>, BackendError> {
        let config = device.active_config_descriptor().map_err(map_rusb_error)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            // Only the first alternate setting is considered
            let Some(alt) = interface.descriptors().next() else {
                continue;
            };
            interfaces.push(InterfaceSummary {
                number: interface.number(),
                class_code: alt.class_code(),
                sub_class_code: alt.sub_class_code(),
                protocol_code: alt.protocol_code(),
                endpoints: alt.endpoint_descriptors().map(|ep| ep.address()).collect(),
            });
        }
        Ok(interfaces)
    }

    fn open(&mut self, device: &Self::Device) -> Result<(), BackendError> {
        if self.handle.is_some() {
            return Err(BackendError::Busy);
        }
        let handle = device.open().map_err(map_rusb_error)?;
        debug!(
            "Opened device at bus {}, device {}",
            device.bus_number(),
            device.address()
        );
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        self.pending.clear();
        if self.handle.take().is_some() {
            debug!("Closed device handle");
        }
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        self.handle_mut()?.reset().map_err(map_rusb_error)
    }

    fn kernel_driver_active(&mut self, interface: u8) -> Result<bool, BackendError> {
        self.handle()?
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .detach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .attach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .set_active_configuration(configuration)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn submit(&mut self, transfer: TransferRequest) -> Result<(), BackendError> {
        self.handle()?;
        if self.pending.iter().any(|p| p.request.slot == transfer.slot) {
            return Err(BackendError::Busy);
        }
        trace!(
            "Queued transfer on endpoint {:#04x}, {} bytes",
            transfer.endpoint, transfer.length
        );
        self.pending.push_back(PendingTransfer {
            request: transfer,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), BackendError> {
        let pending = self
            .pending
            .iter_mut()
            .find(|p| p.request.slot == slot)
            .ok_or(BackendError::NotFound)?;
        pending.cancelled = true;
        Ok(())
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), BackendError> {
        self.handle_mut()?
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        buffers: &mut dyn TransferBuffers,
        completed: &mut VecDeque<Completion>,
    ) -> Result<(), BackendError> {
        self.complete_cancelled(completed);
        self.write_outbound(buffers, completed);
        self.read_inbound(timeout, buffers, completed);
        Ok(())
    }
}

/// Perform one outbound transfer, returning the payload bytes written
fn write_transfer(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
    data: &[u8],
) -> Result<usize, BackendError> {
    match request.kind {
        TransferKind::Control => {
            if data.len() < CONTROL_SETUP_SIZE {
                return Err(BackendError::InvalidParam);
            }
            let (setup, payload) = data.split_at(CONTROL_SETUP_SIZE);
            let value = u16::from_le_bytes([setup[2], setup[3]]);
            let index = u16::from_le_bytes([setup[4], setup[5]]);
            handle
                .write_control(setup[0], setup[1], value, index, payload, WRITE_TIMEOUT)
                .map_err(map_rusb_error)
        }
        TransferKind::Bulk => handle
            .write_bulk(request.endpoint, data, WRITE_TIMEOUT)
            .map_err(map_rusb_error),
        TransferKind::Interrupt => handle
            .write_interrupt(request.endpoint, data, WRITE_TIMEOUT)
            .map_err(map_rusb_error),
    }
}

/// Completion status for a failed transfer
fn transfer_status(err: &BackendError) -> TransferStatus {
    match err {
        BackendError::Pipe => TransferStatus::Stall,
        BackendError::NoDevice => TransferStatus::NoDevice,
        BackendError::Timeout => TransferStatus::TimedOut,
        BackendError::Overflow => TransferStatus::Overflow,
        BackendError::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

/// Map rusb::Error to BackendError
pub fn map_rusb_error(err: rusb::Error) -> BackendError {
    match err {
        rusb::Error::Timeout => BackendError::Timeout,
        rusb::Error::Pipe => BackendError::Pipe,
        rusb::Error::NoDevice => BackendError::NoDevice,
        rusb::Error::NotFound => BackendError::NotFound,
        rusb::Error::Busy => BackendError::Busy,
        rusb::Error::Overflow => BackendError::Overflow,
        rusb::Error::Io => BackendError::Io,
        rusb::Error::InvalidParam => BackendError::InvalidParam,
        rusb::Error::Access => BackendError::Access,
        rusb::Error::NotSupported => BackendError::NotSupported,
        rusb::Error::Interrupted => BackendError::Interrupted,
        rusb::Error::NoMem => BackendError::NoMem,
        _ => BackendError::Other(err.to_string()),
    }
}
