//! Test utilities for the transport
//!
//! [`MockBackend`] stands in for the host USB stack. Tests describe the
//! attached devices, script which transfers finish and how, inject failures,
//! and afterwards inspect every call the session made.
//!
//! # Example
//!
//! ```
//! use transport::test_utils::{MockBackend, bt_device};
//! use transport::{Acceptance, SessionConfig, TransportSession};
//!
//! let backend = MockBackend::with_devices(vec![bt_device(1, 4, 0x0a12, 0x0001)]);
//! let session =
//!     TransportSession::open(backend, SessionConfig::default(), &Acceptance::First).unwrap();
//! assert!(session.is_running());
//! ```

use crate::backend::{
    Completion, DeviceSummary, InterfaceSummary, TransferBuffers, TransferRequest, TransferStatus,
    UsbBackend,
};
use crate::error::BackendError;
use crate::pool::{EndpointRole, SlotId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// An attached device as seen by [`MockBackend`]
///
/// Clones share a reference counter, so tests can check which device
/// references are still held.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub summary: DeviceSummary,
    pub interfaces: Vec<InterfaceSummary>,
    refs: Rc<()>,
}

impl MockDevice {
    pub fn new(summary: DeviceSummary, interfaces: Vec<InterfaceSummary>) -> Self {
        Self {
            summary,
            interfaces,
            refs: Rc::new(()),
        }
    }
}

/// A Bluetooth radio with the usual HCI interface 0
pub fn bt_device(bus_number: u8, address: u8, vendor_id: u16, product_id: u16) -> MockDevice {
    MockDevice::new(
        DeviceSummary {
            bus_number,
            address,
            vendor_id,
            product_id,
            class_code: 0xE0,
            sub_class_code: 0x01,
            protocol_code: 0x01,
        },
        vec![InterfaceSummary {
            number: 0,
            class_code: 0xE0,
            sub_class_code: 0x01,
            protocol_code: 0x01,
            endpoints: vec![0x81, 0x82, 0x02],
        }],
    )
}

/// A device no Bluetooth filter should pick (a hub)
pub fn other_device(bus_number: u8, address: u8) -> MockDevice {
    MockDevice::new(
        DeviceSummary {
            bus_number,
            address,
            vendor_id: 0x1d6b,
            product_id: 0x0002,
            class_code: 0x09,
            sub_class_code: 0x00,
            protocol_code: 0x00,
        },
        vec![InterfaceSummary {
            number: 0,
            class_code: 0x09,
            sub_class_code: 0x00,
            protocol_code: 0x00,
            endpoints: vec![0x81],
        }],
    )
}

/// A backend operation, as recorded by [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Exit,
    Open { bus_number: u8, address: u8 },
    Close,
    Reset,
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    Submit(TransferRequest),
    Cancel(SlotId),
    ClearHalt(u8),
    HandleEvents,
}

/// Shared record of backend calls
///
/// Outlives the backend, so a test can still inspect what a failed `open`
/// did after the session consumed the backend.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// How many recorded calls match `pred`
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.borrow().iter().filter(|c| pred(c)).count()
    }

    fn push(&self, call: Call) {
        self.0.borrow_mut().push(call);
    }
}

/// Which in-flight transfer a scripted completion finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Slot(SlotId),
    /// Oldest in-flight transfer of this endpoint at event time
    Oldest(EndpointRole),
}

#[derive(Debug, Clone)]
struct Scripted {
    target: Target,
    status: TransferStatus,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct InFlight {
    request: TransferRequest,
    cancelled: bool,
    captured: bool,
}

/// Scriptable [`UsbBackend`] that records every call
#[derive(Debug, Default)]
pub struct MockBackend {
    devices: Vec<MockDevice>,
    opened: Option<MockDevice>,
    in_flight: Vec<InFlight>,
    script: VecDeque<Scripted>,
    calls: CallLog,
    sent: Vec<(EndpointRole, Vec<u8>)>,

    /// Kernel driver reported as bound to the interface
    pub kernel_driver_active: bool,
    /// Cancelled transfers come back on the next event pump
    pub cancel_completes: bool,
    pub fail_init: Option<BackendError>,
    pub fail_enumerate: Option<BackendError>,
    pub fail_open: Option<BackendError>,
    pub fail_detach: Option<BackendError>,
    pub fail_reset: Option<BackendError>,
    pub fail_set_configuration: Option<BackendError>,
    pub fail_claim: Option<BackendError>,
    pub fail_handle_events: Option<BackendError>,
    /// Error returned by the next `submit_failures` submissions
    pub submit_error: Option<BackendError>,
    pub submit_failures: usize,
    /// Submissions of a slot that was already in flight
    pub double_submits: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            cancel_completes: true,
            ..Default::default()
        }
    }

    pub fn with_devices(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            ..Self::new()
        }
    }

    /// Fail the next `count` submissions with `error`
    pub fn fail_submits(&mut self, count: usize, error: BackendError) {
        self.submit_failures = count;
        self.submit_error = Some(error);
    }

    /// Finish a transfer on the next event pump
    ///
    /// For inbound transfers `data` is copied into the slot.
    pub fn complete(&mut self, target: Target, status: TransferStatus, data: &[u8]) {
        self.script.push_back(Scripted {
            target,
            status,
            data: data.to_vec(),
        });
    }

    /// Finish the oldest in-flight transfer of an endpoint successfully
    pub fn complete_ok(&mut self, role: EndpointRole, data: &[u8]) {
        self.complete(Target::Oldest(role), TransferStatus::Completed, data);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.calls()
    }

    /// Handle on the call record that stays valid after the backend is gone
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// How many times a call matching `pred` was made
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.count(pred)
    }

    /// Submissions recorded so far
    pub fn submissions(&self) -> Vec<TransferRequest> {
        self.calls
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Outbound transfer contents seen by the event pump, in order
    pub fn sent(&self) -> &[(EndpointRole, Vec<u8>)] {
        &self.sent
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_on(&self, role: EndpointRole) -> usize {
        self.in_flight
            .iter()
            .filter(|t| t.request.slot.role == role)
            .count()
    }

    /// References to attached device `index` held outside the backend
    pub fn outstanding_refs(&self, index: usize) -> usize {
        self.devices
            .get(index)
            .map(|d| Rc::strong_count(&d.refs) - 1)
            .unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    fn resolve(&self, target: Target) -> Option<usize> {
        match target {
            Target::Slot(slot) => self.in_flight.iter().position(|t| t.request.slot == slot),
            Target::Oldest(role) => self
                .in_flight
                .iter()
                .position(|t| t.request.slot.role == role && !t.cancelled),
        }
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;

    fn init(&mut self) -> Result<(), BackendError> {
        self.calls.push(Call::Init);
        self.fail_init.clone().map_or(Ok(()), Err)
    }

    fn exit(&mut self) {
        self.calls.push(Call::Exit);
    }

    fn devices(&mut self) -> Result<Vec<Self::Device>, BackendError> {
        if let Some(e) = self.fail_enumerate.clone() {
            return Err(e);
        }
        Ok(self.devices.clone())
    }

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, BackendError> {
        Ok(device.summary.clone())
    }

    fn interfaces(&self, device: &Self::Device) -> Result<Vec<InterfaceSummary>, BackendError> {
        Ok(device.interfaces.clone())
    }

    fn open(&mut self, device: &Self::Device) -> Result<(), BackendError> {
        self.calls.push(Call::Open {
            bus_number: device.summary.bus_number,
            address: device.summary.address,
        });
        if let Some(e) = self.fail_open.clone() {
            return Err(e);
        }
        self.opened = Some(device.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.calls.push(Call::Close);
        self.opened = None;
        self.in_flight.clear();
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        self.calls.push(Call::Reset);
        self.fail_reset.clone().map_or(Ok(()), Err)
    }

    fn kernel_driver_active(&mut self, _interface: u8) -> Result<bool, BackendError> {
        Ok(self.kernel_driver_active)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError> {
        self.calls.push(Call::DetachKernelDriver(interface));
        self.fail_detach.clone().map_or(Ok(()), Err)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), BackendError> {
        self.calls.push(Call::AttachKernelDriver(interface));
        Ok(())
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), BackendError> {
        self.calls.push(Call::SetConfiguration(configuration));
        self.fail_set_configuration.clone().map_or(Ok(()), Err)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), BackendError> {
        self.calls.push(Call::ClaimInterface(interface));
        self.fail_claim.clone().map_or(Ok(()), Err)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), BackendError> {
        self.calls.push(Call::ReleaseInterface(interface));
        Ok(())
    }

    fn submit(&mut self, transfer: TransferRequest) -> Result<(), BackendError> {
        self.calls.push(Call::Submit(transfer));
        if self.submit_failures > 0 {
            self.submit_failures -= 1;
            return Err(self.submit_error.clone().unwrap_or(BackendError::Io));
        }
        if self.in_flight.iter().any(|t| t.request.slot == transfer.slot) {
            self.double_submits += 1;
            return Err(BackendError::Busy);
        }
        self.in_flight.push(InFlight {
            request: transfer,
            cancelled: false,
            captured: false,
        });
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), BackendError> {
        self.calls.push(Call::Cancel(slot));
        let transfer = self
            .in_flight
            .iter_mut()
            .find(|t| t.request.slot == slot)
            .ok_or(BackendError::NotFound)?;
        transfer.cancelled = true;
        Ok(())
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), BackendError> {
        self.calls.push(Call::ClearHalt(endpoint));
        Ok(())
    }

    fn handle_events(
        &mut self,
        _timeout: Duration,
        buffers: &mut dyn TransferBuffers,
        completed: &mut VecDeque<Completion>,
    ) -> Result<(), BackendError> {
        self.calls.push(Call::HandleEvents);
        if let Some(e) = self.fail_handle_events.clone() {
            return Err(e);
        }

        for transfer in self.in_flight.iter_mut() {
            if !transfer.captured && !transfer.request.is_inbound() {
                transfer.captured = true;
                let data = buffers.transfer_buffer(transfer.request.slot).to_vec();
                self.sent.push((transfer.request.slot.role, data));
            }
        }

        if self.cancel_completes {
            self.in_flight.retain(|t| {
                if t.cancelled {
                    completed.push_back(Completion {
                        slot: t.request.slot,
                        status: TransferStatus::Cancelled,
                        actual_length: 0,
                    });
                }
                !t.cancelled
            });
        }

        // Scripted completions whose transfer is not in flight wait for a
        // later pump
        let mut waiting = VecDeque::new();
        while let Some(scripted) = self.script.pop_front() {
            let Some(pos) = self.resolve(scripted.target) else {
                waiting.push_back(scripted);
                continue;
            };
            let transfer = self.in_flight.remove(pos);
            let slot = transfer.request.slot;
            let actual_length = if transfer.request.is_inbound() {
                let buffer = buffers.transfer_buffer_mut(slot);
                let len = scripted.data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&scripted.data[..len]);
                len
            } else {
                transfer.request.length
            };
            completed.push_back(Completion {
                slot,
                status: scripted.status,
                actual_length,
            });
        }
        self.script = waiting;
        Ok(())
    }
}
