//! Transport session
//!
//! One session owns one radio: the backend, the four endpoint pools and the
//! queue of finished transfers. It is driven from a single thread; sends
//! never block and the only wait happens inside [`TransportSession::dispatch`].

use crate::backend::{Completion, DeviceSummary, TransferBuffers, UsbBackend};
use crate::error::{BackendError, PoolError, SendError};
use crate::lifecycle::LifecycleState;
use crate::pool::{
    CONTROL_SETUP_SIZE, DEFAULT_SLOTS_PER_ENDPOINT, EndpointPools, EndpointRole,
    HCI_MAX_BUFFER_SIZE, SlotId,
};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// `bmRequestType` of an HCI command: host-to-device, class, interface
pub const HCI_COMMAND_REQUEST_TYPE: u8 = 0x21;

/// Event pump iterations allowed for cancelled transfers to come back
pub const DEFAULT_TEARDOWN_BUDGET: u32 = 20;

/// Tunables of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub slots_per_endpoint: usize,
    /// Largest HCI packet per transfer; the control endpoint adds the setup
    /// packet on top
    pub buffer_size: usize,
    pub teardown_budget: u32,
    /// Reset the radio after opening it (failures are ignored)
    pub reset_on_open: bool,
    /// Select this configuration before claiming the interface
    pub configuration: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slots_per_endpoint: DEFAULT_SLOTS_PER_ENDPOINT,
            buffer_size: HCI_MAX_BUFFER_SIZE,
            teardown_budget: DEFAULT_TEARDOWN_BUDGET,
            reset_on_open: true,
            configuration: None,
        }
    }
}

/// Kind of packet delivered upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Event,
    AclData,
}

/// Receiver of inbound packets
///
/// Packets arrive in completion order. The slice is only valid for the
/// duration of the call.
pub trait PacketSink {
    fn deliver(&mut self, kind: InboundKind, data: &[u8]);
}

impl<F> PacketSink for F
where
    F: FnMut(InboundKind, &[u8]),
{
    fn deliver(&mut self, kind: InboundKind, data: &[u8]) {
        self(kind, data)
    }
}

/// An open (or partially open) connection to one radio
pub struct TransportSession<B: UsbBackend> {
    pub(crate) backend: B,
    pub(crate) config: SessionConfig,
    pub(crate) state: LifecycleState,
    pub(crate) interface: Option<u8>,
    pub(crate) kernel_driver_detached: bool,
    pub(crate) device: Option<DeviceSummary>,
    pub(crate) pools: Option<EndpointPools>,
    pub(crate) completions: VecDeque<Completion>,
    pub(crate) lost: bool,
}

impl<B: UsbBackend> TransportSession<B> {
    /// A session in the `Closed` state
    pub(crate) fn closed(backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: LifecycleState::Closed,
            interface: None,
            kernel_driver_detached: false,
            device: None,
            pools: None,
            completions: VecDeque::new(),
            lost: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The radio this session was opened on
    pub fn device(&self) -> Option<&DeviceSummary> {
        self.device.as_ref()
    }

    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    pub fn pools(&self) -> Option<&EndpointPools> {
        self.pools.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Whether sends and dispatch steps are accepted
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::TransfersAllocated && !self.lost
    }

    /// Whether the radio has been reported gone
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Bytes of the slot that take part in its current transfer
    pub fn transfer_buffer(&self, slot: SlotId) -> Option<&[u8]> {
        self.pools.as_ref().map(|pools| pools.transfer_buffer(slot))
    }

    /// Largest HCI command accepted by [`send_command`](Self::send_command)
    pub fn max_command_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Largest ACL packet accepted by [`send_acl`](Self::send_acl)
    pub fn max_acl_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Queue an HCI command on the control endpoint
    ///
    /// The payload is copied; the caller keeps ownership of `packet`.
    pub fn send_command(&mut self, packet: &[u8]) -> Result<(), SendError> {
        debug!("send_command, size {}", packet.len());
        self.send_on(EndpointRole::Control, packet)
    }

    /// Queue an ACL packet on the bulk-out endpoint
    pub fn send_acl(&mut self, packet: &[u8]) -> Result<(), SendError> {
        debug!("send_acl, size {}", packet.len());
        self.send_on(EndpointRole::BulkOut, packet)
    }

    fn send_on(&mut self, role: EndpointRole, packet: &[u8]) -> Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::Closed);
        }
        let Some(pools) = self.pools.as_mut() else {
            return Err(SendError::Closed);
        };

        let max = self.config.buffer_size;
        if packet.len() > max {
            warn!("Packet too large ({} > {})", packet.len(), max);
            return Err(SendError::TooLarge {
                size: packet.len(),
                max,
            });
        }

        let pool = pools.get_mut(role);
        let slot = match pool.acquire() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Out of {:?} transfer buffers. Dropping.", role);
                return Err(SendError::Busy);
            }
        };

        let staged = stage_packet(pool.buffer_mut(slot), role, packet)
            .and_then(|length| pool.set_length(slot, length))
            .and_then(|()| pool.request(slot));
        let request = match staged {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to stage {:?} transfer: {}", role, e);
                let _ = pool.release(slot);
                return Err(SendError::Busy);
            }
        };

        if let Err(e) = self.backend.submit(request) {
            warn!("Error submitting {:?} transfer: {}", role, e);
            let _ = pool.release(slot);
            if e == BackendError::NoDevice {
                self.lost = true;
            }
            return Err(SendError::Busy);
        }

        if let Err(e) = pool.mark_in_flight(slot) {
            error!("Slot bookkeeping out of sync: {}", e);
        }
        Ok(())
    }
}

/// Copy `packet` into a slot region, behind a setup packet on the control
/// endpoint; returns the transfer length
fn stage_packet(
    buffer: Result<&mut [u8], PoolError>,
    role: EndpointRole,
    packet: &[u8],
) -> Result<usize, PoolError> {
    let buffer = buffer?;
    let offset = if role == EndpointRole::Control {
        fill_control_setup(&mut buffer[..CONTROL_SETUP_SIZE], packet.len());
        CONTROL_SETUP_SIZE
    } else {
        0
    };
    buffer[offset..offset + packet.len()].copy_from_slice(packet);
    Ok(offset + packet.len())
}

/// Write the setup packet of an HCI command transfer
///
/// `bRequest`, `wValue` and `wIndex` are zero; `wLength` is the command
/// length, little endian.
pub fn fill_control_setup(setup: &mut [u8], length: usize) {
    setup[0] = HCI_COMMAND_REQUEST_TYPE;
    setup[1] = 0;
    setup[2..4].copy_from_slice(&0u16.to_le_bytes());
    setup[4..6].copy_from_slice(&0u16.to_le_bytes());
    setup[6..8].copy_from_slice(&(length as u16).to_le_bytes());
}
