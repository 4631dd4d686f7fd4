//! Completion dispatch
//!
//! One dispatch step pumps the backend once and then drains every finished
//! transfer in the order the backend reported them. Inbound transfers are
//! delivered upward and immediately resubmitted; outbound transfers go back
//! to their pool.

use crate::backend::{Completion, TransferStatus, UsbBackend};
use crate::error::{BackendError, Result, TransportError};
use crate::pool::{EndpointPool, EndpointRole, SlotId};
use crate::session::{InboundKind, PacketSink, TransportSession};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

impl<B: UsbBackend> TransportSession<B> {
    /// Wait up to `timeout` for transfers to finish and process them
    ///
    /// Returns the number of completions handled. `Err(DeviceLost)` means the
    /// radio is gone; the session accepts nothing more and should be torn
    /// down.
    pub fn dispatch<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<usize>
    where
        S: PacketSink + ?Sized,
    {
        if self.lost {
            return Err(TransportError::DeviceLost);
        }
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        let Some(pools) = self.pools.as_mut() else {
            return Err(TransportError::NotRunning);
        };

        if let Err(e) = self
            .backend
            .handle_events(timeout, pools, &mut self.completions)
        {
            if e == BackendError::NoDevice {
                error!("Device removed");
                self.lost = true;
                return Err(TransportError::DeviceLost);
            }
            error!("Handling USB events failed: {}", e);
            return Err(TransportError::Backend(e));
        }

        let mut handled = 0;
        while let Some(completion) = self.completions.pop_front() {
            handled += 1;
            let pool = pools.get_mut(completion.slot.role);
            if let Err(e) = pool.mark_completed(completion.slot) {
                error!("Completion for a slot the backend does not own: {}", e);
                continue;
            }

            let outcome = if completion.slot.role.is_inbound() {
                handle_inbound(&mut self.backend, pool, completion, sink)
            } else {
                handle_outbound(&mut self.backend, pool, completion)
            };

            if let Err(fatal) = outcome {
                let err = match fatal {
                    Fatal::DeviceLost => TransportError::DeviceLost,
                    Fatal::Resubmit(e) => TransportError::ResubmitFailed(e),
                };
                error!("{}", err);
                self.lost = true;
                // Anything left is handed back to teardown rather than
                // delivered.
                self.park_completions();
                return Err(err);
            }
        }

        if handled > 0 {
            trace!("Dispatched {} completions", handled);
        }
        Ok(handled)
    }

    /// Return queued completions to their pools without acting on them
    pub(crate) fn park_completions(&mut self) {
        let Some(pools) = self.pools.as_mut() else {
            self.completions.clear();
            return;
        };
        for completion in self.completions.drain(..) {
            let pool = pools.get_mut(completion.slot.role);
            if pool.mark_completed(completion.slot).is_ok() {
                let _ = pool.release(completion.slot);
            }
        }
    }
}

/// Completion handling that ends the session
enum Fatal {
    DeviceLost,
    /// An inbound slot could not be resubmitted
    Resubmit(BackendError),
}

fn handle_inbound<B, S>(
    backend: &mut B,
    pool: &mut EndpointPool,
    completion: Completion,
    sink: &mut S,
) -> std::result::Result<(), Fatal>
where
    B: UsbBackend,
    S: PacketSink + ?Sized,
{
    let slot = completion.slot;
    match completion.status {
        TransferStatus::Completed => {
            let kind = match slot.role {
                EndpointRole::InterruptIn => InboundKind::Event,
                _ => InboundKind::AclData,
            };
            if let Ok(buffer) = pool.buffer(slot) {
                let len = completion.actual_length.min(buffer.len());
                sink.deliver(kind, &buffer[..len]);
            }
        }
        TransferStatus::Stall => {
            warn!("Transfer stalled, trying again");
            clear_halt(backend, pool);
        }
        TransferStatus::NoDevice => {
            let _ = pool.release(slot);
            return Err(Fatal::DeviceLost);
        }
        status => {
            debug!(
                "unexpected status. endpoint {:#04x}, status {:?}, length {}",
                pool.endpoint().address,
                status,
                completion.actual_length
            );
        }
    }

    // Every inbound slot must stay in flight or reception starves
    match resubmit(backend, pool, slot) {
        Ok(()) => Ok(()),
        Err(BackendError::NoDevice) => Err(Fatal::DeviceLost),
        Err(e) => Err(Fatal::Resubmit(e)),
    }
}

fn handle_outbound<B: UsbBackend>(
    backend: &mut B,
    pool: &mut EndpointPool,
    completion: Completion,
) -> std::result::Result<(), Fatal> {
    let slot = completion.slot;
    match completion.status {
        TransferStatus::Completed => {
            let _ = pool.release(slot);
            Ok(())
        }
        TransferStatus::Stall => {
            warn!("Transfer stalled, trying again");
            clear_halt(backend, pool);
            // Same payload, same length: the staged bytes are still there
            match resubmit(backend, pool, slot) {
                Ok(()) => Ok(()),
                Err(BackendError::NoDevice) => Err(Fatal::DeviceLost),
                // The packet is dropped
                Err(_) => Ok(()),
            }
        }
        TransferStatus::NoDevice => {
            let _ = pool.release(slot);
            Err(Fatal::DeviceLost)
        }
        status => {
            debug!(
                "unexpected status. endpoint {:#04x}, status {:?}, length {}",
                pool.endpoint().address,
                status,
                completion.actual_length
            );
            let _ = pool.release(slot);
            Ok(())
        }
    }
}

fn clear_halt<B: UsbBackend>(backend: &mut B, pool: &EndpointPool) {
    let endpoint = pool.endpoint().address;
    if let Err(e) = backend.clear_halt(endpoint) {
        warn!("Failed to clear halt on endpoint {:#04x}: {}", endpoint, e);
    }
}

/// Put a completed slot back in flight
///
/// On failure the slot goes back to the free list and the caller decides
/// whether the endpoint can live without it.
fn resubmit<B: UsbBackend>(
    backend: &mut B,
    pool: &mut EndpointPool,
    slot: SlotId,
) -> std::result::Result<(), BackendError> {
    let request = match pool.request(slot) {
        Ok(request) => request,
        Err(e) => {
            error!("Cannot resubmit {:?}: {}", slot, e);
            let _ = pool.release(slot);
            return Err(BackendError::InvalidParam);
        }
    };

    if let Err(e) = backend.submit(request) {
        error!(
            "Failed to resubmit transfer on endpoint {:#04x}: {}",
            request.endpoint, e
        );
        let _ = pool.release(slot);
        return Err(e);
    }
    let _ = pool.mark_in_flight(slot);
    Ok(())
}
