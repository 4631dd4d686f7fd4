//! Session bring-up and teardown
//!
//! A session climbs through [`LifecycleState`] one step at a time. Teardown
//! walks back down from whatever state was reached, so a failed `open` and a
//! normal shutdown share the same path.

use crate::backend::{TransferStatus, UsbBackend};
use crate::error::{BackendError, OpenError};
use crate::locator::{Acceptor, find_device};
use crate::pool::{EndpointPools, EndpointRole};
use crate::session::{SessionConfig, TransportSession};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How far a session got; ordered from least to most acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleState {
    Closed,
    /// Backend initialised
    Opened,
    /// Device handle open
    DeviceOpened,
    /// Interface claimed
    InterfaceClaimed,
    /// Pools allocated and inbound transfers primed; the running state
    TransfersAllocated,
}

/// What teardown had to do to get back to `Closed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Event pump iterations spent waiting for cancelled transfers
    pub polls: u32,
    /// Transfers still owned by the backend when the budget ran out
    pub leaked: usize,
}

impl<B: UsbBackend> TransportSession<B> {
    /// Find an acceptable radio and bring a session up on it
    ///
    /// On failure everything acquired so far is released before the error is
    /// returned, and the backend is dropped.
    pub fn open<A>(backend: B, config: SessionConfig, acceptor: &A) -> Result<Self, OpenError>
    where
        A: Acceptor + ?Sized,
    {
        let mut session = Self::closed(backend, config);
        match session.bring_up(acceptor) {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!("{}", e);
                session.teardown();
                Err(e)
            }
        }
    }

    fn bring_up<A>(&mut self, acceptor: &A) -> Result<(), OpenError>
    where
        A: Acceptor + ?Sized,
    {
        self.backend.init().map_err(OpenError::Init)?;
        self.state = LifecycleState::Opened;

        let located = find_device(&mut self.backend, acceptor).map_err(|_| OpenError::NotFound)?;
        self.backend.open(&located.device).map_err(OpenError::Open)?;
        // Handle holds its own reference from here on
        drop(located.device);
        self.state = LifecycleState::DeviceOpened;
        self.device = Some(located.summary);
        self.interface = Some(located.interface);
        let interface = located.interface;

        self.detach_kernel_driver(interface)?;

        if self.config.reset_on_open {
            if let Err(e) = self.backend.reset() {
                warn!("Device reset failed ({}). Ignoring", e);
            }
        }

        if let Some(configuration) = self.config.configuration {
            self.backend
                .set_configuration(configuration)
                .map_err(OpenError::Configure)?;
        }

        self.backend
            .claim_interface(interface)
            .map_err(OpenError::Claim)?;
        self.state = LifecycleState::InterfaceClaimed;
        debug!("Claimed interface {}", interface);

        let pools = self.pools.insert(EndpointPools::allocate(
            self.config.slots_per_endpoint,
            self.config.buffer_size,
        ));
        self.state = LifecycleState::TransfersAllocated;

        for role in [EndpointRole::InterruptIn, EndpointRole::BulkIn] {
            pools
                .get_mut(role)
                .prime_all(&mut self.backend)
                .map_err(OpenError::Prime)?;
        }

        info!(
            "Session open on interface {} ({} transfers per endpoint)",
            interface, self.config.slots_per_endpoint
        );
        Ok(())
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), OpenError> {
        match self.backend.kernel_driver_active(interface) {
            Ok(true) => {
                self.backend
                    .detach_kernel_driver(interface)
                    .map_err(OpenError::DetachKernelDriver)?;
                self.kernel_driver_detached = true;
                debug!("Detached kernel driver from interface {}", interface);
            }
            Ok(false) | Err(BackendError::NotSupported) => {}
            Err(e) => debug!("Cannot query kernel driver: {}", e),
        }
        Ok(())
    }

    /// Release everything the session holds and return to `Closed`
    ///
    /// In-flight transfers are cancelled and the backend is pumped until they
    /// come back or the teardown budget is spent. Calling this again, or on a
    /// session that never opened, does nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == LifecycleState::Closed {
            return report;
        }

        if self.state >= LifecycleState::TransfersAllocated {
            report = self.cancel_transfers();
            self.pools = None;
        }

        if self.state >= LifecycleState::InterfaceClaimed {
            if let Some(interface) = self.interface {
                if let Err(e) = self.backend.release_interface(interface) {
                    debug!("Failed to release interface {}: {}", interface, e);
                }
            }
        }

        if self.state >= LifecycleState::DeviceOpened {
            if self.kernel_driver_detached {
                if let Some(interface) = self.interface {
                    match self.backend.attach_kernel_driver(interface) {
                        Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                        Err(e) => debug!("Failed to reattach kernel driver: {}", e),
                    }
                }
                self.kernel_driver_detached = false;
            }
            self.backend.close();
        }

        self.backend.exit();
        self.state = LifecycleState::Closed;
        self.interface = None;
        debug!("Transport shutdown complete");
        report
    }

    fn cancel_transfers(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        // Whatever the last dispatch step left behind is finished already
        self.park_completions();

        let Some(pools) = self.pools.as_mut() else {
            return report;
        };

        for role in EndpointRole::ALL {
            let in_flight: Vec<_> = pools.get(role).in_flight().collect();
            for slot in in_flight {
                if let Err(e) = self.backend.cancel(slot) {
                    // Already finishing; its completion still has to come back
                    debug!("Failed to cancel {:?}: {}", slot, e);
                }
            }
        }

        while pools.in_flight_count() > 0 && report.polls < self.config.teardown_budget {
            report.polls += 1;
            if let Err(e) =
                self.backend
                    .handle_events(Duration::ZERO, pools, &mut self.completions)
            {
                debug!("Handling USB events during teardown failed: {}", e);
            }
            for completion in self.completions.drain(..) {
                let pool = pools.get_mut(completion.slot.role);
                if completion.status != TransferStatus::Cancelled {
                    debug!(
                        "Transfer {:?} finished with {:?} during teardown",
                        completion.slot, completion.status
                    );
                }
                if pool.mark_completed(completion.slot).is_ok() {
                    let _ = pool.release(completion.slot);
                }
            }
        }

        report.leaked = pools.in_flight_count();
        if report.leaked > 0 {
            warn!(
                "Timed out waiting for USB transfers to cancel. Leaking {} transfers",
                report.leaked
            );
        }
        report
    }
}

impl<B: UsbBackend> Drop for TransportSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
