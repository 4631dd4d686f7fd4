//! USB worker thread
//!
//! The worker is the only owner of the [`TransportSession`]. It alternates
//! between draining host requests from the channel bridge and one dispatch
//! step bounded by the poll interval, so sends and completions are handled
//! strictly in sequence.

use crate::config::{DriverConfig, RecoverySettings};
use bytes::Bytes;
use common::{UsbCommand, UsbEvent, UsbWorker};
use protocol::{HostReport, HostRequest};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use transport::{
    Acceptance, InboundKind, PacketSink, RusbBackend, SessionConfig, TransportError,
    TransportSession, UsbBackend,
};

/// Granularity at which a restart delay checks for shutdown
const RESTART_POLL: Duration = Duration::from_millis(50);

/// Pause after a backend error that is not a device loss
const BACKEND_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Why a running session stopped
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Shutdown,
    Lost(String),
}

/// Forwards inbound packets to the host link
struct HostSink<'a> {
    worker: &'a UsbWorker,
    closed: bool,
}

impl PacketSink for HostSink<'_> {
    fn deliver(&mut self, kind: InboundKind, data: &[u8]) {
        if self.closed {
            return;
        }
        let payload = Bytes::copy_from_slice(data);
        let report = match kind {
            InboundKind::Event => HostReport::Event(payload),
            InboundKind::AclData => HostReport::AclData(payload),
        };
        if let Err(e) = self.worker.send_event(UsbEvent::Report(report)) {
            debug!("Host link gone: {}", e);
            self.closed = true;
        }
    }
}

/// USB worker thread
///
/// Opens the radio, pumps it until shutdown or loss, and reopens it when
/// `[recovery]` allows.
pub struct UsbWorkerThread {
    worker: UsbWorker,
    acceptance: Acceptance,
    session_config: SessionConfig,
    poll_interval: Duration,
    recovery: RecoverySettings,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, acceptance: Acceptance, config: &DriverConfig) -> Self {
        Self {
            worker,
            acceptance,
            session_config: config.session_config(),
            poll_interval: config.poll_interval(),
            recovery: config.recovery.clone(),
        }
    }

    /// Run until shutdown or until the radio is gone for good
    ///
    /// `new_backend` is called for every open attempt. A radio that cannot
    /// be opened the first time is fatal; later failures count against
    /// `max_restarts`.
    pub fn run<B, F>(self, mut new_backend: F)
    where
        B: UsbBackend,
        F: FnMut() -> B,
    {
        info!("USB worker thread started");
        let mut restarts = 0u32;
        let mut ever_opened = false;

        loop {
            let reason = match TransportSession::open(
                new_backend(),
                self.session_config.clone(),
                &self.acceptance,
            ) {
                Ok(mut session) => {
                    ever_opened = true;
                    self.announce(&session);

                    let outcome = self.drive(&mut session);
                    let report = session.teardown();
                    debug!(
                        "Session closed after {} teardown polls, {} transfers leaked",
                        report.polls, report.leaked
                    );

                    match outcome {
                        Outcome::Shutdown => break,
                        Outcome::Lost(reason) => reason,
                    }
                }
                Err(e) => {
                    error!("Failed to open BT device: {}", e);
                    if !ever_opened {
                        self.give_up(e.to_string());
                        break;
                    }
                    e.to_string()
                }
            };

            if !self.recovery.restart_on_loss || restarts >= self.recovery.max_restarts {
                self.give_up(reason);
                break;
            }
            restarts += 1;
            warn!(
                "Radio lost ({}), reopening in {:?} (attempt {} of {})",
                reason,
                self.recovery.restart_delay(),
                restarts,
                self.recovery.max_restarts
            );
            if !self.wait_before_restart(self.recovery.restart_delay()) {
                break;
            }
        }

        info!("USB worker thread stopped");
    }

    fn announce<B: UsbBackend>(&self, session: &TransportSession<B>) {
        let Some(device) = session.device() else {
            return;
        };
        let event = UsbEvent::SessionOpened {
            bus_number: device.bus_number,
            address: device.address,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
        };
        if let Err(e) = self.worker.send_event(event) {
            debug!("Host link gone: {}", e);
        }
    }

    fn give_up(&self, reason: String) {
        if let Err(e) = self.worker.send_event(UsbEvent::SessionLost { reason }) {
            debug!("Host link gone: {}", e);
        }
    }

    /// Pump the session until shutdown or device loss
    fn drive<B: UsbBackend>(&self, session: &mut TransportSession<B>) -> Outcome {
        loop {
            while let Some(cmd) = self.worker.try_recv_command() {
                match cmd {
                    UsbCommand::Send(request) => forward(session, request),
                    UsbCommand::Shutdown => {
                        info!("USB worker shutting down");
                        return Outcome::Shutdown;
                    }
                }
            }

            let mut sink = HostSink {
                worker: &self.worker,
                closed: false,
            };
            match session.dispatch(self.poll_interval, &mut sink) {
                Ok(_) => {}
                Err(e @ (TransportError::DeviceLost | TransportError::ResubmitFailed(_))) => {
                    return Outcome::Lost(e.to_string());
                }
                Err(TransportError::NotRunning) => {
                    return Outcome::Lost("Session is not running".to_string());
                }
                Err(TransportError::Backend(e)) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(BACKEND_ERROR_BACKOFF);
                }
            }

            if sink.closed {
                return Outcome::Shutdown;
            }
        }
    }

    /// Sleep out the restart delay; `false` when shutdown was requested
    fn wait_before_restart(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            while let Some(cmd) = self.worker.try_recv_command() {
                match cmd {
                    UsbCommand::Shutdown => return false,
                    UsbCommand::Send(_) => debug!("No radio, dropping host packet"),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(RESTART_POLL));
        }
    }
}

/// Hand one host request to the radio
///
/// A packet that cannot be sent right now is dropped; the host stack's flow
/// control is expected to keep this rare.
fn forward<B: UsbBackend>(session: &mut TransportSession<B>, request: HostRequest) {
    let (kind, result) = match &request {
        HostRequest::Command(packet) => ("HCI command", session.send_command(packet)),
        HostRequest::AclData(packet) => ("ACL packet", session.send_acl(packet)),
    };
    if let Err(e) = result {
        warn!(
            "Dropping {} of {} bytes: {}",
            kind,
            request.payload().len(),
            e
        );
    }
}

/// Spawn the USB worker thread on top of libusb
pub fn spawn_usb_worker(
    worker: UsbWorker,
    acceptance: Acceptance,
    config: &DriverConfig,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let worker_thread = UsbWorkerThread::new(worker, acceptance, config);
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || worker_thread.run(RusbBackend::new))
}
