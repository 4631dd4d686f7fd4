//! Async channel bridge between the host link and the USB worker thread
//!
//! The USB session has exactly one owner: the worker thread. The Tokio side
//! (stdin reader, stdout writer) never touches it directly; it hands host
//! requests over `UsbCommand` and receives everything going upward as
//! `UsbEvent`.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{HostReport, HostRequest};

/// Capacity of each direction of the bridge
pub const BRIDGE_CAPACITY: usize = 256;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Forward an HCI command or ACL packet to the radio
    Send(HostRequest),

    /// Tear the session down and stop the USB thread
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// Packet or log line destined for the controlling process
    Report(HostReport),

    /// A radio was found and the session reached the running state
    SessionOpened {
        bus_number: u8,
        address: u8,
        vendor_id: u16,
        product_id: u16,
    },

    /// The radio went away and the worker gave up on it
    SessionLost {
        /// Human-readable reason
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
    event_tx: Sender<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event if one is already queued
    pub fn try_recv_event(&self) -> Option<UsbEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Blocking command sender for threads outside the runtime
    ///
    /// It does not hold the event receiver, so a thread parked on host I/O
    /// never keeps the event side of the bridge alive.
    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Sender that injects events from outside the USB thread (log forwarding)
    pub fn report_sender(&self) -> ReportSender {
        ReportSender {
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    ///
    /// A closed command channel reads as `Shutdown`: nobody is left to talk to.
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        match self.cmd_rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(async_channel::TryRecvError::Empty) => None,
            Err(async_channel::TryRecvError::Closed) => Some(UsbCommand::Shutdown),
        }
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Command half of the bridge for plain threads (blocking)
#[derive(Clone)]
pub struct CommandSender {
    cmd_tx: Sender<UsbCommand>,
}

impl CommandSender {
    /// Send a command to the USB thread, waiting while the bridge is full
    pub fn send(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Non-blocking sender of host reports, usable from any thread
#[derive(Clone)]
pub struct ReportSender {
    event_tx: Sender<UsbEvent>,
}

impl ReportSender {
    /// Queue a report, dropping it when the bridge is full or closed
    ///
    /// Returns `true` when the report was queued.
    pub fn try_send(&self, report: HostReport) -> bool {
        match self.event_tx.try_send(UsbEvent::Report(report)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (event_tx, event_rx) = bounded(BRIDGE_CAPACITY);

    (
        UsbBridge {
            cmd_tx,
            event_rx,
            event_tx: event_tx.clone(),
        },
        UsbWorker { cmd_rx, event_tx },
    )
}
