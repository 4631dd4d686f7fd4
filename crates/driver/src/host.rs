//! Host link
//!
//! Framed packets from the controlling process arrive on stdin and are
//! handed to the USB worker; everything the worker reports goes back out on
//! stdout. A packet type the driver does not accept ends the link with an
//! error.
//!
//! Stdin is read on a plain detached thread. A blocking read cannot be
//! cancelled, and the process must still exit when the radio is lost while
//! the host keeps the pipe open.

use anyhow::{Context, Result, anyhow};
use common::{CommandSender, UsbBridge, UsbCommand, UsbEvent};
use protocol::{HostReport, HostRequest, read_framed, write_framed_async};
use std::io::Read;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tracing::{info, trace};

/// Forward host requests to the USB worker until the host closes the link
pub fn pump_requests<R: Read>(reader: &mut R, commands: &CommandSender) -> Result<()> {
    loop {
        let frame = match read_framed(reader) {
            Ok(frame) => frame,
            Err(e) if e.is_eof() => {
                info!("Host closed the link");
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read packet from host"),
        };

        let request = HostRequest::try_from(frame).context("Invalid packet from host")?;
        trace!("host -> radio: {:?}", request);
        commands
            .send(UsbCommand::Send(request))
            .context("USB worker is gone")?;
    }
}

/// Write one report to the host
pub async fn write_report<W>(writer: &mut W, report: HostReport) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_framed_async(writer, &report.into_frame())
        .await
        .context("Failed to write packet to host")
}

/// Run the host link until the host hangs up or the radio is lost
///
/// The reader thread is never joined; when the radio goes away first it is
/// left blocked in its read and ends with the process.
pub async fn run<R, W>(reader: R, writer: &mut W, bridge: &UsbBridge) -> Result<()>
where
    R: Read + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (done_tx, mut done_rx) = oneshot::channel();
    let commands = bridge.command_sender();
    std::thread::Builder::new()
        .name("host-reader".to_string())
        .spawn(move || {
            let mut reader = reader;
            let _ = done_tx.send(pump_requests(&mut reader, &commands));
        })
        .context("Failed to spawn host reader thread")?;

    loop {
        tokio::select! {
            finished = &mut done_rx => {
                return finished.unwrap_or_else(|_| Err(anyhow!("Host reader thread died")));
            }
            event = bridge.recv_event() => {
                match event.context("USB worker is gone")? {
                    UsbEvent::Report(report) => write_report(writer, report).await?,
                    UsbEvent::SessionOpened {
                        vendor_id,
                        product_id,
                        ..
                    } => {
                        info!("Radio {:04x}:{:04x} ready", vendor_id, product_id);
                    }
                    UsbEvent::SessionLost { reason } => {
                        return Err(anyhow!("Bluetooth radio lost: {}", reason));
                    }
                }
            }
        }
    }
}
