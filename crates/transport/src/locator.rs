//! Bluetooth radio discovery
//!
//! Walks the attached devices, keeps the ones that look like a Bluetooth
//! controller (by class code and endpoint layout) and asks an [`Acceptor`]
//! whether to use each of them. The first accepted device wins; references to
//! every other device are dropped before returning.

use crate::backend::{DeviceSummary, InterfaceSummary, UsbBackend};
use crate::pool::EndpointRole;
use tracing::{debug, info, warn};

/// Wireless controller / RF / Bluetooth programming interface
const CLASS_WIRELESS: (u8, u8, u8) = (0xE0, 0x01, 0x01);
/// Miscellaneous / common class / interface association descriptor
const CLASS_MISC_IAD: (u8, u8, u8) = (0xEF, 0x02, 0x01);
const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

/// Which radio to use among the plausible candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Match vendor and product IDs
    VidPid { vid: u16, pid: u16 },
    /// Match bus number and device address
    Location { bus: u8, address: u8 },
    /// Take the first plausible radio
    First,
}

/// Decides whether a plausible radio should be used
///
/// Evaluated at most once per candidate. Implemented for [`Acceptance`] and
/// for any `Fn(&DeviceSummary) -> bool`.
pub trait Acceptor {
    fn accept(&self, device: &DeviceSummary) -> bool;
}

impl Acceptor for Acceptance {
    fn accept(&self, device: &DeviceSummary) -> bool {
        match *self {
            Acceptance::VidPid { vid, pid } => {
                device.vendor_id == vid && device.product_id == pid
            }
            Acceptance::Location { bus, address } => {
                device.bus_number == bus && device.address == address
            }
            Acceptance::First => true,
        }
    }
}

impl<F> Acceptor for F
where
    F: Fn(&DeviceSummary) -> bool,
{
    fn accept(&self, device: &DeviceSummary) -> bool {
        self(device)
    }
}

/// A selected radio, still referenced but not yet opened
#[derive(Debug)]
pub struct LocatedDevice<D> {
    pub device: D,
    pub summary: DeviceSummary,
    /// Interface carrying the HCI endpoints
    pub interface: u8,
}

/// No attached device was both plausible and accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("No acceptable Bluetooth modules found")]
pub struct NotFound;

/// Device-level class filter
pub fn possible_bt_device(device: &DeviceSummary) -> bool {
    let triple = (device.class_code, device.sub_class_code, device.protocol_code);
    triple == CLASS_WIRELESS
        || triple == CLASS_MISC_IAD
        || device.class_code == CLASS_VENDOR_SPECIFIC
}

/// At least three endpoints, including event-in, ACL-in and ACL-out
pub fn has_expected_endpoints(interface: &InterfaceSummary) -> bool {
    interface.endpoints.len() >= 3
        && [
            EndpointRole::InterruptIn,
            EndpointRole::BulkIn,
            EndpointRole::BulkOut,
        ]
        .iter()
        .all(|role| interface.endpoints.contains(&role.address()))
}

/// First interface that can carry HCI traffic
pub fn find_bt_interface(interfaces: &[InterfaceSummary]) -> Option<u8> {
    interfaces
        .iter()
        .find(|intf| {
            let triple = (intf.class_code, intf.sub_class_code, intf.protocol_code);
            (triple == CLASS_WIRELESS || intf.class_code == CLASS_VENDOR_SPECIFIC)
                && has_expected_endpoints(intf)
        })
        .map(|intf| intf.number)
}

/// Summary and interface of a device, if it looks like a radio
fn plausible<B: UsbBackend>(
    backend: &B,
    device: &B::Device,
) -> Option<(DeviceSummary, u8)> {
    let summary = match backend.device_summary(device) {
        Ok(summary) => summary,
        Err(e) => {
            debug!("Failed to read device descriptor: {}", e);
            return None;
        }
    };
    if !possible_bt_device(&summary) {
        return None;
    }

    let interfaces = match backend.interfaces(device) {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!(
                "Failed to read configuration of {:04x}:{:04x}: {}",
                summary.vendor_id, summary.product_id, e
            );
            return None;
        }
    };
    let interface = find_bt_interface(&interfaces)?;
    Some((summary, interface))
}

/// Pick the first plausible radio that `acceptor` accepts
pub fn find_device<B, A>(
    backend: &mut B,
    acceptor: &A,
) -> Result<LocatedDevice<B::Device>, NotFound>
where
    B: UsbBackend,
    A: Acceptor + ?Sized,
{
    let devices = match backend.devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            return Err(NotFound);
        }
    };

    // Consuming the list drops every reference we do not return
    for device in devices {
        let Some((summary, interface)) = plausible(backend, &device) else {
            continue;
        };

        if acceptor.accept(&summary) {
            info!(
                "Using BT device at bus {}, device {}: ID {:04x}:{:04x}",
                summary.bus_number, summary.address, summary.vendor_id, summary.product_id
            );
            return Ok(LocatedDevice {
                device,
                summary,
                interface,
            });
        }

        info!(
            "Skipping BT device at bus {}, device {}: ID {:04x}:{:04x}",
            summary.bus_number, summary.address, summary.vendor_id, summary.product_id
        );
    }

    Err(NotFound)
}

/// Every plausible radio, with its HCI interface, for `--list-devices`
pub fn list_candidates<B: UsbBackend>(backend: &mut B) -> Vec<(DeviceSummary, u8)> {
    match backend.devices() {
        Ok(devices) => devices
            .iter()
            .filter_map(|device| plausible(backend, device))
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            Vec::new()
        }
    }
}
