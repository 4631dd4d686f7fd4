//! Host link protocol for the USB HCI transport
//!
//! This crate defines the packets exchanged between the driver and the
//! controlling process (the Bluetooth host stack) and the length-prefixed
//! framing used on the pipe between them.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use protocol::{HostReport, HostRequest, decode_framed, encode_framed};
//!
//! let report = HostReport::Event(Bytes::from_static(&[0x0e, 0x01, 0x00]));
//! let bytes = encode_framed(&report.into_frame()).unwrap();
//!
//! let (frame, _) = decode_framed(&bytes).unwrap();
//! assert!(HostRequest::try_from(frame).is_err());
//! ```

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, decode_framed, encode_framed, read_framed, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{ProtocolError, Result};
pub use messages::{Frame, HostReport, HostRequest, LogLevel, PacketType};
