//! Host link packet definitions
//!
//! Packets exchanged with the controlling process reuse the UART (H4) HCI
//! packet type values so the controller can treat the USB transport like a
//! serial one. One custom type (`0xFC`) carries diagnostic log lines upward.
//!
//! - Controller → driver: [`HostRequest`] (HCI commands, outbound ACL data)
//! - Driver → controller: [`HostReport`] (HCI events, inbound ACL data, logs)

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Packet type byte that follows the length prefix of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// HCI command (controller → driver)
    Command = 0x01,
    /// HCI ACL data (both directions)
    AclData = 0x02,
    /// HCI synchronous (SCO) data, recognised but never routed
    SyncData = 0x03,
    /// HCI event (driver → controller)
    Event = 0x04,
    /// Diagnostic log message (driver → controller)
    Log = 0xFC,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Command),
            0x02 => Ok(PacketType::AclData),
            0x03 => Ok(PacketType::SyncData),
            0x04 => Ok(PacketType::Event),
            0xFC => Ok(PacketType::Log),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

/// Severity carried in the first payload byte of a log packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Debug = 2,
}

impl TryFrom<u8> for LogLevel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(LogLevel::Error),
            1 => Ok(LogLevel::Warning),
            2 => Ok(LogLevel::Debug),
            other => Err(ProtocolError::InvalidLogLevel(other)),
        }
    }
}

/// A decoded frame: packet type plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }
}

/// Request from the controlling process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// HCI command bytes (opcode, parameter length, parameters)
    Command(Bytes),
    /// Outbound ACL data packet
    AclData(Bytes),
}

impl HostRequest {
    pub fn payload(&self) -> &Bytes {
        match self {
            HostRequest::Command(payload) | HostRequest::AclData(payload) => payload,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            HostRequest::Command(payload) => Frame::new(PacketType::Command, payload),
            HostRequest::AclData(payload) => Frame::new(PacketType::AclData, payload),
        }
    }
}

impl TryFrom<Frame> for HostRequest {
    type Error = ProtocolError;

    /// Only commands and ACL data may travel controller → driver. Anything else
    /// is a protocol violation.
    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.packet_type {
            PacketType::Command => Ok(HostRequest::Command(frame.payload)),
            PacketType::AclData => Ok(HostRequest::AclData(frame.payload)),
            other => Err(ProtocolError::UnexpectedPacketType(other as u8)),
        }
    }
}

/// Report sent to the controlling process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostReport {
    /// HCI event received on the interrupt endpoint
    Event(Bytes),
    /// ACL data received on the bulk IN endpoint
    AclData(Bytes),
    /// Diagnostic log line
    Log { level: LogLevel, message: String },
}

impl HostReport {
    pub fn into_frame(self) -> Frame {
        match self {
            HostReport::Event(payload) => Frame::new(PacketType::Event, payload),
            HostReport::AclData(payload) => Frame::new(PacketType::AclData, payload),
            HostReport::Log { level, message } => {
                let mut payload = BytesMut::with_capacity(1 + message.len());
                payload.put_u8(level as u8);
                payload.put_slice(message.as_bytes());
                Frame::new(PacketType::Log, payload.freeze())
            }
        }
    }
}

impl TryFrom<Frame> for HostReport {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.packet_type {
            PacketType::Event => Ok(HostReport::Event(frame.payload)),
            PacketType::AclData => Ok(HostReport::AclData(frame.payload)),
            PacketType::Log => {
                let (&level, text) = frame
                    .payload
                    .split_first()
                    .ok_or(ProtocolError::EmptyFrame)?;
                Ok(HostReport::Log {
                    level: LogLevel::try_from(level)?,
                    message: String::from_utf8_lossy(text).into_owned(),
                })
            }
            other => Err(ProtocolError::UnexpectedPacketType(other as u8)),
        }
    }
}
