//! Frame encoding and decoding for the host link
//!
//! # Frame Format
//!
//! ```text
//! [Length: u16 (big-endian)][Type: u8][Payload bytes]
//! ```
//!
//! `Length` counts the type byte plus the payload, so the smallest valid frame
//! is three bytes long and carries an empty payload.

use crate::error::{ProtocolError, Result};
use crate::messages::{Frame, PacketType};
use bytes::Bytes;
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest value the length prefix can carry (type byte + payload)
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Encode a frame with its length prefix
///
/// # Example
/// ```
/// use protocol::{Frame, PacketType, encode_framed};
///
/// let frame = Frame::new(PacketType::Event, vec![0x0e, 0x01, 0x00]);
/// let bytes = encode_framed(&frame).unwrap();
/// assert_eq!(bytes, [0x00, 0x04, 0x04, 0x0e, 0x01, 0x00]);
/// ```
pub fn encode_framed(frame: &Frame) -> Result<Vec<u8>> {
    let body_len = 1 + frame.payload.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    out.extend_from_slice(&(body_len as u16).to_be_bytes());
    out.push(frame.packet_type.into());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Decode one frame from the start of `bytes`
///
/// Returns the frame and the number of bytes consumed so callers can walk a
/// buffer holding several frames back to back.
pub fn decode_framed(bytes: &[u8]) -> Result<(Frame, usize)> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: LENGTH_PREFIX_SIZE,
            actual: bytes.len(),
        });
    }

    let length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if length == 0 {
        return Err(ProtocolError::EmptyFrame);
    }

    let total = LENGTH_PREFIX_SIZE + length;
    if bytes.len() < total {
        return Err(ProtocolError::IncompleteFrame {
            expected: total,
            actual: bytes.len(),
        });
    }

    let frame = body_to_frame(&bytes[LENGTH_PREFIX_SIZE..total])?;
    Ok((frame, total))
}

/// Write a framed packet to a writer (e.g., stdout)
pub fn write_framed<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let framed = encode_framed(frame)?;
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read a framed packet from a reader (e.g., stdin)
///
/// A clean end of stream surfaces as an `Io` error of kind `UnexpectedEof`,
/// see [`ProtocolError::is_eof`].
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_bytes)?;
    let length = u16::from_be_bytes(len_bytes) as usize;
    if length == 0 {
        return Err(ProtocolError::EmptyFrame);
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    body_to_frame(&body)
}

/// Async: Write a framed packet to an async writer
#[cfg(feature = "async")]
pub async fn write_framed_async<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let framed = encode_framed(frame)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: Read a framed packet from an async reader
#[cfg(feature = "async")]
pub async fn read_framed_async<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_bytes).await?;
    let length = u16::from_be_bytes(len_bytes) as usize;
    if length == 0 {
        return Err(ProtocolError::EmptyFrame);
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    body_to_frame(&body)
}

fn body_to_frame(body: &[u8]) -> Result<Frame> {
    let (&packet_type, payload) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
    Ok(Frame {
        packet_type: PacketType::try_from(packet_type)?,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HostReport, HostRequest, LogLevel};
    use std::io::Cursor;

    #[test]
    fn test_length_counts_type_and_payload() {
        let frame = HostReport::AclData(Bytes::from_static(&[1, 2, 3, 4])).into_frame();
        let bytes = encode_framed(&frame).unwrap();
        assert_eq!(&bytes[..3], &[0x00, 0x05, 0x02]);
        assert_eq!(bytes.len(), 7);
    }

    #[test]
    fn test_decode_command_request() {
        // HCI_Reset
        let bytes = [0x00, 0x04, 0x01, 0x03, 0x0c, 0x00];
        let (frame, consumed) = decode_framed(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());

        let request = HostRequest::try_from(frame).unwrap();
        assert_eq!(
            request,
            HostRequest::Command(Bytes::from_static(&[0x03, 0x0c, 0x00]))
        );
    }

    #[test]
    fn test_decode_walks_back_to_back_frames() {
        let mut bytes = encode_framed(&Frame::new(PacketType::Command, vec![0xAA])).unwrap();
        bytes.extend(encode_framed(&Frame::new(PacketType::AclData, vec![0xBB, 0xCC])).unwrap());

        let (first, used) = decode_framed(&bytes).unwrap();
        let (second, _) = decode_framed(&bytes[used..]).unwrap();
        assert_eq!(first.packet_type, PacketType::Command);
        assert_eq!(second.payload.as_ref(), &[0xBB, 0xCC]);
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = [0x00, 0x05, 0x02, 0x01];
        assert!(matches!(
            decode_framed(&bytes),
            Err(ProtocolError::IncompleteFrame {
                expected: 7,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_zero_length_frame() {
        assert!(matches!(
            decode_framed(&[0x00, 0x00]),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::new(PacketType::AclData, vec![0u8; MAX_FRAME_SIZE]);
        assert!(matches!(
            encode_framed(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_read_write_stream() {
        let mut buffer = Vec::new();
        let report = HostReport::Log {
            level: LogLevel::Error,
            message: "Device removed".to_string(),
        };
        write_framed(&mut buffer, &report.clone().into_frame()).unwrap();

        let mut cursor = Cursor::new(buffer);
        let frame = read_framed(&mut cursor).unwrap();
        assert_eq!(HostReport::try_from(frame).unwrap(), report);

        // Stream is now exhausted
        let err = read_framed(&mut cursor).unwrap_err();
        assert!(err.is_eof());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_read_write() {
        let mut buffer = Vec::new();
        let frame = Frame::new(PacketType::Event, vec![0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);
        write_framed_async(&mut buffer, &frame).await.unwrap();

        let mut reader = buffer.as_slice();
        let decoded = read_framed_async(&mut reader).await.unwrap();
        assert_eq!(decoded, frame);
    }
}
