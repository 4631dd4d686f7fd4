//! Integration tests for host link framing
//!
//! Exercises the byte layout seen by the controlling process and the
//! direction rules for packet types.
//!
//! Run with: `cargo test -p protocol --test framing_tests`

use bytes::Bytes;
use protocol::{
    Frame, HostReport, HostRequest, LogLevel, PacketType, ProtocolError, decode_framed,
    encode_framed, read_framed, write_framed,
};
use std::io::Cursor;

mod layout {
    use super::*;

    #[test]
    fn test_event_report_bytes() {
        let report = HostReport::Event(Bytes::from_static(&[0x0e, 0x01, 0x00]));
        let bytes = encode_framed(&report.into_frame()).unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0x04, 0x0e, 0x01, 0x00]);
    }

    #[test]
    fn test_log_report_bytes() {
        let report = HostReport::Log {
            level: LogLevel::Debug,
            message: "hi".to_string(),
        };
        let bytes = encode_framed(&report.into_frame()).unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0xFC, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_empty_payload_is_three_bytes() {
        let bytes = encode_framed(&Frame::new(PacketType::AclData, Bytes::new())).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0x02]);
    }
}

mod direction {
    use super::*;

    #[test]
    fn test_requests_accept_command_and_acl() {
        for (ty, expected) in [
            (
                0x01u8,
                HostRequest::Command(Bytes::from_static(&[0x03, 0x0c, 0x00])),
            ),
            (
                0x02u8,
                HostRequest::AclData(Bytes::from_static(&[0x03, 0x0c, 0x00])),
            ),
        ] {
            let bytes = [0x00, 0x04, ty, 0x03, 0x0c, 0x00];
            let (frame, _) = decode_framed(&bytes).unwrap();
            assert_eq!(HostRequest::try_from(frame).unwrap(), expected);
        }
    }

    #[test]
    fn test_requests_reject_everything_else() {
        for ty in [0x03u8, 0x04, 0xFC] {
            let bytes = [0x00, 0x02, ty, 0x00];
            let (frame, _) = decode_framed(&bytes).unwrap();
            assert!(matches!(
                HostRequest::try_from(frame),
                Err(ProtocolError::UnexpectedPacketType(t)) if t == ty
            ));
        }

        let bytes = [0x00, 0x02, 0x99, 0x00];
        assert!(matches!(
            decode_framed(&bytes),
            Err(ProtocolError::UnknownPacketType(0x99))
        ));
    }
}

mod streams {
    use super::*;

    #[test]
    fn test_several_frames_on_one_stream() {
        let mut buffer = Vec::new();
        let requests = vec![
            HostRequest::Command(Bytes::from_static(&[0x03, 0x0c, 0x00])),
            HostRequest::AclData(Bytes::from(vec![0x40, 0x00, 0x02, 0x00, 0xAA, 0xBB])),
            HostRequest::Command(Bytes::from_static(&[0x01, 0x10, 0x00])),
        ];
        for request in &requests {
            write_framed(&mut buffer, &request.clone().into_frame()).unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in requests {
            let frame = read_framed(&mut cursor).unwrap();
            assert_eq!(HostRequest::try_from(frame).unwrap(), expected);
        }
        assert!(read_framed(&mut cursor).unwrap_err().is_eof());
    }

    #[test]
    fn test_truncated_stream_is_eof() {
        let mut cursor = Cursor::new(vec![0x00, 0x08, 0x01, 0x03]);
        let err = read_framed(&mut cursor).unwrap_err();
        assert!(err.is_eof());
    }
}
