//! Transport Session Integration Tests
//!
//! Drives an open session over the mock backend.
//!
//! # Test Scenarios
//! - Outbound size limits, exhaustion and submit failures
//! - HCI command setup packet layout
//! - Inbound delivery order and resubmission
//! - Stall recovery on both directions
//! - Device removal
//!
//! Run with: `cargo test -p transport --test session_tests`

use std::time::Duration;
use transport::test_utils::{Call, MockBackend, Target, bt_device};
use transport::{
    Acceptance, BackendError, EndpointRole, InboundKind, PacketSink, SendError, SessionConfig,
    TransferStatus, TransportError, TransportSession,
};

#[derive(Default)]
struct Collect(Vec<(InboundKind, Vec<u8>)>);

impl PacketSink for Collect {
    fn deliver(&mut self, kind: InboundKind, data: &[u8]) {
        self.0.push((kind, data.to_vec()));
    }
}

fn open_session() -> TransportSession<MockBackend> {
    let backend = MockBackend::with_devices(vec![bt_device(1, 4, 0x0a12, 0x0001)]);
    let mut session = TransportSession::open(backend, SessionConfig::default(), &Acceptance::First)
        .expect("Failed to open session");
    session.backend_mut().clear_calls();
    session
}

fn submits_on(session: &TransportSession<MockBackend>, role: EndpointRole) -> usize {
    session
        .backend()
        .count(|c| matches!(c, Call::Submit(r) if r.slot.role == role))
}

fn step(session: &mut TransportSession<MockBackend>) -> (Result<usize, TransportError>, Collect) {
    let mut sink = Collect::default();
    let result = session.dispatch(Duration::ZERO, &mut sink);
    (result, sink)
}

// ============================================================================
// Outbound Tests
// ============================================================================

#[test]
fn test_command_size_limit() {
    let mut session = open_session();
    let max = session.max_command_size();
    assert_eq!(max, 256);

    assert_eq!(
        session.send_command(&vec![0u8; max + 1]),
        Err(SendError::TooLarge {
            size: max + 1,
            max
        })
    );
    assert_eq!(submits_on(&session, EndpointRole::Control), 0);
    assert_eq!(session.pools().unwrap().command.free_count(), 4);

    // Exactly filling the control buffer is fine
    assert_eq!(session.send_command(&vec![0u8; max]), Ok(()));
    let submitted = session.backend().submissions();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].length, max + 8);
}

#[test]
fn test_acl_size_limit() {
    let mut session = open_session();
    assert!(matches!(
        session.send_acl(&[0u8; 257]),
        Err(SendError::TooLarge { size: 257, max: 256 })
    ));
    let max = session.max_acl_size();
    assert_eq!(max, 256);
    assert_eq!(session.send_acl(&vec![0u8; max]), Ok(()));
    assert_eq!(session.backend().submissions()[0].length, max);
}

#[test]
fn test_command_setup_packet() {
    let mut session = open_session();
    session.send_command(&[0x03, 0x0c, 0x00]).unwrap();

    let request = session.backend().submissions()[0];
    assert_eq!(request.endpoint, 0x00);
    assert_eq!(request.length, 11);

    let bytes = session.transfer_buffer(request.slot).unwrap();
    assert_eq!(
        bytes,
        &[0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x03, 0x0c, 0x00]
    );
    // wLength matches the payload
    assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 3);
}

#[test]
fn test_acl_is_sent_verbatim() {
    let mut session = open_session();
    let packet = [0x40, 0x20, 0x03, 0x00, 0xAA, 0xBB, 0xCC];
    session.send_acl(&packet).unwrap();
    step(&mut session).0.unwrap();

    assert_eq!(
        session.backend().sent(),
        &[(EndpointRole::BulkOut, packet.to_vec())]
    );
}

#[test]
fn test_exhausted_pool_is_busy() {
    let mut session = open_session();
    for _ in 0..4 {
        session.send_command(&[0x01, 0x10, 0x00]).unwrap();
    }
    assert_eq!(session.send_command(&[0x01, 0x10, 0x00]), Err(SendError::Busy));
    assert_eq!(submits_on(&session, EndpointRole::Control), 4);

    // One completion frees one slot
    session.backend_mut().complete_ok(EndpointRole::Control, &[]);
    assert_eq!(step(&mut session).0, Ok(1));
    assert_eq!(session.pools().unwrap().command.free_count(), 1);
    assert_eq!(session.send_command(&[0x01, 0x10, 0x00]), Ok(()));
}

#[test]
fn test_refused_submit_returns_slot() {
    let mut session = open_session();
    session.backend_mut().fail_submits(1, BackendError::Io);

    assert_eq!(session.send_acl(&[1, 2, 3]), Err(SendError::Busy));
    assert_eq!(session.pools().unwrap().acl_out.free_count(), 4);
    assert!(session.is_running());

    assert_eq!(session.send_acl(&[1, 2, 3]), Ok(()));
    assert_eq!(session.pools().unwrap().acl_out.in_flight_count(), 1);
}

#[test]
fn test_outbound_completion_recycles_slot() {
    let mut session = open_session();
    session.send_acl(&[1, 2, 3]).unwrap();
    session.send_command(&[0x03, 0x0c, 0x00]).unwrap();

    session.backend_mut().complete_ok(EndpointRole::BulkOut, &[]);
    session.backend_mut().complete_ok(EndpointRole::Control, &[]);
    let (result, sink) = step(&mut session);

    assert_eq!(result, Ok(2));
    assert!(sink.0.is_empty());
    let pools = session.pools().unwrap();
    assert_eq!(pools.acl_out.free_count(), 4);
    assert_eq!(pools.command.free_count(), 4);
}

#[test]
fn test_outbound_unexpected_status_drops() {
    let mut session = open_session();
    session.send_acl(&[1, 2, 3]).unwrap();
    session.backend_mut().clear_calls();

    session
        .backend_mut()
        .complete(Target::Oldest(EndpointRole::BulkOut), TransferStatus::TimedOut, &[]);
    assert_eq!(step(&mut session).0, Ok(1));

    assert_eq!(submits_on(&session, EndpointRole::BulkOut), 0);
    assert_eq!(session.pools().unwrap().acl_out.free_count(), 4);
}

// ============================================================================
// Inbound Tests
// ============================================================================

#[test]
fn test_inbound_primed_at_open() {
    let session = open_session();
    let pools = session.pools().unwrap();
    assert_eq!(pools.event.in_flight_count(), 4);
    assert_eq!(pools.acl_in.in_flight_count(), 4);
    assert_eq!(pools.command.in_flight_count(), 0);
    assert_eq!(pools.acl_out.in_flight_count(), 0);
    assert_eq!(session.backend().in_flight_count(), 8);
}

#[test]
fn test_delivery_in_completion_order() {
    let mut session = open_session();
    let backend = session.backend_mut();
    backend.complete_ok(EndpointRole::InterruptIn, &[0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);
    backend.complete_ok(EndpointRole::BulkIn, &[0x01, 0x20, 0x02, 0x00, 0xAA, 0xBB]);
    backend.complete_ok(EndpointRole::InterruptIn, &[0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00]);
    backend.complete_ok(EndpointRole::BulkIn, &[0x01, 0x20, 0x00, 0x00]);

    let (result, sink) = step(&mut session);
    assert_eq!(result, Ok(4));
    assert_eq!(
        sink.0,
        vec![
            (
                InboundKind::Event,
                vec![0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]
            ),
            (
                InboundKind::AclData,
                vec![0x01, 0x20, 0x02, 0x00, 0xAA, 0xBB]
            ),
            (
                InboundKind::Event,
                vec![0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00]
            ),
            (InboundKind::AclData, vec![0x01, 0x20, 0x00, 0x00]),
        ]
    );
}

#[test]
fn test_inbound_resubmitted_after_delivery() {
    let mut session = open_session();
    for _ in 0..6 {
        session.backend_mut().complete_ok(EndpointRole::InterruptIn, &[0x0e]);
    }
    let (result, sink) = step(&mut session);
    assert_eq!(result, Ok(4));
    assert_eq!(sink.0.len(), 4);

    // Every slot went straight back in flight, so the rest complete too
    let (result, sink) = step(&mut session);
    assert_eq!(result, Ok(2));
    assert_eq!(sink.0.len(), 2);

    assert_eq!(submits_on(&session, EndpointRole::InterruptIn), 6);
    assert_eq!(session.pools().unwrap().event.in_flight_count(), 4);
    assert_eq!(session.backend().double_submits, 0);
}

#[test]
fn test_inbound_unexpected_status_resubmits() {
    let mut session = open_session();
    session
        .backend_mut()
        .complete(Target::Oldest(EndpointRole::BulkIn), TransferStatus::Overflow, &[]);

    let (result, sink) = step(&mut session);
    assert_eq!(result, Ok(1));
    assert!(sink.0.is_empty());
    assert_eq!(submits_on(&session, EndpointRole::BulkIn), 1);
    assert_eq!(session.pools().unwrap().acl_in.in_flight_count(), 4);
}

#[test]
fn test_failed_inbound_resubmit_is_fatal() {
    let mut session = open_session();
    session.backend_mut().complete_ok(EndpointRole::InterruptIn, &[0x0e]);
    session.backend_mut().complete_ok(EndpointRole::BulkIn, &[0x01]);
    session.backend_mut().fail_submits(1, BackendError::Io);

    let (result, sink) = step(&mut session);
    assert_eq!(result, Err(TransportError::ResubmitFailed(BackendError::Io)));
    // The event was delivered before its slot could not go back out
    assert_eq!(sink.0.len(), 1);
    assert!(session.is_lost());
    assert!(!session.is_running());

    // The queued ACL completion is parked, not delivered or resubmitted
    let pools = session.pools().unwrap();
    assert_eq!(pools.event.in_flight_count(), 3);
    assert_eq!(pools.acl_in.in_flight_count(), 3);
    assert_eq!(session.send_acl(&[1]), Err(SendError::Closed));

    let report = session.teardown();
    assert_eq!(report.leaked, 0);
}

#[test]
fn test_inbound_never_starves_silently() {
    let mut session = open_session();
    let mut failures = 0;
    for _ in 0..4 {
        session.backend_mut().complete_ok(EndpointRole::InterruptIn, &[0x0e]);
        session.backend_mut().fail_submits(1, BackendError::Busy);
        if step(&mut session).0.is_err() {
            failures += 1;
        }
        if !session.is_running() {
            break;
        }
    }

    // Either every slot is still in flight or the session says it is done
    assert_eq!(failures, 1);
    assert!(!session.is_running());
    for _ in 0..10 {
        assert!(step(&mut session).0.is_err());
    }
}

#[test]
fn test_failed_resubmit_after_missing_device_is_lost() {
    let mut session = open_session();
    session.backend_mut().complete_ok(EndpointRole::BulkIn, &[0x01]);
    session.backend_mut().fail_submits(1, BackendError::NoDevice);

    assert_eq!(step(&mut session).0, Err(TransportError::DeviceLost));
    assert!(session.is_lost());
}

// ============================================================================
// Stall Tests
// ============================================================================

#[test]
fn test_inbound_stall_clears_halt_once() {
    let mut session = open_session();
    session
        .backend_mut()
        .complete(Target::Oldest(EndpointRole::InterruptIn), TransferStatus::Stall, &[]);

    let (result, sink) = step(&mut session);
    assert_eq!(result, Ok(1));
    assert!(sink.0.is_empty());

    let backend = session.backend();
    assert_eq!(backend.count(|c| *c == Call::ClearHalt(0x81)), 1);
    assert_eq!(backend.count(|c| matches!(c, Call::ClearHalt(_))), 1);
    assert_eq!(submits_on(&session, EndpointRole::InterruptIn), 1);
    assert_eq!(session.pools().unwrap().event.in_flight_count(), 4);
}

#[test]
fn test_outbound_stall_retries_same_transfer() {
    let mut session = open_session();
    session.send_command(&[0x03, 0x0c, 0x00]).unwrap();
    let first = session.backend().submissions()[0];
    session.backend_mut().clear_calls();

    session
        .backend_mut()
        .complete(Target::Slot(first.slot), TransferStatus::Stall, &[]);
    assert_eq!(step(&mut session).0, Ok(1));

    let backend = session.backend();
    assert_eq!(backend.count(|c| *c == Call::ClearHalt(0x00)), 1);
    assert_eq!(backend.submissions(), vec![first]);
    assert_eq!(session.pools().unwrap().command.in_flight_count(), 1);

    // The retried transfer carries the same bytes
    let sent = session.backend().sent();
    assert_eq!(sent.len(), 1);
    step(&mut session).0.unwrap();
    let sent = session.backend().sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);

    session.backend_mut().complete_ok(EndpointRole::Control, &[]);
    step(&mut session).0.unwrap();
    assert_eq!(session.pools().unwrap().command.free_count(), 4);
}

// ============================================================================
// Device Removal Tests
// ============================================================================

#[test]
fn test_device_removed_on_inbound_is_fatal() {
    let mut session = open_session();
    let backend = session.backend_mut();
    backend.complete(Target::Oldest(EndpointRole::BulkIn), TransferStatus::NoDevice, &[]);
    backend.complete_ok(EndpointRole::InterruptIn, &[0x0e]);

    let (result, sink) = step(&mut session);
    assert_eq!(result, Err(TransportError::DeviceLost));
    assert!(sink.0.is_empty());
    assert_eq!(session.backend().submissions().len(), 0);
    assert!(session.is_lost());
    assert!(!session.is_running());

    assert_eq!(session.send_command(&[0x03, 0x0c, 0x00]), Err(SendError::Closed));
    assert_eq!(session.send_acl(&[1]), Err(SendError::Closed));
    assert_eq!(step(&mut session).0, Err(TransportError::DeviceLost));
    assert_eq!(session.backend().submissions().len(), 0);
}

#[test]
fn test_device_removed_on_outbound_is_fatal() {
    let mut session = open_session();
    session.send_acl(&[1, 2, 3]).unwrap();
    session.backend_mut().clear_calls();
    session
        .backend_mut()
        .complete(Target::Oldest(EndpointRole::BulkOut), TransferStatus::NoDevice, &[]);

    assert_eq!(step(&mut session).0, Err(TransportError::DeviceLost));
    assert_eq!(session.backend().submissions().len(), 0);
}

#[test]
fn test_device_removed_during_send() {
    let mut session = open_session();
    session.backend_mut().fail_submits(1, BackendError::NoDevice);

    assert_eq!(session.send_acl(&[1, 2, 3]), Err(SendError::Busy));
    assert_eq!(step(&mut session).0, Err(TransportError::DeviceLost));
}

#[test]
fn test_event_pump_failure_surfaces() {
    let mut session = open_session();
    session.backend_mut().fail_handle_events = Some(BackendError::Io);
    assert_eq!(
        step(&mut session).0,
        Err(TransportError::Backend(BackendError::Io))
    );

    session.backend_mut().fail_handle_events = Some(BackendError::NoDevice);
    assert_eq!(step(&mut session).0, Err(TransportError::DeviceLost));
}

#[test]
fn test_closed_session_rejects_work() {
    let mut session = open_session();
    session.teardown();
    assert_eq!(session.send_command(&[0x03, 0x0c, 0x00]), Err(SendError::Closed));
    assert_eq!(step(&mut session).0, Err(TransportError::NotRunning));
}
