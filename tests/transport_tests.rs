mod common;

use std::sync::atomic::Ordering;

use common::MockDevice;
use usbadb::protocol::{AdbError, Command, Packet};
use usbadb::transport::{Direction, Transport};

const LIMIT: usize = 1024 * 1024;

async fn claimed(device: MockDevice) -> Transport {
    Transport::claim(Box::new(device), LIMIT).await.expect("claim")
}

#[tokio::test]
async fn claim_clears_both_endpoints() {
    let device = MockDevice::new();
    let state = device.state();
    let _transport = claimed(device).await;

    assert!(state.opened.load(Ordering::SeqCst));
    let halts = state.cleared_halts.lock().clone();
    assert!(halts.contains(&(Direction::In, 1)));
    assert!(halts.contains(&(Direction::Out, 2)));
}

#[tokio::test]
async fn claim_fails_without_adb_interface() {
    let device = MockDevice::without_adb_interface();
    let state = device.state();
    let err = Transport::claim(Box::new(device), LIMIT).await.unwrap_err();
    assert!(matches!(err, AdbError::NoAdbInterface));
    // The device must not be left open.
    assert!(state.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn claim_reports_busy_interface() {
    let device = MockDevice::new();
    device.state().claim_busy.store(true, Ordering::SeqCst);
    let state = device.state();
    let err = Transport::claim(Box::new(device), LIMIT).await.unwrap_err();
    assert!(matches!(err, AdbError::Busy));
    assert!(state.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn zero_length_packet_after_full_sized_payload() {
    let device = MockDevice::with_out_packet_size(64);
    let state = device.state();
    let transport = claimed(device).await;

    transport
        .send_packet(&Packet::new(Command::Wrte, 1, 2, vec![0x42; 64]), LIMIT)
        .await
        .unwrap();

    let raw = state.raw_out();
    assert_eq!(raw.len(), 3, "header, payload, terminator");
    assert_eq!(raw[0].len(), 24);
    assert_eq!(raw[1].len(), 64);
    assert_eq!(raw[2].len(), 0);
}

#[tokio::test]
async fn no_terminator_for_partial_payload() {
    let device = MockDevice::with_out_packet_size(64);
    let state = device.state();
    let transport = claimed(device).await;

    transport
        .send_packet(&Packet::new(Command::Wrte, 1, 2, vec![0x42; 63]), LIMIT)
        .await
        .unwrap();

    let raw = state.raw_out();
    assert_eq!(raw.len(), 2, "header and payload only");
    assert_eq!(raw[0].len(), 24);
    assert_eq!(raw[1].len(), 63);
}

#[tokio::test]
async fn transient_send_failure_is_retried_once() {
    let device = MockDevice::new();
    let state = device.state();
    let transport = claimed(device).await;
    state.cleared_halts.lock().clear();

    state.fail_next_out.store(true, Ordering::SeqCst);
    transport
        .send_packet(&Packet::new(Command::Open, 1, 0, b"shell:id\0".to_vec()), LIMIT)
        .await
        .unwrap();

    // The retry cleared the OUT endpoint and resent the whole packet.
    assert!(state
        .cleared_halts
        .lock()
        .contains(&(Direction::Out, 2)));
    let sent = state.sent_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, Command::Open);
    assert_eq!(sent[0].payload, b"shell:id\0");
}

#[tokio::test]
async fn send_fails_disconnected_when_device_is_gone() {
    let device = MockDevice::new();
    let state = device.state();
    let transport = claimed(device).await;

    state.unplug();
    let err = transport
        .send_packet(&Packet::new(Command::Okay, 1, 2, Vec::new()), LIMIT)
        .await
        .unwrap_err();
    assert!(matches!(err, AdbError::Disconnected));
}

#[tokio::test]
async fn receiver_skips_short_reads_and_bad_magic() {
    let device = MockDevice::new();
    let state = device.state();
    let transport = claimed(device).await;

    // A truncated read and a corrupted header, then a real frame.
    state.push_chunk(vec![0xAA; 10]);
    state.push_chunk(vec![0x55; 24]);
    state.push_packet(&Packet::new(Command::Okay, 7, 1, Vec::new()));

    let packet = transport.recv_packet().await.unwrap();
    assert_eq!(packet.command, Command::Okay);
    assert_eq!(packet.arg0, 7);
    assert_eq!(packet.arg1, 1);
}

#[tokio::test]
async fn receiver_reassembles_header_and_payload() {
    let device = MockDevice::new();
    let state = device.state();
    let transport = claimed(device).await;

    state.push_packet(&Packet::new(Command::Wrte, 7, 1, b"hello".to_vec()));

    let packet = transport.recv_packet().await.unwrap();
    assert_eq!(packet.command, Command::Wrte);
    assert_eq!(packet.payload, b"hello");
}

#[tokio::test]
async fn receiver_reports_disconnect() {
    let device = MockDevice::new();
    let state = device.state();
    let transport = claimed(device).await;

    state.unplug();
    let err = transport.recv_packet().await.unwrap_err();
    assert!(matches!(err, AdbError::Disconnected));
}
