//! Bus facade behavior against a scripted driver backend.

mod helpers;

use std::time::Duration;

use canport::driver::{DriverTransport, FLAG_EXTENDED, OpenOptions, detect_channels};
use canport::{Bus, BusState, CanError, CanFrame};
use helpers::{MockProbe, mock_backend, mock_backend_with_event, raw};
use tokio::time::Instant;

fn open_bus() -> (Bus, MockProbe) {
    let (backend, probe) = mock_backend();
    let transport = DriverTransport::open(backend, 105, 250_000, OpenOptions::default()).unwrap();
    (Bus::new(transport), probe)
}

fn open_bus_with_event() -> (Bus, MockProbe) {
    let (backend, probe) = mock_backend_with_event();
    let transport = DriverTransport::open(backend, 105, 250_000, OpenOptions::default()).unwrap();
    (Bus::new(transport), probe)
}

#[tokio::test(start_paused = true)]
async fn recv_with_zero_timeout_returns_immediately() {
    let (bus, _probe) = open_bus();
    let start = Instant::now();
    let got = bus.recv(Some(Duration::ZERO)).await.unwrap();
    assert!(got.is_none());
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn recv_timeout_elapses_after_about_t() {
    let (bus, _probe) = open_bus();
    let start = Instant::now();
    let got = bus.recv(Some(Duration::from_secs(1))).await.unwrap();
    assert!(got.is_none());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
    assert!(
        elapsed < Duration::from_millis(1100),
        "overshot the deadline: {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn recv_preserves_arrival_order_and_rebases_timestamps() {
    let (bus, probe) = open_bus();
    probe.push_frame(raw(0x100, &[0x01], 5_000));
    probe.push_frame(raw(0x101, &[0x02], 7_500));

    let first = bus.recv(Some(Duration::ZERO)).await.unwrap().unwrap();
    let second = bus.recv(Some(Duration::ZERO)).await.unwrap().unwrap();
    assert_eq!(first.id(), 0x100);
    assert_eq!(first.timestamp(), Some(0.5));
    assert_eq!(second.id(), 0x101);
    assert_eq!(second.timestamp(), Some(0.75));
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn recv_wakes_on_driver_event() {
    let (bus, probe) = open_bus_with_event();
    let pusher = {
        let probe = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            probe.push_frame(raw(0x42, &[0xAA], 3_000));
        })
    };

    let start = Instant::now();
    let got = bus.recv(Some(Duration::from_secs(1))).await.unwrap().unwrap();
    assert_eq!(got.id(), 0x42);
    assert_eq!(got.timestamp(), Some(0.3));
    assert!(
        start.elapsed() < Duration::from_millis(350),
        "event wakeup took {:?}",
        start.elapsed()
    );
    pusher.await.unwrap();
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn receive_fault_trips_the_bus_to_error() {
    let (bus, probe) = open_bus();
    probe.set_rx_code(-42);

    match bus.recv(Some(Duration::ZERO)).await.unwrap_err() {
        CanError::Operation { code, .. } => assert_eq!(code, Some(-42)),
        other => panic!("expected an operation fault, got {other:?}"),
    }
    assert_eq!(bus.state(), BusState::Error);

    // Error is terminal: nothing is processed any more.
    assert!(bus.recv(Some(Duration::ZERO)).await.is_err());
    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert!(bus.send(&frame, None).await.is_err());
    assert!(bus.set_state(BusState::Active).is_err());
}

#[tokio::test(start_paused = true)]
async fn send_fault_trips_the_bus_to_error() {
    let (bus, probe) = open_bus();
    probe.set_send_code(-9);
    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert!(matches!(
        bus.send(&frame, None).await.unwrap_err(),
        CanError::Operation { .. }
    ));
    assert_eq!(bus.state(), BusState::Error);
}

#[tokio::test(start_paused = true)]
async fn send_timeout_is_not_a_bus_fault() {
    let (bus, probe) = open_bus();
    probe.set_send_code(canport::driver::codes::TX_TIMEOUT);
    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert_eq!(
        bus.send(&frame, Some(Duration::from_millis(10))).await.unwrap_err(),
        CanError::Timeout
    );
    assert_eq!(bus.state(), BusState::Active);
}

#[tokio::test(start_paused = true)]
async fn error_state_is_never_requestable() {
    let (bus, _probe) = open_bus();
    assert!(matches!(
        bus.set_state(BusState::Error).unwrap_err(),
        CanError::InvalidState { .. }
    ));
    assert_eq!(bus.state(), BusState::Active);
}

#[tokio::test(start_paused = true)]
async fn active_passive_round_trip_drives_the_mode_hook() {
    let (bus, probe) = open_bus();

    bus.set_state(BusState::Passive).unwrap();
    assert_eq!(bus.state(), BusState::Passive);
    assert_eq!(probe.listen_only_calls(), vec![true]);

    // Passive still receives, but transmit is refused.
    probe.push_frame(raw(0x55, &[0x01], 1_000));
    let got = bus.recv(Some(Duration::ZERO)).await.unwrap().unwrap();
    assert_eq!(got.id(), 0x55);
    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert!(bus.send(&frame, None).await.is_err());
    assert_eq!(probe.send_count(), 0);

    bus.set_state(BusState::Active).unwrap();
    assert_eq!(bus.state(), BusState::Active);
    assert_eq!(probe.listen_only_calls(), vec![true, false]);
    bus.send(&frame, None).await.unwrap();
    assert_eq!(probe.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn status_reflects_the_driver_snapshot() {
    let (bus, _probe) = open_bus();
    let snapshot = bus.status().await.unwrap();
    assert_eq!(snapshot.bitrate, 250_000);
    assert_eq!(snapshot.hardware_rev, 0x0102);
    assert_eq!(snapshot.firmware_rev, 0x0304);
}

#[tokio::test(start_paused = true)]
async fn enumeration_reports_channel_and_name() {
    let (mut backend, _probe) = mock_backend();
    let channels = detect_channels(&mut backend).unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].channel, 105);
    assert_eq!(channels[0].name, "CanFox CAN1");
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_a_barrier_and_idempotent() {
    let (bus, probe) = open_bus();
    bus.shutdown().await;
    assert_eq!(probe.closes(), 1);

    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert!(bus.send(&frame, None).await.is_err());
    assert!(bus.recv(Some(Duration::ZERO)).await.is_err());
    assert!(bus.status().await.is_err());
    assert!(
        bus.send_periodic(frame, Duration::from_millis(100))
            .is_err()
    );

    bus.shutdown().await;
    assert_eq!(probe.closes(), 1, "close must be idempotent");
}

#[tokio::test(start_paused = true)]
async fn channel_105_periodic_scenario() {
    let (bus, probe) = open_bus();
    assert_eq!(probe.opened(), Some((105, 250_000)));

    let frame = CanFrame::new_eff(
        0xC0FFEF,
        &[0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF],
    )
    .unwrap();
    let task = bus.send_periodic(frame, Duration::from_millis(200)).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    task.stop().await;

    let sent = probe.sends();
    assert!(
        (49..=51).contains(&sent.len()),
        "expected ~50 sends, observed {}",
        sent.len()
    );
    let first = &sent[0].msg;
    assert_eq!(first.id, 0xC0FFEF);
    assert_eq!(first.dlc, 8);
    assert_ne!(first.flags & FLAG_EXTENDED, 0);
    assert_eq!(first.data, [0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF]);
    assert!(task.take_error().is_none());

    // Nothing pending after stop.
    let frozen = probe.send_count();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(probe.send_count(), frozen);

    bus.shutdown().await;
    assert_eq!(probe.closes(), 1);
}
