//! Session integration tests
//!
//! Drive full `BleDevice` sessions against the simulated host: connection
//! setup, queued operations, timeouts and guarded reconnect. Time is paused
//! so every deadline elapses instantly.
//!
//! Run with: cargo test --test integration_session

use blelink_core::gatt::descriptor::{properties, uuid_from_u16};
use blelink_core::gatt::registry::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT};
use blelink_core::sim::{SimCall, SimulatedHost};
use blelink_core::{
    decode_heart_rate, BleDevice, BleError, CharacteristicDescriptor, ConnectionState,
    DeviceAddress, DisconnectReason, HostCapability, LinkPriority, Priority, SessionConfig,
    SessionEvent, WriteMode, WriteRequest,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

type Events = Arc<Mutex<Vec<SessionEvent>>>;

fn spawn(host: &Arc<SimulatedHost>, config: SessionConfig) -> (BleDevice, Events) {
    let capability: Arc<dyn HostCapability> = host.clone();
    let device = BleDevice::spawn(config, capability, None);
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    device.register_observer(Arc::new(move |_: &DeviceAddress, event: &SessionEvent| {
        sink.lock().unwrap().push(event.clone())
    }));
    (device, events)
}

fn defaults() -> SessionConfig {
    SessionConfig::builder(ADDRESS).build().unwrap()
}

/// Wait until the queue is empty and nothing is in flight.
async fn settle(device: &BleDevice) {
    loop {
        let status = device.status().await.unwrap();
        if status.pending_operations == 0 && status.in_flight.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn ready(device: &BleDevice) {
    device.connect().unwrap();
    device.wait_for_state(ConnectionState::Ready).await.unwrap();
    settle(device).await;
}

fn states(events: &Events) -> Vec<ConnectionState> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn position(events: &Events, matches: impl Fn(&SessionEvent) -> bool) -> Option<usize> {
    events.lock().unwrap().iter().position(matches)
}

fn has(events: &Events, event: &SessionEvent) -> bool {
    events.lock().unwrap().contains(event)
}

fn control_point() -> CharacteristicDescriptor {
    CharacteristicDescriptor::from_properties(
        uuid_from_u16(0xfff0),
        uuid_from_u16(0xfff1),
        properties::WRITE | properties::WRITE_NO_RESPONSE,
    )
}

// ============================================================================
// CONNECTION SETUP
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_walks_every_state_to_ready() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());

    ready(&device).await;

    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::DiscoveringServices,
            ConnectionState::Ready,
        ]
    );
    let discovered =
        position(&events, |e| matches!(e, SessionEvent::ServicesDiscovered(_))).unwrap();
    let mtu = position(&events, |e| *e == SessionEvent::MtuChanged(517)).unwrap();
    let ready = position(&events, |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                state: ConnectionState::Ready,
                ..
            }
        )
    })
    .unwrap();
    assert!(discovered < mtu && mtu < ready);

    assert!(host
        .calls()
        .contains(&SimCall::ConnectionPriority(LinkPriority::High)));
    assert!(host.calls().contains(&SimCall::RequestMtu(517)));
    assert_eq!(device.current_mtu(), 517);
    assert_eq!(device.payload_size(), 514);
    assert_eq!(device.characteristics().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_ready_state_carries_peer_address() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    let peer = DeviceAddress::parse(ADDRESS).unwrap();
    assert!(has(
        &events,
        &SessionEvent::StateChanged {
            state: ConnectionState::Ready,
            peer: Some(peer),
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_auto_notify_subscribes_capable_characteristics() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    for characteristic in [HEART_RATE_MEASUREMENT, BATTERY_LEVEL] {
        assert!(has(
            &events,
            &SessionEvent::NotificationEnabled {
                characteristic,
                enabled: true,
                success: true,
            }
        ));
    }
    assert_eq!(
        host.count_calls(|c| matches!(c, SimCall::SetNotification { .. })),
        2
    );

    assert!(host.notify(HEART_RATE_MEASUREMENT, vec![0x00, 72]));
    settle(&device).await;
    let value = events
        .lock()
        .unwrap()
        .iter()
        .find_map(|e| match e {
            SessionEvent::Notification {
                characteristic,
                value,
            } if *characteristic == HEART_RATE_MEASUREMENT => Some(value.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(decode_heart_rate(&value).unwrap().bpm, 72);
}

#[tokio::test(start_paused = true)]
async fn test_auto_notify_disabled() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let config = SessionConfig::builder(ADDRESS)
        .auto_notify(false)
        .build()
        .unwrap();
    let (device, _events) = spawn(&host, config);
    ready(&device).await;

    assert_eq!(
        host.count_calls(|c| matches!(c, SimCall::SetNotification { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_mtu_negotiation_can_be_skipped() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let config = SessionConfig::builder(ADDRESS)
        .auto_negotiate_mtu(false)
        .build()
        .unwrap();
    let (device, _events) = spawn(&host, config);
    ready(&device).await;

    assert_eq!(host.count_calls(|c| matches!(c, SimCall::RequestMtu(_))), 0);
    assert_eq!(device.current_mtu(), 23);
    assert_eq!(device.payload_size(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_peer_mtu_limit_is_respected() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_max_mtu(185);
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    assert!(has(&events, &SessionEvent::MtuChanged(185)));
    assert_eq!(device.current_mtu(), 185);
    assert_eq!(device.payload_size(), 182);
}

#[tokio::test(start_paused = true)]
async fn test_radio_off_rejects_connect() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_radio_enabled(false);
    let (device, events) = spawn(&host, defaults());

    device.connect().unwrap();
    device.status().await.unwrap();

    assert!(has(&events, &SessionEvent::Error(BleError::CapabilityUnavailable)));
    assert!(states(&events).is_empty());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_connect_status(None);
    let config = SessionConfig::builder(ADDRESS)
        .connection_timeout_ms(2_000)
        .build()
        .unwrap();
    let (device, events) = spawn(&host, config);

    device.connect().unwrap();
    device
        .wait_for_state(ConnectionState::Connecting)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(device.connection_state(), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(1)).await;
    device.status().await.unwrap();
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(has(&events, &SessionEvent::Error(BleError::ConnectionTimeout)));
    assert!(has(
        &events,
        &SessionEvent::Disconnected {
            reason: DisconnectReason::Timeout,
            status: -1,
            connect_phase: true,
        }
    ));
    assert!(host.count_calls(|c| matches!(c, SimCall::Close(_))) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_tears_link_down() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_discovery_status(129);
    let (device, events) = spawn(&host, defaults());

    device.connect().unwrap();
    device
        .wait_for_state(ConnectionState::DiscoveringServices)
        .await
        .unwrap();
    device
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();

    assert!(has(&events, &SessionEvent::Error(BleError::DiscoveryFailed(129))));
    assert!(!states(&events).contains(&ConnectionState::Ready));
    assert!(device.characteristics().is_empty());
}

// ============================================================================
// OPERATIONS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_delivers_value_and_completion() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();

    assert!(result.await.unwrap());
    assert!(has(
        &events,
        &SessionEvent::ReadComplete {
            characteristic: BATTERY_LEVEL,
            value: Some(vec![87]),
            success: true,
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_or_unsupported_targets_rejected_synchronously() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, _events) = spawn(&host, defaults());
    ready(&device).await;

    let unknown = uuid_from_u16(0xbeef);
    assert_eq!(device.read(unknown), Err(BleError::NotFound(unknown)));
    assert!(matches!(
        device.write(HEART_RATE_MEASUREMENT, vec![1], None),
        Err(BleError::Unsupported { .. })
    ));
    assert!(matches!(
        device.enable_indication(BATTERY_LEVEL, true),
        Err(BleError::Unsupported { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_fails_without_retry() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    host.set_missing(BATTERY_LEVEL);
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();

    assert!(!result.await.unwrap());
    assert_eq!(host.count_calls(|c| *c == SimCall::Read(BATTERY_LEVEL)), 1);
    assert!(has(&events, &SessionEvent::Error(BleError::NotFound(BATTERY_LEVEL))));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    host.fail_next(2, 133);
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();

    assert!(result.await.unwrap());
    assert_eq!(host.count_calls(|c| *c == SimCall::Read(BATTERY_LEVEL)), 3);
    settle(&device).await;
    let reads: Vec<SessionEvent> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionEvent::ReadComplete { .. }))
        .cloned()
        .collect();
    assert_eq!(
        reads,
        vec![SessionEvent::ReadComplete {
            characteristic: BATTERY_LEVEL,
            value: Some(vec![87]),
            success: true,
        }]
    );
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(_))));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_failure() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    host.fail_next(4, 133);
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();

    assert!(!result.await.unwrap());
    assert_eq!(host.count_calls(|c| *c == SimCall::Read(BATTERY_LEVEL)), 4);
    settle(&device).await;
    assert!(has(&events, &SessionEvent::Error(BleError::OperationFailed(133))));

    // The queue keeps working afterwards.
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();
    assert!(result.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_operation_times_out() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let config = SessionConfig::builder(ADDRESS)
        .operation_timeout_ms(1_000)
        .build()
        .unwrap();
    let (device, events) = spawn(&host, config);
    ready(&device).await;

    host.set_respond(false);
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(
        device.status().await.unwrap().in_flight,
        Some("Read"),
        "still retrying"
    );

    assert!(!result.await.unwrap());
    assert_eq!(host.count_calls(|c| *c == SimCall::Read(BATTERY_LEVEL)), 4);
    settle(&device).await;
    assert!(has(&events, &SessionEvent::Error(BleError::OperationTimeout)));
    assert_eq!(device.connection_state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_priority_beats_submission_order() {
    let host = Arc::new(SimulatedHost::new(vec![
        control_point(),
        CharacteristicDescriptor::from_properties(
            uuid_from_u16(0x180f),
            BATTERY_LEVEL,
            properties::READ,
        ),
    ]));
    let (device, _events) = spawn(&host, defaults());
    ready(&device).await;
    let before = host.calls().len();

    let target = control_point().uuid;
    device
        .write_with(WriteRequest::new(target, vec![1]).with_priority(Priority::Low))
        .unwrap();
    device.read(BATTERY_LEVEL).unwrap();
    device
        .write_with(WriteRequest::new(target, vec![2]).with_priority(Priority::High))
        .unwrap();
    settle(&device).await;

    let calls: Vec<SimCall> = host.calls().split_off(before);
    let order: Vec<String> = calls
        .iter()
        .map(|c| match c {
            SimCall::Write { data, .. } => format!("write {}", data[0]),
            SimCall::Read(_) => "read".to_string(),
            other => format!("{:?}", other),
        })
        .collect();
    // The first request is already in flight when the others arrive.
    assert_eq!(order, vec!["write 1", "write 2", "read"]);
}

#[tokio::test(start_paused = true)]
async fn test_short_write_prefers_without_response() {
    let host = Arc::new(SimulatedHost::new(vec![control_point()]));
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    let target = control_point().uuid;
    device.write(target, vec![0x01, 0x02], None).unwrap();
    device
        .write(target, vec![0x03], Some(WriteMode::WithResponse))
        .unwrap();
    settle(&device).await;

    assert_eq!(
        host.writes(),
        vec![
            (target, vec![0x01, 0x02], WriteMode::WithoutResponse),
            (target, vec![0x03], WriteMode::WithResponse),
        ]
    );
    assert!(has(
        &events,
        &SessionEvent::WriteComplete {
            characteristic: target,
            success: true,
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_long_write_is_chunked_in_order() {
    let host = Arc::new(SimulatedHost::new(vec![control_point()]));
    let config = SessionConfig::builder(ADDRESS)
        .auto_negotiate_mtu(false)
        .build()
        .unwrap();
    let (device, _events) = spawn(&host, config);
    ready(&device).await;

    let target = control_point().uuid;
    let data: Vec<u8> = (0..45).collect();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let (done, result) = oneshot::channel();
    device
        .write_with(
            WriteRequest::new(target, data.clone())
                .on_progress(move |sent, total| seen.lock().unwrap().push((sent, total)))
                .on_complete(move |ok| {
                    let _ = done.send(ok);
                }),
        )
        .unwrap();

    assert!(result.await.unwrap());
    let writes = host.writes();
    let sizes: Vec<usize> = writes.iter().map(|(_, chunk, _)| chunk.len()).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
    assert!(writes
        .iter()
        .all(|(_, _, mode)| *mode == WriteMode::WithResponse));
    let joined: Vec<u8> = writes.into_iter().flat_map(|(_, chunk, _)| chunk).collect();
    assert_eq!(joined, data);
    assert_eq!(*progress.lock().unwrap(), vec![(20, 45), (40, 45), (45, 45)]);
}

#[tokio::test(start_paused = true)]
async fn test_payload_size_controls_chunking() {
    let host = Arc::new(SimulatedHost::new(vec![control_point()]));
    let (device, _events) = spawn(&host, defaults());
    ready(&device).await;

    assert_eq!(device.set_payload_size(100), Ok(100));
    device.write(control_point().uuid, vec![7u8; 250], None).unwrap();
    settle(&device).await;

    let sizes: Vec<usize> = host.writes().iter().map(|(_, c, _)| c.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_chunk_aborts_transfer() {
    let host = Arc::new(SimulatedHost::new(vec![control_point()]));
    let config = SessionConfig::builder(ADDRESS)
        .auto_negotiate_mtu(false)
        .build()
        .unwrap();
    let (device, events) = spawn(&host, config);
    ready(&device).await;

    host.fail_next(1, 0x0d);
    let (done, result) = oneshot::channel();
    device
        .write_with(WriteRequest::new(control_point().uuid, vec![0u8; 45]).on_complete(
            move |ok| {
                let _ = done.send(ok);
            },
        ))
        .unwrap();

    assert!(!result.await.unwrap());
    assert_eq!(host.writes().len(), 1);
    settle(&device).await;
    assert!(has(&events, &SessionEvent::Error(BleError::OperationFailed(0x0d))));
}

#[tokio::test(start_paused = true)]
async fn test_request_mtu_after_ready() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let config = SessionConfig::builder(ADDRESS)
        .auto_negotiate_mtu(false)
        .build()
        .unwrap();
    let (device, events) = spawn(&host, config);
    ready(&device).await;

    device.request_mtu(247).unwrap();
    settle(&device).await;
    assert!(has(&events, &SessionEvent::MtuChanged(247)));
    assert_eq!(device.current_mtu(), 247);
    assert_eq!(device.payload_size(), 244);
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_user_disconnect() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    device.disconnect().unwrap();
    device
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();

    assert!(states(&events).contains(&ConnectionState::Disconnecting));
    assert!(has(
        &events,
        &SessionEvent::Disconnected {
            reason: DisconnectReason::UserRequest,
            status: 0,
            connect_phase: false,
        }
    ));
    assert_eq!(device.current_mtu(), 23);
    assert_eq!(
        device.read(BATTERY_LEVEL),
        Err(BleError::NotReady(ConnectionState::Disconnected))
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_host_answer_uses_grace_period() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, _events) = spawn(&host, defaults());
    ready(&device).await;

    host.set_respond(false);
    device.disconnect().unwrap();
    device
        .wait_for_state(ConnectionState::Disconnecting)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.connection_state(), ConnectionState::Disconnecting);

    tokio::time::sleep(Duration::from_secs(2)).await;
    device.status().await.unwrap();
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_is_reported() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    assert!(host.drop_link(8));
    device
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(has(
        &events,
        &SessionEvent::Disconnected {
            reason: DisconnectReason::LinkError,
            status: 8,
            connect_phase: false,
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_work() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, events) = spawn(&host, defaults());
    ready(&device).await;

    host.set_respond(false);
    let (done, result) = oneshot::channel();
    device
        .read_with(BATTERY_LEVEL, move |ok| {
            let _ = done.send(ok);
        })
        .unwrap();
    device.status().await.unwrap();

    device.close().await;
    assert!(!result.await.unwrap());
    assert!(device.is_closed());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(_))));
}

// ============================================================================
// GUARDED RECONNECT
// ============================================================================

fn guarded() -> blelink_core::SessionConfigBuilder {
    SessionConfig::builder(ADDRESS)
        .guarded_reconnect(true)
        .reconnect_interval_ms(1_000)
}

#[tokio::test(start_paused = true)]
async fn test_guard_reconnects_after_link_loss() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, _events) = spawn(&host, guarded().build().unwrap());
    ready(&device).await;

    host.drop_link(8);
    device
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(host.connect_count(), 1);

    device.wait_for_state(ConnectionState::Ready).await.unwrap();
    assert_eq!(host.connect_count(), 2);
    let guard = device.status().await.unwrap().guard.unwrap();
    assert_eq!(guard.reconnect_attempts, 0);
    assert!(!guard.reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_transient_connect_failure_gets_quick_retry() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_connect_status(Some(133));
    let (device, events) = spawn(&host, guarded().build().unwrap());

    device.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.connect_count(), 1);
    assert!(has(
        &events,
        &SessionEvent::Disconnected {
            reason: DisconnectReason::ConnectFailed,
            status: 133,
            connect_phase: true,
        }
    ));

    host.set_connect_status(Some(0));
    device.wait_for_state(ConnectionState::Ready).await.unwrap();
    assert_eq!(host.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_quick_retries_are_bounded() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    host.set_connect_status(Some(133));
    let config = guarded().max_reconnect_attempts(0).build().unwrap();
    let (device, _events) = spawn(&host, config);

    device.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    // One attempt plus two quick retries, then the exhausted budget stops it.
    assert_eq!(host.connect_count(), 3);
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_are_capped() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let config = guarded().max_reconnect_attempts(2).build().unwrap();
    let (device, _events) = spawn(&host, config);
    ready(&device).await;

    host.set_connect_status(Some(257));
    host.drop_link(8);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(host.connect_count(), 3);
    let guard = device.status().await.unwrap().guard.unwrap();
    assert!(guard.guarding);
    assert!(!guard.reconnecting);
    assert_eq!(guard.reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_is_not_reconnected() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, _events) = spawn(&host, guarded().build().unwrap());
    ready(&device).await;

    device.disconnect().unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(host.connect_count(), 1);
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_guard_toggled_at_runtime() {
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let (device, _events) = spawn(&host, defaults());
    ready(&device).await;
    assert!(device.status().await.unwrap().guard.is_none());

    device.set_guard_enabled(true).unwrap();
    host.drop_link(8);
    tokio::time::sleep(Duration::from_millis(100)).await;
    device.set_guard_enabled(false).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(host.connect_count(), 1);
    let guard = device.status().await.unwrap().guard.unwrap();
    assert!(!guard.guarding);
}
