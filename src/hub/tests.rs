use super::*;
use crate::clock::{ManualClock, TokioClock};
use crate::error::ActuatorError;
use crate::store::MemoryStateStore;
use std::time::Duration;
use tokio::sync::broadcast;

fn settings() -> HubSettings {
    HubSettings {
        offline_threshold: Duration::from_secs(7),
        actuator_timeout: Duration::from_secs(15),
        status_interval: Duration::from_secs(2),
    }
}

fn simulated_hub(latency: Duration) -> (Arc<CameraHub>, Arc<SimulatedActuator>, MemoryStateStore) {
    let clock: SharedClock = Arc::new(TokioClock::starting_at(1_700_000_000_000));
    let store = MemoryStateStore::new(Arc::clone(&clock));
    let shared: SharedStore = Arc::new(store.clone());
    let actuator = Arc::new(
        SimulatedActuator::new(Arc::clone(&shared), Arc::clone(&clock), Duration::from_secs(2))
            .with_capture_latency(latency),
    );
    let hub = CameraHub::new(shared, actuator.clone(), clock, settings());
    (hub, actuator, store)
}

async fn next_capture_event(events: &mut broadcast::Receiver<CameraEvent>) -> CameraEvent {
    loop {
        let event = events.recv().await.unwrap();
        if matches!(
            event,
            CameraEvent::CaptureComplete { .. }
                | CameraEvent::CaptureTimeout { .. }
                | CameraEvent::CaptureFailed { .. }
        ) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_capture_is_busy_while_first_in_flight() {
    let (hub, actuator, _store) = simulated_hub(Duration::from_secs(2));
    let mut events = hub.events().subscribe();

    let first = match hub.execute(Command::Capture).await {
        Reply::CaptureStarted(ticket) => ticket,
        other => panic!("Expected capture to start, got {:?}", other),
    };
    assert!(hub.is_capturing());

    let second = hub.execute(Command::Capture).await;
    assert!(second.is_busy());

    match next_capture_event(&mut events).await {
        CameraEvent::CaptureComplete {
            id, duration_ms, ..
        } => {
            assert_eq!(id, first.id);
            assert!(duration_ms >= 2_000);
        }
        other => panic!("Unexpected event {:?}", other),
    }

    assert!(!hub.is_capturing());
    assert_eq!(actuator.capture_count(), 1);
    assert!(hub.result_since(first.requested_at).await.is_some());

    // Lock released: the next capture is accepted
    assert!(matches!(
        hub.execute(Command::Capture).await,
        Reply::CaptureStarted(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_live_start_refused_during_capture() {
    let (hub, _actuator, store) = simulated_hub(Duration::from_secs(2));

    assert!(matches!(hub.start_capture(), Reply::CaptureStarted(_)));
    let reply = hub
        .execute(Command::LiveControl {
            action: LiveAction::Start,
        })
        .await;
    assert!(reply.is_busy());
    assert!(!store.load_or(LiveEnabled(false)).await.0);

    // Stopping is always allowed
    let reply = hub
        .execute(Command::LiveControl {
            action: LiveAction::Stop,
        })
        .await;
    assert_eq!(reply, Reply::Accepted);
}

#[tokio::test(start_paused = true)]
async fn test_actuator_timeout_releases_lock() {
    let (hub, _actuator, _store) = simulated_hub(Duration::from_secs(60));
    let mut events = hub.events().subscribe();

    let ticket = match hub.start_capture() {
        Reply::CaptureStarted(ticket) => ticket,
        other => panic!("Expected capture to start, got {:?}", other),
    };

    assert_eq!(
        next_capture_event(&mut events).await,
        CameraEvent::CaptureTimeout { id: ticket.id }
    );
    assert!(!hub.is_capturing());
    assert!(hub.result_since(ticket.requested_at).await.is_none());
}

#[tokio::test]
async fn test_result_since_filters_older_results() {
    let (hub, _actuator, store) = simulated_hub(Duration::ZERO);
    let record = CaptureResultRecord::stored(5_000, 1_200, "captures/cap-1.jpg");
    store.save(&record).await.unwrap();

    assert_eq!(hub.result_since(4_999).await, Some(record));
    assert!(hub.result_since(5_000).await.is_none());
}

#[tokio::test]
async fn test_slot_writes_are_validated() {
    let (hub, _actuator, store) = simulated_hub(Duration::ZERO);

    let reply = hub.write_slot_value(Slot::CameraTelemetry, "1,2,3,4").await;
    assert!(matches!(
        reply,
        Reply::Rejected {
            reason: RejectReason::Invalid,
            ..
        }
    ));

    let reply = hub.write_slot_value(Slot::LiveQuality, "640 by 480").await;
    assert!(matches!(
        reply,
        Reply::Rejected {
            reason: RejectReason::Invalid,
            ..
        }
    ));

    assert_eq!(
        hub.write_slot_value(Slot::LiveQuality, "1280 720 75").await,
        Reply::Accepted
    );
    let quality = store.load::<StreamQuality>().await.unwrap().value;
    assert_eq!((quality.width, quality.height), (1280, 720));
}

#[tokio::test]
async fn test_store_failure_is_reported_unavailable() {
    let (hub, _actuator, store) = simulated_hub(Duration::ZERO);
    store.set_fail_writes(true);

    let reply = hub
        .execute(Command::LiveControl {
            action: LiveAction::Start,
        })
        .await;
    assert!(matches!(
        reply,
        Reply::Rejected {
            reason: RejectReason::Unavailable,
            ..
        }
    ));
}

#[tokio::test]
async fn test_status_tick_reports_liveness_transitions() {
    let clock = ManualClock::new(10_000);
    let store = MemoryStateStore::new(Arc::new(clock.clone()));
    let shared: SharedStore = Arc::new(store.clone());
    let actuator = Arc::new(SimulatedActuator::new(
        Arc::clone(&shared),
        Arc::new(clock.clone()),
        Duration::from_secs(2),
    ));
    let hub = CameraHub::new(shared, actuator.clone(), Arc::new(clock.clone()), settings());
    let mut events = hub.events().subscribe();

    actuator.emit().await;
    hub.tick().await;
    assert_eq!(events.recv().await.unwrap(), CameraEvent::CameraConnected);
    match events.recv().await.unwrap() {
        CameraEvent::Status { snapshot } => {
            assert!(snapshot.online);
            assert_eq!(snapshot.telemetry_written_at, Some(10_000));
        }
        other => panic!("Expected status, got {:?}", other),
    }

    clock.advance(Duration::from_millis(7_001));
    hub.tick().await;
    assert_eq!(events.recv().await.unwrap(), CameraEvent::CameraDisconnected);
    match events.recv().await.unwrap() {
        CameraEvent::Status { snapshot } => assert!(!snapshot.online),
        other => panic!("Expected status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_frames_announced_only_while_live() {
    let clock = ManualClock::new(10_000);
    let store = MemoryStateStore::new(Arc::new(clock.clone()));
    let shared: SharedStore = Arc::new(store.clone());
    let actuator = Arc::new(SimulatedActuator::new(
        Arc::clone(&shared),
        Arc::new(clock.clone()),
        Duration::from_secs(2),
    ));
    let hub = CameraHub::new(shared, actuator.clone(), Arc::new(clock.clone()), settings());

    actuator.emit().await;
    assert!(store.load::<FrameStamp>().await.is_none());

    store.save(&LiveEnabled(true)).await.unwrap();
    actuator.emit().await;
    let mut events = hub.events().subscribe();
    hub.tick().await;

    let mut frames = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CameraEvent::LiveFrameReady { frame_id } = event {
            frames.push(frame_id);
        }
    }
    assert_eq!(frames, vec![1]);
}

#[tokio::test]
async fn test_process_actuator_writes_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let actuator = ProcessActuator::new("touch", dir.path());
    let job = CaptureJob {
        id: "cap-7".to_string(),
        requested_at: 1_000,
    };

    let result = actuator.capture(&job).await.unwrap();
    assert!(result.ends_with("cap-7.jpg"));
    assert!(actuator.output_path(&job).exists());
}

#[tokio::test]
async fn test_process_actuator_reports_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let actuator = ProcessActuator::new("echo lens cap on >&2; false", dir.path());
    let job = CaptureJob {
        id: "cap-8".to_string(),
        requested_at: 1_000,
    };

    match actuator.capture(&job).await {
        Err(ActuatorError::CommandFailed { details }) => {
            assert!(details.contains("lens cap on"))
        }
        other => panic!("Expected command failure, got {:?}", other),
    }
}
