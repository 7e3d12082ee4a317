use super::*;
use crate::clock::{SharedClock, TokioClock};
use crate::error::CaptureError;
use crate::hub::{CameraHub, HubSettings, LocalBackend, SimulatedActuator};
use crate::liveness::{LivenessChange, OnlineStatus};
use crate::retry::RetrySchedule;
use crate::store::{LiveEnabled, MemoryStateStore, SessionStamp, SharedStore, StateStoreExt};
use crate::transport::{CaptureCompletion, ChannelMode, Reply};
use tokio::time::{timeout, Instant};

// Arbiter transitions

#[test]
fn test_capture_from_live_forces_live_off_first() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);
    arbiter.start_live();

    let effects = arbiter.request_capture(1_000, true).unwrap();
    assert_eq!(effects[0], Effect::SendLive(false));
    assert!(effects.contains(&Effect::EndSession));
    assert_eq!(effects.last(), Some(&Effect::IssueCapture));
    assert_eq!(arbiter.state().phase, Phase::Capturing);
    assert!(!arbiter.state().live_enabled);
    assert!(arbiter.state().was_live);
}

#[test]
fn test_second_capture_rejected_locally() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.request_capture(1_000, false).unwrap();
    assert_eq!(
        arbiter.request_capture(1_001, false),
        Err(CaptureError::AlreadyCapturing)
    );
}

#[test]
fn test_terminal_capture_restores_live_only_if_it_was_live() {
    let completion = CaptureCompletion {
        id: "cap-1".to_string(),
        result_ref: "captures/cap-1.jpg".to_string(),
        duration_ms: 2_000,
    };

    let mut idle = Arbiter::new(QualityPreset::Medium);
    idle.request_capture(1_000, false).unwrap();
    let effects = idle.capture_finished(Ok(completion.clone()), 3_000);
    assert!(!effects.contains(&Effect::ScheduleResume));
    assert_eq!(idle.state().phase, Phase::Idle);
    assert_eq!(
        idle.state().last_capture.as_ref().and_then(|c| c.completed_at),
        Some(3_000)
    );

    let mut live = Arbiter::new(QualityPreset::Medium);
    live.liveness_changed(LivenessChange::WentOnline);
    live.start_live();
    live.request_capture(1_000, true).unwrap();
    let effects = live.capture_finished(Err(CaptureError::Busy), 1_050);
    assert!(effects.contains(&Effect::ScheduleResume));
    assert!(effects.contains(&Effect::Notify(ClientNotice::CaptureRejected {
        error: CaptureError::Busy
    })));

    let effects = live.settle_elapsed();
    assert!(effects.contains(&Effect::SendLive(true)));
    assert!(effects.contains(&Effect::ApplyQuality { force: true }));
    assert_eq!(live.state().phase, Phase::LiveActive);
}

#[test]
fn test_idle_capture_restores_shared_live_flag() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);

    let effects = arbiter.request_capture(1_000, true).unwrap();
    assert_eq!(effects[0], Effect::SendLive(false));
    assert!(!arbiter.state().was_live);

    let failure = CaptureError::Failed {
        details: "lens cap on".to_string(),
    };
    let effects = arbiter.capture_finished(Err(failure), 2_000);
    assert!(effects.contains(&Effect::ScheduleResume));

    // Only the flag goes back on; this client stays idle
    assert_eq!(arbiter.settle_elapsed(), vec![Effect::SendLive(true)]);
    assert_eq!(arbiter.state().phase, Phase::Idle);
    assert!(!arbiter.state().live_enabled);
    assert!(arbiter.state().session_id.is_none());
}

#[test]
fn test_live_start_during_settle_waits_for_delay() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);
    arbiter.request_capture(1_000, true).unwrap();
    arbiter.capture_finished(Err(CaptureError::Busy), 1_050);
    assert!(arbiter.state().resume_pending);

    assert!(arbiter.start_live().is_empty());
    assert_eq!(arbiter.state().phase, Phase::Idle);
    assert!(arbiter.state().resume_pending);

    let effects = arbiter.settle_elapsed();
    assert!(effects.contains(&Effect::SendLive(true)));
    assert!(effects.contains(&Effect::StartSession));
    assert_eq!(arbiter.state().phase, Phase::LiveActive);
}

#[test]
fn test_stop_during_settle_keeps_other_viewers_flag() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);
    arbiter.request_capture(1_000, true).unwrap();
    arbiter.capture_finished(Err(CaptureError::Busy), 1_050);
    arbiter.start_live();

    assert_eq!(
        arbiter.stop_live(),
        vec![Effect::Notify(ClientNotice::LiveStopped)]
    );
    assert_eq!(arbiter.settle_elapsed(), vec![Effect::SendLive(true)]);
    assert_eq!(arbiter.state().phase, Phase::Idle);
}

#[test]
fn test_concede_does_not_touch_shared_live_flag() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);
    arbiter.start_live();
    arbiter.session_started("A1".to_string());

    let winner = SessionStamp {
        timestamp_ms: 5_000,
        session_id: "B1".to_string(),
    };
    let effects = arbiter.session_conceded(&winner);
    assert!(!effects.iter().any(|e| matches!(e, Effect::SendLive(_))));
    assert!(effects.contains(&Effect::DetachFrames));
    assert!(!arbiter.state().live_enabled);
    assert_eq!(arbiter.state().phase, Phase::Idle);
}

#[test]
fn test_offline_suspends_and_online_resumes() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOnline);
    arbiter.start_live();
    arbiter.session_started("A1".to_string());

    let effects = arbiter.liveness_changed(LivenessChange::WentOffline);
    assert!(effects.contains(&Effect::PauseHeartbeat));
    assert!(!effects.iter().any(|e| matches!(e, Effect::SendLive(_))));
    assert!(arbiter.state().suspended);
    assert!(arbiter.state().was_live);

    let effects = arbiter.liveness_changed(LivenessChange::WentOnline);
    assert!(effects.contains(&Effect::ResumeHeartbeat));
    assert!(effects.contains(&Effect::ApplyQuality { force: true }));
    assert!(arbiter.state().is_streaming());
}

#[test]
fn test_live_start_while_offline_waits_without_writes() {
    let mut arbiter = Arbiter::new(QualityPreset::Medium);
    arbiter.liveness_changed(LivenessChange::WentOffline);

    let effects = arbiter.start_live();
    assert_eq!(
        effects,
        vec![Effect::Notify(ClientNotice::LiveSuspended)]
    );
    assert_eq!(arbiter.state().online, OnlineStatus::Offline);
    assert!(arbiter.state().suspended);
}

// Client core against an in-process hub

struct Rig {
    hub: Arc<CameraHub>,
    store: MemoryStateStore,
    actuator: Arc<SimulatedActuator>,
    clock: SharedClock,
}

fn rig(capture_latency: Duration) -> Rig {
    let clock: SharedClock = Arc::new(TokioClock::starting_at(1_700_000_000_000));
    let store = MemoryStateStore::new(Arc::clone(&clock));
    let shared: SharedStore = Arc::new(store.clone());
    let actuator = Arc::new(
        SimulatedActuator::new(Arc::clone(&shared), Arc::clone(&clock), Duration::from_secs(2))
            .with_capture_latency(capture_latency),
    );
    let hub = CameraHub::new(
        shared,
        actuator.clone(),
        Arc::clone(&clock),
        HubSettings {
            offline_threshold: Duration::from_secs(7),
            actuator_timeout: Duration::from_secs(15),
            status_interval: Duration::from_secs(2),
        },
    );
    Rig {
        hub,
        store,
        actuator,
        clock,
    }
}

fn settings() -> ClientSettings {
    ClientSettings {
        poll_interval: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(30),
        frame_refresh_interval: Duration::from_secs(1),
        settle_delay: Duration::from_millis(500),
        offline_threshold: Duration::from_secs(7),
        event_timeout: Duration::from_secs(15),
        polling_timeout: Duration::from_secs(10),
        default_preset: QualityPreset::Medium,
    }
}

fn polling(rig: &Rig) -> SharedTransport {
    Arc::new(PollingTransport::new(
        Arc::new(LocalBackend::new(Arc::clone(&rig.hub))),
        RetrySchedule {
            fast_interval: Duration::from_millis(50),
            fast_attempts: 40,
            slow_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        },
        Duration::from_secs(7),
        Arc::clone(&rig.clock),
    ))
}

fn client(rig: &Rig) -> ClientHandle {
    let (handle, _task) = spawn_client(polling(rig), Arc::clone(&rig.clock), settings());
    handle
}

async fn expect_notice<F>(notices: &mut broadcast::Receiver<ClientNotice>, wanted: F) -> ClientNotice
where
    F: Fn(&ClientNotice) -> bool,
{
    timeout(Duration::from_secs(120), async {
        loop {
            match notices.recv().await {
                Ok(notice) if wanted(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("Notice channel closed: {}", e),
            }
        }
    })
    .await
    .expect("notice did not arrive")
}

async fn live_flag(store: &MemoryStateStore) -> bool {
    store.load_or(LiveEnabled(false)).await.0
}

#[tokio::test]
async fn test_client_core_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}

    let rig = rig(Duration::ZERO);
    let (_intents, intent_rx) = mpsc::channel(1);
    let (state_tx, _state) = watch::channel(Arbiter::new(QualityPreset::Medium).state().clone());
    let (notices, _) = broadcast::channel(1);
    let runtime = ClientRuntime::new(
        polling(&rig),
        Arc::clone(&rig.clock),
        settings(),
        intent_rx,
        state_tx,
        notices,
        CancellationToken::new(),
    );
    let run = runtime.run();
    assert_send(&run);
}

#[tokio::test(start_paused = true)]
async fn test_capture_during_live_resumes_after_settle_delay() {
    let rig = rig(Duration::from_secs(2));
    rig.actuator.emit().await;
    rig.actuator.start();

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.start_live().await.unwrap();
    expect_notice(&mut notices, |n| *n == ClientNotice::LiveStarted).await;
    assert!(live_flag(&rig.store).await);

    handle.capture().await.unwrap();
    expect_notice(&mut notices, |n| *n == ClientNotice::CaptureStarted).await;
    // Live is off before the capture can complete
    assert!(!live_flag(&rig.store).await);
    assert_eq!(handle.state().phase, Phase::Capturing);

    let completed = expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::CaptureCompleted { .. })
    })
    .await;
    let completed_at = Instant::now();
    match completed {
        ClientNotice::CaptureCompleted { duration_ms, .. } => assert!(duration_ms >= 2_000),
        other => panic!("Unexpected notice {:?}", other),
    }

    expect_notice(&mut notices, |n| *n == ClientNotice::LiveStarted).await;
    let resumed_after = completed_at.elapsed();
    assert!(resumed_after >= Duration::from_millis(500));
    assert!(resumed_after < Duration::from_millis(600));
    assert!(live_flag(&rig.store).await);
    assert_eq!(rig.actuator.capture_count(), 1);

    let state = handle.state();
    assert_eq!(state.phase, Phase::LiveActive);
    assert!(state.last_capture.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_two_viewers_converge_on_newest_session() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;
    rig.actuator.start();

    let a = client(&rig);
    let mut a_notices = a.notices();
    a.start_live().await.unwrap();
    expect_notice(&mut a_notices, |n| *n == ClientNotice::LiveStarted).await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let b = client(&rig);
    let mut b_notices = b.notices();
    b.start_live().await.unwrap();
    expect_notice(&mut b_notices, |n| *n == ClientNotice::LiveStarted).await;
    let b_session = b.state().session_id.expect("b holds a session");

    let conceded = expect_notice(&mut a_notices, |n| {
        matches!(n, ClientNotice::SessionConceded { .. })
    })
    .await;
    assert_eq!(
        conceded,
        ClientNotice::SessionConceded {
            winner: b_session.clone()
        }
    );

    let a_state = a.state();
    assert_eq!(a_state.phase, Phase::Idle);
    assert!(!a_state.live_enabled);
    assert!(a_state.session_id.is_none());
    // The loser never switched the shared stream off under the winner
    assert!(live_flag(&rig.store).await);

    // B keeps the slot across several heartbeats
    tokio::time::sleep(Duration::from_secs(25)).await;
    let slot = rig.store.load::<SessionStamp>().await.unwrap().value;
    assert_eq!(slot.session_id, b_session);
    assert_eq!(b.state().phase, Phase::LiveActive);
    assert_eq!(a.state().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_offline_silently_stops_and_auto_resumes() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;
    let started = Instant::now();

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.start_live().await.unwrap();
    expect_notice(&mut notices, |n| *n == ClientNotice::LiveStarted).await;

    // No more telemetry: suspended only once it is older than the threshold
    expect_notice(&mut notices, |n| *n == ClientNotice::LiveSuspended).await;
    assert!(started.elapsed() > Duration::from_secs(7));
    let state = handle.state();
    assert_eq!(state.online, OnlineStatus::Offline);
    assert!(state.suspended);
    assert!(state.was_live);
    assert_eq!(state.phase, Phase::LiveActive);
    let session = state.session_id.clone();

    rig.actuator.emit().await;
    expect_notice(&mut notices, |n| *n == ClientNotice::LiveResumed).await;
    let state = handle.state();
    assert!(state.is_streaming());
    assert_eq!(state.online, OnlineStatus::Online);
    assert_eq!(state.session_id, session);
    assert!(live_flag(&rig.store).await);
}

#[tokio::test(start_paused = true)]
async fn test_busy_capture_is_not_retried() {
    let rig = rig(Duration::from_secs(5));
    rig.actuator.emit().await;
    rig.actuator.start();

    // Another client's capture holds the camera
    assert!(matches!(rig.hub.start_capture(), Reply::CaptureStarted(_)));

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.capture().await.unwrap();
    let rejected = expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::CaptureRejected { .. })
    })
    .await;
    assert_eq!(
        rejected,
        ClientNotice::CaptureRejected {
            error: CaptureError::Busy
        }
    );
    assert_eq!(handle.state().phase, Phase::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.actuator.capture_count(), 1);
    assert!(!rig.hub.is_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_double_capture_invokes_actuator_once() {
    let rig = rig(Duration::from_secs(2));
    rig.actuator.emit().await;
    rig.actuator.start();

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.capture().await.unwrap();
    handle.capture().await.unwrap();

    let rejected = expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::CaptureRejected { .. })
    })
    .await;
    assert_eq!(
        rejected,
        ClientNotice::CaptureRejected {
            error: CaptureError::AlreadyCapturing
        }
    );
    expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::CaptureCompleted { .. })
    })
    .await;
    assert_eq!(rig.actuator.capture_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_capture_reported_as_timeout() {
    let rig = rig(Duration::from_secs(120));
    rig.actuator.emit().await;
    rig.actuator.start();

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.capture().await.unwrap();

    let failed = expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::CaptureFailed { .. })
    })
    .await;
    assert_eq!(
        failed,
        ClientNotice::CaptureFailed {
            error: CaptureError::Timeout {
                timeout: Duration::from_secs(10)
            }
        }
    );
    assert_eq!(handle.state().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_same_quality_applied_once() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;
    rig.actuator.start();

    let handle = client(&rig);
    let mut notices = handle.notices();
    handle.start_live().await.unwrap();
    expect_notice(&mut notices, |n| {
        *n == ClientNotice::QualityApplied {
            preset: QualityPreset::Medium,
        }
    })
    .await;

    handle.select_quality(QualityPreset::Medium).await.unwrap();
    handle.select_quality(QualityPreset::High).await.unwrap();
    let next = expect_notice(&mut notices, |n| {
        matches!(n, ClientNotice::QualityApplied { .. })
    })
    .await;
    assert_eq!(
        next,
        ClientNotice::QualityApplied {
            preset: QualityPreset::High
        }
    );

    let quality = rig
        .store
        .load::<crate::store::StreamQuality>()
        .await
        .unwrap()
        .value;
    assert_eq!((quality.width, quality.height), (1280, 720));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_switches_live_off() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;
    rig.actuator.start();

    let (handle, task) = spawn_client(polling(&rig), Arc::clone(&rig.clock), settings());
    let mut notices = handle.notices();
    handle.start_live().await.unwrap();
    expect_notice(&mut notices, |n| *n == ClientNotice::LiveStarted).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(!live_flag(&rig.store).await);
    assert!(handle.capture().await.is_err());
    assert_eq!(handle.state().channel, ChannelMode::Polling);
}

#[tokio::test(start_paused = true)]
async fn test_suspended_owner_concedes_to_newer_viewer() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;

    let a = client(&rig);
    let mut a_notices = a.notices();
    a.start_live().await.unwrap();
    expect_notice(&mut a_notices, |n| *n == ClientNotice::LiveStarted).await;
    expect_notice(&mut a_notices, |n| *n == ClientNotice::LiveSuspended).await;

    // Telemetry returns and B goes live before A polls again
    rig.actuator.emit().await;
    let b = client(&rig);
    let mut b_notices = b.notices();
    b.start_live().await.unwrap();
    expect_notice(&mut b_notices, |n| *n == ClientNotice::LiveStarted).await;
    let b_session = b.state().session_id.expect("b holds a session");
    rig.actuator.start();

    expect_notice(&mut a_notices, |n| {
        matches!(n, ClientNotice::SessionConceded { .. })
    })
    .await;
    assert_eq!(a.state().phase, Phase::Idle);

    tokio::time::sleep(Duration::from_secs(25)).await;
    let slot = rig.store.load::<SessionStamp>().await.unwrap().value;
    assert_eq!(slot.session_id, b_session);
    assert!(b.state().is_streaming());
    assert_eq!(a.state().phase, Phase::Idle);
    assert!(live_flag(&rig.store).await);
}

#[tokio::test(start_paused = true)]
async fn test_idle_capture_gives_live_back_to_owner() {
    let rig = rig(Duration::from_secs(1));
    rig.actuator.emit().await;
    rig.actuator.start();

    let a = client(&rig);
    let mut a_notices = a.notices();
    a.start_live().await.unwrap();
    expect_notice(&mut a_notices, |n| *n == ClientNotice::LiveStarted).await;

    let b = client(&rig);
    let mut b_notices = b.notices();
    b.capture().await.unwrap();
    expect_notice(&mut b_notices, |n| *n == ClientNotice::CaptureStarted).await;
    assert!(!live_flag(&rig.store).await);

    expect_notice(&mut b_notices, |n| {
        matches!(n, ClientNotice::CaptureCompleted { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(live_flag(&rig.store).await);
    let b_state = b.state();
    assert_eq!(b_state.phase, Phase::Idle);
    assert!(b_state.session_id.is_none());
    assert_eq!(a.state().phase, Phase::LiveActive);
}
