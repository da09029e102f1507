/// Fleet behaviour across the registry, sessions, recorder and event consumer
use common::{CameraError, CameraProfile, RetryPolicy};
use recorder::{MemorySinkFactory, RecorderSettings, RecordingController};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use viewer::ptz::{MockPtzConnector, PtzDirection};
use viewer::stream::{
    CameraEvent, ChannelConsumer, FailurePhase, MockFrameSource, RegistrySettings,
    SessionRegistry, SessionSettings, SessionState, StreamPlan,
};

struct Fleet {
    registry: SessionRegistry,
    source: MockFrameSource,
    events: mpsc::Receiver<CameraEvent>,
    _recordings: tempfile::TempDir,
}

fn fleet(source: MockFrameSource, ptz: MockPtzConnector) -> Fleet {
    let recordings = tempfile::tempdir().unwrap();
    let recorder = Arc::new(RecordingController::new(
        Arc::new(MemorySinkFactory::new()),
        RecorderSettings {
            output_dir: recordings.path().to_path_buf(),
            ..RecorderSettings::default()
        },
    ));
    let (consumer, events) = ChannelConsumer::channel(8192);
    let settings = RegistrySettings {
        session: SessionSettings {
            connect_retry: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10)),
            onvif_retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(5)),
            ..SessionSettings::default()
        },
        setup_parallelism: Some(2),
        ..RegistrySettings::default()
    };
    Fleet {
        registry: SessionRegistry::new(
            Arc::new(source.clone()),
            Arc::new(ptz),
            recorder,
            Arc::new(consumer),
            settings,
        ),
        source,
        events,
        _recordings: recordings,
    }
}

fn camera(ip: &str) -> CameraProfile {
    CameraProfile::new(ip).with_credentials("admin", "secret")
}

async fn wait_for_state(registry: &SessionRegistry, ip: &str, state: SessionState) {
    for _ in 0..10_000 {
        if let Ok(status) = registry.session_status(ip).await {
            if status.state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{ip} never reached {state}");
}

fn drain(events: &mut mpsc::Receiver<CameraEvent>) -> Vec<CameraEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn replace_leaves_exactly_the_new_fleet() {
    // the first stream drops after two frames, so one camera is mid-reconnect
    let source = MockFrameSource::new().then_stream(StreamPlan::FailAfter(2));
    let mut f = fleet(source, MockPtzConnector::new());

    let old = vec![camera("10.0.0.1"), camera("10.0.0.2"), camera("10.0.0.3")];
    f.registry.attach(old).await;
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        wait_for_state(&f.registry, ip, SessionState::Streaming).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = f
        .registry
        .replace(vec![camera("10.0.0.3"), camera("10.0.0.4")])
        .await;
    assert_eq!(report.started, vec!["10.0.0.3", "10.0.0.4"]);

    let cameras = f.registry.cameras().await;
    let ips: Vec<_> = cameras.iter().map(|c| c.camera.as_str()).collect();
    assert_eq!(ips, vec!["10.0.0.3", "10.0.0.4"]);
    assert!(f.registry.status("10.0.0.1").await.is_err());
    assert!(f.registry.status("10.0.0.2").await.is_err());

    let detached: HashSet<String> = drain(&mut f.events)
        .into_iter()
        .filter_map(|e| match e {
            CameraEvent::Detached { camera } => Some(camera),
            _ => None,
        })
        .collect();
    assert_eq!(detached.len(), 3);

    // nothing from the old fleet arrives after the swap
    wait_for_state(&f.registry, "10.0.0.4", SessionState::Streaming).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for event in drain(&mut f.events) {
        assert!(matches!(event.camera(), "10.0.0.3" | "10.0.0.4"), "stale event {event:?}");
    }

    f.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn stream_failure_emits_error_then_fresh_frames() {
    let source = MockFrameSource::new().then_stream(StreamPlan::FailAfter(3));
    let mut f = fleet(source, MockPtzConnector::new());

    f.registry.attach(vec![camera("10.0.0.1")]).await;
    for _ in 0..1000 {
        if f.registry.session_status("10.0.0.1").await.unwrap().reconnects == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_for_state(&f.registry, "10.0.0.1", SessionState::Streaming).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain(&mut f.events);
    let error_at = events
        .iter()
        .position(|e| matches!(e, CameraEvent::Error { .. }))
        .expect("error event");
    let frames_after: Vec<u64> = events[error_at..]
        .iter()
        .filter_map(|e| match e {
            CameraEvent::Frame { frame, .. } => Some(frame.sequence),
            _ => None,
        })
        .collect();
    assert_eq!(frames_after.first(), Some(&1), "sequence restarts after reconnect");
    assert!(!events
        .iter()
        .any(|e| matches!(e, CameraEvent::State { state: SessionState::Failed(_), .. })));

    f.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn ptz_failures_leave_stream_running() {
    let ptz = MockPtzConnector::new().failing_commands();
    let f = fleet(MockFrameSource::new(), ptz);

    f.registry.attach(vec![camera("10.0.0.1")]).await;
    wait_for_state(&f.registry, "10.0.0.1", SessionState::Streaming).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = f
        .registry
        .ptz_move("10.0.0.1", PtzDirection::Right, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CameraError::PtzCommand(_)));
    assert!(f.registry.ptz_stop("10.0.0.1").await.is_err());

    assert_eq!(
        f.registry.session_status("10.0.0.1").await.unwrap().state,
        SessionState::Streaming
    );
    f.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_camera_fails_alone() {
    let source = MockFrameSource::new().failing_opens(3);
    let f = fleet(source, MockPtzConnector::new());

    f.registry.attach(vec![camera("10.0.0.1")]).await;
    wait_for_state(&f.registry, "10.0.0.1", SessionState::Failed(FailurePhase::Connecting)).await;
    f.registry.attach(vec![camera("10.0.0.2")]).await;
    wait_for_state(&f.registry, "10.0.0.2", SessionState::Streaming).await;

    let failed = f.registry.status("10.0.0.1").await.unwrap();
    assert_eq!(failed.state, "failed_connecting");
    assert!(failed.last_error.unwrap().contains("after 3 attempts"));
    assert_eq!(f.source.open_calls(), 4);

    f.registry.detach_all().await;
}
