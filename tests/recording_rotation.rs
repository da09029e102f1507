/// Recording driven by live frames through the registry
use common::{CameraError, CameraProfile, RetryPolicy};
use recorder::{MemorySinkFactory, RecorderSettings, RecordingController, ToggleOutcome};
use std::sync::Arc;
use std::time::Duration;
use viewer::board::FrameBoard;
use viewer::ptz::MockPtzConnector;
use viewer::stream::{
    MockFrameSource, RegistrySettings, SessionRegistry, SessionSettings, SessionState,
};

struct Rig {
    registry: SessionRegistry,
    sinks: MemorySinkFactory,
    board: Arc<FrameBoard>,
    _dir: tempfile::TempDir,
}

fn rig(sinks: MemorySinkFactory, max_duration: Duration) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(RecordingController::new(
        Arc::new(sinks.clone()),
        RecorderSettings {
            output_dir: dir.path().join("recordings"),
            max_duration,
            ..RecorderSettings::default()
        },
    ));
    let board = Arc::new(FrameBoard::new());
    let registry = SessionRegistry::new(
        Arc::new(MockFrameSource::new()),
        Arc::new(MockPtzConnector::new()),
        recorder,
        board.clone(),
        RegistrySettings {
            session: SessionSettings {
                connect_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5)),
                ..SessionSettings::default()
            },
            ..RegistrySettings::default()
        },
    );
    Rig {
        registry,
        sinks,
        board,
        _dir: dir,
    }
}

async fn streaming(registry: &SessionRegistry, ip: &str) {
    registry
        .attach(vec![CameraProfile::new(ip).with_credentials("admin", "pw")])
        .await;
    for _ in 0..1000 {
        if registry.session_status(ip).await.unwrap().state == SessionState::Streaming {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{ip} never started streaming");
}

#[tokio::test(start_paused = true)]
async fn long_recording_rotates_once_and_keeps_going() {
    let r = rig(MemorySinkFactory::new(), Duration::from_secs(1));
    streaming(&r.registry, "10.0.0.1").await;

    let first = r.registry.start_recording("10.0.0.1").await.unwrap().unwrap();
    assert!(first.file_name().unwrap().to_string_lossy().starts_with("10.0.0.1_"));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(r.sinks.opened().len(), 2);
    assert_eq!(r.sinks.finished(), vec![first]);

    let status = r.registry.recorder().status("10.0.0.1").await.unwrap();
    assert!(status.recording);
    assert_ne!(status.file, None);

    let summary = r.registry.stop_recording("10.0.0.1").await.unwrap().unwrap();
    assert!(summary.frame_count > 0);
    assert_eq!(r.sinks.finished().len(), 2);

    r.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_are_idempotent() {
    let r = rig(MemorySinkFactory::new(), Duration::from_secs(3600));
    streaming(&r.registry, "10.0.0.1").await;

    assert!(r.registry.stop_recording("10.0.0.1").await.unwrap().is_none());
    assert!(r.registry.start_recording("10.0.0.1").await.unwrap().is_some());
    assert!(r.registry.start_recording("10.0.0.1").await.unwrap().is_none());
    assert_eq!(r.sinks.opened().len(), 1);

    match r.registry.toggle_recording("10.0.0.1").await.unwrap() {
        ToggleOutcome::Stopped(Some(summary)) => assert_eq!(summary.camera, "10.0.0.1"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        r.registry.start_recording("10.0.0.7").await,
        Err(CameraError::CameraNotFound(_))
    ));

    r.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn failed_sink_leaves_stream_untouched() {
    let r = rig(MemorySinkFactory::new().failing_opens(1), Duration::from_secs(3600));
    streaming(&r.registry, "10.0.0.1").await;

    assert!(matches!(
        r.registry.start_recording("10.0.0.1").await,
        Err(CameraError::RecordingStart(_))
    ));
    assert!(!r.registry.recorder().is_recording("10.0.0.1").await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        r.registry.session_status("10.0.0.1").await.unwrap().state,
        SessionState::Streaming
    );
    assert!(r.board.latest("10.0.0.1").is_some());

    r.registry.detach_all().await;
}

#[tokio::test(start_paused = true)]
async fn write_failure_is_reported_and_recording_goes_idle() {
    let r = rig(MemorySinkFactory::new().failing_writes_after(5), Duration::from_secs(3600));
    streaming(&r.registry, "10.0.0.1").await;

    r.registry.start_recording("10.0.0.1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!r.registry.recorder().is_recording("10.0.0.1").await);
    let tile = r.board.view("10.0.0.1").unwrap();
    assert!(tile.last_error.unwrap().contains("recording write failed"));
    assert_eq!(
        r.registry.session_status("10.0.0.1").await.unwrap().state,
        SessionState::Streaming
    );

    r.registry.detach_all().await;
}
