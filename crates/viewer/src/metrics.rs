use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SESSIONS_STREAMING: Lazy<IntGauge> =
    Lazy::new(|| gauge("camwall_sessions_streaming", "Camera sessions currently streaming"));

pub static RECONNECTS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("camwall_reconnects_total", "Reconnect cycles after a stream failure"));

pub static CONNECT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "camwall_connect_failures_total",
        "Connect sequences that exhausted their retry budget",
    )
});

pub static FRAMES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("camwall_frames_total", "Frames read from all cameras"));

pub static FRAMES_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "camwall_frames_dropped_total",
        "Frames dropped because the event consumer was behind",
    )
});

pub static RECORDINGS_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| gauge("camwall_recordings_active", "Cameras currently recording"));

pub static RECORDING_ROTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "camwall_recording_rotations_total",
        "Recordings rotated into a new file at the duration cap",
    )
});

// Metric names and help strings are static, so construction cannot fail.
#[allow(clippy::expect_used)]
fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("static gauge definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

#[allow(clippy::expect_used)]
fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static counter definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

/// Force registration so every series shows up before its first update.
pub fn init() {
    Lazy::force(&SESSIONS_STREAMING);
    Lazy::force(&RECONNECTS_TOTAL);
    Lazy::force(&CONNECT_FAILURES_TOTAL);
    Lazy::force(&FRAMES_TOTAL);
    Lazy::force(&FRAMES_DROPPED_TOTAL);
    Lazy::force(&RECORDINGS_ACTIVE);
    Lazy::force(&RECORDING_ROTATIONS_TOTAL);
}

pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mfs = REGISTRY.gather();
    encoder.encode(&mfs, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
