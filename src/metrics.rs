use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge_vec, Encoder, Histogram,
    IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref PRESENCE_ONLINE: IntGaugeVec = register_int_gauge_vec!(
        "pseudolive_presence_online",
        "Clients currently present per event",
        &["event_id"]
    )
    .unwrap();
    pub static ref SESSION_PHASES: IntCounterVec = register_int_counter_vec!(
        "pseudolive_session_phase_total",
        "Playback sessions entering each lifecycle phase",
        &["phase"]
    )
    .unwrap();
    pub static ref SEEK_ATTEMPTS: Histogram = register_histogram!(
        "pseudolive_seek_attempts",
        "Seek attempts needed before playback was released",
        vec![0.0, 1.0, 2.0, 3.0, 4.0]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
