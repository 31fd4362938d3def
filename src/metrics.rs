use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_counter, register_int_gauge_vec, Encoder, GaugeVec,
    IntCounter, IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref CLIENT_BANDWIDTH: GaugeVec = register_gauge_vec!(
        "loopcast_client_bandwidth_bytes",
        "Current bandwidth per streaming client in bytes/sec",
        &["channel"]
    )
    .unwrap();
    pub static ref ENCODER_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "loopcast_encoder_cpu_usage_percent",
        "Current CPU usage of the encoder process per channel (0-100+)",
        &["channel"]
    )
    .unwrap();
    pub static ref ACTIVE_CLIENTS: IntGaugeVec = register_int_gauge_vec!(
        "loopcast_active_clients",
        "Streaming clients currently connected per channel",
        &["channel"]
    )
    .unwrap();
    pub static ref SESSIONS_STARTED: IntCounter = register_int_counter!(
        "loopcast_sessions_started_total",
        "Concat sessions allocated since process start"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    // Touch the lazily-registered series so they are present before first use.
    lazy_static::initialize(&CLIENT_BANDWIDTH);
    lazy_static::initialize(&ENCODER_CPU_USAGE);
    lazy_static::initialize(&ACTIVE_CLIENTS);
    lazy_static::initialize(&SESSIONS_STARTED);
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_series() {
        ENCODER_CPU_USAGE.with_label_values(&["42"]).set(12.5);
        SESSIONS_STARTED.inc();
        let text = gather_metrics();
        assert!(text.contains("loopcast_encoder_cpu_usage_percent"));
        assert!(text.contains("loopcast_sessions_started_total"));
    }
}
