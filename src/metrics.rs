//! Process metrics, exposed in the Prometheus text format on `/metrics`.
use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder,
    Gauge, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref RELAY_SWITCHES: IntCounterVec = register_int_counter_vec!(
        "verdant_relay_switches_total",
        "Relay state transitions",
        &["relay", "state"]
    )
    .unwrap();
    pub static ref RELAY_REFUSALS: IntCounterVec = register_int_counter_vec!(
        "verdant_relay_refusals_total",
        "Relay activations refused by a business rule",
        &["relay", "reason"]
    )
    .unwrap();
    pub static ref SENSOR_READ_FAILURES: IntCounterVec = register_int_counter_vec!(
        "verdant_sensor_read_failures_total",
        "Sensor cycles skipped because acquisition failed",
        &["sensor"]
    )
    .unwrap();
    pub static ref CONDITIONAL_FIRES: IntCounterVec = register_int_counter_vec!(
        "verdant_conditional_fires_total",
        "Conditionals that triggered",
        &["source"]
    )
    .unwrap();
    pub static ref PID_CYCLES: IntCounterVec = register_int_counter_vec!(
        "verdant_pid_cycles_total",
        "PID control cycles by outcome",
        &["pid", "outcome"]
    )
    .unwrap();
    pub static ref ACTIVE_CONTROLLERS: IntGaugeVec = register_int_gauge_vec!(
        "verdant_active_controllers",
        "Running workers per controller type",
        &["kind"]
    )
    .unwrap();
    pub static ref AMP_LOAD: Gauge =
        register_gauge!("verdant_amp_load", "Current drawn by relays that are on").unwrap();
    pub static ref UPTIME_SECONDS: IntGauge =
        register_int_gauge!("verdant_uptime_seconds", "Seconds since the daemon started").unwrap();
}

/// Render every registered metric.
pub fn gather() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_contains_counters() {
        RELAY_SWITCHES.with_label_values(&["1", "on"]).inc();
        AMP_LOAD.set(2.5);
        let text = gather().unwrap();
        assert!(text.contains("verdant_relay_switches_total"));
        assert!(text.contains("verdant_amp_load"));
    }
}
