use crate::mock_hw::{start_time, wired, Rig};
use chrono::Utc;
use verdant::{
    clock::Clock,
    config::{
        DaemonConfig, OutputMode, PidConfig, PidDirection, PidOutput, RelayConfig, RelayKind,
        RelayState, SetpointWindow,
    },
    controllers::{
        pid::{PidAdjustment, PidWorker},
        RelayControl, Worker,
    },
    gpio::PwmChannel,
    store::{Measurement, MeasurementStore},
};

fn cooling_pid() -> PidConfig {
    PidConfig {
        id: 1,
        name: "cooling".into(),
        is_activated: true,
        sensor_id: 1,
        measurement: "temperature".into(),
        direction: PidDirection::Lower,
        period: 10.0,
        kp: 1.0,
        ki: 0.0,
        kd: 0.0,
        setpoint: 20.0,
        band: 0.0,
        max_measure_age: None,
        raise: None,
        lower: Some(PidOutput {
            relay_id: 5,
            mode: OutputMode::Pulse,
            min_duration: 0.0,
            max_duration: 60.0,
            min_off_duration: 0.0,
        }),
        schedule: vec![],
    }
}

fn rig() -> Rig {
    let mut config = DaemonConfig::default();
    config.relays = vec![wired(5, 5, 2.0)];
    Rig::new(config, start_time(8, 0))
}

fn worker(rig: &Rig, config: PidConfig) -> PidWorker {
    PidWorker::new(
        config,
        Some(10.0),
        rig.relays.clone(),
        rig.persister.clone(),
        rig.clock.clone(),
    )
    .unwrap()
}

fn record(rig: &Rig, value: f64) {
    rig.store
        .write(&Measurement::new(
            "sensor_1",
            "temperature",
            value,
            rig.clock.now().with_timezone(&Utc),
        ))
        .unwrap();
}

#[test]
fn sensor_gap_only_ever_switches_the_output_off() {
    let rig = rig();
    let mut pid = worker(&rig, cooling_pid());
    // The sensor wrote once, long before the PID started.
    rig.clock.advance(chrono::Duration::seconds(-65));
    record(&rig, 30.0);
    rig.advance(65);

    for _ in 0..65 {
        pid.step().unwrap();
        rig.advance(1);
    }
    assert!(rig.writes_to(5).iter().all(|high| !high));
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
    assert!(rig.store.records("pid_1", "pid_output").is_empty());
    assert_eq!(pid.pid().integrator(), 0.0);
}

#[test]
fn fresh_measurement_drives_the_lower_relay_then_fails_safe() {
    let rig = rig();
    let mut pid = worker(&rig, cooling_pid());
    record(&rig, 30.0);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::On);
    let outputs = rig.store.records("pid_1", "pid_output");
    assert_eq!(outputs.len(), 1);
    assert!((outputs[0].value + 10.0).abs() < 1e-9);

    // 1.5 sensor periods without a new reading.
    rig.advance(16);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
    assert_eq!(rig.store.records("pid_1", "pid_output").len(), 1);
}

#[test]
fn paused_pid_leaves_relays_alone() {
    let rig = rig();
    let mut pid = worker(&rig, cooling_pid());
    pid.control().pause();
    record(&rig, 30.0);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
    assert!(rig.store.records("pid_1", "setpoint").is_empty());
    pid.control().resume();
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::On);
}

#[test]
fn scheduled_setpoint_ramps_across_the_window() {
    let rig = rig();
    let mut config = cooling_pid();
    config.schedule = vec![SetpointWindow {
        start: "08:00".into(),
        end: "09:00".into(),
        start_setpoint: 20.0,
        end_setpoint: Some(30.0),
    }];
    let mut pid = worker(&rig, config);
    rig.advance(30 * 60);
    record(&rig, 22.0);
    pid.cycle();
    let setpoints = rig.store.records("pid_1", "setpoint");
    assert_eq!(setpoints.len(), 1);
    assert!((setpoints[0].value - 25.0).abs() < 1e-9);

    // Outside the window the default applies.
    rig.advance(31 * 60);
    record(&rig, 22.0);
    pid.cycle();
    let setpoints = rig.store.records("pid_1", "setpoint");
    assert!((setpoints[1].value - 20.0).abs() < 1e-9);
}

#[test]
fn stopping_turns_the_outputs_off() {
    let rig = rig();
    let mut pid = worker(&rig, cooling_pid());
    record(&rig, 30.0);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::On);
    pid.shutdown();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
}

#[test]
fn band_leaves_the_output_idle_until_the_far_edge() {
    let rig = rig();
    let mut config = cooling_pid();
    config.band = 1.0;
    let mut pid = worker(&rig, config);

    record(&rig, 22.0);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::On);
    let outputs = rig.store.records("pid_1", "pid_output");
    assert!((outputs[0].value + 3.0).abs() < 1e-9);
    assert_eq!(rig.store.records("pid_1", "setpoint_band_min")[0].value, 19.0);
    assert_eq!(rig.store.records("pid_1", "setpoint_band_max")[0].value, 21.0);

    // Still cooling inside the band, toward the lower edge.
    record(&rig, 20.5);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::On);

    record(&rig, 18.5);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
    record(&rig, 20.5);
    pid.cycle();
    assert_eq!(rig.relays.relay_state(5).unwrap(), RelayState::Off);
    assert_eq!(rig.store.records("pid_1", "pid_output").len(), 2);
}

#[test]
fn live_adjustments_apply_on_the_next_step() {
    let rig = rig();
    let mut pid = worker(&rig, cooling_pid());
    let control = pid.control();
    control.adjust(PidAdjustment::Setpoint(25.0));
    control.adjust(PidAdjustment::Kp(2.0));
    control.adjust(PidAdjustment::Integrator(3.0));
    assert_eq!(control.status().kp, 1.0);

    pid.step().unwrap();
    let status = control.status();
    assert_eq!(status.kp, 2.0);
    assert_eq!(status.integrator, 3.0);
    assert_eq!(status.setpoint, Some(25.0));

    record(&rig, 30.0);
    pid.cycle();
    let outputs = rig.store.records("pid_1", "pid_output");
    assert!((outputs[0].value + 10.0).abs() < 1e-9);
    assert_eq!(rig.store.records("pid_1", "setpoint")[0].value, 25.0);
}

#[test]
fn duty_cycle_output_drives_the_pwm_channel() {
    let mut daemon_config = DaemonConfig::default();
    daemon_config.relays = vec![RelayConfig {
        kind: RelayKind::Pwm,
        pin: None,
        pwm: Some(PwmChannel {
            chip: 0,
            channel: 0,
            hertz: 100.0,
        }),
        ..wired(6, 0, 1.0)
    }];
    let rig = Rig::new(daemon_config, start_time(8, 0));
    let mut config = cooling_pid();
    config.lower = Some(PidOutput {
        relay_id: 6,
        mode: OutputMode::DutyCycle,
        min_duration: 10.0,
        max_duration: 80.0,
        min_off_duration: 0.0,
    });
    let mut pid = worker(&rig, config);

    // Output -2 over a 10 s period is 20 %.
    record(&rig, 22.0);
    pid.cycle();
    assert_eq!(rig.gpio.duty_cycle(0, 0), Some(20.0));
    assert_eq!(rig.relays.relay_state(6).unwrap(), RelayState::On);

    record(&rig, 40.0);
    pid.cycle();
    assert_eq!(rig.gpio.duty_cycle(0, 0), Some(80.0));

    record(&rig, 19.0);
    pid.cycle();
    assert_eq!(rig.gpio.duty_cycle(0, 0), Some(0.0));
    assert_eq!(rig.relays.relay_state(6).unwrap(), RelayState::Off);
}
