use crate::mock_hw::{start_time, wired, NoCamera};
use actix_web::{test, web, App};
use std::{fs, sync::Arc, thread, time::Duration};
use tempfile::TempDir;
use verdant::{
    clock::ManualClock,
    config::{
        ControllerKind, DaemonConfig, LcdConfig, LcdLine, PidConfig, PidDirection, RelayConfig,
        RelayKind, RelayState, SensorConfig, SensorDevice, StaticConfigStore, TimerConfig,
        TimerKind,
    },
    controllers::lcd::RecordingDisplays,
    daemon::{Daemon, DaemonError, DaemonParts},
    gpio::{MockGpio, PwmChannel},
    notify::RecordingMailer,
    rpc::{self, Response},
    store::MemoryStore,
};

struct Harness {
    daemon: Arc<Daemon>,
    gpio: Arc<MockGpio>,
    store: Arc<MemoryStore>,
    displays: RecordingDisplays,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let loadavg = dir.path().join("loadavg");
    fs::write(&loadavg, "0.52 0.41 0.30 1/123 4567\n").unwrap();

    let mut config = DaemonConfig::default();
    config.misc.lock_dir = dir.path().join("locks");
    config.relays = vec![
        wired(1, 17, 2.0),
        wired(2, 27, 2.0),
        RelayConfig {
            kind: RelayKind::Pwm,
            pin: None,
            pwm: Some(PwmChannel {
                chip: 0,
                channel: 0,
                hertz: 25000.0,
            }),
            ..wired(4, 0, 1.0)
        },
    ];
    config.pids = vec![PidConfig {
        id: 5,
        name: "load".into(),
        is_activated: false,
        sensor_id: 3,
        measurement: "cpu_load_1m".into(),
        direction: PidDirection::Raise,
        period: 30.0,
        kp: 1.0,
        ki: 0.0,
        kd: 0.0,
        setpoint: 1.0,
        band: 0.0,
        max_measure_age: None,
        raise: None,
        lower: None,
        schedule: vec![],
    }];
    config.lcds = vec![LcdConfig {
        id: 1,
        name: "Board".into(),
        is_activated: false,
        period: 10.0,
        i2c_bus: 1,
        i2c_address: 0x27,
        columns: 16,
        rows: 2,
        lines: vec![LcdLine {
            entity: "sensor_3".into(),
            measurement: "cpu_load_1m".into(),
            label: Some("Load".into()),
        }],
    }];
    config.timers = vec![TimerConfig {
        id: 1,
        name: "fan".into(),
        is_activated: true,
        relay_id: 2,
        state: RelayState::On,
        kind: TimerKind::Duration { on: 30.0, off: 30.0 },
    }];
    config.sensors = vec![SensorConfig {
        id: 3,
        name: "board".into(),
        is_activated: false,
        device: SensorDevice::CpuLoad,
        location: loadavg.to_string_lossy().into_owned(),
        period: 60.0,
        i2c_bus: 1,
        multiplexer: None,
        adc: None,
        pre_relay_id: None,
        pre_relay_duration: 0.0,
        edge: None,
    }];

    let gpio = Arc::new(MockGpio::new());
    let store = Arc::new(MemoryStore::new());
    let displays = RecordingDisplays::new();
    let daemon = Daemon::new(DaemonParts {
        config_store: Arc::new(StaticConfigStore::new(config)),
        gpio: gpio.clone(),
        store: store.clone(),
        clock: Arc::new(ManualClock::new(start_time(10, 0))),
        mailer: Arc::new(RecordingMailer::new()),
        camera: Arc::new(NoCamera),
        displays: Arc::new(displays.clone()),
        synchronous_store: true,
    })
    .unwrap();
    daemon.start().unwrap();
    Harness {
        daemon,
        gpio,
        store,
        displays,
        _dir: dir,
    }
}

#[::core::prelude::v1::test]
fn starts_activated_controllers_and_rejects_duplicates() {
    let h = harness();
    assert_eq!(h.daemon.status().timers, vec![1]);
    assert!(h.daemon.status().sensors.is_empty());
    assert!(matches!(
        h.daemon.activate(ControllerKind::Timer, 1),
        Err(DaemonError::AlreadyActive { .. })
    ));
    h.daemon.deactivate(ControllerKind::Timer, 1).unwrap();
    assert!(matches!(
        h.daemon.deactivate(ControllerKind::Timer, 1),
        Err(DaemonError::NotActive { .. })
    ));
    assert!(matches!(
        h.daemon.activate(ControllerKind::Pid, 9),
        Err(DaemonError::NotConfigured { .. })
    ));
    assert_eq!(h.daemon.check_daemon().unwrap(), "All controllers running");
    h.daemon.shutdown();
}

#[::core::prelude::v1::test]
fn activated_sensor_records_measurements() {
    let h = harness();
    h.daemon.activate(ControllerKind::Sensor, 3).unwrap();
    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = h.store.records("sensor_3", "cpu_load_1m");
        if !recorded.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(recorded.len(), 1);
    assert!((recorded[0].value - 0.52).abs() < 1e-9);
    h.daemon.shutdown();
}

#[::core::prelude::v1::test]
fn shutdown_switches_every_relay_off() {
    let h = harness();
    // The timer's first command runs on a dispatch thread.
    for _ in 0..50 {
        if h.gpio.level(27) == Some(true) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.gpio.level(27), Some(true));
    h.daemon.relay_on(1, 0.0, 0.0).unwrap();
    assert_eq!(h.daemon.relay_state(1).unwrap(), "on");
    h.daemon.shutdown();
    assert_eq!(h.gpio.level(17), Some(false));
    assert_eq!(h.gpio.level(27), Some(false));
    assert!(!h.daemon.is_running());
}

#[actix_web::test]
async fn rpc_reports_status_and_refusals() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(h.daemon.clone()))
            .configure(rpc::routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/daemon").to_request();
    let body: Response = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, Response::success("alive".into()));

    let req = test::TestRequest::post()
        .uri("/api/relays/1/on")
        .set_json(&serde_json::json!({ "duration": 0.0 }))
        .to_request();
    let body: Response = test::call_and_read_body_json(&app, req).await;
    assert!(body.status, "{}", body.message);

    let req = test::TestRequest::post().uri("/api/relays/1/on").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);

    let req = test::TestRequest::post()
        .uri("/api/controllers/timer/1/activate")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    h.daemon.shutdown();
}

#[::core::prelude::v1::test]
fn activated_lcd_draws_on_its_display() {
    let h = harness();
    h.daemon.activate(ControllerKind::Lcd, 1).unwrap();
    let mut frame = None;
    for _ in 0..50 {
        frame = h.displays.last_frame(1);
        if frame.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        frame.unwrap(),
        vec!["Board 10:00     ".to_string(), "Load: --        ".to_string()]
    );
    assert!(h.daemon.flash_lcd(1, true).is_ok());
    h.daemon.shutdown();
}

#[actix_web::test]
async fn rpc_adjusts_pids_and_duty_cycles() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(h.daemon.clone()))
            .configure(rpc::routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/relays/4/duty_cycle")
        .set_json(&serde_json::json!({ "duty_cycle": 35.0 }))
        .to_request();
    let body: Response = test::call_and_read_body_json(&app, req).await;
    assert!(body.status, "{}", body.message);
    assert_eq!(h.gpio.duty_cycle(0, 0), Some(35.0));

    let req = test::TestRequest::post()
        .uri("/api/relays/1/duty_cycle")
        .set_json(&serde_json::json!({ "duty_cycle": 35.0 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/relays/1/on")
        .set_json(&serde_json::json!({ "duration": 1e13 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    assert_eq!(h.gpio.level(17), Some(false));

    let req = test::TestRequest::post()
        .uri("/api/pids/5/set/kp")
        .set_json(&serde_json::json!({ "value": 2.5 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);

    h.daemon.activate(ControllerKind::Pid, 5).unwrap();
    let req = test::TestRequest::post()
        .uri("/api/pids/5/set/kp")
        .set_json(&serde_json::json!({ "value": 2.5 }))
        .to_request();
    let body: Response = test::call_and_read_body_json(&app, req).await;
    assert!(body.status, "{}", body.message);
    let mut kp = 0.0;
    for _ in 0..50 {
        kp = h.daemon.pid_status(5).unwrap().kp;
        if kp == 2.5 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(kp, 2.5);

    let req = test::TestRequest::post()
        .uri("/api/pids/5/set/gain")
        .set_json(&serde_json::json!({ "value": 1.0 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

    h.daemon.shutdown();
}
