use crate::mock_hw::{start_time, wired, Rig};
use verdant::{
    config::{DaemonConfig, RelayState, TimerConfig, TimerKind},
    controllers::{timer::TimerWorker, RelayControl, Worker},
};

fn rig(hour: u32, minute: u32) -> Rig {
    let mut config = DaemonConfig::default();
    config.relays = vec![wired(4, 24, 1.0)];
    Rig::new(config, start_time(hour, minute))
}

fn timer(kind: TimerKind) -> TimerConfig {
    TimerConfig {
        id: 1,
        name: "lights".into(),
        is_activated: true,
        relay_id: 4,
        state: RelayState::On,
        kind,
    }
}

#[test]
fn overnight_timespan_issues_one_correction() {
    let rig = rig(23, 0);
    let mut worker = TimerWorker::new(
        timer(TimerKind::Timespan {
            start: "22:00".into(),
            end: "06:00".into(),
        }),
        rig.relays.clone(),
        rig.clock.clone(),
    )
    .unwrap()
    .dispatch_inline();
    for _ in 0..20 {
        worker.step().unwrap();
        rig.advance(1);
    }
    assert_eq!(rig.writes_to(24), vec![true]);
    assert_eq!(rig.relays.relay_state(4).unwrap(), RelayState::On);
}

#[test]
fn timespan_leaves_relay_alone_outside_the_window() {
    let rig = rig(12, 0);
    let mut worker = TimerWorker::new(
        timer(TimerKind::Timespan {
            start: "22:00".into(),
            end: "06:00".into(),
        }),
        rig.relays.clone(),
        rig.clock.clone(),
    )
    .unwrap()
    .dispatch_inline();
    worker.step().unwrap();
    assert!(rig.writes_to(24).is_empty());
}

#[test]
fn duty_cycle_relay_expires_through_the_relay_service() {
    let rig = rig(12, 0);
    let mut worker = TimerWorker::new(
        timer(TimerKind::Duration { on: 5.0, off: 15.0 }),
        rig.relays.clone(),
        rig.clock.clone(),
    )
    .unwrap()
    .dispatch_inline();
    for _ in 0..40 {
        worker.step().unwrap();
        rig.relays.tick();
        rig.advance(1);
    }
    assert_eq!(rig.writes_to(24), vec![true, false, true, false]);
}
