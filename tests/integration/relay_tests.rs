use crate::mock_hw::{start_time, wired, Rig};
use chrono::Utc;
use verdant::{
    clock::Clock,
    config::{DaemonConfig, RelayState},
    controllers::{
        relay::{RelayError, DURATION_MEASUREMENT},
        RelayControl,
    },
};

fn greenhouse() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.misc.max_amps = 10.0;
    config.relays = vec![wired(1, 17, 6.0), wired(2, 27, 5.0), wired(3, 22, 1.0)];
    config
}

#[test]
fn amp_limit_refuses_only_the_relay_that_would_exceed_it() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    rig.relays.turn_on(1, 0.0, true, 0.0).unwrap();
    match rig.relays.turn_on(2, 0.0, true, 0.0) {
        Err(RelayError::OverCurrent { requested, max, .. }) => {
            assert!((requested - 11.0).abs() < 1e-9);
            assert!((max - 10.0).abs() < 1e-9);
        }
        other => panic!("expected over-current refusal, got {:?}", other),
    }
    assert_eq!(rig.relays.relay_state(2).unwrap(), RelayState::Off);
    rig.relays.turn_on(3, 0.0, true, 0.0).unwrap();
    assert!((rig.relays.current_amp_load() - 7.0).abs() < 1e-9);
}

#[test]
fn timed_relay_expires_and_records_its_duration_at_start() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    let started = rig.clock.now();
    rig.relays.turn_on(1, 30.0, true, 0.0).unwrap();
    rig.advance(29);
    rig.relays.tick();
    assert_eq!(rig.relays.relay_state(1).unwrap(), RelayState::On);
    rig.advance(1);
    rig.relays.tick();
    assert_eq!(rig.relays.relay_state(1).unwrap(), RelayState::Off);

    let facts = rig.store.records("relay_1", DURATION_MEASUREMENT);
    assert_eq!(facts.len(), 1);
    assert!((facts[0].value - 30.0).abs() < 1e-6);
    assert_eq!(facts[0].timestamp, started.with_timezone(&Utc));
}

#[test]
fn turning_off_an_off_relay_changes_nothing() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    rig.relays.turn_off(1, true).unwrap();
    rig.relays.turn_off(1, true).unwrap();
    assert!(rig.writes_to(17).is_empty());
    assert!(rig.store.all().is_empty());
}

#[test]
fn minimum_off_duration_is_enforced() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    rig.relays.turn_on(1, 0.0, true, 0.0).unwrap();
    rig.advance(60);
    rig.relays.turn_off(1, true).unwrap();
    rig.advance(10);
    match rig.relays.turn_on(1, 20.0, true, 30.0) {
        Err(RelayError::MinOffDuration { remaining, .. }) => assert!((remaining - 20.0).abs() < 1e-6),
        other => panic!("expected min-off refusal, got {:?}", other),
    }
    rig.advance(20);
    rig.relays.turn_on(1, 20.0, true, 30.0).unwrap();
    assert_eq!(rig.relays.relay_state(1).unwrap(), RelayState::On);
}

#[test]
fn unknown_relay_is_refused() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    assert!(matches!(
        rig.relays.turn_on(42, 0.0, true, 0.0),
        Err(RelayError::UnknownRelay(42))
    ));
}

#[test]
fn oversized_duration_is_refused_before_the_pin_moves() {
    let rig = Rig::new(greenhouse(), start_time(9, 0));
    match rig.relays.turn_on(1, 1e13, true, 0.0) {
        Err(RelayError::InvalidDuration { id, duration }) => {
            assert_eq!(id, 1);
            assert_eq!(duration, 1e13);
        }
        other => panic!("expected invalid duration refusal, got {:?}", other),
    }
    assert!(rig.writes_to(17).is_empty());
    assert_eq!(rig.gpio.level(17), Some(false));
    assert_eq!(rig.relays.relay_state(1).unwrap(), RelayState::Off);
    assert_eq!(rig.relays.current_amp_load(), 0.0);

    assert!(matches!(
        rig.relays.turn_on(1, f64::NAN, true, 0.0),
        Err(RelayError::InvalidDuration { .. })
    ));
    assert!(rig.writes_to(17).is_empty());
}
