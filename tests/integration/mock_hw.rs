//! In-memory hardware, store and clock for driving the controllers from
//! tests without touching GPIO or the filesystem.

use chrono::{DateTime, Local, TimeZone};
use std::{path::PathBuf, sync::Arc};
use verdant::{
    clock::ManualClock,
    conditional::{ActionExecutor, Collaborators},
    config::{CaptureKind, DaemonConfig, RelayConfig, RelayKind, StaticConfigStore},
    controllers::{relay::RelayService, NoLcds},
    gpio::MockGpio,
    notify::{Camera, RecordingMailer},
    store::{MemoryStore, Persister},
};

pub struct NoCamera;

impl Camera for NoCamera {
    fn capture(&self, _: CaptureKind) -> anyhow::Result<PathBuf> {
        anyhow::bail!("no camera attached")
    }
}

pub fn start_time(hour: u32, minute: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 3, 10, hour, minute, 0).unwrap()
}

pub fn wired(id: u32, pin: u64, amps: f64) -> RelayConfig {
    RelayConfig {
        id,
        name: format!("relay {}", id),
        kind: RelayKind::Wired,
        pin: Some(pin),
        trigger: true,
        amps,
        on_at_start: None,
        on_command: None,
        off_command: None,
        opposing_relay_id: None,
        pwm: None,
    }
}

pub fn collaborators(mailer: Arc<RecordingMailer>) -> Collaborators {
    Collaborators {
        mailer,
        camera: Arc::new(NoCamera),
        lcds: Arc::new(NoLcds),
    }
}

#[allow(dead_code)]
pub struct Rig {
    pub gpio: Arc<MockGpio>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub config: Arc<StaticConfigStore>,
    pub persister: Arc<Persister>,
    pub mailer: Arc<RecordingMailer>,
    pub relays: Arc<RelayService>,
}

#[allow(dead_code)]
impl Rig {
    pub fn new(config: DaemonConfig, now: DateTime<Local>) -> Rig {
        let gpio = Arc::new(MockGpio::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let config = Arc::new(StaticConfigStore::new(config));
        let persister = Arc::new(Persister::synchronous(store.clone()));
        let mailer = Arc::new(RecordingMailer::new());
        let actions = ActionExecutor::new(collaborators(mailer.clone()), 2, clock.clone());
        let relays = Arc::new(
            RelayService::new(
                gpio.clone(),
                config.clone(),
                persister.clone(),
                clock.clone(),
                actions,
            )
            .unwrap(),
        );
        relays.initialize().unwrap();
        Rig {
            gpio,
            store,
            clock,
            config,
            persister,
            mailer,
            relays,
        }
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Levels written to `pin`, in order.
    pub fn writes_to(&self, pin: u64) -> Vec<bool> {
        self.gpio
            .writes()
            .into_iter()
            .filter(|(p, _)| *p == pin)
            .map(|(_, high)| high)
            .collect()
    }
}
