//! The relay actuation service: the only code that switches outputs.
//!
//! Each relay is either off, on without a bound, or on until a deadline.
//! A tick thread switches expired timed relays off. Every completed on
//! interval is stored as a `duration_sec` fact stamped at its start.
//! Conditionals fired by a switch run on a dispatch thread once the
//! service is spawned.
use crate::{
    clock::{checked_after, secs_between, SharedClock},
    conditional::{ActionExecutor, Firing},
    config::{RelayConditional, RelayConfig, RelayId, RelayKind, RelayState, SharedConfigStore},
    controllers::RelayControl,
    gpio::GpioBackend,
    metrics::{AMP_LOAD, RELAY_REFUSALS, RELAY_SWITCHES},
    notify::run_command,
    store::{relay_entity, Persister},
};
use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

pub const DURATION_MEASUREMENT: &str = "duration_sec";
pub const DUTY_CYCLE_MEASUREMENT: &str = "duty_cycle";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay {0} is not configured")]
    UnknownRelay(RelayId),
    #[error("relay {0} has no pin or command to switch it")]
    NotConfigured(RelayId),
    #[error("relay {0} is already on")]
    AlreadyOn(RelayId),
    #[error("relay {id} would draw {requested:.2} A, exceeding the {max:.2} A limit")]
    OverCurrent {
        id: RelayId,
        requested: f64,
        max: f64,
    },
    #[error("relay {id} must stay off for another {remaining:.1} s")]
    MinOffDuration { id: RelayId, remaining: f64 },
    #[error("relay {id} cannot be turned on for {duration} s")]
    InvalidDuration { id: RelayId, duration: f64 },
    #[error("relay {id} cannot run at a duty cycle of {duty} %")]
    InvalidDutyCycle { id: RelayId, duty: f64 },
    #[error("relay {0} is not a PWM relay")]
    NotPwm(RelayId),
    #[error("relay {id} output failed: {source:#}")]
    Hardware {
        id: RelayId,
        #[source]
        source: anyhow::Error,
    },
}

impl RelayError {
    fn reason(&self) -> &'static str {
        match self {
            RelayError::UnknownRelay(_) => "unknown",
            RelayError::NotConfigured(_) => "not_configured",
            RelayError::AlreadyOn(_) => "already_on",
            RelayError::OverCurrent { .. } => "over_current",
            RelayError::MinOffDuration { .. } => "min_off",
            RelayError::InvalidDuration { .. } => "invalid_duration",
            RelayError::InvalidDutyCycle { .. } => "invalid_duty_cycle",
            RelayError::NotPwm(_) => "not_pwm",
            RelayError::Hardware { .. } => "hardware",
        }
    }
}

/// What a relay is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Activation {
    /// `since` is the last on to off transition, if there was one.
    Off { since: Option<DateTime<Local>> },
    OnUnbounded { since: DateTime<Local> },
    OnTimed {
        started: DateTime<Local>,
        until: DateTime<Local>,
        duration: f64,
    },
}

impl Activation {
    pub fn is_on(&self) -> bool {
        !matches!(self, Activation::Off { .. })
    }

    /// Start of the current on interval.
    fn on_since(&self) -> Option<DateTime<Local>> {
        match *self {
            Activation::Off { .. } => None,
            Activation::OnUnbounded { since } => Some(since),
            Activation::OnTimed { started, .. } => Some(started),
        }
    }
}

struct RelayEntry {
    config: RelayConfig,
    activation: Activation,
    /// Percent, only moved for PWM relays.
    duty: f64,
}

impl RelayEntry {
    fn new(config: RelayConfig, activation: Activation) -> Self {
        let duty = if activation.is_on() { 100.0 } else { 0.0 };
        RelayEntry {
            config,
            activation,
            duty,
        }
    }
}

/// A measurement waiting to be persisted.
struct Fact {
    relay_id: RelayId,
    measurement: &'static str,
    at: DateTime<Local>,
    value: f64,
}

impl Fact {
    /// A completed on interval, stamped at its start.
    fn interval(relay_id: RelayId, started: DateTime<Local>, now: DateTime<Local>) -> Fact {
        Fact {
            relay_id,
            measurement: DURATION_MEASUREMENT,
            at: started,
            value: secs_between(started, now).max(0.0),
        }
    }
}

/// A transition whose conditionals still have to be evaluated.
struct Fired {
    relay_id: RelayId,
    pin: Option<u64>,
    state: RelayState,
    duration: f64,
}

/// Outcome of a switch made under the table lock.
#[derive(Default)]
struct Switched {
    facts: Vec<Fact>,
    fired: Vec<Fired>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAction {
    Add,
    Modify,
    Delete,
}

impl FromStr for SetupAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "add" => Ok(SetupAction::Add),
            "modify" | "mod" => Ok(SetupAction::Modify),
            "delete" | "del" => Ok(SetupAction::Delete),
            other => bail!("unknown setup action '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub id: RelayId,
    pub name: String,
    pub amps: f64,
    pub activation: Activation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty_cycle: Option<f64>,
}

pub struct RelayService {
    gpio: Arc<dyn GpioBackend>,
    config_store: SharedConfigStore,
    persister: Arc<Persister>,
    clock: SharedClock,
    actions: ActionExecutor,
    max_amps: f64,
    tick: Duration,
    relays: Mutex<HashMap<RelayId, RelayEntry>>,
    conditionals: RwLock<Arc<Vec<RelayConditional>>>,
    /// Queue of the conditional dispatch thread, present while spawned.
    conditional_queue: Mutex<Option<Sender<Fired>>>,
    running: AtomicBool,
}

impl RelayService {
    pub fn new(
        gpio: Arc<dyn GpioBackend>,
        config_store: SharedConfigStore,
        persister: Arc<Persister>,
        clock: SharedClock,
        actions: ActionExecutor,
    ) -> anyhow::Result<RelayService> {
        let config = config_store.load()?;
        Ok(RelayService {
            gpio,
            config_store,
            persister,
            clock,
            actions,
            max_amps: config.misc.max_amps,
            tick: Duration::from_millis(config.misc.relay_tick_ms.max(1)),
            relays: Mutex::new(HashMap::new()),
            conditionals: RwLock::new(Arc::new(config.active_relay_conditionals())),
            conditional_queue: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RelayId, RelayEntry>> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load every configured relay, switch all outputs off and then turn
    /// on the relays configured to start on. No conditionals fire.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let config = self.config_store.load()?;
        let now = self.clock.now();
        {
            let mut relays = self.table();
            relays.clear();
            for relay in &config.relays {
                let mut activation = Activation::Off { since: None };
                match relay.on_at_start {
                    None => {
                        if self.read_output(relay).unwrap_or(false) {
                            activation = Activation::OnUnbounded { since: now };
                        }
                        if let Err(e) = self.setup_output(relay, activation.is_on()) {
                            error!("Relay {} ({}) setup failed: {:#}", relay.id, relay.name, e);
                        }
                    }
                    Some(_) => {
                        if let Err(e) = self.setup_output(relay, false) {
                            error!("Relay {} ({}) setup failed: {:#}", relay.id, relay.name, e);
                        }
                    }
                }
                relays.insert(relay.id, RelayEntry::new(relay.clone(), activation));
            }
        }
        for relay in config.relays.iter().filter(|r| r.on_at_start == Some(true)) {
            match self.turn_on(relay.id, 0.0, false, 0.0) {
                Ok(()) => info!("Relay {} ({}) turned on at start", relay.id, relay.name),
                Err(e) => warn!("Relay {} could not be turned on at start: {}", relay.id, e),
            }
        }
        self.update_amp_gauge();
        info!("Relay service initialized with {} relays", config.relays.len());
        Ok(())
    }

    /// Run the expiry tick on its own thread until [`RelayService::stop`].
    /// Conditionals fired from then on are evaluated on a second thread,
    /// which the returned handle joins before it finishes.
    pub fn spawn(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel::<Fired>();
        let service = self.clone();
        let dispatcher = thread::Builder::new()
            .name("relay-conditionals".into())
            .spawn(move || {
                for fired in rx {
                    service.check_conditionals(&fired);
                }
                debug!("Relay conditional dispatch finished");
            })?;
        *self.conditional_queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        self.running.store(true, Ordering::SeqCst);
        let service = self.clone();
        let handle = thread::Builder::new()
            .name("relay-service".into())
            .spawn(move || {
                while service.running.load(Ordering::SeqCst) {
                    service.tick();
                    thread::sleep(service.tick);
                }
                service.conditional_queue.lock().unwrap_or_else(|e| e.into_inner()).take();
                if dispatcher.join().is_err() {
                    error!("Relay conditional dispatch panicked");
                }
                debug!("Relay tick loop finished");
            })?;
        Ok(handle)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Turn every relay off.
    pub fn shutdown(&self) {
        let ids: Vec<RelayId> = self.table().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.turn_off(id, false) {
                error!("Relay {} could not be turned off at shutdown: {}", id, e);
            }
        }
    }

    /// Switch off timed relays whose deadline has passed.
    pub fn tick(&self) {
        let now = self.clock.now();
        let mut switched = Switched::default();
        {
            let mut relays = self.table();
            for (id, entry) in relays.iter_mut() {
                if let Activation::OnTimed { until, .. } = entry.activation {
                    if now >= until {
                        debug!("Relay {} duration elapsed", id);
                        if let Err(e) = self.switch_off(entry, now, true, &mut switched) {
                            error!("{}", e);
                        }
                    }
                }
            }
        }
        self.finish(switched);
    }

    pub fn current_amp_load(&self) -> f64 {
        Self::load_of(&self.table(), None)
    }

    fn load_of(relays: &HashMap<RelayId, RelayEntry>, except: Option<RelayId>) -> f64 {
        relays
            .values()
            .filter(|e| e.activation.is_on() && Some(e.config.id) != except)
            .map(|e| e.config.amps)
            .sum()
    }

    /// Duty cycle of a PWM relay in percent.
    pub fn duty_cycle(&self, relay_id: RelayId) -> Result<f64, RelayError> {
        let relays = self.table();
        let entry = relays.get(&relay_id).ok_or(RelayError::UnknownRelay(relay_id))?;
        match entry.config.kind {
            RelayKind::Pwm => Ok(entry.duty),
            _ => Err(RelayError::NotPwm(relay_id)),
        }
    }

    /// Seconds the relay has been on in its current interval, 0 when off.
    pub fn sec_currently_on(&self, relay_id: RelayId) -> Result<f64, RelayError> {
        let now = self.clock.now();
        let relays = self.table();
        let entry = relays.get(&relay_id).ok_or(RelayError::UnknownRelay(relay_id))?;
        Ok(entry
            .activation
            .on_since()
            .map_or(0.0, |since| secs_between(since, now).max(0.0)))
    }

    pub fn activation(&self, relay_id: RelayId) -> Option<Activation> {
        self.table().get(&relay_id).map(|e| e.activation)
    }

    pub fn snapshot(&self) -> Vec<RelaySnapshot> {
        let mut relays: Vec<RelaySnapshot> = self
            .table()
            .values()
            .map(|e| RelaySnapshot {
                id: e.config.id,
                name: e.config.name.clone(),
                amps: e.config.amps,
                activation: e.activation,
                duty_cycle: match e.config.kind {
                    RelayKind::Pwm => Some(e.duty),
                    _ => None,
                },
            })
            .collect();
        relays.sort_by_key(|r| r.id);
        relays
    }

    /// Add a relay from configuration, or reload one already running. A
    /// reloaded relay is switched off first.
    pub fn add_mod_relay(&self, relay_id: RelayId, setup_pin: bool) -> anyhow::Result<()> {
        let config = self.config_store.load()?;
        let relay = config
            .relay(relay_id)
            .cloned()
            .with_context(|| format!("relay {} is not in the configuration", relay_id))?;
        let now = self.clock.now();
        let mut switched = Switched::default();
        {
            let mut relays = self.table();
            if let Some(entry) = relays.get_mut(&relay_id) {
                self.switch_off(entry, now, false, &mut switched)?;
            }
            if setup_pin {
                self.setup_output(&relay, false)?;
            }
            let since = match relays.get(&relay_id) {
                Some(entry) => match entry.activation {
                    Activation::Off { since } => since,
                    _ => Some(now),
                },
                None => None,
            };
            info!("Relay {} ({}) loaded", relay.id, relay.name);
            relays.insert(relay_id, RelayEntry::new(relay, Activation::Off { since }));
        }
        self.finish(switched);
        Ok(())
    }

    /// Switch a relay off and forget it.
    pub fn del_relay(&self, relay_id: RelayId) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut switched = Switched::default();
        let removed = {
            let mut relays = self.table();
            let entry = relays
                .get_mut(&relay_id)
                .ok_or(RelayError::UnknownRelay(relay_id))?;
            self.switch_off(entry, now, false, &mut switched)?;
            relays.remove(&relay_id)
        };
        self.finish(switched);
        if let Some(entry) = removed {
            if let (RelayKind::Wired, Some(pin)) = (entry.config.kind, entry.config.pin) {
                if let Err(e) = self.gpio.release(pin) {
                    warn!("Could not release pin {}: {:#}", pin, e);
                }
            }
            info!("Relay {} ({}) deleted", relay_id, entry.config.name);
        }
        Ok(())
    }

    pub fn relay_setup(&self, action: SetupAction, relay_id: RelayId) -> anyhow::Result<()> {
        match action {
            SetupAction::Add | SetupAction::Modify => self.add_mod_relay(relay_id, true),
            SetupAction::Delete => self.del_relay(relay_id),
        }
    }

    /// Reload relay conditionals and swap the table in one step.
    pub fn refresh_conditionals(&self) -> anyhow::Result<usize> {
        let table = Arc::new(self.config_store.load()?.active_relay_conditionals());
        let count = table.len();
        *self.conditionals.write().unwrap_or_else(|e| e.into_inner()) = table;
        info!("Relay conditionals refreshed ({} active)", count);
        Ok(count)
    }

    fn setup_output(&self, relay: &RelayConfig, on: bool) -> anyhow::Result<()> {
        match relay.kind {
            RelayKind::Wired => {
                if let Some(pin) = relay.pin {
                    self.gpio.setup_output(pin, on == relay.trigger)?;
                }
            }
            RelayKind::Pwm => {
                if let Some(channel) = relay.pwm {
                    self.gpio.set_pwm(channel, if on { 100.0 } else { 0.0 })?;
                }
            }
            RelayKind::Command => {}
        }
        Ok(())
    }

    fn read_output(&self, relay: &RelayConfig) -> anyhow::Result<bool> {
        let pin = relay.pin.context("relay has no pin")?;
        Ok(self.gpio.read(pin)? == relay.trigger)
    }

    fn check_switchable(config: &RelayConfig) -> Result<(), RelayError> {
        let ok = match config.kind {
            RelayKind::Wired => config.pin.is_some(),
            RelayKind::Command => config.on_command.is_some() && config.off_command.is_some(),
            RelayKind::Pwm => config.pwm.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(RelayError::NotConfigured(config.id))
        }
    }

    fn drive(&self, config: &RelayConfig, on: bool) -> Result<(), RelayError> {
        self.drive_duty(config, if on { 100.0 } else { 0.0 })
    }

    /// Full duty is on and zero is off for relays without PWM.
    fn drive_duty(&self, config: &RelayConfig, duty: f64) -> Result<(), RelayError> {
        let on = duty > 0.0;
        let result = match config.kind {
            RelayKind::Wired => match config.pin {
                Some(pin) => self.gpio.write(pin, on == config.trigger),
                None => return Err(RelayError::NotConfigured(config.id)),
            },
            RelayKind::Command => {
                let command = if on {
                    &config.on_command
                } else {
                    &config.off_command
                };
                match command {
                    Some(command) => run_command(command).and_then(|output| {
                        if output.success {
                            Ok(())
                        } else {
                            Err(anyhow::anyhow!(
                                "'{}' exited with {:?}: {}",
                                command,
                                output.code,
                                output.stderr
                            ))
                        }
                    }),
                    None => return Err(RelayError::NotConfigured(config.id)),
                }
            }
            RelayKind::Pwm => match config.pwm {
                Some(channel) => self.gpio.set_pwm(channel, duty),
                None => return Err(RelayError::NotConfigured(config.id)),
            },
        };
        result.map_err(|source| RelayError::Hardware {
            id: config.id,
            source,
        })
    }

    /// Switch one entry off under the table lock. An entry that is already
    /// off with its output off is left alone.
    fn switch_off(
        &self,
        entry: &mut RelayEntry,
        now: DateTime<Local>,
        trigger_conditionals: bool,
        switched: &mut Switched,
    ) -> Result<(), RelayError> {
        let was_on = entry.activation.is_on();
        if !was_on {
            let energized = match entry.config.kind {
                RelayKind::Wired => self.read_output(&entry.config).unwrap_or(false),
                RelayKind::Pwm => entry.duty > 0.0,
                RelayKind::Command => false,
            };
            if !energized {
                return Ok(());
            }
        }
        Self::check_switchable(&entry.config)?;
        self.drive(&entry.config, false)?;
        if let Some(started) = entry.activation.on_since() {
            switched.facts.push(Fact::interval(entry.config.id, started, now));
        }
        if entry.config.kind == RelayKind::Pwm {
            switched.facts.push(Fact {
                relay_id: entry.config.id,
                measurement: DUTY_CYCLE_MEASUREMENT,
                at: now,
                value: 0.0,
            });
        }
        entry.activation = Activation::Off { since: Some(now) };
        entry.duty = 0.0;
        RELAY_SWITCHES
            .with_label_values(&[&entry.config.id.to_string(), "off"])
            .inc();
        info!("Relay {} ({}) turned off", entry.config.id, entry.config.name);
        if trigger_conditionals && was_on {
            switched.fired.push(Fired {
                relay_id: entry.config.id,
                pin: entry.config.pin,
                state: RelayState::Off,
                duration: 0.0,
            });
        }
        Ok(())
    }

    fn try_turn_on(
        &self,
        relay_id: RelayId,
        duration: f64,
        trigger_conditionals: bool,
        min_off_duration: f64,
    ) -> Result<Switched, RelayError> {
        let now = self.clock.now();
        // Nothing may be written until the deadline is known to exist
        let until = if duration > 0.0 {
            Some(checked_after(now, duration).ok_or(RelayError::InvalidDuration {
                id: relay_id,
                duration,
            })?)
        } else if !duration.is_finite() {
            return Err(RelayError::InvalidDuration {
                id: relay_id,
                duration,
            });
        } else {
            None
        };
        let mut switched = Switched::default();
        let mut relays = self.table();
        let (config, activation) = {
            let entry = relays.get(&relay_id).ok_or(RelayError::UnknownRelay(relay_id))?;
            (entry.config.clone(), entry.activation)
        };
        Self::check_switchable(&config)?;
        if duration <= 0.0 {
            if let Activation::OnUnbounded { .. } = activation {
                return Err(RelayError::AlreadyOn(relay_id));
            }
        }
        if min_off_duration > 0.0 {
            if let Activation::Off { since: Some(off) } = activation {
                let off_for = secs_between(off, now);
                if off_for < min_off_duration {
                    return Err(RelayError::MinOffDuration {
                        id: relay_id,
                        remaining: min_off_duration - off_for,
                    });
                }
            }
        }
        let requested = Self::load_of(&relays, Some(relay_id)) + config.amps;
        if requested > self.max_amps {
            return Err(RelayError::OverCurrent {
                id: relay_id,
                requested,
                max: self.max_amps,
            });
        }
        if let Some(opposing) = config.opposing_relay_id {
            if let Some(other) = relays.get_mut(&opposing) {
                if other.activation.is_on() {
                    info!("Relay {} turning on, switching opposing relay {} off", relay_id, opposing);
                    self.switch_off(other, now, trigger_conditionals, &mut switched)?;
                }
            }
        }
        self.drive(&config, true)?;
        if let Some(started) = activation.on_since() {
            switched.facts.push(Fact::interval(relay_id, started, now));
        }
        let entry = relays
            .get_mut(&relay_id)
            .ok_or(RelayError::UnknownRelay(relay_id))?;
        entry.activation = match until {
            Some(until) => Activation::OnTimed {
                started: now,
                until,
                duration,
            },
            None => Activation::OnUnbounded { since: now },
        };
        entry.duty = 100.0;
        RELAY_SWITCHES
            .with_label_values(&[&relay_id.to_string(), "on"])
            .inc();
        if duration > 0.0 {
            info!("Relay {} ({}) on for {:.1} s", relay_id, config.name, duration);
        } else {
            info!("Relay {} ({}) on", relay_id, config.name);
        }
        if trigger_conditionals {
            switched.fired.push(Fired {
                relay_id,
                pin: config.pin,
                state: RelayState::On,
                duration,
            });
        }
        Ok(switched)
    }

    fn try_set_duty_cycle(&self, relay_id: RelayId, duty: f64) -> Result<Switched, RelayError> {
        if !duty.is_finite() || !(0.0..=100.0).contains(&duty) {
            return Err(RelayError::InvalidDutyCycle { id: relay_id, duty });
        }
        let now = self.clock.now();
        let mut switched = Switched::default();
        let mut relays = self.table();
        let (config, activation) = {
            let entry = relays.get(&relay_id).ok_or(RelayError::UnknownRelay(relay_id))?;
            (entry.config.clone(), entry.activation)
        };
        if config.kind != RelayKind::Pwm {
            return Err(RelayError::NotPwm(relay_id));
        }
        Self::check_switchable(&config)?;
        if duty == 0.0 {
            if let Some(entry) = relays.get_mut(&relay_id) {
                self.switch_off(entry, now, true, &mut switched)?;
            }
            return Ok(switched);
        }
        if !activation.is_on() {
            let requested = Self::load_of(&relays, Some(relay_id)) + config.amps;
            if requested > self.max_amps {
                return Err(RelayError::OverCurrent {
                    id: relay_id,
                    requested,
                    max: self.max_amps,
                });
            }
        }
        self.drive_duty(&config, duty)?;
        let entry = relays
            .get_mut(&relay_id)
            .ok_or(RelayError::UnknownRelay(relay_id))?;
        entry.duty = duty;
        switched.facts.push(Fact {
            relay_id,
            measurement: DUTY_CYCLE_MEASUREMENT,
            at: now,
            value: duty,
        });
        if !activation.is_on() {
            entry.activation = Activation::OnUnbounded { since: now };
            RELAY_SWITCHES
                .with_label_values(&[&relay_id.to_string(), "on"])
                .inc();
            info!("Relay {} ({}) on at {:.1} %", relay_id, config.name, duty);
            switched.fired.push(Fired {
                relay_id,
                pin: config.pin,
                state: RelayState::On,
                duration: 0.0,
            });
        } else {
            debug!("Relay {} duty cycle {:.1} %", relay_id, duty);
        }
        Ok(switched)
    }

    /// Persist facts and evaluate conditionals once the table lock is gone.
    fn finish(&self, switched: Switched) {
        for fact in switched.facts {
            self.persister.persist_value(
                &relay_entity(fact.relay_id),
                fact.measurement,
                fact.value,
                fact.at.with_timezone(&Utc),
            );
        }
        self.update_amp_gauge();
        for fired in switched.fired {
            self.dispatch(fired);
        }
    }

    /// Queue a transition for the dispatch thread, or evaluate it here when
    /// the service was never spawned.
    fn dispatch(&self, fired: Fired) {
        let queued = match &*self.conditional_queue.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(tx) => tx.send(fired).map_err(|e| e.0),
            None => Err(fired),
        };
        if let Err(fired) = queued {
            self.check_conditionals(&fired);
        }
    }

    fn check_conditionals(&self, fired: &Fired) {
        let table = self
            .conditionals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for conditional in table.iter().filter(|c| {
            c.if_relay_id == fired.relay_id
                && c.if_relay_state == fired.state
                && (fired.state == RelayState::Off
                    || (c.if_relay_duration - fired.duration).abs() < f64::EPSILON)
        }) {
            let firing = Firing::new(
                &format!("Relay conditional {}", conditional.id),
                format!(
                    "Relay conditional {} ({}): relay {} turned {}{}",
                    conditional.id,
                    conditional.name,
                    fired.relay_id,
                    fired.state,
                    if fired.duration > 0.0 {
                        format!(" for {} s", fired.duration)
                    } else {
                        String::new()
                    }
                ),
            )
            .with(
                "output_pin",
                fired.pin.map(|p| p.to_string()).unwrap_or_default(),
            )
            .with("output_action", fired.state.to_string())
            .with("output_duration", fired.duration.to_string());
            self.actions.execute(self, &firing, &conditional.actions);
        }
    }

    fn update_amp_gauge(&self) {
        AMP_LOAD.set(self.current_amp_load());
    }

    fn refused(&self, relay_id: RelayId, error: &RelayError) {
        RELAY_REFUSALS
            .with_label_values(&[&relay_id.to_string(), error.reason()])
            .inc();
        match error {
            RelayError::MinOffDuration { .. } => debug!("Relay {} not turned on: {}", relay_id, error),
            RelayError::Hardware { .. } => error!("{}", error),
            _ => warn!("Relay {} not switched: {}", relay_id, error),
        }
    }
}

impl RelayControl for RelayService {
    fn turn_on(
        &self,
        relay_id: RelayId,
        duration: f64,
        trigger_conditionals: bool,
        min_off_duration: f64,
    ) -> Result<(), RelayError> {
        match self.try_turn_on(relay_id, duration, trigger_conditionals, min_off_duration) {
            Ok(switched) => {
                self.finish(switched);
                Ok(())
            }
            Err(e) => {
                self.refused(relay_id, &e);
                Err(e)
            }
        }
    }

    fn turn_off(&self, relay_id: RelayId, trigger_conditionals: bool) -> Result<(), RelayError> {
        let now = self.clock.now();
        let mut switched = Switched::default();
        let result = {
            let mut relays = self.table();
            match relays.get_mut(&relay_id) {
                Some(entry) => self.switch_off(entry, now, trigger_conditionals, &mut switched),
                None => Err(RelayError::UnknownRelay(relay_id)),
            }
        };
        match result {
            Ok(()) => {
                self.finish(switched);
                Ok(())
            }
            Err(e) => {
                self.refused(relay_id, &e);
                Err(e)
            }
        }
    }

    fn set_duty_cycle(&self, relay_id: RelayId, duty: f64) -> Result<(), RelayError> {
        match self.try_set_duty_cycle(relay_id, duty) {
            Ok(switched) => {
                self.finish(switched);
                Ok(())
            }
            Err(e) => {
                self.refused(relay_id, &e);
                Err(e)
            }
        }
    }

    /// Wired relays report their output level, the others their bookkeeping.
    fn relay_state(&self, relay_id: RelayId) -> Result<RelayState, RelayError> {
        let relays = self.table();
        let entry = relays.get(&relay_id).ok_or(RelayError::UnknownRelay(relay_id))?;
        let on = match entry.config.kind {
            RelayKind::Wired => self
                .read_output(&entry.config)
                .map_err(|source| RelayError::Hardware {
                    id: relay_id,
                    source,
                })?,
            RelayKind::Command | RelayKind::Pwm => entry.activation.is_on(),
        };
        Ok(if on { RelayState::On } else { RelayState::Off })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        conditional::Collaborators,
        config::{Action, DaemonConfig, StaticConfigStore},
        controllers::NoLcds,
        gpio::MockGpio,
        notify::{Camera, RecordingMailer},
        store::MemoryStore,
    };
    use crate::clock::Clock;
    use crate::gpio::PwmChannel;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::{path::PathBuf, time::Instant};

    struct NoCamera;

    impl Camera for NoCamera {
        fn capture(&self, _: crate::config::CaptureKind) -> anyhow::Result<PathBuf> {
            bail!("no camera")
        }
    }

    struct Rig {
        service: Arc<RelayService>,
        gpio: Arc<MockGpio>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        config: Arc<StaticConfigStore>,
    }

    fn relay(id: RelayId, pin: u64, amps: f64) -> RelayConfig {
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

    fn rig(config: DaemonConfig) -> Rig {
        let gpio = Arc::new(MockGpio::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap(),
        ));
        let config = Arc::new(StaticConfigStore::new(config));
        let actions = ActionExecutor::new(
            Collaborators {
                mailer: Arc::new(RecordingMailer::new()),
                camera: Arc::new(NoCamera),
                lcds: Arc::new(NoLcds),
            },
            2,
            clock.clone(),
        );
        let service = Arc::new(
            RelayService::new(
                gpio.clone(),
                config.clone(),
                Arc::new(Persister::synchronous(store.clone())),
                clock.clone(),
                actions,
            )
            .unwrap(),
        );
        service.initialize().unwrap();
        Rig {
            service,
            gpio,
            store,
            clock,
            config,
        }
    }

    fn pwm_relay(id: RelayId, channel: u32, amps: f64) -> RelayConfig {
        RelayConfig {
            kind: RelayKind::Pwm,
            pin: None,
            pwm: Some(PwmChannel {
                chip: 0,
                channel,
                hertz: 1000.0,
            }),
            ..relay(id, 0, amps)
        }
    }

    fn basic() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.misc.max_amps = 10.0;
        config.relays = vec![relay(1, 17, 6.0), relay(2, 27, 5.0), relay(3, 22, 1.0)];
        config
    }

    #[test]
    fn unbounded_on_then_off_records_interval() {
        let rig = rig(basic());
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        assert_eq!(rig.service.relay_state(1).unwrap(), RelayState::On);
        assert!(rig.gpio.level(17).unwrap());
        assert!(matches!(
            rig.service.turn_on(1, 0.0, true, 0.0),
            Err(RelayError::AlreadyOn(1))
        ));
        rig.clock.advance(ChronoDuration::seconds(30));
        assert_eq!(rig.service.sec_currently_on(1).unwrap(), 30.0);
        rig.service.turn_off(1, true).unwrap();
        assert_eq!(rig.service.relay_state(1).unwrap(), RelayState::Off);
        let facts = rig.store.records("relay_1", DURATION_MEASUREMENT);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 30.0);
        assert_eq!(
            facts[0].timestamp,
            Local.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap().with_timezone(&Utc)
        );
    }

    #[test]
    fn over_current_is_refused_without_touching_state() {
        let rig = rig(basic());
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        let writes = rig.gpio.writes().len();
        assert!(matches!(
            rig.service.turn_on(2, 20.0, true, 0.0),
            Err(RelayError::OverCurrent { .. })
        ));
        assert_eq!(rig.gpio.writes().len(), writes);
        assert_eq!(rig.service.relay_state(2).unwrap(), RelayState::Off);
        assert_eq!(rig.service.current_amp_load(), 6.0);
        rig.service.turn_on(3, 0.0, true, 0.0).unwrap();
        assert_eq!(rig.service.current_amp_load(), 7.0);
    }

    #[test]
    fn rearming_a_timed_relay_splits_the_interval() {
        let rig = rig(basic());
        rig.service.turn_on(3, 60.0, true, 0.0).unwrap();
        rig.clock.advance(ChronoDuration::seconds(20));
        rig.service.turn_on(3, 60.0, true, 0.0).unwrap();
        let facts = rig.store.records("relay_3", DURATION_MEASUREMENT);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 20.0);
        match rig.service.activation(3).unwrap() {
            Activation::OnTimed { until, .. } => {
                assert_eq!(until, rig.clock.now() + ChronoDuration::seconds(60))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timed_relay_can_become_unbounded() {
        let rig = rig(basic());
        rig.service.turn_on(3, 60.0, true, 0.0).unwrap();
        rig.clock.advance(ChronoDuration::seconds(5));
        rig.service.turn_on(3, 0.0, true, 0.0).unwrap();
        assert!(matches!(
            rig.service.activation(3),
            Some(Activation::OnUnbounded { .. })
        ));
        rig.clock.advance(ChronoDuration::seconds(120));
        rig.service.tick();
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
    }

    #[test]
    fn min_off_duration_counts_from_last_off() {
        let rig = rig(basic());
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        rig.service.turn_off(1, true).unwrap();
        rig.clock.advance(ChronoDuration::seconds(30));
        assert!(matches!(
            rig.service.turn_on(1, 10.0, true, 60.0),
            Err(RelayError::MinOffDuration { .. })
        ));
        rig.clock.advance(ChronoDuration::seconds(31));
        rig.service.turn_on(1, 10.0, true, 60.0).unwrap();
    }

    #[test]
    fn opposing_relay_is_switched_off_first() {
        let mut config = basic();
        config.relays[0].opposing_relay_id = Some(3);
        let rig = rig(config);
        rig.service.turn_on(3, 0.0, true, 0.0).unwrap();
        rig.service.turn_on(1, 10.0, true, 0.0).unwrap();
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::Off);
        assert_eq!(rig.service.relay_state(1).unwrap(), RelayState::On);
    }

    #[test]
    fn conditionals_require_exact_duration() {
        let mut config = basic();
        config.relay_conditionals = vec![RelayConditional {
            id: 1,
            name: "chain".into(),
            is_activated: true,
            if_relay_id: 1,
            if_relay_state: RelayState::On,
            if_relay_duration: 10.0,
            actions: vec![Action::Relay {
                relay_id: 3,
                state: RelayState::On,
                duration: 0.0,
            }],
        }];
        let rig = rig(config);
        rig.service.turn_on(1, 5.0, true, 0.0).unwrap();
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::Off);
        rig.service.turn_on(1, 10.0, true, 0.0).unwrap();
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
    }

    #[test]
    fn conditional_refresh_swaps_table() {
        let rig = rig(basic());
        rig.config.update(|c| {
            c.relay_conditionals = vec![RelayConditional {
                id: 2,
                name: "off chain".into(),
                is_activated: true,
                if_relay_id: 1,
                if_relay_state: RelayState::Off,
                if_relay_duration: 0.0,
                actions: vec![Action::Relay {
                    relay_id: 3,
                    state: RelayState::On,
                    duration: 0.0,
                }],
            }]
        });
        assert_eq!(rig.service.refresh_conditionals().unwrap(), 1);
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        rig.service.turn_off(1, true).unwrap();
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
    }

    #[test]
    fn start_up_honours_on_at_start() {
        let mut config = basic();
        config.relays[2].on_at_start = Some(true);
        config.relays[1].on_at_start = Some(false);
        let rig = rig(config);
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
        assert_eq!(rig.service.relay_state(2).unwrap(), RelayState::Off);
    }

    #[test]
    fn delete_switches_off_before_forgetting() {
        let rig = rig(basic());
        rig.service.turn_on(2, 0.0, true, 0.0).unwrap();
        rig.service.relay_setup(SetupAction::Delete, 2).unwrap();
        assert_eq!(rig.gpio.writes().last(), Some(&(27, false)));
        assert!(matches!(
            rig.service.relay_state(2),
            Err(RelayError::UnknownRelay(2))
        ));
    }

    #[test]
    fn modify_reloads_configuration() {
        let rig = rig(basic());
        rig.service.turn_on(2, 0.0, true, 0.0).unwrap();
        rig.config.update(|c| c.relays[1].amps = 2.0);
        rig.service.relay_setup(SetupAction::Modify, 2).unwrap();
        assert_eq!(rig.service.relay_state(2).unwrap(), RelayState::Off);
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        rig.service.turn_on(2, 0.0, true, 0.0).unwrap();
        assert_eq!(rig.service.current_amp_load(), 8.0);
    }

    #[test]
    fn relay_without_pin_is_refused() {
        let mut config = basic();
        config.relays[2].pin = None;
        let rig = rig(config);
        assert!(matches!(
            rig.service.turn_on(3, 0.0, true, 0.0),
            Err(RelayError::NotConfigured(3))
        ));
        assert!(matches!(
            rig.service.turn_on(42, 0.0, true, 0.0),
            Err(RelayError::UnknownRelay(42))
        ));
    }

    #[test]
    fn inverted_trigger_drives_low_for_on() {
        let mut config = basic();
        config.relays[2].trigger = false;
        let rig = rig(config);
        assert_eq!(rig.gpio.level(22), Some(true));
        rig.service.turn_on(3, 0.0, true, 0.0).unwrap();
        assert_eq!(rig.gpio.level(22), Some(false));
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
    }

    #[test]
    fn unrepresentable_duration_is_refused_before_switching() {
        let rig = rig(basic());
        let writes = rig.gpio.writes().len();
        for duration in &[1e13, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                rig.service.turn_on(1, *duration, true, 0.0),
                Err(RelayError::InvalidDuration { id: 1, .. })
            ));
        }
        assert_eq!(rig.gpio.writes().len(), writes);
        assert_eq!(rig.gpio.level(17), Some(false));
        assert_eq!(rig.service.activation(1), Some(Activation::Off { since: None }));
        assert_eq!(rig.service.current_amp_load(), 0.0);
        rig.service.turn_on(1, 10.0, true, 0.0).unwrap();
    }

    #[test]
    fn pwm_relay_follows_duty_cycle() {
        let mut config = basic();
        config.relays.push(pwm_relay(4, 1, 2.0));
        let rig = rig(config);
        assert_eq!(rig.gpio.duty_cycle(0, 1), Some(0.0));

        rig.service.set_duty_cycle(4, 40.0).unwrap();
        assert_eq!(rig.gpio.duty_cycle(0, 1), Some(40.0));
        assert_eq!(rig.service.relay_state(4).unwrap(), RelayState::On);
        assert_eq!(rig.service.current_amp_load(), 2.0);
        rig.clock.advance(ChronoDuration::seconds(10));
        rig.service.set_duty_cycle(4, 75.0).unwrap();
        assert_eq!(rig.service.duty_cycle(4).unwrap(), 75.0);
        let duties: Vec<f64> = rig
            .store
            .records("relay_4", DUTY_CYCLE_MEASUREMENT)
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(duties, vec![40.0, 75.0]);

        rig.service.set_duty_cycle(4, 0.0).unwrap();
        assert_eq!(rig.gpio.duty_cycle(0, 1), Some(0.0));
        assert_eq!(rig.service.relay_state(4).unwrap(), RelayState::Off);
        let facts = rig.store.records("relay_4", DURATION_MEASUREMENT);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 10.0);
    }

    #[test]
    fn duty_cycle_is_refused_for_bad_values_and_other_kinds() {
        let mut config = basic();
        config.relays.push(pwm_relay(4, 1, 5.0));
        let rig = rig(config);
        assert!(matches!(
            rig.service.set_duty_cycle(4, 120.0),
            Err(RelayError::InvalidDutyCycle { .. })
        ));
        assert!(matches!(
            rig.service.set_duty_cycle(4, f64::NAN),
            Err(RelayError::InvalidDutyCycle { .. })
        ));
        assert!(matches!(
            rig.service.set_duty_cycle(1, 50.0),
            Err(RelayError::NotPwm(1))
        ));
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        assert!(matches!(
            rig.service.set_duty_cycle(4, 50.0),
            Err(RelayError::OverCurrent { .. })
        ));
        assert_eq!(rig.gpio.duty_cycle(0, 1), Some(0.0));
    }

    #[test]
    fn spawned_service_runs_conditionals_off_the_caller() {
        let mut config = basic();
        config.relay_conditionals = vec![RelayConditional {
            id: 1,
            name: "slow chain".into(),
            is_activated: true,
            if_relay_id: 1,
            if_relay_state: RelayState::On,
            if_relay_duration: 0.0,
            actions: vec![
                Action::Command {
                    command: "sleep 1".into(),
                },
                Action::Relay {
                    relay_id: 3,
                    state: RelayState::On,
                    duration: 0.0,
                },
            ],
        }];
        let rig = rig(config);
        let handle = rig.service.spawn().unwrap();

        let started = Instant::now();
        rig.service.turn_on(1, 0.0, true, 0.0).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::Off);

        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.gpio.level(22) != Some(true) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(rig.service.relay_state(3).unwrap(), RelayState::On);
        rig.service.stop();
        handle.join().unwrap();
    }
}
