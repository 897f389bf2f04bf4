//! Periodic sensor acquisition and the conditionals attached to a sensor.
use crate::{
    clock::{checked_after, secs_between, seconds, SharedClock, Ticker},
    conditional::{ActionExecutor, Firing},
    config::{ConfigStore, SensorConditional, SensorConfig, SensorDevice, SensorTrigger, Threshold},
    controllers::{RelayControl, Worker},
    drivers::SensorDriver,
    gpio::{EdgeWatcher, GpioBackend},
    metrics::SENSOR_READ_FAILURES,
    store::{sensor_entity, Measurement, Persister},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

pub const EDGE_MEASUREMENT: &str = "edge";

/// A sensor's conditional table. Refreshes build a complete new table and
/// swap it in, so readers always see a consistent set.
#[derive(Debug)]
pub struct SensorControl {
    sensor_id: u32,
    table: RwLock<Arc<Vec<SensorConditional>>>,
}

impl SensorControl {
    pub fn new(sensor_id: u32, conditionals: Vec<SensorConditional>) -> Self {
        Self {
            sensor_id,
            table: RwLock::new(Arc::new(conditionals)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<SensorConditional>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, conditionals: Vec<SensorConditional>) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(conditionals);
    }

    /// Reload this sensor's conditionals after `conditional_id` was added,
    /// modified or deleted.
    pub fn refresh(&self, store: &dyn ConfigStore, mod_kind: &str, conditional_id: u32) -> Result<String> {
        let conditionals = store.load()?.sensor_conditionals_for(self.sensor_id);
        let count = conditionals.len();
        self.replace(conditionals);
        let message = format!(
            "Sensor {} conditional {} refreshed after {} ({} active)",
            self.sensor_id, conditional_id, mod_kind, count
        );
        info!("{}", message);
        Ok(message)
    }
}

/// Collaborators a sensor worker is built with.
#[derive(Clone)]
pub struct SensorDeps {
    pub relays: Arc<dyn RelayControl>,
    pub persister: Arc<Persister>,
    pub gpio: Arc<dyn GpioBackend>,
    pub clock: SharedClock,
}

/// State used both by the polling loop and by the edge callback thread.
struct Shared {
    config: SensorConfig,
    entity: String,
    deps: SensorDeps,
    actions: ActionExecutor,
    control: Arc<SensorControl>,
    last_edge: Mutex<Option<DateTime<Local>>>,
}

impl Shared {
    fn fire(&self, conditional: &SensorConditional, message: String, value: Option<f64>) {
        let firing = Firing::new(&format!("Sensor conditional {}", conditional.id), message)
            .with("sensor_id", self.config.id.to_string())
            .with(
                "value",
                value.map(|v| v.to_string()).unwrap_or_default(),
            );
        self.actions
            .execute(self.deps.relays.as_ref(), &firing, &conditional.actions);
    }

    fn on_edge(&self, rising: bool) {
        let edge_config = match &self.config.edge {
            Some(edge) => edge,
            None => return,
        };
        if !edge_config.edge.matches(rising) {
            return;
        }
        let now = self.deps.clock.now();
        {
            let mut last = self.last_edge.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *last {
                if secs_between(previous, now) < edge_config.reset_period {
                    debug!("Sensor {}: edge inside reset period ignored", self.config.id);
                    return;
                }
            }
            *last = Some(now);
        }
        let value = if rising { 1.0 } else { -1.0 };
        self.deps.persister.persist_value(
            &self.entity,
            EDGE_MEASUREMENT,
            value,
            now.with_timezone(&Utc),
        );
        for conditional in self.control.snapshot().iter() {
            if let SensorTrigger::Edge { edge } = conditional.trigger {
                if edge.matches(rising) {
                    self.fire(
                        conditional,
                        format!(
                            "Sensor conditional {} ({}): {} edge on sensor {}",
                            conditional.id,
                            conditional.name,
                            if rising { "rising" } else { "falling" },
                            self.config.id
                        ),
                        Some(value),
                    );
                }
            }
        }
    }
}

enum Phase {
    Idle,
    PreActivating { until: DateTime<Local> },
}

pub struct SensorWorker {
    shared: Arc<Shared>,
    driver: Option<Box<dyn SensorDriver>>,
    ticker: Ticker,
    phase: Phase,
    max_age: f64,
    last_fired: HashMap<u32, DateTime<Local>>,
    state_tickers: HashMap<u32, Ticker>,
    watcher: Option<EdgeWatcher>,
}

impl SensorWorker {
    pub fn new(
        config: SensorConfig,
        driver: Option<Box<dyn SensorDriver>>,
        conditionals: Vec<SensorConditional>,
        actions: ActionExecutor,
        deps: SensorDeps,
    ) -> SensorWorker {
        let ticker = Ticker::new(seconds(config.period), deps.clock.now());
        let max_age = 1.5 * config.period;
        let control = Arc::new(SensorControl::new(config.id, conditionals));
        SensorWorker {
            shared: Arc::new(Shared {
                entity: sensor_entity(config.id),
                config,
                deps,
                actions,
                control,
                last_edge: Mutex::new(None),
            }),
            driver,
            ticker,
            phase: Phase::Idle,
            max_age,
            last_fired: HashMap::new(),
            state_tickers: HashMap::new(),
            watcher: None,
        }
    }

    pub fn control(&self) -> Arc<SensorControl> {
        self.shared.control.clone()
    }

    fn config(&self) -> &SensorConfig {
        &self.shared.config
    }

    fn pin(&self) -> Result<u64> {
        self.config()
            .location
            .trim()
            .parse()
            .with_context(|| format!("sensor {} location is not a GPIO pin", self.config().id))
    }

    fn sample(&mut self, now: DateTime<Local>) {
        let id = self.config().id;
        let driver = match self.driver.as_mut() {
            Some(driver) => driver,
            None => return,
        };
        let measurements = match driver.acquire() {
            Ok(measurements) if !measurements.is_empty() => measurements,
            Ok(_) => {
                debug!("Sensor {}: no measurements returned", id);
                SENSOR_READ_FAILURES.with_label_values(&[&id.to_string()]).inc();
                return;
            }
            Err(e) => {
                debug!("Sensor {}: could not acquire measurement: {:#}", id, e);
                SENSOR_READ_FAILURES.with_label_values(&[&id.to_string()]).inc();
                return;
            }
        };
        let timestamp = now.with_timezone(&Utc);
        let store = self.shared.deps.persister.store().clone();
        // One failed write does not hold back the rest of the sample
        let mut failed = 0;
        for (name, value) in &measurements {
            let fact = Measurement::new(&self.shared.entity, name, *value, timestamp);
            if let Err(e) = store.write(&fact) {
                error!("Sensor {}: could not store {}: {:#}", id, name, e);
                failed += 1;
            }
        }
        if failed > 0 {
            SENSOR_READ_FAILURES.with_label_values(&[&id.to_string()]).inc();
            warn!("Sensor {}: {} of {} measurements not stored", id, failed, measurements.len());
        }
        debug!("Sensor {}: {:?}", id, measurements);
        self.check_conditionals(now);
    }

    /// Evaluate threshold conditionals against the latest stored values.
    fn check_conditionals(&mut self, now: DateTime<Local>) {
        let store = self.shared.deps.persister.store().clone();
        for conditional in self.shared.control.snapshot().iter() {
            let (measurement, direction, setpoint) = match &conditional.trigger {
                SensorTrigger::Measurement {
                    measurement,
                    direction,
                    setpoint,
                } => (measurement, *direction, *setpoint),
                _ => continue,
            };
            if let Some(last) = self.last_fired.get(&conditional.id) {
                if secs_between(*last, now) < conditional.period {
                    continue;
                }
            }
            let latest = match store.read_latest(&self.shared.entity, measurement) {
                Ok(Some(m)) if secs_between(m.timestamp.with_timezone(&Local), now) <= self.max_age => m,
                Ok(_) => {
                    debug!(
                        "Sensor conditional {}: no recent {} to compare",
                        conditional.id, measurement
                    );
                    continue;
                }
                Err(e) => {
                    warn!("Sensor conditional {}: {:#}", conditional.id, e);
                    continue;
                }
            };
            let triggered = match direction {
                Threshold::Above => latest.value > setpoint,
                Threshold::Below => latest.value < setpoint,
            };
            if triggered {
                self.last_fired.insert(conditional.id, now);
                self.shared.fire(
                    conditional,
                    format!(
                        "Sensor conditional {} ({}): {} {:.2} is {} {:.2}",
                        conditional.id,
                        conditional.name,
                        measurement,
                        latest.value,
                        match direction {
                            Threshold::Above => "above",
                            Threshold::Below => "below",
                        },
                        setpoint
                    ),
                    Some(latest.value),
                );
            }
        }
    }

    /// GPIO state conditionals are polled on their own periods.
    fn check_gpio_state(&mut self, now: DateTime<Local>) {
        let table = self.shared.control.snapshot();
        for conditional in table.iter() {
            let wanted = match conditional.trigger {
                SensorTrigger::GpioState { state } => state,
                _ => continue,
            };
            let ticker = self
                .state_tickers
                .entry(conditional.id)
                .or_insert_with(|| Ticker::new(seconds(conditional.period), now));
            if !ticker.ready(now) {
                continue;
            }
            let level = match self.pin().and_then(|pin| self.shared.deps.gpio.read(pin)) {
                Ok(level) => level,
                Err(e) => {
                    debug!("Sensor conditional {}: {:#}", conditional.id, e);
                    continue;
                }
            };
            if level == wanted {
                self.shared.fire(
                    conditional,
                    format!(
                        "Sensor conditional {} ({}): pin of sensor {} is {}",
                        conditional.id,
                        conditional.name,
                        self.config().id,
                        if level { "high" } else { "low" }
                    ),
                    Some(if level { 1.0 } else { 0.0 }),
                );
            }
        }
    }
}

impl Worker for SensorWorker {
    fn name(&self) -> String {
        format!("Sensor {}", self.config().id)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.config().device == SensorDevice::Edge {
            let edge = self
                .config()
                .edge
                .clone()
                .with_context(|| format!("sensor {} has no edge section", self.config().id))?;
            let pin = self.pin()?;
            let shared = self.shared.clone();
            self.watcher = Some(EdgeWatcher::spawn(
                self.shared.deps.gpio.clone(),
                pin,
                edge.edge,
                Duration::from_millis(edge.bounce_ms),
                move |rising| shared.on_edge(rising),
            )?);
            info!("Sensor {}: watching pin {} for {:?} edges", self.config().id, pin, edge.edge);
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let now = self.shared.deps.clock.now();
        match self.phase {
            Phase::Idle => {
                if self.driver.is_some() && self.ticker.ready(now) {
                    let pre = self
                        .config()
                        .pre_relay_id
                        .filter(|_| self.config().pre_relay_duration > 0.0);
                    match pre {
                        Some(relay_id) => {
                            let duration = self.config().pre_relay_duration;
                            if let Err(e) = self.shared.deps.relays.turn_on(relay_id, duration, true, 0.0) {
                                warn!("Sensor {}: pre-read relay: {}", self.config().id, e);
                            }
                            self.phase = match checked_after(now, duration) {
                                Some(until) => Phase::PreActivating { until },
                                None => {
                                    self.sample(now);
                                    Phase::Idle
                                }
                            };
                        }
                        None => self.sample(now),
                    }
                }
            }
            Phase::PreActivating { until } => {
                if now >= until {
                    self.phase = Phase::Idle;
                    self.sample(now);
                }
            }
        }
        self.check_gpio_state(now);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}
