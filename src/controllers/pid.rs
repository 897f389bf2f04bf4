//! PID regulation of one measurement through a raise and a lower relay.
use crate::{
    clock::{parse_hour_minute, secs_between, seconds, within_span, SharedClock, Ticker},
    config::{OutputMode, PidConfig, PidDirection, PidOutput, RelayId, SetpointWindow},
    controllers::{relay::RelayError, RelayControl, Worker},
    metrics::PID_CYCLES,
    store::{pid_entity, sensor_entity, MeasurementStore, Persister},
};
use anyhow::{bail, Result};
use chrono::{DateTime, Local, NaiveTime, Timelike, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

/// The terms of one PID update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidTerms {
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub output: f64,
}

/// Discrete PID. The integrator is clamped so that `integrator × ki`
/// never exceeds the control period in seconds.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    period: f64,
    integrator: f64,
    previous_error: f64,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, period: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            period,
            integrator: 0.0,
            previous_error: 0.0,
        }
    }

    pub fn update(&mut self, setpoint: f64, measured: f64) -> PidTerms {
        let error = setpoint - measured;
        let p = self.kp * error;

        self.integrator += error;
        if self.ki != 0.0 {
            let limit = (self.period / self.ki).abs();
            self.integrator = self.integrator.max(-limit).min(limit);
        }
        let i = self.ki * self.integrator;

        let d = self.kd * (error - self.previous_error);
        self.previous_error = error;

        PidTerms {
            p,
            i,
            d,
            output: p + i + d,
        }
    }

    pub fn integrator(&self) -> f64 {
        self.integrator
    }

    pub fn set_integrator(&mut self, integrator: f64) {
        self.integrator = integrator;
    }

    pub fn set_kp(&mut self, kp: f64) {
        self.kp = kp;
    }

    pub fn set_ki(&mut self, ki: f64) {
        self.ki = ki;
    }

    pub fn set_kd(&mut self, kd: f64) {
        self.kd = kd;
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    /// Forget the accumulated integral and the previous error.
    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.previous_error = 0.0;
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }
}

/// A band of `±band` around the setpoint.
///
/// Below the band a raising loop regulates toward the upper edge and keeps
/// doing so inside the band until the upper edge is crossed. Lowering is
/// the mirror image. A loop driving both ways aims at the edge nearest the
/// measurement and rests inside the band.
#[derive(Debug, Clone, Default)]
pub struct Hysteresis {
    band: f64,
    raising: bool,
    lowering: bool,
}

impl Hysteresis {
    pub fn new(band: f64) -> Self {
        Self {
            band,
            ..Self::default()
        }
    }

    pub fn edges(&self, setpoint: f64) -> (f64, f64) {
        (setpoint - self.band, setpoint + self.band)
    }

    /// Setpoint to regulate on this cycle, `None` to leave the outputs idle.
    /// `pid` is reset whenever a two-way loop changes direction.
    pub fn target(
        &mut self,
        direction: PidDirection,
        setpoint: f64,
        measured: f64,
        pid: &mut Pid,
    ) -> Option<f64> {
        if self.band <= 0.0 {
            return Some(setpoint);
        }
        let (low, high) = self.edges(setpoint);
        let inside = low < measured && measured < high;
        match direction {
            PidDirection::Raise => {
                if measured < low || (inside && self.raising) {
                    self.raising = true;
                    return Some(high);
                }
                if measured > high {
                    self.raising = false;
                }
                None
            }
            PidDirection::Lower => {
                if measured > high || (inside && self.lowering) {
                    self.lowering = true;
                    return Some(low);
                }
                if measured < low {
                    self.lowering = false;
                }
                None
            }
            PidDirection::Both => {
                if measured < low {
                    if !self.raising {
                        pid.reset();
                        self.raising = true;
                        self.lowering = false;
                    }
                    Some(low)
                } else if measured > high {
                    if !self.lowering {
                        pid.reset();
                        self.lowering = true;
                        self.raising = false;
                    }
                    Some(high)
                } else {
                    None
                }
            }
        }
    }
}

/// A change made to a running PID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidAdjustment {
    /// New default setpoint. Resets the integrator and previous error.
    Setpoint(f64),
    Kp(f64),
    Ki(f64),
    Kd(f64),
    Integrator(f64),
}

impl PidAdjustment {
    pub fn parse(parameter: &str, value: f64) -> Result<PidAdjustment> {
        if !value.is_finite() {
            bail!("PID {} must be a finite number", parameter);
        }
        Ok(match parameter {
            "setpoint" => PidAdjustment::Setpoint(value),
            "kp" => PidAdjustment::Kp(value),
            "ki" => PidAdjustment::Ki(value),
            "kd" => PidAdjustment::Kd(value),
            "integrator" => PidAdjustment::Integrator(value),
            other => bail!("unknown PID parameter '{}'", other),
        })
    }
}

impl fmt::Display for PidAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PidAdjustment::Setpoint(v) => write!(f, "setpoint {}", v),
            PidAdjustment::Kp(v) => write!(f, "kp {}", v),
            PidAdjustment::Ki(v) => write!(f, "ki {}", v),
            PidAdjustment::Kd(v) => write!(f, "kd {}", v),
            PidAdjustment::Integrator(v) => write!(f, "integrator {}", v),
        }
    }
}

#[derive(Debug, Clone)]
struct Window {
    start: NaiveTime,
    end: NaiveTime,
    start_setpoint: f64,
    end_setpoint: Option<f64>,
}

const SECS_PER_DAY: i64 = 86_400;

/// Time of day windows overriding the default setpoint.
#[derive(Debug, Clone, Default)]
pub struct SetpointSchedule {
    windows: Vec<Window>,
}

impl SetpointSchedule {
    pub fn from_config(windows: &[SetpointWindow]) -> Result<Self> {
        let windows = windows
            .iter()
            .map(|w| {
                Ok(Window {
                    start: parse_hour_minute(&w.start)?,
                    end: parse_hour_minute(&w.end)?,
                    start_setpoint: w.start_setpoint,
                    end_setpoint: w.end_setpoint,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { windows })
    }

    /// Setpoint of the first window containing `now`. Windows with an end
    /// setpoint ramp linearly across the window.
    pub fn setpoint_at(&self, now: NaiveTime) -> Option<f64> {
        let window = self
            .windows
            .iter()
            .find(|w| within_span(now, w.start, w.end))?;
        match window.end_setpoint {
            None => Some(window.start_setpoint),
            Some(end_setpoint) => {
                let start = i64::from(window.start.num_seconds_from_midnight());
                let end = i64::from(window.end.num_seconds_from_midnight());
                let now = i64::from(now.num_seconds_from_midnight());
                let total = (end - start).rem_euclid(SECS_PER_DAY);
                let elapsed = (now - start).rem_euclid(SECS_PER_DAY);
                let fraction = if total == 0 {
                    0.0
                } else {
                    (elapsed as f64 / total as f64).min(1.0)
                };
                Some(window.start_setpoint + fraction * (end_setpoint - window.start_setpoint))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PidMode {
    Active,
    /// No computation and no actuation.
    Paused,
    /// No computation, the last output keeps being applied.
    Held,
}

#[derive(Debug, Clone, Serialize)]
pub struct PidStatus {
    pub mode: PidMode,
    pub setpoint: Option<f64>,
    pub measurement: Option<f64>,
    pub terms: Option<PidTerms>,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integrator: f64,
}

/// The part of a PID worker other threads may touch.
#[derive(Debug)]
pub struct PidControl {
    id: u32,
    status: Mutex<PidStatus>,
    pending: Mutex<Vec<PidAdjustment>>,
}

impl PidControl {
    fn new(config: &PidConfig) -> Self {
        Self {
            id: config.id,
            status: Mutex::new(PidStatus {
                mode: PidMode::Active,
                setpoint: None,
                measurement: None,
                terms: None,
                kp: config.kp,
                ki: config.ki,
                kd: config.kd,
                integrator: 0.0,
            }),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a change for the worker's next iteration.
    pub fn adjust(&self, adjustment: PidAdjustment) -> String {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(adjustment);
        let message = format!("PID {} {} queued", self.id, adjustment);
        info!("{}", message);
        message
    }

    fn take_adjustments(&self) -> Vec<PidAdjustment> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn status(&self) -> PidStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn mode(&self) -> PidMode {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).mode
    }

    fn set_mode(&self, mode: PidMode) -> String {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.mode = mode;
        let message = match mode {
            PidMode::Active => format!("PID {} resumed", self.id),
            PidMode::Paused => format!("PID {} paused", self.id),
            PidMode::Held => format!("PID {} held", self.id),
        };
        info!("{}", message);
        message
    }

    pub fn hold(&self) -> String {
        self.set_mode(PidMode::Held)
    }

    pub fn pause(&self) -> String {
        self.set_mode(PidMode::Paused)
    }

    pub fn resume(&self) -> String {
        self.set_mode(PidMode::Active)
    }

    fn update<F: FnOnce(&mut PidStatus)>(&self, f: F) {
        f(&mut self.status.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

pub struct PidWorker {
    config: PidConfig,
    entity: String,
    input_entity: String,
    pid: Pid,
    hysteresis: Hysteresis,
    /// Used outside schedule windows.
    setpoint: f64,
    schedule: SetpointSchedule,
    max_age: f64,
    relays: Arc<dyn RelayControl>,
    store: Arc<dyn MeasurementStore>,
    persister: Arc<Persister>,
    clock: SharedClock,
    ticker: Ticker,
    control: Arc<PidControl>,
    last_output: f64,
}

impl PidWorker {
    /// `sensor_period` of the bound sensor sets the default freshness limit.
    pub fn new(
        config: PidConfig,
        sensor_period: Option<f64>,
        relays: Arc<dyn RelayControl>,
        persister: Arc<Persister>,
        clock: SharedClock,
    ) -> Result<PidWorker> {
        let schedule = SetpointSchedule::from_config(&config.schedule)?;
        let max_age = config
            .max_measure_age
            .unwrap_or_else(|| 1.5 * sensor_period.unwrap_or(config.period));
        let ticker = Ticker::delayed(seconds(config.period), clock.now());
        Ok(PidWorker {
            entity: pid_entity(config.id),
            input_entity: sensor_entity(config.sensor_id),
            pid: Pid::new(config.kp, config.ki, config.kd, config.period),
            hysteresis: Hysteresis::new(config.band),
            setpoint: config.setpoint,
            control: Arc::new(PidControl::new(&config)),
            store: persister.store().clone(),
            schedule,
            max_age,
            relays,
            persister,
            clock,
            ticker,
            config,
            last_output: 0.0,
        })
    }

    pub fn control(&self) -> Arc<PidControl> {
        self.control.clone()
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Apply changes queued through [`PidControl::adjust`].
    pub fn apply_adjustments(&mut self) {
        let adjustments = self.control.take_adjustments();
        if adjustments.is_empty() {
            return;
        }
        for adjustment in adjustments {
            match adjustment {
                PidAdjustment::Setpoint(setpoint) => {
                    self.setpoint = setpoint;
                    self.pid.reset();
                }
                PidAdjustment::Kp(kp) => self.pid.set_kp(kp),
                PidAdjustment::Ki(ki) => self.pid.set_ki(ki),
                PidAdjustment::Kd(kd) => self.pid.set_kd(kd),
                PidAdjustment::Integrator(integrator) => self.pid.set_integrator(integrator),
            }
            info!("PID {}: {} applied", self.config.id, adjustment);
        }
        let (kp, ki, kd) = self.pid.gains();
        let integrator = self.pid.integrator();
        let setpoint = self.setpoint;
        self.control.update(|s| {
            s.kp = kp;
            s.ki = ki;
            s.kd = kd;
            s.integrator = integrator;
            s.setpoint = Some(setpoint);
        });
    }

    fn latest_measurement(&self, now: DateTime<Local>) -> Option<f64> {
        match self
            .store
            .read_latest(&self.input_entity, &self.config.measurement)
        {
            Ok(Some(m)) => {
                let age = secs_between(m.timestamp.with_timezone(&Local), now);
                if age <= self.max_age {
                    Some(m.value)
                } else {
                    debug!(
                        "PID {}: latest {} is {:.0} s old",
                        self.config.id, self.config.measurement, age
                    );
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("PID {}: could not read measurement: {:#}", self.config.id, e);
                None
            }
        }
    }

    /// Run one control cycle at the current time.
    pub fn cycle(&mut self) {
        let now = self.clock.now();
        match self.control.mode() {
            PidMode::Paused => {
                PID_CYCLES
                    .with_label_values(&[&self.config.id.to_string(), "paused"])
                    .inc();
                return;
            }
            PidMode::Held => {
                PID_CYCLES
                    .with_label_values(&[&self.config.id.to_string(), "held"])
                    .inc();
                self.actuate(self.last_output);
                return;
            }
            PidMode::Active => {}
        }

        let measured = match self.latest_measurement(now) {
            Some(value) => value,
            None => {
                debug!(
                    "PID {}: no fresh {} from sensor {}, actuators off",
                    self.config.id, self.config.measurement, self.config.sensor_id
                );
                PID_CYCLES
                    .with_label_values(&[&self.config.id.to_string(), "no_data"])
                    .inc();
                self.fail_safe();
                self.control.update(|s| s.measurement = None);
                return;
            }
        };

        let setpoint = self
            .schedule
            .setpoint_at(now.time())
            .unwrap_or(self.setpoint);
        let timestamp = now.with_timezone(&Utc);
        self.persister
            .persist_value(&self.entity, "setpoint", setpoint, timestamp);
        if self.config.band > 0.0 {
            let (low, high) = self.hysteresis.edges(setpoint);
            self.persister
                .persist_value(&self.entity, "setpoint_band_min", low, timestamp);
            self.persister
                .persist_value(&self.entity, "setpoint_band_max", high, timestamp);
        }

        let target = self
            .hysteresis
            .target(self.config.direction, setpoint, measured, &mut self.pid);
        let target = match target {
            Some(target) => target,
            None => {
                debug!(
                    "PID {}: {:.2} inside the band around {:.2}, outputs idle",
                    self.config.id, measured, setpoint
                );
                PID_CYCLES
                    .with_label_values(&[&self.config.id.to_string(), "in_band"])
                    .inc();
                self.control.update(|s| {
                    s.setpoint = Some(setpoint);
                    s.measurement = Some(measured);
                    s.terms = None;
                });
                self.last_output = 0.0;
                self.actuate(0.0);
                return;
            }
        };

        let terms = self.pid.update(target, measured);
        for (name, value) in [
            ("pid_p_value", terms.p),
            ("pid_i_value", terms.i),
            ("pid_d_value", terms.d),
            ("pid_output", terms.output),
        ]
        .iter()
        {
            self.persister
                .persist_value(&self.entity, name, *value, timestamp);
        }
        debug!(
            "PID {}: setpoint {:.2}, measured {:.2}, output {:.2}",
            self.config.id, setpoint, measured, terms.output
        );
        let integrator = self.pid.integrator();
        self.control.update(|s| {
            s.setpoint = Some(setpoint);
            s.measurement = Some(measured);
            s.terms = Some(terms);
            s.integrator = integrator;
        });
        PID_CYCLES
            .with_label_values(&[&self.config.id.to_string(), "ok"])
            .inc();
        self.last_output = terms.output;
        self.actuate(terms.output);
    }

    fn fail_safe(&self) {
        if let Some(raise) = &self.config.raise {
            self.off(raise.relay_id);
        }
        if let Some(lower) = &self.config.lower {
            self.off(lower.relay_id);
        }
    }

    fn actuate(&self, output: f64) {
        let raise = self
            .config
            .raise
            .as_ref()
            .filter(|_| self.config.direction.raises() && output > 0.0);
        let lower = self
            .config
            .lower
            .as_ref()
            .filter(|_| self.config.direction.lowers() && output < 0.0);

        // The idle direction is switched off before the active one may turn on.
        if raise.is_none() {
            if let Some(r) = &self.config.raise {
                self.off(r.relay_id);
            }
        }
        if lower.is_none() {
            if let Some(l) = &self.config.lower {
                self.off(l.relay_id);
            }
        }
        if let Some(raise) = raise {
            self.on(raise, output);
        }
        if let Some(lower) = lower {
            self.on(lower, output.abs());
        }
    }

    fn on(&self, relay: &PidOutput, amount: f64) {
        if relay.mode == OutputMode::DutyCycle {
            let duty = (amount / self.config.period * 100.0)
                .min(100.0)
                .max(relay.min_duration)
                .min(relay.max_duration);
            match self.relays.set_duty_cycle(relay.relay_id, duty) {
                Ok(()) => debug!(
                    "PID {}: relay {} at {:.1} %",
                    self.config.id, relay.relay_id, duty
                ),
                Err(e) => warn!("PID {}: {}", self.config.id, e),
            }
            return;
        }
        let duration = amount.min(relay.max_duration);
        if duration <= relay.min_duration {
            return;
        }
        match self
            .relays
            .turn_on(relay.relay_id, duration, true, relay.min_off_duration)
        {
            Ok(()) => debug!(
                "PID {}: relay {} on for {:.1} s",
                self.config.id, relay.relay_id, duration
            ),
            Err(e @ RelayError::MinOffDuration { .. }) => debug!("PID {}: {}", self.config.id, e),
            Err(e) => warn!("PID {}: {}", self.config.id, e),
        }
    }

    fn off(&self, relay_id: RelayId) {
        if let Err(e) = self.relays.turn_off(relay_id, true) {
            warn!("PID {}: {}", self.config.id, e);
        }
    }
}

impl Worker for PidWorker {
    fn name(&self) -> String {
        format!("PID {}", self.config.id)
    }

    fn step(&mut self) -> Result<()> {
        self.apply_adjustments();
        if self.ticker.ready(self.clock.now()) {
            self.cycle();
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn shutdown(&mut self) {
        self.fail_safe();
    }
}
