//! Owns every worker: starts them in dependency order, answers RPC calls
//! and tears everything down with the relay service last.
use crate::{
    clock::SharedClock,
    conditional::{ActionExecutor, Collaborators},
    config::{ConfigStore, ControllerKind, DaemonConfig, LcdId, RelayId, SharedConfigStore},
    controllers::{
        lcd::{DisplayFactory, LcdRegistry, LcdWorker},
        pid::{PidAdjustment, PidControl, PidStatus, PidWorker},
        relay::{RelayError, RelayService, RelaySnapshot, SetupAction},
        sensor::{SensorControl, SensorDeps, SensorWorker},
        timer::TimerWorker,
        LcdControl, RelayControl, WorkerHandle,
    },
    drivers,
    gpio::GpioBackend,
    lock::{self, LockManager},
    metrics::{ACTIVE_CONTROLLERS, AMP_LOAD, UPTIME_SECONDS},
    notify::{Camera, Mailer},
    store::{MeasurementStore, Persister},
};
use anyhow::Context;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    collections::HashMap,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

const STATS_PERIOD: Duration = Duration::from_secs(60);
const RESOURCE_LOG_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{kind} {id} is already active")]
    AlreadyActive { kind: ControllerKind, id: u32 },
    #[error("{kind} {id} is not active")]
    NotActive { kind: ControllerKind, id: u32 },
    #[error("{kind} {id} is not configured")]
    NotConfigured { kind: ControllerKind, id: u32 },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

struct Running<C> {
    handle: WorkerHandle,
    control: Arc<C>,
}

#[derive(Default)]
struct Workers {
    sensors: HashMap<u32, Running<SensorControl>>,
    pids: HashMap<u32, Running<PidControl>>,
    timers: HashMap<u32, WorkerHandle>,
    lcds: HashMap<u32, WorkerHandle>,
}

impl Workers {
    fn is_active(&self, kind: ControllerKind, id: u32) -> bool {
        match kind {
            ControllerKind::Sensor => self.sensors.contains_key(&id),
            ControllerKind::Pid => self.pids.contains_key(&id),
            ControllerKind::Timer => self.timers.contains_key(&id),
            ControllerKind::Lcd => self.lcds.contains_key(&id),
        }
    }

    fn count(&self, kind: ControllerKind) -> usize {
        match kind {
            ControllerKind::Sensor => self.sensors.len(),
            ControllerKind::Pid => self.pids.len(),
            ControllerKind::Timer => self.timers.len(),
            ControllerKind::Lcd => self.lcds.len(),
        }
    }

    fn handles(&self) -> Vec<&WorkerHandle> {
        self.lcds
            .values()
            .chain(self.timers.values())
            .chain(self.sensors.values().map(|r| &r.handle))
            .chain(self.pids.values().map(|r| &r.handle))
            .collect()
    }
}

const KINDS: [ControllerKind; 4] = [
    ControllerKind::Sensor,
    ControllerKind::Pid,
    ControllerKind::Timer,
    ControllerKind::Lcd,
];

/// Hardware and outside collaborators the daemon runs against.
pub struct DaemonParts {
    pub config_store: SharedConfigStore,
    pub gpio: Arc<dyn GpioBackend>,
    pub store: Arc<dyn MeasurementStore>,
    pub clock: SharedClock,
    pub mailer: Arc<dyn Mailer>,
    pub camera: Arc<dyn Camera>,
    pub displays: Arc<dyn DisplayFactory>,
    /// Write facts inline instead of through the background queue.
    pub synchronous_store: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    pub amp_load: f64,
    pub relays: Vec<RelaySnapshot>,
    pub sensors: Vec<u32>,
    pub pids: Vec<u32>,
    pub timers: Vec<u32>,
    pub lcds: Vec<u32>,
}

pub struct Daemon {
    config_store: SharedConfigStore,
    gpio: Arc<dyn GpioBackend>,
    clock: SharedClock,
    displays: Arc<dyn DisplayFactory>,
    persister: Arc<Persister>,
    relays: Arc<RelayService>,
    lcds: Arc<LcdRegistry>,
    collaborators: Collaborators,
    locks: LockManager,
    hourly_email_max: u32,
    workers: Mutex<Workers>,
    started: Instant,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(parts: DaemonParts) -> anyhow::Result<Arc<Daemon>> {
        let config = parts.config_store.load()?;
        lock::prepare_dir(&config.misc.lock_dir)?;
        let locks = LockManager::new(
            &config.misc.lock_dir,
            Duration::from_secs(config.misc.lock_timeout_secs),
        )
        .break_live_locks(config.misc.break_live_locks);
        let persister = Arc::new(if parts.synchronous_store {
            Persister::synchronous(parts.store.clone())
        } else {
            Persister::spawn(parts.store.clone(), config.misc.persist_queue)?
        });
        let lcds = Arc::new(LcdRegistry::new());
        let collaborators = Collaborators {
            mailer: parts.mailer,
            camera: parts.camera,
            lcds: lcds.clone(),
        };
        let relays = Arc::new(RelayService::new(
            parts.gpio.clone(),
            parts.config_store.clone(),
            persister.clone(),
            parts.clock.clone(),
            ActionExecutor::new(collaborators.clone(), config.smtp.hourly_max, parts.clock.clone()),
        )?);
        Ok(Arc::new(Daemon {
            config_store: parts.config_store,
            gpio: parts.gpio,
            clock: parts.clock,
            displays: parts.displays,
            persister,
            relays,
            lcds,
            collaborators,
            locks,
            hourly_email_max: config.smtp.hourly_max,
            workers: Mutex::new(Workers::default()),
            started: Instant::now(),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }))
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn relays(&self) -> &Arc<RelayService> {
        &self.relays
    }

    /// Relay service first, then every activated timer, sensor, PID and LCD.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!("Daemon starting");
        self.running.store(true, Ordering::SeqCst);
        self.relays.initialize()?;
        let relay_thread = self.relays.spawn()?;
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(relay_thread);

        let config = self.config_store.load()?;
        let wanted = config
            .timers
            .iter()
            .filter(|t| t.is_activated)
            .map(|t| (ControllerKind::Timer, t.id))
            .chain(
                config
                    .sensors
                    .iter()
                    .filter(|s| s.is_activated)
                    .map(|s| (ControllerKind::Sensor, s.id)),
            )
            .chain(
                config
                    .pids
                    .iter()
                    .filter(|p| p.is_activated)
                    .map(|p| (ControllerKind::Pid, p.id)),
            )
            .chain(
                config
                    .lcds
                    .iter()
                    .filter(|l| l.is_activated)
                    .map(|l| (ControllerKind::Lcd, l.id)),
            );
        for (kind, id) in wanted {
            if let Err(e) = self.activate(kind, id) {
                error!("Could not start {} {}: {}", kind, id, e);
            }
        }

        let daemon = self.clone();
        let housekeeping = thread::Builder::new()
            .name("housekeeping".into())
            .spawn(move || daemon.housekeeping())?;
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(housekeeping);
        info!("Daemon started");
        Ok(())
    }

    /// Start a controller and wait until it reports ready.
    pub fn activate(&self, kind: ControllerKind, id: u32) -> DaemonResult<String> {
        let mut workers = self.workers();
        if workers.is_active(kind, id) {
            return Err(DaemonError::AlreadyActive { kind, id });
        }
        let config = self.config_store.load()?;
        match kind {
            ControllerKind::Sensor => {
                let (handle, control) = self.start_sensor(&config, id)?;
                workers.sensors.insert(id, Running { handle, control });
            }
            ControllerKind::Pid => {
                let (handle, control) = self.start_pid(&config, id)?;
                workers.pids.insert(id, Running { handle, control });
            }
            ControllerKind::Timer => {
                let timer = config
                    .timer(id)
                    .cloned()
                    .ok_or(DaemonError::NotConfigured { kind, id })?;
                let worker = TimerWorker::new(timer, self.relay_control(), self.clock.clone())?;
                workers.timers.insert(id, WorkerHandle::spawn(worker)?);
            }
            ControllerKind::Lcd => {
                let lcd = config
                    .lcd(id)
                    .cloned()
                    .ok_or(DaemonError::NotConfigured { kind, id })?;
                let worker = LcdWorker::new(
                    lcd,
                    self.persister.store().clone(),
                    self.clock.clone(),
                    self.displays.clone(),
                );
                let state = worker.state();
                workers.lcds.insert(id, WorkerHandle::spawn(worker)?);
                self.lcds.register(id, state);
            }
        }
        ACTIVE_CONTROLLERS
            .with_label_values(&[&kind.to_string()])
            .set(workers.count(kind) as i64);
        let message = format!("{} {} activated", kind, id);
        info!("{}", message);
        Ok(message)
    }

    fn relay_control(&self) -> Arc<dyn RelayControl> {
        self.relays.clone()
    }

    fn start_sensor(&self, config: &DaemonConfig, id: u32) -> DaemonResult<(WorkerHandle, Arc<SensorControl>)> {
        let sensor = config.sensor(id).cloned().ok_or(DaemonError::NotConfigured {
            kind: ControllerKind::Sensor,
            id,
        })?;
        let driver = drivers::build_driver(&sensor, &self.locks)
            .with_context(|| format!("sensor {} driver", id))?;
        let worker = SensorWorker::new(
            sensor,
            driver,
            config.sensor_conditionals_for(id),
            ActionExecutor::new(self.collaborators.clone(), self.hourly_email_max, self.clock.clone()),
            SensorDeps {
                relays: self.relay_control(),
                persister: self.persister.clone(),
                gpio: self.gpio.clone(),
                clock: self.clock.clone(),
            },
        );
        let control = worker.control();
        Ok((WorkerHandle::spawn(worker)?, control))
    }

    fn start_pid(&self, config: &DaemonConfig, id: u32) -> DaemonResult<(WorkerHandle, Arc<PidControl>)> {
        let pid = config.pid(id).cloned().ok_or(DaemonError::NotConfigured {
            kind: ControllerKind::Pid,
            id,
        })?;
        let sensor_period = config.sensor(pid.sensor_id).map(|s| s.period);
        let worker = PidWorker::new(
            pid,
            sensor_period,
            self.relay_control(),
            self.persister.clone(),
            self.clock.clone(),
        )?;
        let control = worker.control();
        Ok((WorkerHandle::spawn(worker)?, control))
    }

    /// Stop a controller and wait for its thread to exit.
    pub fn deactivate(&self, kind: ControllerKind, id: u32) -> DaemonResult<String> {
        let mut workers = self.workers();
        let handle = match kind {
            ControllerKind::Sensor => workers.sensors.remove(&id).map(|r| r.handle),
            ControllerKind::Pid => workers.pids.remove(&id).map(|r| r.handle),
            ControllerKind::Timer => workers.timers.remove(&id),
            ControllerKind::Lcd => {
                self.lcds.unregister(id);
                workers.lcds.remove(&id)
            }
        };
        let mut handle = handle.ok_or(DaemonError::NotActive { kind, id })?;
        handle.stop();
        ACTIVE_CONTROLLERS
            .with_label_values(&[&kind.to_string()])
            .set(workers.count(kind) as i64);
        let message = format!("{} {} deactivated", kind, id);
        info!("{}", message);
        Ok(message)
    }

    pub fn relay_on(&self, relay_id: RelayId, duration: f64, min_off_duration: f64) -> DaemonResult<String> {
        self.relays.turn_on(relay_id, duration, true, min_off_duration)?;
        Ok(if duration > 0.0 {
            format!("Relay {} on for {} s", relay_id, duration)
        } else {
            format!("Relay {} on", relay_id)
        })
    }

    pub fn relay_off(&self, relay_id: RelayId, trigger_conditionals: bool) -> DaemonResult<String> {
        self.relays.turn_off(relay_id, trigger_conditionals)?;
        Ok(format!("Relay {} off", relay_id))
    }

    pub fn relay_state(&self, relay_id: RelayId) -> DaemonResult<String> {
        Ok(self.relays.relay_state(relay_id)?.to_string())
    }

    pub fn relay_setup(&self, action: SetupAction, relay_id: RelayId) -> DaemonResult<String> {
        self.relays.relay_setup(action, relay_id)?;
        Ok(format!("Relay {} {:?} complete", relay_id, action).to_lowercase())
    }

    pub fn relay_duty_cycle(&self, relay_id: RelayId, duty: f64) -> DaemonResult<String> {
        self.relays.set_duty_cycle(relay_id, duty)?;
        Ok(format!("Relay {} duty cycle {} %", relay_id, duty))
    }

    pub fn relay_sec_currently_on(&self, relay_id: RelayId) -> DaemonResult<f64> {
        Ok(self.relays.sec_currently_on(relay_id)?)
    }

    pub fn flash_lcd(&self, lcd_id: LcdId, on: bool) -> DaemonResult<String> {
        Ok(self.lcds.flash(lcd_id, on)?)
    }

    pub fn refresh_sensor_conditionals(
        &self,
        sensor_id: u32,
        mod_kind: &str,
        conditional_id: u32,
    ) -> DaemonResult<String> {
        let control = self
            .workers()
            .sensors
            .get(&sensor_id)
            .map(|r| r.control.clone())
            .ok_or(DaemonError::NotActive {
                kind: ControllerKind::Sensor,
                id: sensor_id,
            })?;
        Ok(control.refresh(self.config_store.as_ref(), mod_kind, conditional_id)?)
    }

    pub fn refresh_relay_conditionals(&self) -> DaemonResult<String> {
        let count = self.relays.refresh_conditionals()?;
        Ok(format!("Relay conditionals refreshed ({} active)", count))
    }

    fn pid_control(&self, pid_id: u32) -> DaemonResult<Arc<PidControl>> {
        self.workers()
            .pids
            .get(&pid_id)
            .map(|r| r.control.clone())
            .ok_or(DaemonError::NotActive {
                kind: ControllerKind::Pid,
                id: pid_id,
            })
    }

    pub fn pid_hold(&self, pid_id: u32) -> DaemonResult<String> {
        Ok(self.pid_control(pid_id)?.hold())
    }

    pub fn pid_pause(&self, pid_id: u32) -> DaemonResult<String> {
        Ok(self.pid_control(pid_id)?.pause())
    }

    pub fn pid_resume(&self, pid_id: u32) -> DaemonResult<String> {
        Ok(self.pid_control(pid_id)?.resume())
    }

    /// Change a running PID's setpoint, gains or integrator.
    pub fn pid_adjust(&self, pid_id: u32, adjustment: PidAdjustment) -> DaemonResult<String> {
        Ok(self.pid_control(pid_id)?.adjust(adjustment))
    }

    pub fn pid_status(&self, pid_id: u32) -> DaemonResult<PidStatus> {
        Ok(self.pid_control(pid_id)?.status())
    }

    /// Error naming the first worker whose thread has died.
    pub fn check_daemon(&self) -> DaemonResult<String> {
        let workers = self.workers();
        if let Some(dead) = workers.handles().into_iter().find(|h| !h.is_alive()) {
            return Err(anyhow::anyhow!("{} is not running", dead.name()).into());
        }
        Ok("All controllers running".to_string())
    }

    pub fn daemon_status(&self) -> &'static str {
        "alive"
    }

    pub fn status(&self) -> DaemonStatus {
        let workers = self.workers();
        let sorted = |mut ids: Vec<u32>| {
            ids.sort_unstable();
            ids
        };
        DaemonStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            amp_load: self.relays.current_amp_load(),
            relays: self.relays.snapshot(),
            sensors: sorted(workers.sensors.keys().copied().collect()),
            pids: sorted(workers.pids.keys().copied().collect()),
            timers: sorted(workers.timers.keys().copied().collect()),
            lcds: sorted(workers.lcds.keys().copied().collect()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn housekeeping(&self) {
        let mut last_stats: Option<Instant> = None;
        let mut last_resource_log = Instant::now();
        while self.is_running() {
            if last_stats.map_or(true, |t| t.elapsed() >= STATS_PERIOD) {
                last_stats = Some(Instant::now());
                self.update_statistics();
            }
            if last_resource_log.elapsed() >= RESOURCE_LOG_PERIOD {
                last_resource_log = Instant::now();
                self.log_resource_use();
            }
            thread::sleep(Duration::from_millis(500));
        }
    }

    fn update_statistics(&self) {
        let workers = self.workers();
        for kind in KINDS.iter() {
            ACTIVE_CONTROLLERS
                .with_label_values(&[&kind.to_string()])
                .set(workers.count(*kind) as i64);
        }
        AMP_LOAD.set(self.relays.current_amp_load());
        UPTIME_SECONDS.set(self.started.elapsed().as_secs() as i64);
    }

    fn log_resource_use(&self) {
        let rss = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find(|l| l.starts_with("VmRSS:"))
                    .map(|l| l.trim_start_matches("VmRSS:").trim().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        let workers = self.workers();
        info!(
            "Uptime {} h, {} sensors, {} PIDs, {} timers, {} LCDs, {:.2} A, RSS {}",
            self.started.elapsed().as_secs() / 3600,
            workers.sensors.len(),
            workers.pids.len(),
            workers.timers.len(),
            workers.lcds.len(),
            self.relays.current_amp_load(),
            rss
        );
    }

    /// Stop LCDs, timers, sensors and PIDs, then the relay service, which
    /// switches every relay off.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Daemon shutting down");
        let mut workers = std::mem::take(&mut *self.workers());
        for (id, mut handle) in workers.lcds.drain() {
            self.lcds.unregister(id);
            handle.stop();
        }
        for (_, mut handle) in workers.timers.drain() {
            handle.stop();
        }
        for (_, mut running) in workers.sensors.drain() {
            running.handle.stop();
        }
        for (_, mut running) in workers.pids.drain() {
            running.handle.stop();
        }
        self.relays.stop();
        for handle in self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            if handle.join().is_err() {
                warn!("A daemon thread panicked");
            }
        }
        self.relays.shutdown();
        self.persister.close();
        info!("Daemon stopped");
    }
}
