//! Daemon configuration, read from a single JSON document.
use crate::gpio::{Edge, PwmChannel};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

pub type RelayId = u32;
pub type SensorId = u32;
pub type PidId = u32;
pub type TimerId = u32;
pub type LcdId = u32;

pub const CONFIG_ENV: &str = "VERDANT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/verdant/config.json";

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub misc: MiscConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub relay_conditionals: Vec<RelayConditional>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub sensor_conditionals: Vec<SensorConditional>,
    #[serde(default)]
    pub pids: Vec<PidConfig>,
    #[serde(default)]
    pub timers: Vec<TimerConfig>,
    #[serde(default)]
    pub lcds: Vec<LcdConfig>,
}

impl DaemonConfig {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<DaemonConfig> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
        let reader = BufReader::new(f);
        let config: DaemonConfig = serde_json::from_reader(reader)
            .with_context(|| format!("could not parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<DaemonConfig> {
        let config: DaemonConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate ids, malformed times of day and outputs that
    /// cannot be driven the way they are configured.
    pub fn validate(&self) -> Result<()> {
        unique("relay", self.relays.iter().map(|r| r.id))?;
        unique("sensor", self.sensors.iter().map(|s| s.id))?;
        unique("pid", self.pids.iter().map(|p| p.id))?;
        unique("timer", self.timers.iter().map(|t| t.id))?;
        unique("lcd", self.lcds.iter().map(|l| l.id))?;
        unique("sensor conditional", self.sensor_conditionals.iter().map(|c| c.id))?;
        unique("relay conditional", self.relay_conditionals.iter().map(|c| c.id))?;
        for relay in &self.relays {
            if relay.kind == RelayKind::Pwm {
                match relay.pwm {
                    Some(channel) if channel.hertz > 0.0 => {}
                    Some(_) => bail!("relay {} needs a positive PWM frequency", relay.id),
                    None => bail!("relay {} is a PWM relay without a channel", relay.id),
                }
            }
        }
        for pid in &self.pids {
            if pid.period <= 0.0 {
                bail!("pid {} has a non-positive period", pid.id);
            }
            if !(pid.band >= 0.0) {
                bail!("pid {} has a negative band", pid.id);
            }
            for output in pid.raise.iter().chain(pid.lower.iter()) {
                if output.mode == OutputMode::DutyCycle {
                    let pwm = self.relay(output.relay_id).map_or(false, |r| r.kind == RelayKind::Pwm);
                    if !pwm {
                        bail!(
                            "pid {} drives relay {} by duty cycle but it is not a PWM relay",
                            pid.id,
                            output.relay_id
                        );
                    }
                }
            }
            for window in &pid.schedule {
                crate::clock::parse_hour_minute(&window.start)
                    .with_context(|| format!("pid {} schedule", pid.id))?;
                crate::clock::parse_hour_minute(&window.end)
                    .with_context(|| format!("pid {} schedule", pid.id))?;
            }
        }
        for timer in &self.timers {
            match &timer.kind {
                TimerKind::Time { at, .. } => {
                    crate::clock::parse_hour_minute(at)
                        .with_context(|| format!("timer {}", timer.id))?;
                }
                TimerKind::Timespan { start, end } => {
                    crate::clock::parse_hour_minute(start)
                        .with_context(|| format!("timer {}", timer.id))?;
                    crate::clock::parse_hour_minute(end)
                        .with_context(|| format!("timer {}", timer.id))?;
                }
                TimerKind::Duration { on, off } => {
                    if *on <= 0.0 || *off < 0.0 {
                        bail!("timer {} needs a positive on duration", timer.id);
                    }
                }
            }
        }
        for lcd in &self.lcds {
            if lcd.rows == 0 || lcd.rows > 4 || lcd.columns == 0 {
                bail!("lcd {} must have 1 to 4 rows and at least one column", lcd.id);
            }
        }
        Ok(())
    }

    pub fn relay(&self, id: RelayId) -> Option<&RelayConfig> {
        self.relays.iter().find(|r| r.id == id)
    }

    pub fn sensor(&self, id: SensorId) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn pid(&self, id: PidId) -> Option<&PidConfig> {
        self.pids.iter().find(|p| p.id == id)
    }

    pub fn timer(&self, id: TimerId) -> Option<&TimerConfig> {
        self.timers.iter().find(|t| t.id == id)
    }

    pub fn lcd(&self, id: LcdId) -> Option<&LcdConfig> {
        self.lcds.iter().find(|l| l.id == id)
    }

    /// Activated conditionals that belong to `sensor_id`.
    pub fn sensor_conditionals_for(&self, sensor_id: SensorId) -> Vec<SensorConditional> {
        self.sensor_conditionals
            .iter()
            .filter(|c| c.sensor_id == sensor_id && c.is_activated)
            .cloned()
            .collect()
    }

    pub fn active_relay_conditionals(&self) -> Vec<RelayConditional> {
        self.relay_conditionals
            .iter()
            .filter(|c| c.is_activated)
            .cloned()
            .collect()
    }
}

fn unique<I: Iterator<Item = u32>>(what: &str, ids: I) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            bail!("duplicate {} id {}", what, id);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiscConfig {
    /// Total current all relays together may draw.
    #[serde(default = "MiscConfig::default_max_amps")]
    pub max_amps: f64,
    #[serde(default = "MiscConfig::default_relay_tick_ms")]
    pub relay_tick_ms: u64,
    #[serde(default = "MiscConfig::default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "MiscConfig::default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default)]
    pub break_live_locks: bool,
    #[serde(default = "MiscConfig::default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "MiscConfig::default_rpc_bind")]
    pub rpc_bind: String,
    /// Bounded queue size of the background persister.
    #[serde(default = "MiscConfig::default_persist_queue")]
    pub persist_queue: usize,
}

impl MiscConfig {
    fn default_max_amps() -> f64 {
        15.0
    }
    fn default_relay_tick_ms() -> u64 {
        100
    }
    fn default_lock_dir() -> PathBuf {
        PathBuf::from("/var/lock")
    }
    fn default_lock_timeout_secs() -> u64 {
        60
    }
    fn default_store_dir() -> PathBuf {
        PathBuf::from("/var/lib/verdant/store")
    }
    fn default_rpc_bind() -> String {
        "127.0.0.1:8080".to_string()
    }
    fn default_persist_queue() -> usize {
        1024
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            max_amps: Self::default_max_amps(),
            relay_tick_ms: Self::default_relay_tick_ms(),
            lock_dir: Self::default_lock_dir(),
            lock_timeout_secs: Self::default_lock_timeout_secs(),
            break_live_locks: false,
            store_dir: Self::default_store_dir(),
            rpc_bind: Self::default_rpc_bind(),
            persist_queue: Self::default_persist_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "SmtpConfig::default_from")]
    pub from: String,
    /// Maximum emails per rolling hour, per sender.
    #[serde(default = "SmtpConfig::default_hourly_max")]
    pub hourly_max: u32,
    #[serde(default = "SmtpConfig::default_sendmail")]
    pub sendmail: String,
}

impl SmtpConfig {
    fn default_from() -> String {
        "verdant@localhost".to_string()
    }
    fn default_hourly_max() -> u32 {
        2
    }
    fn default_sendmail() -> String {
        "/usr/sbin/sendmail".to_string()
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            from: Self::default_from(),
            hourly_max: Self::default_hourly_max(),
            sendmail: Self::default_sendmail(),
        }
    }
}

/// Commands used to capture media. `((path))` is replaced by the output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_photo_command")]
    pub photo_command: String,
    #[serde(default = "CameraConfig::default_video_command")]
    pub video_command: String,
    #[serde(default = "CameraConfig::default_dir")]
    pub dir: PathBuf,
}

impl CameraConfig {
    fn default_photo_command() -> String {
        "raspistill -o ((path))".to_string()
    }
    fn default_video_command() -> String {
        "raspivid -t 5000 -o ((path))".to_string()
    }
    fn default_dir() -> PathBuf {
        PathBuf::from("/var/lib/verdant/camera")
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            photo_command: Self::default_photo_command(),
            video_command: Self::default_video_command(),
            dir: Self::default_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    /// Driven through a GPIO output pin.
    Wired,
    /// Switched by running `on_command` / `off_command`.
    Command,
    /// A hardware PWM channel. On and off are 100 % and 0 % duty.
    Pwm,
}

impl Default for RelayKind {
    fn default() -> Self {
        RelayKind::Wired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    On,
    Off,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::On => write!(f, "on"),
            RelayState::Off => write!(f, "off"),
        }
    }
}

impl FromStr for RelayState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(RelayState::On),
            "off" => Ok(RelayState::Off),
            other => bail!("unknown relay state '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub id: RelayId,
    pub name: String,
    #[serde(default)]
    pub kind: RelayKind,
    #[serde(default)]
    pub pin: Option<u64>,
    /// GPIO level that switches the load on.
    #[serde(default = "enabled")]
    pub trigger: bool,
    #[serde(default)]
    pub amps: f64,
    /// `Some(state)` forces the relay to that state at start-up.
    #[serde(default)]
    pub on_at_start: Option<bool>,
    #[serde(default)]
    pub on_command: Option<String>,
    #[serde(default)]
    pub off_command: Option<String>,
    /// Relay driving the opposite direction, switched off before this one turns on.
    #[serde(default)]
    pub opposing_relay_id: Option<RelayId>,
    #[serde(default)]
    pub pwm: Option<PwmChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Photo,
    Video,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Photo => write!(f, "photo"),
            CaptureKind::Video => write!(f, "video"),
        }
    }
}

/// Something a conditional does once it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Relay {
        relay_id: RelayId,
        state: RelayState,
        #[serde(default)]
        duration: f64,
    },
    Command {
        command: String,
    },
    Email {
        to: String,
        #[serde(default)]
        attachment: Option<CaptureKind>,
    },
    FlashLcd {
        lcd_id: LcdId,
    },
    Camera {
        capture: CaptureKind,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConditional {
    pub id: u32,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    pub if_relay_id: RelayId,
    pub if_relay_state: RelayState,
    /// Commanded duration an "on" transition must match exactly.
    #[serde(default)]
    pub if_relay_duration: f64,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorDevice {
    Ds18b20,
    CpuTemp,
    CpuLoad,
    Adc,
    Edge,
}

impl fmt::Display for SensorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorDevice::Ds18b20 => "ds18b20",
            SensorDevice::CpuTemp => "cpu_temp",
            SensorDevice::CpuLoad => "cpu_load",
            SensorDevice::Adc => "adc",
            SensorDevice::Edge => "edge",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexerConfig {
    pub address: u8,
    #[serde(default = "default_i2c_bus")]
    pub bus: u8,
    pub channel: u8,
}

fn default_i2c_bus() -> u8 {
    1
}

/// Analog input read through a Linux IIO device, with a linear calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdcConfig {
    pub address: u8,
    pub channel: u8,
    /// IIO device directory, e.g. `/sys/bus/iio/devices/iio:device0`.
    pub device_path: PathBuf,
    pub measurement: String,
    pub volts_min: f64,
    pub volts_max: f64,
    pub units_min: f64,
    pub units_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub edge: Edge,
    #[serde(default)]
    pub bounce_ms: u64,
    /// Seconds after an edge during which further edges are ignored.
    #[serde(default)]
    pub reset_period: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: SensorId,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    pub device: SensorDevice,
    /// One-wire device path, GPIO pin or I2C address, depending on `device`.
    #[serde(default)]
    pub location: String,
    pub period: f64,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(default)]
    pub multiplexer: Option<MultiplexerConfig>,
    #[serde(default)]
    pub adc: Option<AdcConfig>,
    #[serde(default)]
    pub pre_relay_id: Option<RelayId>,
    #[serde(default)]
    pub pre_relay_duration: f64,
    #[serde(default)]
    pub edge: Option<EdgeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorTrigger {
    Measurement {
        measurement: String,
        direction: Threshold,
        setpoint: f64,
    },
    Edge {
        edge: Edge,
    },
    GpioState {
        state: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConditional {
    pub id: u32,
    pub sensor_id: SensorId,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    /// Seconds between evaluations, and so between firings.
    pub period: f64,
    pub trigger: SensorTrigger,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidDirection {
    Raise,
    Lower,
    Both,
}

impl PidDirection {
    pub fn raises(self) -> bool {
        self != PidDirection::Lower
    }

    pub fn lowers(self) -> bool {
        self != PidDirection::Raise
    }
}

/// How a PID output turns its control variable into actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Switch the relay on for the computed number of seconds.
    Pulse,
    /// Hold a PWM relay at the computed share of the period.
    DutyCycle,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Pulse
    }
}

/// One actuator a PID drives. The clamps are seconds for pulse outputs
/// and percent for duty cycle outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidOutput {
    pub relay_id: RelayId,
    #[serde(default)]
    pub mode: OutputMode,
    #[serde(default)]
    pub min_duration: f64,
    pub max_duration: f64,
    #[serde(default)]
    pub min_off_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetpointWindow {
    pub start: String,
    pub end: String,
    pub start_setpoint: f64,
    #[serde(default)]
    pub end_setpoint: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    pub id: PidId,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    pub sensor_id: SensorId,
    pub measurement: String,
    pub direction: PidDirection,
    pub period: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    /// Hysteresis around the setpoint. Zero regulates on the setpoint itself.
    #[serde(default)]
    pub band: f64,
    /// Oldest measurement still acted upon, in seconds.
    #[serde(default)]
    pub max_measure_age: Option<f64>,
    #[serde(default)]
    pub raise: Option<PidOutput>,
    #[serde(default)]
    pub lower: Option<PidOutput>,
    #[serde(default)]
    pub schedule: Vec<SetpointWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// Fire once at `at` (HH:MM), for `duration_on` seconds when non-zero.
    Time {
        at: String,
        #[serde(default)]
        duration_on: f64,
    },
    /// Hold the relay in `state` between `start` and `end`.
    Timespan { start: String, end: String },
    /// Switch on for `on` seconds at the start of every `on + off` cycle.
    Duration { on: f64, off: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub id: TimerId,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    pub relay_id: RelayId,
    pub state: RelayState,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcdLine {
    pub entity: String,
    pub measurement: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcdConfig {
    pub id: LcdId,
    pub name: String,
    #[serde(default = "enabled")]
    pub is_activated: bool,
    pub period: f64,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    /// Address of the PCF8574 backpack driving the HD44780.
    #[serde(default = "LcdConfig::default_address")]
    pub i2c_address: u8,
    #[serde(default = "LcdConfig::default_columns")]
    pub columns: usize,
    #[serde(default = "LcdConfig::default_rows")]
    pub rows: usize,
    #[serde(default)]
    pub lines: Vec<LcdLine>,
}

impl LcdConfig {
    fn default_address() -> u8 {
        0x27
    }
    fn default_columns() -> usize {
        16
    }
    fn default_rows() -> usize {
        2
    }
}

/// The kinds of workers the supervisor can start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Sensor,
    Pid,
    Timer,
    Lcd,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::Sensor => "Sensor",
            ControllerKind::Pid => "PID",
            ControllerKind::Timer => "Timer",
            ControllerKind::Lcd => "LCD",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ControllerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sensor" => Ok(ControllerKind::Sensor),
            "pid" => Ok(ControllerKind::Pid),
            "timer" => Ok(ControllerKind::Timer),
            "lcd" => Ok(ControllerKind::Lcd),
            other => bail!("unknown controller type '{}'", other),
        }
    }
}

/// Where workers fetch their configuration rows from.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<DaemonConfig>;
}

pub type SharedConfigStore = Arc<dyn ConfigStore>;

/// Re-reads the JSON file on every load so refresh calls pick up edits.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Path from `VERDANT_CONFIG`, or the default location.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<DaemonConfig> {
        DaemonConfig::load_from_path(&self.path)
    }
}

/// An in-memory configuration that can be edited while workers run.
#[derive(Debug, Default)]
pub struct StaticConfigStore {
    config: Mutex<DaemonConfig>,
}

impl StaticConfigStore {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn update<F: FnOnce(&mut DaemonConfig)>(&self, f: F) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }
}

impl ConfigStore for StaticConfigStore {
    fn load(&self) -> Result<DaemonConfig> {
        Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
