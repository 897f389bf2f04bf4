//! Relay outputs, switch inputs and PWM channels.
//!
//! GPIO goes through `sysfs_gpio`. Inputs are watched with kernel edge
//! interrupts, so even short pulses are latched.
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use sysfs_gpio::{Direction, Pin};

const SYSFS_PWM: &str = "/sys/class/pwm";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `rising` is one this edge selection cares about.
    pub fn matches(self, rising: bool) -> bool {
        match self {
            Edge::Rising => rising,
            Edge::Falling => !rising,
            Edge::Both => true,
        }
    }

    fn as_sysfs(self) -> sysfs_gpio::Edge {
        match self {
            Edge::Rising => sysfs_gpio::Edge::RisingEdge,
            Edge::Falling => sysfs_gpio::Edge::FallingEdge,
            Edge::Both => sysfs_gpio::Edge::BothEdges,
        }
    }
}

/// A hardware PWM channel, `/sys/class/pwm/pwmchip<chip>/pwm<channel>`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PwmChannel {
    #[serde(default)]
    pub chip: u32,
    pub channel: u32,
    pub hertz: f64,
}

/// Interrupts armed on one input pin.
pub trait EdgeEvents: Send {
    /// Block until the pin changes or `timeout` passes. Returns the level
    /// read after the interrupt.
    fn wait(&mut self, timeout: Duration) -> Result<Option<bool>>;
}

/// The operations the controllers need from the board.
pub trait GpioBackend: Send + Sync {
    /// Configure `pin` as an output driven to `high`.
    fn setup_output(&self, pin: u64, high: bool) -> Result<()>;
    fn setup_input(&self, pin: u64) -> Result<()>;
    fn write(&self, pin: u64, high: bool) -> Result<()>;
    fn read(&self, pin: u64) -> Result<bool>;
    fn release(&self, pin: u64) -> Result<()>;
    /// Arm `edge` interrupts on an input pin.
    fn edge_events(&self, pin: u64, edge: Edge) -> Result<Box<dyn EdgeEvents>>;
    /// Drive a PWM channel at `duty` percent. Zero disables the output.
    fn set_pwm(&self, channel: PwmChannel, duty: f64) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsGpio;

fn exported(pin: u64) -> Result<Pin> {
    let gpio = Pin::new(pin);
    gpio.export()
        .with_context(|| format!("could not export pin {}", pin))?;
    Ok(gpio)
}

fn write_attribute(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("could not write {}", path.display()))
}

struct SysfsEdges {
    poller: sysfs_gpio::PinPoller,
}

impl EdgeEvents for SysfsEdges {
    fn wait(&mut self, timeout: Duration) -> Result<Option<bool>> {
        let millis = timeout.as_millis().min(isize::MAX as u128) as isize;
        Ok(self.poller.poll(millis)?.map(|value| value == 1))
    }
}

impl GpioBackend for SysfsGpio {
    fn setup_output(&self, pin: u64, high: bool) -> Result<()> {
        exported(pin)?
            .set_direction(if high { Direction::High } else { Direction::Low })
            .with_context(|| format!("could not set direction of pin {}", pin))?;
        Ok(())
    }

    fn setup_input(&self, pin: u64) -> Result<()> {
        exported(pin)?
            .set_direction(Direction::In)
            .with_context(|| format!("could not set direction of pin {}", pin))?;
        Ok(())
    }

    fn write(&self, pin: u64, high: bool) -> Result<()> {
        Pin::new(pin)
            .set_value(high as u8)
            .with_context(|| format!("could not write pin {}", pin))?;
        Ok(())
    }

    fn read(&self, pin: u64) -> Result<bool> {
        let value = Pin::new(pin)
            .get_value()
            .with_context(|| format!("could not read pin {}", pin))?;
        Ok(value == 1)
    }

    fn release(&self, pin: u64) -> Result<()> {
        Pin::new(pin)
            .unexport()
            .with_context(|| format!("could not unexport pin {}", pin))?;
        Ok(())
    }

    fn edge_events(&self, pin: u64, edge: Edge) -> Result<Box<dyn EdgeEvents>> {
        let gpio = exported(pin)?;
        gpio.set_direction(Direction::In)?;
        gpio.set_edge(edge.as_sysfs())
            .with_context(|| format!("could not set edge of pin {}", pin))?;
        let mut poller = gpio.get_poller()?;
        // The value file is readable once before the first interrupt
        poller.poll(0)?;
        Ok(Box::new(SysfsEdges { poller }))
    }

    fn set_pwm(&self, channel: PwmChannel, duty: f64) -> Result<()> {
        if !(channel.hertz > 0.0) {
            bail!("PWM frequency must be positive, got {}", channel.hertz);
        }
        let chip = PathBuf::from(format!("{}/pwmchip{}", SYSFS_PWM, channel.chip));
        let dir = chip.join(format!("pwm{}", channel.channel));
        if !dir.exists() {
            write_attribute(&chip.join("export"), &channel.channel.to_string())?;
        }
        let period_ns = (1e9 / channel.hertz).round() as u64;
        let duty_ns = (period_ns as f64 * duty.max(0.0).min(100.0) / 100.0).round() as u64;
        // The kernel rejects a duty cycle longer than the period
        write_attribute(&dir.join("duty_cycle"), "0")?;
        write_attribute(&dir.join("period"), &period_ns.to_string())?;
        write_attribute(&dir.join("duty_cycle"), &duty_ns.to_string())?;
        write_attribute(&dir.join("enable"), if duty_ns > 0 { "1" } else { "0" })
    }
}

/// In-memory board. Pins read back whatever was last written, and inputs
/// can be driven with [`MockGpio::drive`].
#[derive(Debug, Default)]
pub struct MockGpio {
    levels: Mutex<HashMap<u64, bool>>,
    writes: Mutex<Vec<(u64, bool)>>,
    watchers: Mutex<HashMap<u64, Vec<(Edge, Sender<bool>)>>>,
    pwm: Mutex<HashMap<(u32, u32), f64>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a pin's level, raising interrupts on armed pins when it changes.
    pub fn drive(&self, pin: u64, high: bool) {
        let previous = self
            .levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, high);
        if previous == Some(high) {
            return;
        }
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = watchers.get_mut(&pin) {
            senders.retain(|(edge, tx)| !edge.matches(high) || tx.send(high).is_ok());
        }
    }

    pub fn level(&self, pin: u64) -> Option<bool> {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .copied()
    }

    /// Every `write` call so far, in order.
    pub fn writes(&self) -> Vec<(u64, bool)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Last duty cycle set on a PWM channel.
    pub fn duty_cycle(&self, chip: u32, channel: u32) -> Option<f64> {
        self.pwm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(chip, channel))
            .copied()
    }
}

struct MockEdges {
    rx: Receiver<bool>,
}

impl EdgeEvents for MockEdges {
    fn wait(&mut self, timeout: Duration) -> Result<Option<bool>> {
        match self.rx.recv_timeout(timeout) {
            Ok(level) => Ok(Some(level)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("pin was released"),
        }
    }
}

impl GpioBackend for MockGpio {
    fn setup_output(&self, pin: u64, high: bool) -> Result<()> {
        self.drive(pin, high);
        Ok(())
    }

    fn setup_input(&self, pin: u64) -> Result<()> {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        levels.entry(pin).or_insert(false);
        Ok(())
    }

    fn write(&self, pin: u64, high: bool) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pin, high));
        self.drive(pin, high);
        Ok(())
    }

    fn read(&self, pin: u64) -> Result<bool> {
        self.level(pin)
            .with_context(|| format!("pin {} is not set up", pin))
    }

    fn release(&self, pin: u64) -> Result<()> {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pin);
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pin);
        Ok(())
    }

    fn edge_events(&self, pin: u64, edge: Edge) -> Result<Box<dyn EdgeEvents>> {
        self.setup_input(pin)?;
        let (tx, rx) = mpsc::channel();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(pin)
            .or_default()
            .push((edge, tx));
        Ok(Box::new(MockEdges { rx }))
    }

    fn set_pwm(&self, channel: PwmChannel, duty: f64) -> Result<()> {
        if !(channel.hertz > 0.0) {
            bail!("PWM frequency must be positive, got {}", channel.hertz);
        }
        self.pwm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((channel.chip, channel.channel), duty);
        Ok(())
    }
}

/// Invokes a callback on debounced pin interrupts.
pub struct EdgeWatcher {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// How long one wait blocks before the stop flag is looked at again.
const EDGE_WAIT: Duration = Duration::from_millis(250);

impl EdgeWatcher {
    /// `on_edge` receives the level after each transition. Transitions
    /// within `bounce` of the previously reported one are ignored.
    pub fn spawn<F>(
        gpio: Arc<dyn GpioBackend>,
        pin: u64,
        edge: Edge,
        bounce: Duration,
        on_edge: F,
    ) -> Result<EdgeWatcher>
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut events = gpio.edge_events(pin, edge)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("edge-{}", pin))
            .spawn(move || {
                let mut last_edge: Option<Instant> = None;
                while flag.load(Ordering::SeqCst) {
                    match events.wait(EDGE_WAIT) {
                        Ok(Some(level)) => {
                            if last_edge.map_or(false, |t| t.elapsed() < bounce) {
                                debug!("Ignoring bounce on pin {}", pin);
                                continue;
                            }
                            last_edge = Some(Instant::now());
                            on_edge(level);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Edge wait on pin {} failed: {:#}", pin, e);
                            thread::sleep(EDGE_WAIT);
                        }
                    }
                }
            })?;
        Ok(EdgeWatcher {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
