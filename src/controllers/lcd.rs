//! Character displays showing the latest measurements.
//!
//! Displays are HD44780 controllers behind a PCF8574 I2C backpack.
use crate::{
    clock::{seconds, SharedClock, Ticker},
    config::{LcdConfig, LcdId},
    controllers::{LcdControl, Worker},
    store::MeasurementStore,
};
use anyhow::{anyhow, bail, Context, Result};
use hd44780_driver::{bus::I2CBus, Cursor, CursorBlink, Display, DisplayMode, HD44780};
use linux_embedded_hal::{Delay, I2cdev};
use log::{debug, info};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

/// DDRAM address of the first column of each row.
const ROW_OFFSETS: [u8; 4] = [0x00, 0x40, 0x14, 0x54];

fn lcd_error<E: fmt::Debug>(e: E) -> anyhow::Error {
    anyhow!("LCD bus error: {:?}", e)
}

/// Exactly `rows` lines, each padded or cut to `columns` characters.
pub fn layout(lines: &[String], rows: usize, columns: usize) -> Vec<String> {
    (0..rows)
        .map(|row| {
            let text = lines.get(row).map(String::as_str).unwrap_or("");
            format!("{:<width$.width$}", text, width = columns)
        })
        .collect()
}

pub trait LcdDisplay: Send {
    /// Replace the whole screen. Rows without a line are cleared.
    fn show(&mut self, lines: &[String]) -> Result<()>;
}

/// Opens the display an LCD worker draws on.
pub trait DisplayFactory: Send + Sync {
    fn open(&self, config: &LcdConfig) -> Result<Box<dyn LcdDisplay>>;
}

pub struct I2cLcd {
    lcd: HD44780<I2CBus<I2cdev>>,
    delay: Delay,
    rows: usize,
    columns: usize,
}

impl I2cLcd {
    pub fn open(config: &LcdConfig) -> Result<I2cLcd> {
        let path = format!("/dev/i2c-{}", config.i2c_bus);
        let i2c = I2cdev::new(&path).with_context(|| format!("could not open {}", path))?;
        let mut delay = Delay;
        let mut lcd = HD44780::new_i2c(i2c, config.i2c_address, &mut delay).map_err(lcd_error)?;
        lcd.reset(&mut delay).map_err(lcd_error)?;
        lcd.clear(&mut delay).map_err(lcd_error)?;
        lcd.set_display_mode(
            DisplayMode {
                display: Display::On,
                cursor_visibility: Cursor::Invisible,
                cursor_blink: CursorBlink::Off,
            },
            &mut delay,
        )
        .map_err(lcd_error)?;
        info!(
            "LCD {} ready on {} at {:#04x}",
            config.id, path, config.i2c_address
        );
        Ok(I2cLcd {
            lcd,
            delay,
            rows: config.rows.min(ROW_OFFSETS.len()),
            columns: config.columns,
        })
    }
}

impl LcdDisplay for I2cLcd {
    fn show(&mut self, lines: &[String]) -> Result<()> {
        for (row, text) in layout(lines, self.rows, self.columns).iter().enumerate() {
            self.lcd
                .set_cursor_pos(ROW_OFFSETS[row], &mut self.delay)
                .map_err(lcd_error)?;
            self.lcd.write_str(text, &mut self.delay).map_err(lcd_error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct I2cDisplays;

impl DisplayFactory for I2cDisplays {
    fn open(&self, config: &LcdConfig) -> Result<Box<dyn LcdDisplay>> {
        Ok(Box::new(I2cLcd::open(config)?))
    }
}

type Frames = Arc<Mutex<HashMap<LcdId, Vec<Vec<String>>>>>;

/// Displays that only remember what they were asked to show.
#[derive(Debug, Default, Clone)]
pub struct RecordingDisplays {
    frames: Frames,
}

impl RecordingDisplays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame shown on `lcd_id`, oldest first.
    pub fn frames(&self, lcd_id: LcdId) -> Vec<Vec<String>> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&lcd_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_frame(&self, lcd_id: LcdId) -> Option<Vec<String>> {
        self.frames(lcd_id).pop()
    }
}

struct RecordingDisplay {
    id: LcdId,
    rows: usize,
    columns: usize,
    frames: Frames,
}

impl LcdDisplay for RecordingDisplay {
    fn show(&mut self, lines: &[String]) -> Result<()> {
        let frame = layout(lines, self.rows, self.columns);
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(self.id)
            .or_default()
            .push(frame);
        Ok(())
    }
}

impl DisplayFactory for RecordingDisplays {
    fn open(&self, config: &LcdConfig) -> Result<Box<dyn LcdDisplay>> {
        Ok(Box::new(RecordingDisplay {
            id: config.id,
            rows: config.rows,
            columns: config.columns,
            frames: self.frames.clone(),
        }))
    }
}

/// Flags a running display shares with the rest of the daemon.
#[derive(Debug, Default)]
pub struct LcdState {
    flashing: AtomicBool,
}

impl LcdState {
    pub fn is_flashing(&self) -> bool {
        self.flashing.load(Ordering::SeqCst)
    }
}

/// Routes flash requests to running displays.
#[derive(Debug, Default)]
pub struct LcdRegistry {
    displays: RwLock<HashMap<LcdId, Arc<LcdState>>>,
}

impl LcdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: LcdId, state: Arc<LcdState>) {
        self.displays
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state);
    }

    pub fn unregister(&self, id: LcdId) {
        self.displays
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

impl LcdControl for LcdRegistry {
    fn flash(&self, lcd_id: LcdId, on: bool) -> Result<String> {
        let displays = self.displays.read().unwrap_or_else(|e| e.into_inner());
        let state = match displays.get(&lcd_id) {
            Some(state) => state,
            None => bail!("LCD {} is not running", lcd_id),
        };
        state.flashing.store(on, Ordering::SeqCst);
        Ok(if on {
            format!("LCD {} flashing", lcd_id)
        } else {
            format!("LCD {} stopped flashing", lcd_id)
        })
    }
}

pub struct LcdWorker {
    config: LcdConfig,
    store: Arc<dyn MeasurementStore>,
    clock: SharedClock,
    displays: Arc<dyn DisplayFactory>,
    display: Option<Box<dyn LcdDisplay>>,
    ticker: Ticker,
    state: Arc<LcdState>,
    content: Vec<String>,
    blank: bool,
}

impl LcdWorker {
    pub fn new(
        config: LcdConfig,
        store: Arc<dyn MeasurementStore>,
        clock: SharedClock,
        displays: Arc<dyn DisplayFactory>,
    ) -> Self {
        let ticker = Ticker::new(seconds(config.period), clock.now());
        Self {
            config,
            store,
            clock,
            displays,
            display: None,
            ticker,
            state: Arc::new(LcdState::default()),
            content: Vec::new(),
            blank: false,
        }
    }

    pub fn state(&self) -> Arc<LcdState> {
        self.state.clone()
    }

    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} {}",
            self.config.name,
            self.clock.now().format("%H:%M")
        )];
        for line in &self.config.lines {
            let label = line
                .label
                .clone()
                .unwrap_or_else(|| format!("{} {}", line.entity, line.measurement));
            let value = match self.store.read_latest(&line.entity, &line.measurement) {
                Ok(Some(m)) => format!("{:.1}", m.value),
                Ok(None) => "--".to_string(),
                Err(e) => {
                    debug!("LCD {}: {:#}", self.config.id, e);
                    "ERR".to_string()
                }
            };
            lines.push(format!("{}: {}", label, value));
        }
        lines
    }

    fn show(&mut self, lines: &[String]) -> Result<()> {
        match self.display.as_mut() {
            Some(display) => display.show(lines),
            None => bail!("LCD {} is not open", self.config.id),
        }
    }
}

impl Worker for LcdWorker {
    fn name(&self) -> String {
        format!("LCD {}", self.config.id)
    }

    fn initialize(&mut self) -> Result<()> {
        self.display = Some(self.displays.open(&self.config)?);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        if self.ticker.ready(self.clock.now()) || self.content.is_empty() {
            self.content = self.render();
        }
        if self.state.is_flashing() {
            self.blank = !self.blank;
        } else {
            self.blank = false;
        }
        let frame = if self.blank {
            Vec::new()
        } else {
            self.content.clone()
        };
        self.show(&frame)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn shutdown(&mut self) {
        let _ = self.show(&[]);
    }
}
