//! Sensor drivers. Every driver turns one device read into a map of
//! measurement name to value.
use crate::{
    config::{AdcConfig, MultiplexerConfig, SensorConfig, SensorDevice},
    lock::{bus_key, LockManager},
};
use anyhow::{anyhow, bail, Context, Result};
use embedded_hal::blocking::i2c::Write as I2cWrite;
use lazy_static::lazy_static;
use linux_embedded_hal::I2cdev;
use log::debug;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub type Measurements = BTreeMap<String, f64>;

pub trait SensorDriver: Send {
    fn acquire(&mut self) -> Result<Measurements>;
}

lazy_static! {
    static ref ONE_WIRE_TEMP: Regex = Regex::new(r"(?m)t=(-?[0-9]+)$").unwrap();
}

/// Parse the contents of a one-wire `w1_slave` file to degrees Celsius,
/// for example 18.5. A failed CRC line is an error.
pub fn parse_one_wire(contents: &str) -> Result<f64> {
    let crc_line = contents.lines().next().context("empty one-wire reading")?;
    if !crc_line.trim_end().ends_with("YES") {
        bail!("one-wire CRC check failed");
    }
    let caps = ONE_WIRE_TEMP
        .captures(contents)
        .context("capture failure for temperature")?;
    Ok(caps
        .get(1)
        .context("could not read temperature")?
        .as_str()
        .parse::<f64>()?
        / 1000.0)
}

/// DS18B20 temperature sensor on the one-wire bus.
#[derive(Debug, Clone)]
pub struct Ds18b20 {
    path: PathBuf,
}

impl Ds18b20 {
    /// `location` is either the full path to `w1_slave` or the device id.
    pub fn new(location: &str) -> Self {
        let path = if location.starts_with('/') {
            PathBuf::from(location)
        } else {
            Path::new("/sys/bus/w1/devices").join(location).join("w1_slave")
        };
        Self { path }
    }
}

impl SensorDriver for Ds18b20 {
    fn acquire(&mut self) -> Result<Measurements> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("could not read {}", self.path.display()))?;
        let mut measurements = Measurements::new();
        measurements.insert("temperature".into(), parse_one_wire(&contents)?);
        Ok(measurements)
    }
}

/// SoC temperature from the thermal zone, reported in millidegrees.
#[derive(Debug, Clone)]
pub struct CpuTemp {
    path: PathBuf,
}

impl CpuTemp {
    pub fn new(location: &str) -> Self {
        let path = if location.is_empty() {
            PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
        } else {
            PathBuf::from(location)
        };
        Self { path }
    }
}

impl SensorDriver for CpuTemp {
    fn acquire(&mut self) -> Result<Measurements> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("could not read {}", self.path.display()))?;
        let millis: f64 = raw.trim().parse()?;
        let mut measurements = Measurements::new();
        measurements.insert("temperature".into(), millis / 1000.0);
        Ok(measurements)
    }
}

/// Load averages from `/proc/loadavg`.
#[derive(Debug, Clone)]
pub struct CpuLoad {
    path: PathBuf,
}

impl CpuLoad {
    pub fn new(location: &str) -> Self {
        let path = if location.is_empty() {
            PathBuf::from("/proc/loadavg")
        } else {
            PathBuf::from(location)
        };
        Self { path }
    }
}

pub fn parse_loadavg(contents: &str) -> Result<Measurements> {
    let fields: Vec<&str> = contents.split_whitespace().collect();
    if fields.len() < 3 {
        bail!("unexpected loadavg contents '{}'", contents.trim());
    }
    let mut measurements = Measurements::new();
    for (name, field) in ["cpu_load_1m", "cpu_load_5m", "cpu_load_15m"]
        .iter()
        .zip(fields.iter())
    {
        measurements.insert(name.to_string(), field.parse()?);
    }
    Ok(measurements)
}

impl SensorDriver for CpuLoad {
    fn acquire(&mut self) -> Result<Measurements> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("could not read {}", self.path.display()))?;
        parse_loadavg(&contents)
    }
}

/// A voltage source with numbered channels.
pub trait AnalogReader: Send {
    fn read_volts(&mut self, channel: u8) -> Result<f64>;
}

/// An ADC exposed by the Linux IIO subsystem (`in_voltageN_raw` × `in_voltageN_scale` mV).
#[derive(Debug, Clone)]
pub struct IioAnalogReader {
    device_path: PathBuf,
}

impl IioAnalogReader {
    pub fn new<P: Into<PathBuf>>(device_path: P) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    fn read_number(&self, file: &str) -> Result<f64> {
        let path = self.device_path.join(file);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Ok(contents.trim().parse()?)
    }
}

impl AnalogReader for IioAnalogReader {
    fn read_volts(&mut self, channel: u8) -> Result<f64> {
        let raw = self.read_number(&format!("in_voltage{}_raw", channel))?;
        let scale = self.read_number(&format!("in_voltage{}_scale", channel))?;
        Ok(raw * scale / 1000.0)
    }
}

pub trait Multiplexer: Send {
    fn select(&mut self, channel: u8) -> Result<()>;
}

/// TCA9548A I2C switch. Writing a bit mask enables the matching downstream channel.
pub struct Tca9548a {
    dev: I2cdev,
    address: u8,
}

impl Tca9548a {
    pub fn open(bus: u8, address: u8) -> Result<Self> {
        let path = format!("/dev/i2c-{}", bus);
        let dev = I2cdev::new(&path).map_err(|e| anyhow!("could not open {}: {}", path, e))?;
        Ok(Self { dev, address })
    }
}

impl Multiplexer for Tca9548a {
    fn select(&mut self, channel: u8) -> Result<()> {
        if channel > 7 {
            bail!("multiplexer channel {} out of range", channel);
        }
        self.dev
            .write(self.address, &[1u8 << channel])
            .map_err(|e| anyhow!("could not select channel {} on 0x{:02X}: {}", channel, self.address, e))
    }
}

/// Map a voltage onto calibrated units. The voltage is clamped to the
/// calibrated range first and the result to the unit range.
pub fn convert_voltage(volts: f64, adc: &AdcConfig) -> f64 {
    let (v_lo, v_hi) = ordered(adc.volts_min, adc.volts_max);
    let span = v_hi - v_lo;
    if span <= 0.0 {
        return adc.units_min;
    }
    let fraction = (volts.max(v_lo).min(v_hi) - adc.volts_min) / (adc.volts_max - adc.volts_min);
    let value = adc.units_min + fraction * (adc.units_max - adc.units_min);
    let (u_lo, u_hi) = ordered(adc.units_min, adc.units_max);
    value.max(u_lo).min(u_hi)
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// An analog input, optionally behind a multiplexer channel. Both bus
/// addresses are locked for the duration of the read.
pub struct AdcSensor {
    adc: AdcConfig,
    bus: u8,
    reader: Box<dyn AnalogReader>,
    mux: Option<(MultiplexerConfig, Box<dyn Multiplexer>)>,
    locks: LockManager,
}

impl AdcSensor {
    pub fn new(
        adc: AdcConfig,
        bus: u8,
        reader: Box<dyn AnalogReader>,
        mux: Option<(MultiplexerConfig, Box<dyn Multiplexer>)>,
        locks: LockManager,
    ) -> Self {
        Self {
            adc,
            bus,
            reader,
            mux,
            locks,
        }
    }
}

impl SensorDriver for AdcSensor {
    fn acquire(&mut self) -> Result<Measurements> {
        // Guards drop in reverse declaration order: ADC first, then the multiplexer.
        let _mux_guard = match self.mux.as_mut() {
            Some((config, mux)) => {
                let guard = self.locks.acquire(&bus_key(config.bus, config.address))?;
                mux.select(config.channel)?;
                Some(guard)
            }
            None => None,
        };
        let _adc_guard = self.locks.acquire(&bus_key(self.bus, self.adc.address))?;
        let volts = self.reader.read_volts(self.adc.channel)?;
        let value = convert_voltage(volts, &self.adc);
        debug!(
            "ADC 0x{:02X} channel {}: {:.3} V -> {:.3}",
            self.adc.address, self.adc.channel, volts, value
        );
        let mut measurements = Measurements::new();
        measurements.insert(self.adc.measurement.clone(), value);
        Ok(measurements)
    }
}

/// Build the driver for a configured sensor. Edge sensors are event driven
/// and have no periodic driver.
pub fn build_driver(config: &SensorConfig, locks: &LockManager) -> Result<Option<Box<dyn SensorDriver>>> {
    let driver: Box<dyn SensorDriver> = match config.device {
        SensorDevice::Ds18b20 => Box::new(Ds18b20::new(&config.location)),
        SensorDevice::CpuTemp => Box::new(CpuTemp::new(&config.location)),
        SensorDevice::CpuLoad => Box::new(CpuLoad::new(&config.location)),
        SensorDevice::Adc => {
            let adc = config
                .adc
                .clone()
                .with_context(|| format!("sensor {} has no adc section", config.id))?;
            let mux = match &config.multiplexer {
                Some(mux) => {
                    let device: Box<dyn Multiplexer> = Box::new(Tca9548a::open(mux.bus, mux.address)?);
                    Some((mux.clone(), device))
                }
                None => None,
            };
            let reader = Box::new(IioAnalogReader::new(adc.device_path.clone()));
            Box::new(AdcSensor::new(adc, config.i2c_bus, reader, mux, locks.clone()))
        }
        SensorDevice::Edge => return Ok(None),
    };
    Ok(Some(driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    fn adc(volts_min: f64, volts_max: f64, units_min: f64, units_max: f64) -> AdcConfig {
        AdcConfig {
            address: 0x48,
            channel: 0,
            device_path: PathBuf::from("/nonexistent"),
            measurement: "moisture".into(),
            volts_min,
            volts_max,
            units_min,
            units_max,
        }
    }

    #[test]
    fn parses_one_wire_reading() {
        let ok = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=18500\n";
        assert_eq!(parse_one_wire(ok).unwrap(), 18.5);
        let negative = "ff ff : crc=aa YES\nff ff t=-1250\n";
        assert_eq!(parse_one_wire(negative).unwrap(), -1.25);
        let bad_crc = "72 01 : crc=57 NO\n72 01 t=18500\n";
        assert!(parse_one_wire(bad_crc).is_err());
    }

    #[test]
    fn parses_loadavg() {
        let m = parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(m["cpu_load_1m"], 0.52);
        assert_eq!(m["cpu_load_15m"], 0.59);
        assert!(parse_loadavg("0.5").is_err());
    }

    #[test]
    fn voltage_is_clamped_then_mapped() {
        let cal = adc(0.5, 2.5, 0.0, 100.0);
        assert_eq!(convert_voltage(1.5, &cal), 50.0);
        assert_eq!(convert_voltage(0.0, &cal), 0.0);
        assert_eq!(convert_voltage(3.3, &cal), 100.0);
    }

    #[test]
    fn inverted_unit_range_maps_downwards() {
        let cal = adc(0.0, 2.0, 100.0, 0.0);
        assert_eq!(convert_voltage(0.5, &cal), 75.0);
        assert_eq!(convert_voltage(5.0, &cal), 0.0);
    }

    proptest! {
        #[test]
        fn converted_value_stays_in_unit_range(volts in -10.0f64..10.0) {
            let cal = adc(0.3, 3.0, -20.0, 80.0);
            let value = convert_voltage(volts, &cal);
            prop_assert!(value >= -20.0 && value <= 80.0);
        }
    }

    struct FixedReader(f64);

    impl AnalogReader for FixedReader {
        fn read_volts(&mut self, _channel: u8) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct RecordingMux(Arc<Mutex<Vec<u8>>>);

    impl Multiplexer for RecordingMux {
        fn select(&mut self, channel: u8) -> Result<()> {
            self.0.lock().unwrap().push(channel);
            Ok(())
        }
    }

    #[test]
    fn adc_read_selects_channel_and_releases_locks() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(100));
        let selected = Arc::new(Mutex::new(Vec::new()));
        let mux = MultiplexerConfig {
            address: 0x70,
            bus: 1,
            channel: 3,
        };
        let mut sensor = AdcSensor::new(
            adc(0.0, 3.3, 0.0, 100.0),
            1,
            Box::new(FixedReader(1.65)),
            Some((mux, Box::new(RecordingMux(selected.clone())))),
            locks.clone(),
        );
        let m = sensor.acquire().unwrap();
        assert!((m["moisture"] - 50.0).abs() < 1e-9);
        assert_eq!(*selected.lock().unwrap(), vec![3]);
        assert!(!locks.lock_path("i2c1_0x70").exists());
        assert!(!locks.lock_path("i2c1_0x48").exists());
    }

    #[test]
    fn adc_read_fails_while_bus_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(50));
        let _held = locks.acquire("i2c1_0x48").unwrap();
        let mut sensor = AdcSensor::new(adc(0.0, 3.3, 0.0, 100.0), 1, Box::new(FixedReader(1.0)), None, locks.clone());
        assert!(sensor.acquire().is_err());
    }
}
