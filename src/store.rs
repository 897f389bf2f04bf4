//! Append-only time-series storage for measurements.
//!
//! Facts land in hourly files per entity, one `timestamp,json` line each.
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::{
        mpsc::{self, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub entity: String,
    pub measurement: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(entity: &str, measurement: &str, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity: entity.to_string(),
            measurement: measurement.to_string(),
            value,
            timestamp,
        }
    }
}

pub fn relay_entity(id: u32) -> String {
    format!("relay_{}", id)
}

pub fn sensor_entity(id: u32) -> String {
    format!("sensor_{}", id)
}

pub fn pid_entity(id: u32) -> String {
    format!("pid_{}", id)
}

pub trait MeasurementStore: Send + Sync {
    fn write(&self, measurement: &Measurement) -> Result<()>;

    /// Most recent fact for this entity and measurement type, if any.
    fn read_latest(&self, entity: &str, measurement: &str) -> Result<Option<Measurement>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Line {
    measurement: String,
    value: f64,
}

/// Hourly append-only files under `dir/<entity>/<YYYY-MM-DD-HH>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

/// How many hourly files `read_latest` looks through before giving up.
const MAX_FILES_SCANNED: usize = 48;

impl FileStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    // Generate filename for a day and an hour
    fn filename(&self, entity: &str, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(entity)
            .join(timestamp.format("%Y-%m-%d-%H").to_string())
    }

    fn read_file(path: &PathBuf) -> Result<Vec<Measurement>> {
        let entity = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut facts = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let (timestamp, body) = match line.split_once(',') {
                Some(parts) => parts,
                None => {
                    warn!("Skipping malformed line in {}", path.display());
                    continue;
                }
            };
            let millis: i64 = timestamp.parse()?;
            let body: Line = serde_json::from_str(body)?;
            let timestamp = Utc
                .timestamp_millis_opt(millis)
                .single()
                .context("timestamp out of range")?;
            facts.push(Measurement {
                entity: entity.clone(),
                measurement: body.measurement,
                value: body.value,
                timestamp,
            });
        }
        Ok(facts)
    }
}

impl MeasurementStore for FileStore {
    fn write(&self, measurement: &Measurement) -> Result<()> {
        let filename = self.filename(&measurement.entity, measurement.timestamp);
        if let Some(parent) = filename.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .with_context(|| format!("could not open {}", filename.display()))?;
        let line = Line {
            measurement: measurement.measurement.clone(),
            value: measurement.value,
        };
        file.write_all(
            format!(
                "{},{}\n",
                measurement.timestamp.timestamp_millis(),
                serde_json::to_string(&line)?
            )
            .as_bytes(),
        )?;
        Ok(())
    }

    fn read_latest(&self, entity: &str, measurement: &str) -> Result<Option<Measurement>> {
        let dir = self.dir.join(entity);
        if !dir.exists() {
            return Ok(None);
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        // Hourly names sort chronologically
        files.sort();
        for path in files.iter().rev().take(MAX_FILES_SCANNED) {
            let latest = Self::read_file(path)?
                .into_iter()
                .filter(|m| m.measurement == measurement)
                .max_by_key(|m| m.timestamp);
            if latest.is_some() {
                return Ok(latest);
            }
        }
        Ok(None)
    }
}

/// Keeps every fact in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    facts: Mutex<Vec<Measurement>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Measurement> {
        self.facts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn records(&self, entity: &str, measurement: &str) -> Vec<Measurement> {
        self.all()
            .into_iter()
            .filter(|m| m.entity == entity && m.measurement == measurement)
            .collect()
    }
}

impl MeasurementStore for MemoryStore {
    fn write(&self, measurement: &Measurement) -> Result<()> {
        self.facts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(measurement.clone());
        Ok(())
    }

    fn read_latest(&self, entity: &str, measurement: &str) -> Result<Option<Measurement>> {
        Ok(self
            .facts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.entity == entity && m.measurement == measurement)
            .max_by_key(|m| m.timestamp)
            .cloned())
    }
}

/// Writes facts from a background thread so control loops never wait on
/// storage. When the queue is full the write happens on the caller's
/// thread instead of being dropped.
pub struct Persister {
    store: Arc<dyn MeasurementStore>,
    tx: Mutex<Option<SyncSender<Measurement>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn spawn(store: Arc<dyn MeasurementStore>, capacity: usize) -> Result<Persister> {
        let (tx, rx) = mpsc::sync_channel::<Measurement>(capacity);
        let worker_store = store.clone();
        let handle = thread::Builder::new()
            .name("persister".into())
            .spawn(move || {
                for measurement in rx {
                    if let Err(e) = worker_store.write(&measurement) {
                        error!("Could not store {:?}: {:#}", measurement, e);
                    }
                }
            })?;
        Ok(Persister {
            store,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Writes inline on the caller's thread.
    pub fn synchronous(store: Arc<dyn MeasurementStore>) -> Persister {
        Persister {
            store,
            tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    pub fn persist(&self, measurement: Measurement) {
        let pending = {
            let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            match tx.as_ref() {
                Some(tx) => match tx.try_send(measurement) {
                    Ok(()) => None,
                    Err(TrySendError::Full(m)) => {
                        warn!("Persistence queue full, writing {} synchronously", m.measurement);
                        Some(m)
                    }
                    Err(TrySendError::Disconnected(m)) => Some(m),
                },
                None => Some(measurement),
            }
        };
        if let Some(measurement) = pending {
            if let Err(e) = self.store.write(&measurement) {
                error!("Could not store {:?}: {:#}", measurement, e);
            }
        }
    }

    pub fn persist_value(&self, entity: &str, measurement: &str, value: f64, timestamp: DateTime<Utc>) {
        self.persist(Measurement::new(entity, measurement, value, timestamp));
    }

    /// Drain the queue and stop the writer thread.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if handle.join().is_err() {
                error!("Persister thread panicked");
            }
        }
        debug!("Persister closed");
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.close();
    }
}
