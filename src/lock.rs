//! File based locks guarding shared bus addresses (I2C multiplexers, ADCs).
//!
//! A lock is a file created with `O_EXCL` that holds the PID of its owner.
//! A lock left behind by a process that no longer exists is broken and
//! acquisition retried once. A lock held by a live process is only broken
//! on timeout when `break_live_locks` is set.
use anyhow::Context;
use log::{debug, warn};
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {path} (held by pid {holder:?})")]
    Timeout {
        path: PathBuf,
        holder: Option<u32>,
        waited: Duration,
    },
    #[error("{path} still contended after breaking a stale lock")]
    StillContended { path: PathBuf },
    #[error("lock file i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    break_live_locks: bool,
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Releasing lock {}", self.path.display());
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

enum Attempt {
    Acquired(LockGuard),
    Held(Option<u32>),
}

impl LockManager {
    pub fn new<P: Into<PathBuf>>(dir: P, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            break_live_locks: false,
        }
    }

    /// Break locks on timeout even when their owner is still alive.
    pub fn break_live_locks(mut self, enabled: bool) -> Self {
        self.break_live_locks = enabled;
        self
    }

    pub fn lock_path(&self, resource_key: &str) -> PathBuf {
        self.dir.join(format!("verdant_{}.pid", resource_key))
    }

    pub fn acquire(&self, resource_key: &str) -> Result<LockGuard, LockError> {
        self.acquire_with_timeout(resource_key, self.timeout)
    }

    pub fn acquire_with_timeout(
        &self,
        resource_key: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let path = self.lock_path(resource_key);
        fs::create_dir_all(&self.dir).map_err(|source| LockError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let started = Instant::now();
        let mut broken = false;
        loop {
            match self.try_create(&path)? {
                Attempt::Acquired(guard) => {
                    debug!(
                        "Acquired lock {} in {:.1} ms",
                        path.display(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                    return Ok(guard);
                }
                Attempt::Held(holder) => {
                    let timed_out = started.elapsed() >= timeout;
                    // An unreadable owner record is treated as dead once we have waited out the timeout.
                    let dead = match holder {
                        Some(pid) => !process_alive(pid),
                        None => timed_out,
                    };
                    if dead || (timed_out && self.break_live_locks) {
                        if broken {
                            return Err(LockError::StillContended { path });
                        }
                        warn!(
                            "Breaking stale lock {} held by pid {:?} ({})",
                            path.display(),
                            holder,
                            if dead { "holder is gone" } else { "timed out" }
                        );
                        self.break_lock(&path)?;
                        broken = true;
                        continue;
                    }
                    if timed_out {
                        return Err(LockError::Timeout {
                            path,
                            holder,
                            waited: started.elapsed(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn try_create(&self, path: &Path) -> Result<Attempt, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(format!("{}\n", std::process::id()).as_bytes())
                    .map_err(|source| LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Ok(Attempt::Acquired(LockGuard {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Attempt::Held(read_holder(path))),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn break_lock(&self, path: &Path) -> Result<(), LockError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Whether a process with this PID exists. Our own PID is always alive:
/// in-process holders release through their guard even when unwinding.
pub fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new(&format!("/proc/{}", pid)).exists()
}

/// Resource keys for bus devices, e.g. `i2c1_0x70`.
pub fn bus_key(bus: u8, address: u8) -> String {
    format!("i2c{}_0x{:02X}", bus, address)
}

/// Create the lock directory up front so permission problems show at start-up.
pub fn prepare_dir(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("could not create lock dir {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_keys_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(100));
        let a = locks.acquire("i2c1_0x70").unwrap();
        let b = locks.acquire("i2c1_0x48").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn guard_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(100));
        let path = {
            let guard = locks.acquire("adc").unwrap();
            guard.path().to_path_buf()
        };
        assert!(!path.exists());
        locks.acquire("adc").unwrap();
    }

    #[test]
    fn live_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(100));
        let _held = locks.acquire("mux").unwrap();
        match locks.acquire("mux") {
            Err(LockError::Timeout { holder, .. }) => assert_eq!(holder, Some(std::process::id())),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn dead_holder_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_secs(5));
        // PIDs are capped well below this on Linux.
        fs::write(locks.lock_path("mux"), "4194305\n").unwrap();
        let started = Instant::now();
        let guard = locks.acquire("mux").unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            fs::read_to_string(guard.path()).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn live_holder_broken_on_timeout_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(50)).break_live_locks(true);
        fs::write(locks.lock_path("adc"), format!("{}\n", std::process::id())).unwrap();
        assert!(locks.acquire("adc").is_ok());
    }

    #[test]
    fn bus_keys_are_formatted() {
        assert_eq!(bus_key(1, 0x70), "i2c1_0x70");
    }
}
