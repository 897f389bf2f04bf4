//! The long running workers and the seams between them.
pub mod lcd;
pub mod pid;
pub mod relay;
pub mod sensor;
pub mod timer;

use crate::config::{LcdId, RelayId, RelayState};
use anyhow::{bail, Result};
use log::{error, info};
use relay::RelayError;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Everything other workers may ask of the relay actuation service.
pub trait RelayControl: Send + Sync {
    fn turn_on(
        &self,
        relay_id: RelayId,
        duration: f64,
        trigger_conditionals: bool,
        min_off_duration: f64,
    ) -> Result<(), RelayError>;

    fn turn_off(&self, relay_id: RelayId, trigger_conditionals: bool) -> Result<(), RelayError>;

    /// Run a PWM relay at `duty` percent. Zero switches it off.
    fn set_duty_cycle(&self, relay_id: RelayId, _duty: f64) -> Result<(), RelayError> {
        Err(RelayError::NotPwm(relay_id))
    }

    fn relay_state(&self, relay_id: RelayId) -> Result<RelayState, RelayError>;
}

pub trait LcdControl: Send + Sync {
    /// Start or stop flashing a display.
    fn flash(&self, lcd_id: LcdId, on: bool) -> Result<String>;
}

/// Used where no LCDs are wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLcds;

impl LcdControl for NoLcds {
    fn flash(&self, lcd_id: LcdId, _on: bool) -> Result<String> {
        bail!("LCD {} is not running", lcd_id)
    }
}

/// A control loop driven by [`WorkerHandle`].
pub trait Worker: Send {
    fn name(&self) -> String;

    /// Runs on the worker thread before readiness is signalled.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// One loop iteration. Errors are logged and the loop carries on.
    fn step(&mut self) -> Result<()>;

    /// Sleep between iterations.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// Runs on the worker thread after the loop has been told to stop.
    fn shutdown(&mut self) {}
}

/// Owns a worker thread. The thread is told to stop and joined on drop.
pub struct WorkerHandle {
    name: String,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker and block until it has initialized.
    pub fn spawn<W: Worker + 'static>(mut worker: W) -> Result<WorkerHandle> {
        let name = worker.name();
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_running = running.clone();
        let thread_alive = alive.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = worker.initialize() {
                thread_alive.store(false, Ordering::SeqCst);
                let _ = ready_tx.send(Err(e));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            info!("{} running", thread_name);
            while thread_running.load(Ordering::SeqCst) {
                match panic::catch_unwind(AssertUnwindSafe(|| worker.step())) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("{} iteration failed: {:#}", thread_name, e),
                    Err(_) => error!("{} iteration panicked", thread_name),
                }
                thread::sleep(worker.poll_interval());
            }
            worker.shutdown();
            thread_alive.store(false, Ordering::SeqCst);
            info!("{} stopped", thread_name);
        })?;
        let mut worker_handle = WorkerHandle {
            name,
            running,
            alive,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(worker_handle),
            Ok(Err(e)) => {
                worker_handle.stop();
                Err(e.context(format!("{} failed to initialize", worker_handle.name)))
            }
            Err(_) => {
                worker_handle.stop();
                bail!("{} exited before signalling readiness", worker_handle.name)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Signal the loop and wait for the thread to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} thread panicked during shutdown", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
