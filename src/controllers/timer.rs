//! Wall clock schedules that switch a relay without looking at sensors.
use crate::{
    clock::{minute_of_day, parse_hour_minute, seconds, within_span, SharedClock, Ticker},
    config::{RelayId, RelayState, TimerConfig, TimerKind},
    controllers::{RelayControl, Worker},
};
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime};
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

enum Schedule {
    Time {
        at: NaiveTime,
        duration_on: f64,
        fired: Option<(NaiveDate, u32)>,
    },
    Timespan {
        start: NaiveTime,
        end: NaiveTime,
        in_flight: Arc<AtomicBool>,
    },
    Duration {
        on: f64,
        ticker: Ticker,
    },
}

pub struct TimerWorker {
    config: TimerConfig,
    relays: Arc<dyn RelayControl>,
    clock: SharedClock,
    schedule: Schedule,
    background: bool,
}

impl TimerWorker {
    pub fn new(config: TimerConfig, relays: Arc<dyn RelayControl>, clock: SharedClock) -> Result<TimerWorker> {
        let schedule = match &config.kind {
            TimerKind::Time { at, duration_on } => Schedule::Time {
                at: parse_hour_minute(at)?,
                duration_on: *duration_on,
                fired: None,
            },
            TimerKind::Timespan { start, end } => Schedule::Timespan {
                start: parse_hour_minute(start)?,
                end: parse_hour_minute(end)?,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
            TimerKind::Duration { on, off } => Schedule::Duration {
                on: *on,
                ticker: Ticker::new(seconds(on + off), clock.now()),
            },
        };
        Ok(TimerWorker {
            config,
            relays,
            clock,
            schedule,
            background: true,
        })
    }

    /// Issue relay commands on the timer's own thread.
    pub fn dispatch_inline(mut self) -> Self {
        self.background = false;
        self
    }

    /// Send a relay command. `done` runs once the call returns.
    fn dispatch(&self, state: RelayState, duration: f64, done: Option<Arc<AtomicBool>>) {
        let relays = self.relays.clone();
        let relay_id = self.config.relay_id;
        let timer_id = self.config.id;
        let command = move || {
            send(relays.as_ref(), timer_id, relay_id, state, duration);
            if let Some(flag) = done {
                flag.store(false, Ordering::SeqCst);
            }
        };
        if self.background {
            if let Err(e) = thread::Builder::new()
                .name(format!("timer-{}-dispatch", timer_id))
                .spawn(command)
            {
                warn!("Timer {}: could not dispatch relay command: {}", timer_id, e);
            }
        } else {
            command();
        }
    }

    fn evaluate(&mut self) {
        let now = self.clock.now();
        let time = now.time();
        let state = self.config.state;
        let mut command: Option<(f64, Option<Arc<AtomicBool>>)> = None;
        match &mut self.schedule {
            Schedule::Time {
                at,
                duration_on,
                fired,
            } => {
                let minute = minute_of_day(time);
                if minute == minute_of_day(*at) {
                    let key = (now.date_naive(), minute);
                    if *fired != Some(key) {
                        *fired = Some(key);
                        info!("Timer {}: {} reached", self.config.id, at.format("%H:%M"));
                        command = Some((*duration_on, None));
                    }
                } else {
                    *fired = None;
                }
            }
            Schedule::Timespan {
                start,
                end,
                in_flight,
            } => {
                if within_span(time, *start, *end) && !in_flight.load(Ordering::SeqCst) {
                    match self.relays.relay_state(self.config.relay_id) {
                        Ok(actual) if actual != state => {
                            info!(
                                "Timer {}: relay {} is {} during {}-{}, correcting",
                                self.config.id,
                                self.config.relay_id,
                                actual,
                                start.format("%H:%M"),
                                end.format("%H:%M")
                            );
                            in_flight.store(true, Ordering::SeqCst);
                            command = Some((0.0, Some(in_flight.clone())));
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Timer {}: {}", self.config.id, e),
                    }
                }
            }
            Schedule::Duration { on, ticker } => {
                if ticker.ready(now) {
                    command = Some((*on, None));
                }
            }
        }
        if let Some((duration, done)) = command {
            self.dispatch(state, duration, done);
        }
    }
}

fn send(relays: &dyn RelayControl, timer_id: u32, relay_id: RelayId, state: RelayState, duration: f64) {
    let result = match state {
        RelayState::On => relays.turn_on(relay_id, duration, true, 0.0),
        RelayState::Off => relays.turn_off(relay_id, true),
    };
    if let Err(e) = result {
        warn!("Timer {}: {}", timer_id, e);
    }
}

impl Worker for TimerWorker {
    fn name(&self) -> String {
        format!("Timer {}", self.config.id)
    }

    fn step(&mut self) -> Result<()> {
        self.evaluate();
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn shutdown(&mut self) {
        send(
            self.relays.as_ref(),
            self.config.id,
            self.config.relay_id,
            RelayState::Off,
            0.0,
        );
    }
}
