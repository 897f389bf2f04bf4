//! Executes the actions of a fired conditional.
use crate::{
    clock::SharedClock,
    config::{Action, CaptureKind, RelayState},
    controllers::{LcdControl, RelayControl},
    metrics::CONDITIONAL_FIRES,
    notify::{run_command, Camera, EmailLimiter, Mailer},
};
use log::{error, info, warn};
use std::{path::PathBuf, sync::Arc, sync::Mutex};

/// Collaborators conditionals call into.
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Mailer>,
    pub camera: Arc<dyn Camera>,
    pub lcds: Arc<dyn LcdControl>,
}

/// What fired, and the values substituted into commands as `((key))`.
#[derive(Debug, Clone, Default)]
pub struct Firing {
    pub source: String,
    pub message: String,
    pub substitutions: Vec<(String, String)>,
}

impl Firing {
    pub fn new(source: &str, message: String) -> Self {
        Self {
            source: source.to_string(),
            message,
            substitutions: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: String) -> Self {
        self.substitutions.push((key.to_string(), value));
        self
    }

    pub fn substitute(&self, command: &str) -> String {
        self.substitutions
            .iter()
            .fold(command.to_string(), |acc, (key, value)| {
                acc.replace(&format!("(({}))", key), value)
            })
    }
}

/// Runs conditional actions with one email rate limit per owner.
pub struct ActionExecutor {
    collaborators: Collaborators,
    limiter: Mutex<EmailLimiter>,
    clock: SharedClock,
}

impl ActionExecutor {
    pub fn new(collaborators: Collaborators, hourly_max: u32, clock: SharedClock) -> Self {
        Self {
            collaborators,
            limiter: Mutex::new(EmailLimiter::new(hourly_max)),
            clock,
        }
    }

    /// Run every action in order. A failing action is logged and skipped.
    pub fn execute(&self, relays: &dyn RelayControl, firing: &Firing, actions: &[Action]) {
        CONDITIONAL_FIRES
            .with_label_values(&[firing.source.as_str()])
            .inc();
        info!("{}", firing.message);
        for action in actions {
            self.execute_one(relays, firing, action);
        }
    }

    fn execute_one(&self, relays: &dyn RelayControl, firing: &Firing, action: &Action) {
        match action {
            Action::Relay {
                relay_id,
                state,
                duration,
            } => {
                let result = match state {
                    RelayState::On => relays.turn_on(*relay_id, *duration, true, 0.0),
                    RelayState::Off => relays.turn_off(*relay_id, true),
                };
                if let Err(e) = result {
                    warn!("{}: could not turn relay {} {}: {}", firing.source, relay_id, state, e);
                }
            }
            Action::Command { command } => {
                let command = firing.substitute(command);
                match run_command(&command) {
                    Ok(output) => info!(
                        "{}: '{}' exited {:?}, stdout: {}, stderr: {}",
                        firing.source, command, output.code, output.stdout, output.stderr
                    ),
                    Err(e) => error!("{}: {:#}", firing.source, e),
                }
            }
            Action::Email { to, attachment } => {
                let now = self.clock.now();
                let allowed = self
                    .limiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .allow(now);
                if !allowed {
                    warn!(
                        "{}: email limit reached, not emailing {}: {}",
                        firing.source, to, firing.message
                    );
                    return;
                }
                let media = attachment.and_then(|kind| self.capture(firing, kind));
                let subject = format!("Verdant: {}", firing.source);
                if let Err(e) =
                    self.collaborators
                        .mailer
                        .send(to, &subject, &firing.message, media.as_deref())
                {
                    error!("{}: could not email {}: {:#}", firing.source, to, e);
                }
            }
            Action::FlashLcd { lcd_id } => match self.collaborators.lcds.flash(*lcd_id, true) {
                Ok(message) => info!("{}: {}", firing.source, message),
                Err(e) => warn!("{}: could not flash LCD {}: {:#}", firing.source, lcd_id, e),
            },
            Action::Camera { capture } => {
                if let Some(path) = self.capture(firing, *capture) {
                    info!("{}: captured {}", firing.source, path.display());
                }
            }
        }
    }

    fn capture(&self, firing: &Firing, kind: CaptureKind) -> Option<PathBuf> {
        match self.collaborators.camera.capture(kind) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("{}: {} capture failed: {:#}", firing.source, kind, e);
                None
            }
        }
    }
}
