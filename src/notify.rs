//! Side effects conditionals reach for: shell commands, email and the camera.
use crate::config::{CameraConfig, CaptureKind, SmtpConfig};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local};
use log::{debug, info};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Mutex,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` through `sh -c` and capture what it printed.
pub fn run_command(command: &str) -> Result<CommandOutput> {
    debug!("Running command: {}", command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("could not spawn '{}'", command))?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str, attachment: Option<&Path>) -> Result<()>;
}

/// Hands messages to the local MTA via `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    config: SmtpConfig,
}

impl SendmailMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, to: &str, subject: &str, body: &str, attachment: Option<&Path>) -> Result<()> {
        let mut message = format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}\n",
            self.config.from, to, subject, body
        );
        if let Some(path) = attachment {
            message.push_str(&format!("\nCaptured media: {}\n", path.display()));
        }
        let mut child = Command::new(&self.config.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not start {}", self.config.sendmail))?;
        child
            .stdin
            .take()
            .context("sendmail stdin unavailable")?
            .write_all(message.as_bytes())?;
        let status = child.wait()?;
        if !status.success() {
            bail!("sendmail exited with {}", status);
        }
        info!("Email sent to {}: {}", to, subject);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

/// Keeps sent messages in memory.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, to: &str, subject: &str, body: &str, attachment: Option<&Path>) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                attachment: attachment.map(Path::to_path_buf),
            });
        Ok(())
    }
}

/// Caps emails per rolling hour. The window opens with the first email
/// after the previous one expired.
#[derive(Debug)]
pub struct EmailLimiter {
    hourly_max: u32,
    window_start: Option<DateTime<Local>>,
    sent: u32,
}

impl EmailLimiter {
    pub fn new(hourly_max: u32) -> Self {
        Self {
            hourly_max,
            window_start: None,
            sent: 0,
        }
    }

    /// Count an email against the limit, returning false when over it.
    pub fn allow(&mut self, now: DateTime<Local>) -> bool {
        let expired = self
            .window_start
            .map_or(true, |start| now >= start + Duration::hours(1));
        if expired {
            self.window_start = Some(now);
            self.sent = 0;
        }
        if self.sent < self.hourly_max {
            self.sent += 1;
            true
        } else {
            false
        }
    }

    /// When the current window ends, if one is open.
    pub fn resets_at(&self) -> Option<DateTime<Local>> {
        self.window_start.map(|start| start + Duration::hours(1))
    }
}

pub trait Camera: Send + Sync {
    /// Capture a still or a clip and return where it was written.
    fn capture(&self, kind: CaptureKind) -> Result<PathBuf>;
}

/// Captures media by running a configured shell command.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    config: CameraConfig,
}

impl CommandCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl Camera for CommandCamera {
    fn capture(&self, kind: CaptureKind) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.dir)
            .with_context(|| format!("could not create {}", self.config.dir.display()))?;
        let (template, extension) = match kind {
            CaptureKind::Photo => (&self.config.photo_command, "jpg"),
            CaptureKind::Video => (&self.config.video_command, "h264"),
        };
        let path = self.config.dir.join(format!(
            "{}-{}.{}",
            kind,
            Local::now().format("%Y-%m-%d_%H-%M-%S"),
            extension
        ));
        let command = template.replace("((path))", &path.display().to_string());
        let output = run_command(&command)?;
        if !output.success {
            bail!("capture command '{}' failed: {}", command, output.stderr);
        }
        Ok(path)
    }
}
