use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::error::PasscodeError;
use super::remote::RemoteMirror;
use crate::platform::common::{read_json, write_json};

pub const PASSCODE_LENGTH: usize = 4;
const SALT_LENGTH: usize = 16;
const SETTINGS_VERSION: &str = "1.0";

/// Persisted passcode record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PasscodeSettings {
    pub version: String,
    /// Hex SHA-256 of `code ‖ salt`
    pub hash: String,
    pub salt: String,
    pub enabled: bool,
    pub failed_attempts: u32,
    pub lockout_until: Option<DateTime<Utc>>,
}

/// Attempt limits and timers for the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
    pub idle_timeout: Duration,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lockout: Duration::seconds(60),
            idle_timeout: Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid { remaining: u32 },
    Locked { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Unset,
    Locked,
    Unlocked,
}

/// Single-shot inactivity timer, re-armed on every unlock and activity
#[derive(Debug, Clone, Copy)]
struct IdleTimer {
    timeout: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self { timeout, deadline: None }
    }

    fn arm(&mut self, now: DateTime<Utc>) {
        self.deadline = Some(now + self.timeout);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    fn fired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Local authentication gate in front of every unlock
pub struct PasscodeGuard {
    path: PathBuf,
    settings: Option<PasscodeSettings>,
    policy: GuardPolicy,
    clock: Arc<dyn Clock>,
    mirror: RemoteMirror,
    unlocked: bool,
    idle: IdleTimer,
    last_activity: Option<DateTime<Utc>>,
}

impl PasscodeGuard {
    pub fn open(
        path: impl Into<PathBuf>,
        policy: GuardPolicy,
        clock: Arc<dyn Clock>,
        mirror: RemoteMirror,
    ) -> Result<Self> {
        let path = path.into();
        let settings = match read_json::<PasscodeSettings>(&path)? {
            Some(settings) if settings.version == SETTINGS_VERSION => Some(settings),
            Some(settings) => {
                warn!(
                    "Passcode file version mismatch (expected {}, got {}). Ignoring stored passcode.",
                    SETTINGS_VERSION, settings.version
                );
                None
            }
            None => None,
        };

        Ok(Self {
            path,
            settings,
            policy,
            clock,
            mirror,
            unlocked: false,
            idle: IdleTimer::new(policy.idle_timeout),
            last_activity: None,
        })
    }

    pub fn state(&self) -> GuardState {
        match &self.settings {
            Some(settings) if settings.enabled => {
                if self.unlocked && !self.idle.fired(self.clock.now()) {
                    GuardState::Unlocked
                } else {
                    GuardState::Locked
                }
            }
            _ => GuardState::Unset,
        }
    }

    pub fn is_set(&self) -> bool {
        self.state() != GuardState::Unset
    }

    pub fn failed_attempts(&self) -> u32 {
        self.settings.as_ref().map_or(0, |s| s.failed_attempts)
    }

    /// Active lockout deadline, if any
    pub fn lockout_until(&self) -> Option<DateTime<Utc>> {
        let until = self.settings.as_ref()?.lockout_until?;
        (self.clock.now() < until).then_some(until)
    }

    /// Set (or replace) the passcode.
    ///
    /// Replacing an existing passcode requires the guard to be unlocked.
    pub fn set_passcode(&mut self, code: &str) -> Result<()> {
        check_format(code)?;

        if self.state() == GuardState::Locked {
            return Err(PasscodeError::GuardLocked.into());
        }

        let salt = generate_salt();
        let settings = PasscodeSettings {
            version: SETTINGS_VERSION.to_string(),
            hash: hash_passcode(code, &salt),
            salt,
            enabled: true,
            failed_attempts: 0,
            lockout_until: None,
        };

        write_json(&self.path, &settings).context("Failed to save passcode")?;
        self.settings = Some(settings);
        self.lock();

        info!("Passcode set");
        self.mirror.mirror_passcode(code, self.clock.now());
        Ok(())
    }

    /// Replace the passcode after proving knowledge of the current one
    pub fn change_passcode(&mut self, current: &str, new: &str) -> Result<Validation> {
        check_format(new)?;

        let outcome = self.validate_passcode(current)?;
        if outcome == Validation::Valid {
            self.set_passcode(new)?;
        }
        Ok(outcome)
    }

    /// Remove the passcode entirely. Requires an unlocked guard.
    pub fn clear_passcode(&mut self) -> Result<()> {
        match self.state() {
            GuardState::Unset => return Ok(()),
            GuardState::Locked => return Err(PasscodeError::GuardLocked.into()),
            GuardState::Unlocked => {}
        }

        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete passcode file: {}", self.path.display()))?;
        }

        self.settings = None;
        self.unlocked = false;
        self.idle.disarm();
        info!("Passcode cleared");
        Ok(())
    }

    pub fn validate_passcode(&mut self, code: &str) -> Result<Validation> {
        check_format(code)?;

        let now = self.clock.now();
        self.expire_lockout(now)?;

        let policy = self.policy;
        let settings = match self.settings.as_mut() {
            Some(settings) if settings.enabled => settings,
            _ => return Err(PasscodeError::NotAuthenticated.into()),
        };

        if let Some(until) = settings.lockout_until {
            debug!("Passcode attempt rejected during lockout");
            return Ok(Validation::Locked { until });
        }

        if constant_time_eq(&hash_passcode(code, &settings.salt), &settings.hash) {
            settings.failed_attempts = 0;
            settings.lockout_until = None;
            write_json(&self.path, &*settings).context("Failed to save passcode state")?;

            self.unlocked = true;
            self.touch_at(now);
            info!("Passcode accepted");
            return Ok(Validation::Valid);
        }

        settings.failed_attempts = (settings.failed_attempts + 1).min(policy.max_attempts);
        let remaining = policy.max_attempts - settings.failed_attempts;

        if remaining == 0 {
            let until = now + policy.lockout;
            settings.lockout_until = Some(until);
            warn!("Too many failed passcode attempts; locked out until {}", until);
        } else {
            warn!("Incorrect passcode ({} attempts remaining)", remaining);
        }

        write_json(&self.path, &*settings).context("Failed to save passcode state")?;
        Ok(Validation::Invalid { remaining })
    }

    /// Fail unless the guard is currently unlocked
    pub fn require_unlocked(&self) -> Result<()> {
        match self.state() {
            GuardState::Unlocked => Ok(()),
            GuardState::Unset => Err(PasscodeError::NotAuthenticated.into()),
            GuardState::Locked => match self.lockout_until() {
                Some(until) => Err(PasscodeError::LockedOut { until }.into()),
                None => Err(PasscodeError::GuardLocked.into()),
            },
        }
    }

    /// Force the guard back to locked. No-op when already locked.
    pub fn lock(&mut self) {
        if self.unlocked {
            info!("Passcode guard locked");
        }
        self.unlocked = false;
        self.idle.disarm();
    }

    /// Record user activity, pushing the idle deadline out
    pub fn touch(&mut self) {
        if self.state() == GuardState::Unlocked {
            let now = self.clock.now();
            self.touch_at(now);
        }
    }

    /// Apply the idle timeout. Returns true if this call locked the guard.
    pub fn poll_idle(&mut self) -> bool {
        if self.unlocked && self.idle.fired(self.clock.now()) {
            debug!("Idle timeout reached");
            self.lock();
            return true;
        }
        false
    }

    /// Moving to the background always locks
    pub fn enter_background(&mut self) {
        debug!("Entering background");
        self.lock();
    }

    /// Returning to the foreground re-checks idle time.
    /// Returns true if the passcode must be entered again.
    pub fn enter_foreground(&mut self) -> bool {
        let now = self.clock.now();
        let idle_exceeded = self
            .last_activity
            .is_none_or(|last| now - last >= self.policy.idle_timeout);

        if idle_exceeded {
            self.lock();
        }

        self.state() == GuardState::Locked
    }

    fn touch_at(&mut self, now: DateTime<Utc>) {
        self.last_activity = Some(now);
        self.idle.arm(now);
    }

    /// Clear a lockout whose deadline has passed, starting a fresh attempt budget
    fn expire_lockout(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(settings) = self.settings.as_mut() else {
            return Ok(());
        };

        if settings.lockout_until.is_some_and(|until| now >= until) {
            settings.lockout_until = None;
            settings.failed_attempts = 0;
            write_json(&self.path, &*settings).context("Failed to save passcode state")?;
            info!("Passcode lockout expired");
        }

        Ok(())
    }
}

fn check_format(code: &str) -> Result<(), PasscodeError> {
    if code.len() == PASSCODE_LENGTH && code.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(PasscodeError::InvalidFormat)
    }
}

fn generate_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LENGTH)
        .map(char::from)
        .collect()
}

fn hash_passcode(code: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(salt.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
