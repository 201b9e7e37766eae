use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Value delivered into a task when the watchdog decides to interrupt it.
///
/// Shared by `Arc` so that a pre-built value can be delivered more than once
/// and still be recognised by identity (`Arc::ptr_eq`).
pub type InterruptValue = Arc<dyn Error + Send + Sync + 'static>;

/// Build the human-readable detection message for `timeout`.
///
/// The timeout is rendered in (possibly fractional) seconds, e.g.
/// `blocking detected after timeout=0.25`.
pub fn blocking_message(timeout: Duration) -> String {
    format!("blocking detected after timeout={}", timeout.as_secs_f64())
}

/// Default interrupt raised when a task blocks the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AlarmInterrupt {
    message: String,
}

impl AlarmInterrupt {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A task was forcibly interrupted by the watchdog.
///
/// Carried in an outer `Result` layer, apart from the task's own errors.  It
/// does not implement [`Error`], so `?` cannot fold it into a
/// `Box<dyn Error>` or any other catch-all error type; only code that names
/// `Interrupted` (normally the supervisor) can handle it.
#[derive(Clone)]
pub struct Interrupted(InterruptValue);

impl Interrupted {
    pub fn new(value: InterruptValue) -> Self {
        Self(value)
    }

    /// The interrupt value exactly as it was delivered.
    pub fn value(&self) -> &InterruptValue {
        &self.0
    }

    pub fn into_value(self) -> InterruptValue {
        self.0
    }

    /// Downcast the delivered value to a concrete error type.
    pub fn downcast_ref<T: Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interrupted").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted: {}", self.0)
    }
}

/// Serializable choice of interrupt behaviour.
///
/// Closures cannot live in a config file, so the file only chooses between
/// logging and raising the default [`AlarmInterrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Log only.
    None,
    /// Raise a fresh [`AlarmInterrupt`] on every trigger.
    #[default]
    Alarm,
}

impl fmt::Display for InterruptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptMode::None => write!(f, "none"),
            InterruptMode::Alarm => write!(f, "alarm"),
        }
    }
}

impl std::str::FromStr for InterruptMode {
    type Err = StallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "false" | "off" => Ok(InterruptMode::None),
            "alarm" | "true" | "on" => Ok(InterruptMode::Alarm),
            other => Err(StallError::InvalidConfig(format!(
                "unknown interrupt mode {other:?} (expected \"none\" or \"alarm\")"
            ))),
        }
    }
}

/// Watchdog settings as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Detection threshold in seconds. Fractions are honoured.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    #[serde(default)]
    pub interrupt: InterruptMode,

    /// Re-arm as soon as the alarm fires instead of waiting for the watchdog
    /// task to be resumed.
    #[serde(default = "default_aggressive")]
    pub aggressive: bool,
}

fn default_timeout_secs() -> f64 {
    1.0
}
fn default_aggressive() -> bool {
    true
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            interrupt: InterruptMode::default(),
            aggressive: default_aggressive(),
        }
    }
}

impl WatchdogConfig {
    /// The validated timeout as a [`Duration`].
    pub fn timeout(&self) -> Result<Duration, StallError> {
        validate_timeout_secs(self.timeout_secs)
    }
}

/// Convert `secs` to a strictly positive [`Duration`].
pub fn validate_timeout_secs(secs: f64) -> Result<Duration, StallError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(StallError::InvalidConfig(format!(
            "timeout must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| StallError::InvalidConfig(format!("timeout {secs} is out of range: {e}")))
}

/// Error type shared by every stallwatch crate.
#[derive(Error, Debug)]
pub enum StallError {
    #[error("Invalid watchdog configuration: {0}")]
    InvalidConfig(String),

    #[error("Config file error at {path}: {details}")]
    Config { path: String, details: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fork failed: {0}")]
    Fork(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
