//! [`InterruptPolicy`] – what, if anything, is raised into a blocking task.

use stallwatch_types::{AlarmInterrupt, InterruptMode, InterruptValue, blocking_message};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Builds a fresh interrupt from the detection message.
pub type InterruptFactory = Arc<dyn Fn(String) -> InterruptValue + Send + Sync + 'static>;

/// How the watchdog reacts, beyond logging, when it triggers.
#[derive(Clone)]
pub enum InterruptPolicy {
    /// Log only; never interrupt.
    None,
    /// Deliver this exact value on every trigger.
    Fixed(InterruptValue),
    /// Build a new value per trigger, passing the detection message
    /// (`blocking detected after timeout=<secs>`).
    Factory(InterruptFactory),
}

impl InterruptPolicy {
    /// Raise a fresh [`AlarmInterrupt`] per trigger.
    pub fn alarm() -> Self {
        Self::factory(|message: String| AlarmInterrupt::new(message))
    }

    pub fn fixed<E: Error + Send + Sync + 'static>(value: E) -> Self {
        Self::Fixed(Arc::new(value))
    }

    pub fn factory<E, F>(build: F) -> Self
    where
        E: Error + Send + Sync + 'static,
        F: Fn(String) -> E + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(move |message| Arc::new(build(message)) as InterruptValue))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, InterruptPolicy::None)
    }

    /// The value to deliver for a trigger after `timeout`, if any.
    pub fn interrupt_for(&self, timeout: Duration) -> Option<InterruptValue> {
        match self {
            InterruptPolicy::None => None,
            InterruptPolicy::Fixed(value) => Some(value.clone()),
            InterruptPolicy::Factory(build) => Some(build(blocking_message(timeout))),
        }
    }
}

impl Default for InterruptPolicy {
    fn default() -> Self {
        Self::alarm()
    }
}

impl From<InterruptMode> for InterruptPolicy {
    fn from(mode: InterruptMode) -> Self {
        match mode {
            InterruptMode::None => InterruptPolicy::None,
            InterruptMode::Alarm => InterruptPolicy::alarm(),
        }
    }
}

impl fmt::Debug for InterruptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptPolicy::None => write!(f, "None"),
            InterruptPolicy::Fixed(value) => f.debug_tuple("Fixed").field(&value.to_string()).finish(),
            InterruptPolicy::Factory(_) => write!(f, "Factory(..)"),
        }
    }
}
