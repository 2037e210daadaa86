//! Timer services driving the device state machine
//!
//! The device never schedules work itself. It asks a [`TimerService`] for
//! timers bound to callbacks and arms or stops them; when and on which thread
//! the callbacks run is up to the service.

mod manual;
mod thread;

pub use manual::{ManualTimer, ManualTimerService};
pub use thread::{ThreadTimer, ThreadTimerService};

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Callback run each time a timer fires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Constraints on the context a timer callback runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLevel {
    /// Must stay short and must not block
    Dispatch,
    /// May block, e.g. to tear down a transport
    Passive,
}

impl ExecutionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Passive => "passive",
        }
    }
}

/// How a timer is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Name used in logs and thread names
    pub name: &'static str,
    /// Re-fire interval; `None` for one-shot timers
    pub period: Option<Duration>,
    pub level: ExecutionLevel,
}

impl TimerConfig {
    /// A periodic timer: after its first fire it keeps firing every `period`
    pub fn periodic(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: Some(period),
            level: ExecutionLevel::Dispatch,
        }
    }

    /// A one-shot timer: fires once per `start`
    pub fn one_shot(name: &'static str) -> Self {
        Self {
            name,
            period: None,
            level: ExecutionLevel::Dispatch,
        }
    }

    /// Run callbacks in a context that tolerates blocking calls
    pub fn passive(mut self) -> Self {
        self.level = ExecutionLevel::Passive;
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }
}

/// A schedulable timer
pub trait Timer: Send + Sync {
    /// Arm the timer to fire once `due` has elapsed.
    ///
    /// Re-arming supersedes a pending fire. Returns true if a pending fire
    /// was superseded.
    fn start(&self, due: Duration) -> bool;

    /// Cancel a pending fire without waiting for a running callback.
    ///
    /// Returns true if a pending fire was cancelled.
    fn stop(&self) -> bool;

    fn config(&self) -> TimerConfig;
}

/// Creates timers bound to callbacks
pub trait TimerService: Send + Sync {
    fn create_timer(
        &self,
        config: TimerConfig,
        callback: TimerCallback,
    ) -> Result<Arc<dyn Timer>, TimerError>;
}

/// Error type for timer creation
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// Periodic timers need a non-zero period
    #[error("timer {0} has a zero period")]
    ZeroPeriod(&'static str),
    /// The worker thread could not be spawned
    #[error("could not spawn worker for timer {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// The service declined to create the timer
    #[error("timer service refused to create timer {0}")]
    Refused(&'static str),
}

pub(crate) fn validate(config: &TimerConfig) -> Result<(), TimerError> {
    match config.period {
        Some(period) if period.is_zero() => Err(TimerError::ZeroPeriod(config.name)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_constructors() {
        let press = TimerConfig::periodic("press", Duration::from_secs(1));
        assert!(press.is_periodic());
        assert_eq!(press.level, ExecutionLevel::Dispatch);

        let release = TimerConfig::one_shot("release").passive();
        assert!(!release.is_periodic());
        assert_eq!(release.level, ExecutionLevel::Passive);
        assert_eq!(release.level.as_str(), "passive");
    }

    #[test]
    fn zero_period_is_rejected() {
        let config = TimerConfig::periodic("press", Duration::ZERO);
        assert!(matches!(validate(&config), Err(TimerError::ZeroPeriod("press"))));
        assert!(validate(&TimerConfig::one_shot("release")).is_ok());
    }
}
