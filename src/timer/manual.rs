//! Manually driven timers on a simulated clock
//!
//! Nothing fires on its own. Tests either fire a timer directly or advance
//! the shared clock, which fires every armed timer whose deadline falls
//! inside the advanced window, earliest first.

use super::{validate, Timer, TimerCallback, TimerConfig, TimerError, TimerService};
use crate::utils::MutexExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Clock {
    now: Mutex<Duration>,
}

impl Clock {
    fn now(&self) -> Duration {
        *self.now.lock_recover()
    }

    fn set(&self, now: Duration) {
        *self.now.lock_recover() = now;
    }
}

/// Timer service whose timers only fire when told to
#[derive(Default)]
pub struct ManualTimerService {
    clock: Arc<Clock>,
    timers: Mutex<Vec<Arc<ManualTimer>>>,
    refuse: Mutex<Vec<&'static str>>,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation of the named timer fail
    pub fn refuse(&self, name: &'static str) {
        self.refuse.lock_recover().push(name);
    }

    /// The timer created under `name`, if any
    pub fn timer(&self, name: &str) -> Option<Arc<ManualTimer>> {
        self.timers
            .lock_recover()
            .iter()
            .find(|t| t.config.name == name)
            .cloned()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock_recover().len()
    }

    /// Simulated time elapsed since the service was created
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Advance the clock by `by`, firing due timers in deadline order.
    ///
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.now() + by;
        let mut fired = 0;

        loop {
            let next = self
                .timers
                .lock_recover()
                .iter()
                .filter_map(|t| t.deadline().map(|d| (d, Arc::clone(t))))
                .filter(|(d, _)| *d <= target)
                .min_by_key(|(d, _)| *d);

            let Some((deadline, timer)) = next else {
                break;
            };

            self.clock.set(deadline);
            if timer.fire() {
                fired += 1;
            }
        }

        self.clock.set(target);
        fired
    }
}

impl TimerService for ManualTimerService {
    fn create_timer(
        &self,
        config: TimerConfig,
        callback: TimerCallback,
    ) -> Result<Arc<dyn Timer>, TimerError> {
        validate(&config)?;
        if self.refuse.lock_recover().contains(&config.name) {
            return Err(TimerError::Refused(config.name));
        }

        let timer = Arc::new(ManualTimer {
            config,
            callback,
            clock: Arc::clone(&self.clock),
            deadline: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fires: AtomicUsize::new(0),
        });
        self.timers.lock_recover().push(Arc::clone(&timer));
        Ok(timer)
    }
}

/// A timer fired by the test driving it
pub struct ManualTimer {
    config: TimerConfig,
    callback: TimerCallback,
    clock: Arc<Clock>,
    deadline: Mutex<Option<Duration>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fires: AtomicUsize,
}

impl ManualTimer {
    /// Simulated time at which the timer will fire, if armed
    pub fn deadline(&self) -> Option<Duration> {
        *self.deadline.lock_recover()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    /// Time left until the pending fire
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_sub(self.clock.now()))
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fire_count(&self) -> usize {
        self.fires.load(Ordering::SeqCst)
    }

    /// Fire now if armed, as the service would at the deadline.
    ///
    /// Returns false without running the callback if the timer is not armed.
    pub fn fire(&self) -> bool {
        {
            let mut deadline = self.deadline.lock_recover();
            let Some(due) = *deadline else {
                return false;
            };
            *deadline = self.config.period.map(|period| due + period);
        }
        self.fires.fetch_add(1, Ordering::SeqCst);
        (self.callback)();
        true
    }

    /// Run the callback regardless of the armed state.
    ///
    /// Models a callback that was already dispatched when the timer was
    /// stopped.
    pub fn fire_late(&self) {
        self.fires.fetch_add(1, Ordering::SeqCst);
        (self.callback)();
    }
}

impl Timer for ManualTimer {
    fn start(&self, due: Duration) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.deadline
            .lock_recover()
            .replace(self.clock.now() + due)
            .is_some()
    }

    fn stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.deadline.lock_recover().take().is_some()
    }

    fn config(&self) -> TimerConfig {
        self.config
    }
}
