//! Thread-backed timers
//!
//! Each timer owns a worker thread that sleeps on a condition variable until
//! its deadline. Callbacks run on that worker, which is allowed to block, so
//! both execution levels are satisfied.

use super::{validate, Timer, TimerCallback, TimerConfig, TimerError, TimerService};
use crate::utils::MutexExt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timer service spawning one worker thread per timer
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimerService;

impl ThreadTimerService {
    pub fn new() -> Self {
        Self
    }
}

impl TimerService for ThreadTimerService {
    fn create_timer(
        &self,
        config: TimerConfig,
        callback: TimerCallback,
    ) -> Result<Arc<dyn Timer>, TimerError> {
        Ok(Arc::new(ThreadTimer::spawn(config, callback)?))
    }
}

#[derive(Default)]
struct Schedule {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

/// A timer running its callback on a dedicated thread
pub struct ThreadTimer {
    config: TimerConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn spawn(config: TimerConfig, callback: TimerCallback) -> Result<Self, TimerError> {
        validate(&config)?;

        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("timer-{}", config.name))
            .spawn(move || run(config, &worker_shared, callback))
            .map_err(|source| TimerError::Spawn {
                name: config.name,
                source,
            })?;

        log::debug!(
            "created {} timer ({}, {} level)",
            config.name,
            match config.period {
                Some(period) => format!("every {:?}", period),
                None => "one-shot".to_string(),
            },
            config.level.as_str()
        );

        Ok(Self {
            config,
            shared,
            worker: Some(worker),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.shared.schedule.lock_recover().deadline.is_some()
    }
}

fn run(config: TimerConfig, shared: &Shared, callback: TimerCallback) {
    let mut schedule = shared.schedule.lock_recover();

    loop {
        if schedule.shutdown {
            break;
        }

        let Some(deadline) = schedule.deadline else {
            schedule = shared
                .wakeup
                .wait(schedule)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            continue;
        };

        let now = Instant::now();
        if now < deadline {
            schedule = shared
                .wakeup
                .wait_timeout(schedule, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            continue;
        }

        schedule.deadline = config.period.map(|period| next_deadline(deadline, period, now));
        drop(schedule);
        callback();
        schedule = shared.schedule.lock_recover();
    }
}

/// Next periodic deadline, skipping fires missed while the callback ran
fn next_deadline(deadline: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = deadline + period;
    while next <= now {
        next += period;
    }
    next
}

impl Timer for ThreadTimer {
    fn start(&self, due: Duration) -> bool {
        let mut schedule = self.shared.schedule.lock_recover();
        let superseded = schedule.deadline.is_some();
        schedule.deadline = Some(Instant::now() + due);
        self.shared.wakeup.notify_all();
        superseded
    }

    fn stop(&self) -> bool {
        let mut schedule = self.shared.schedule.lock_recover();
        let cancelled = schedule.deadline.take().is_some();
        self.shared.wakeup.notify_all();
        cancelled
    }

    fn config(&self) -> TimerConfig {
        self.config
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let mut schedule = self.shared.schedule.lock_recover();
            schedule.shutdown = true;
            schedule.deadline = None;
            self.shared.wakeup.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            // Dropped from inside our own callback: the worker exits on its own.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn wait_for(count: &AtomicUsize, at_least: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn one_shot_fires_once() {
        let (count, callback) = counter();
        let timer = ThreadTimer::spawn(TimerConfig::one_shot("test"), callback).unwrap();

        assert!(!timer.start(Duration::from_millis(5)));
        assert!(wait_for(&count, 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[test]
    fn periodic_keeps_firing_until_stopped() {
        let (count, callback) = counter();
        let timer = ThreadTimer::spawn(
            TimerConfig::periodic("test", Duration::from_millis(5)),
            callback,
        )
        .unwrap();

        timer.start(Duration::from_millis(1));
        assert!(wait_for(&count, 3));
        assert!(timer.stop());

        thread::sleep(Duration::from_millis(20));
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn restart_supersedes_pending_fire() {
        let (count, callback) = counter();
        let timer = ThreadTimer::spawn(TimerConfig::one_shot("test"), callback).unwrap();

        timer.start(Duration::from_secs(60));
        assert!(timer.start(Duration::from_millis(5)));
        assert!(wait_for(&count, 1));
    }

    #[test]
    fn stop_before_fire_cancels() {
        let (count, callback) = counter();
        let timer = ThreadTimer::spawn(TimerConfig::one_shot("test"), callback).unwrap();

        timer.start(Duration::from_millis(20));
        assert!(timer.stop());
        assert!(!timer.stop());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_deadline_skips_missed_periods() {
        let start = Instant::now();
        let period = Duration::from_millis(10);
        let next = next_deadline(start, period, start + Duration::from_millis(35));
        assert_eq!(next, start + Duration::from_millis(40));
    }

    #[test]
    fn service_rejects_zero_period() {
        let (_, callback) = counter();
        let result = ThreadTimerService::new()
            .create_timer(TimerConfig::periodic("test", Duration::ZERO), callback);
        assert!(matches!(result, Err(TimerError::ZeroPeriod("test"))));
    }
}
