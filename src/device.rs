//! Emulated keyboard device
//!
//! A [`DeviceContext`] owns the transport handle, a periodic press timer, a
//! one-shot release timer and the cycle counter. Every press tick submits a
//! key-down report and arms the release timer; every release tick submits a
//! key-up report and counts a cycle. When the cycle limit is reached the
//! device tears down its transport and stops pressing.
//!
//! Timer callbacks, transport teardown and device cleanup can all run at the
//! same time. They coordinate through the transport slot only: a callback
//! that finds the slot empty does nothing.

use crate::descriptor::{KeyReport, REPORT_DESCRIPTOR, REPORT_LEN};
use crate::timer::{Timer, TimerCallback, TimerConfig, TimerError, TimerService};
use crate::trace;
use crate::transport::{
    ClosedCallback, DeviceIdentity, OpenParams, TransportBackend, TransportError, TransportSlot,
    VirtualHid,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Name of the periodic key-down timer
pub const PRESS_TIMER: &str = "press";
/// Name of the one-shot key-up timer
pub const RELEASE_TIMER: &str = "release";

/// Timing of the press/release cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Delay before the first press
    pub initial_delay: Duration,
    /// Interval between presses
    pub period: Duration,
    /// How long the key is held
    pub release_delay: Duration,
    /// Number of cycles before the device shuts itself down
    pub cycle_limit: u32,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10_000),
            period: Duration::from_millis(1_000),
            release_delay: Duration::from_millis(200),
            cycle_limit: 10,
        }
    }
}

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceState {
    /// Created, transport or timers not yet ready
    Uninitialized = 0,
    /// Press timer armed, reports flowing
    Active = 1,
    /// Transport teardown requested, waiting for its notification
    Terminating = 2,
    /// Transport gone; timer callbacks are no-ops
    Closed = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Active,
            2 => Self::Terminating,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        }
    }
}

/// Counters describing what a device has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub cycles: u32,
    pub reports_submitted: u64,
    pub submit_failures: u64,
}

/// Error type for device creation
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("transport open failed: {0}")]
    Open(#[source] TransportError),
    #[error("transport start failed: {0}")]
    Start(#[source] TransportError),
    #[error("transport was torn down while the device was being created")]
    ClosedDuringCreation,
    #[error("creating the {timer} timer failed: {source}")]
    Timer {
        timer: &'static str,
        #[source]
        source: TimerError,
    },
}

/// Everything needed to create a device
#[derive(Clone)]
pub struct DeviceInit {
    pub backend: Arc<dyn TransportBackend>,
    pub timers: Arc<dyn TimerService>,
    pub cadence: Cadence,
    pub identity: DeviceIdentity,
}

/// Per-device state shared with timer and transport callbacks
pub struct DeviceContext {
    transport: TransportSlot,
    press_timer: OnceLock<Arc<dyn Timer>>,
    release_timer: OnceLock<Arc<dyn Timer>>,
    cycle_count: AtomicU32,
    state: AtomicU8,
    reports_submitted: AtomicU64,
    submit_failures: AtomicU64,
    cadence: Cadence,
}

impl DeviceContext {
    fn new(cadence: Cadence) -> Self {
        Self {
            transport: TransportSlot::new(),
            press_timer: OnceLock::new(),
            release_timer: OnceLock::new(),
            cycle_count: AtomicU32::new(0),
            state: AtomicU8::new(DeviceState::Uninitialized as u8),
            reports_submitted: AtomicU64::new(0),
            submit_failures: AtomicU64::new(0),
            cadence,
        }
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `to` unless the device is already in one of `unless`.
    fn transition(&self, to: DeviceState, unless: &[DeviceState]) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let current = DeviceState::from_u8(current);
                (!unless.contains(&current)).then_some(to as u8)
            });

        match result {
            Ok(previous) => {
                let previous = DeviceState::from_u8(previous);
                if previous != to {
                    log::info!("device {} -> {}", previous.as_str(), to.as_str());
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    /// True while a transport handle is held
    pub fn has_transport(&self) -> bool {
        !self.transport.is_empty()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            cycles: self.cycle_count(),
            reports_submitted: self.reports_submitted.load(Ordering::SeqCst),
            submit_failures: self.submit_failures.load(Ordering::SeqCst),
        }
    }

    /// Press-timer callback: submit a key-down report and arm the release timer.
    pub fn on_press_timer(&self) {
        trace::enter("on_press_timer");

        let Some(hid) = self.transport.get() else {
            return;
        };
        if self.cycle_count() >= self.cadence.cycle_limit {
            return;
        }

        if self.submit(hid.as_ref(), KeyReport::Pressed, "on_press_timer") {
            if let Some(release) = self.release_timer.get() {
                release.start(self.cadence.release_delay);
            }
        }
    }

    /// Release-timer callback: submit a key-up report and count the cycle.
    ///
    /// Runs at passive level: reaching the cycle limit tears the transport
    /// down from here.
    pub fn on_release_timer(&self) {
        trace::enter("on_release_timer");

        let Some(hid) = self.transport.get() else {
            return;
        };

        self.submit(hid.as_ref(), KeyReport::Released, "on_release_timer");
        drop(hid);

        let cycles = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("cycle {}/{} complete", cycles, self.cadence.cycle_limit);

        if cycles >= self.cadence.cycle_limit {
            log::info!("cycle limit {} reached, shutting down", self.cadence.cycle_limit);
            self.close_transport(false);
            if let Some(press) = self.press_timer.get() {
                press.stop();
            }
        }
    }

    /// Transport closed-notification: forget the handle.
    pub fn on_transport_closed(&self) {
        trace::enter("on_transport_closed");
        self.transport.clear();
        self.transition(DeviceState::Closed, &[]);
    }

    /// Request teardown of the transport if one is still held.
    ///
    /// Returns false if there was nothing to close.
    pub fn close_transport(&self, force_immediate: bool) -> bool {
        let Some(hid) = self.transport.take() else {
            return false;
        };
        self.transition(DeviceState::Terminating, &[DeviceState::Closed]);
        hid.close(force_immediate);
        true
    }

    fn submit(
        &self,
        hid: &dyn VirtualHid,
        report: KeyReport,
        function: &str,
    ) -> bool {
        match hid.submit_report(&report.as_bytes()) {
            Ok(()) => {
                self.reports_submitted.fetch_add(1, Ordering::SeqCst);
                log::debug!("submitted {}", report.as_str());
                true
            }
            Err(e) => {
                self.submit_failures.fetch_add(1, Ordering::SeqCst);
                trace::error_status("submit_report", &e, function);
                false
            }
        }
    }
}

/// An emulated keyboard device.
///
/// Dropping the device runs its cleanup.
pub struct Device {
    context: Arc<DeviceContext>,
    cleaned_up: AtomicBool,
}

impl Device {
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn state(&self) -> DeviceState {
        self.context.state()
    }

    /// Device teardown: close any open transport and stop both timers.
    ///
    /// Safe to call while timer callbacks are running, and more than once.
    pub fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        trace::enter("cleanup");

        self.context.close_transport(false);
        if let Some(press) = self.context.press_timer.get() {
            press.stop();
        }
        if let Some(release) = self.context.release_timer.get() {
            release.stop();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn timer_callback(context: &Arc<DeviceContext>, handler: fn(&DeviceContext)) -> TimerCallback {
    let context = Arc::downgrade(context);
    Arc::new(move || {
        if let Some(context) = context.upgrade() {
            handler(&context);
        }
    })
}

fn closed_callback(context: Weak<DeviceContext>) -> ClosedCallback {
    Box::new(move || {
        if let Some(context) = context.upgrade() {
            context.on_transport_closed();
        }
    })
}

fn create_timer(
    context: &Arc<DeviceContext>,
    timers: &dyn TimerService,
    config: TimerConfig,
    handler: fn(&DeviceContext),
) -> Result<Arc<dyn Timer>, DeviceError> {
    timers
        .create_timer(config, timer_callback(context, handler))
        .map_err(|source| {
            trace::error_status("create_timer", &source, "create_device");
            DeviceError::Timer {
                timer: config.name,
                source,
            }
        })
}

/// Create a device: open and start the transport, create both timers and arm
/// the press timer.
///
/// Creation is all-or-nothing. On error no timer is armed and any opened
/// transport has been closed.
pub fn create_device(init: DeviceInit) -> Result<Device, DeviceError> {
    trace::enter("create_device");

    let context = Arc::new(DeviceContext::new(init.cadence));

    let params = OpenParams {
        descriptor: &REPORT_DESCRIPTOR,
        report_len: REPORT_LEN,
        identity: &init.identity,
    };
    let hid = init
        .backend
        .open(&params, closed_callback(Arc::downgrade(&context)))
        .map_err(|e| {
            trace::error_status("open", &e, "create_device");
            DeviceError::Open(e)
        })?;

    if !context.transport.install(Arc::clone(&hid)) {
        hid.close(true);
        return Err(DeviceError::ClosedDuringCreation);
    }

    if let Err(e) = hid.start() {
        trace::error_status("start", &e, "create_device");
        context.close_transport(true);
        return Err(DeviceError::Start(e));
    }
    drop(hid);

    let timers = init.timers.as_ref();
    let press = create_timer(
        &context,
        timers,
        TimerConfig::periodic(PRESS_TIMER, init.cadence.period),
        DeviceContext::on_press_timer,
    );
    let release = press.and_then(|press| {
        create_timer(
            &context,
            timers,
            TimerConfig::one_shot(RELEASE_TIMER).passive(),
            DeviceContext::on_release_timer,
        )
        .map(|release| (press, release))
    });

    let (press, release) = match release {
        Ok(timers) => timers,
        Err(e) => {
            context.close_transport(true);
            return Err(e);
        }
    };

    // Both slots are fresh, so neither set can fail.
    let _ = context.release_timer.set(release);
    let _ = context.press_timer.set(Arc::clone(&press));

    if !context.transition(
        DeviceState::Active,
        &[DeviceState::Terminating, DeviceState::Closed],
    ) {
        return Err(DeviceError::ClosedDuringCreation);
    }

    press.start(init.cadence.initial_delay);
    log::info!(
        "{} active via {}: first press in {:?}, every {:?}, held {:?}, {} cycles",
        init.identity.name,
        init.backend.name(),
        init.cadence.initial_delay,
        init.cadence.period,
        init.cadence.release_delay,
        init.cadence.cycle_limit
    );

    Ok(Device {
        context,
        cleaned_up: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimerService;
    use crate::transport::{CloseDelivery, LoopbackBackend, LoopbackChannel, LoopbackFaults};

    struct Harness {
        backend: Arc<LoopbackBackend>,
        timers: Arc<ManualTimerService>,
    }

    impl Harness {
        fn new(delivery: CloseDelivery) -> Self {
            Self {
                backend: Arc::new(LoopbackBackend::new(delivery)),
                timers: Arc::new(ManualTimerService::new()),
            }
        }

        fn init(&self) -> DeviceInit {
            DeviceInit {
                backend: self.backend.clone(),
                timers: self.timers.clone(),
                cadence: Cadence::default(),
                identity: DeviceIdentity::default(),
            }
        }

        fn create(&self) -> Device {
            create_device(self.init()).expect("device creation should succeed")
        }

        fn channel(&self) -> Arc<LoopbackChannel> {
            self.backend.last_channel().expect("a channel was opened")
        }

        fn press(&self) -> Arc<crate::timer::ManualTimer> {
            self.timers.timer(PRESS_TIMER).expect("press timer exists")
        }

        fn release(&self) -> Arc<crate::timer::ManualTimer> {
            self.timers.timer(RELEASE_TIMER).expect("release timer exists")
        }
    }

    #[test]
    fn cadence_reference_values() {
        let cadence = Cadence::default();
        assert_eq!(cadence.initial_delay, Duration::from_millis(10_000));
        assert_eq!(cadence.period, Duration::from_millis(1_000));
        assert_eq!(cadence.release_delay, Duration::from_millis(200));
        assert_eq!(cadence.cycle_limit, 10);
    }

    #[test]
    fn creation_arms_press_timer_only() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();

        assert_eq!(device.state(), DeviceState::Active);
        assert!(h.channel().is_started());
        assert_eq!(h.channel().descriptor(), &REPORT_DESCRIPTOR);
        assert_eq!(h.press().deadline(), Some(Duration::from_millis(10_000)));
        assert_eq!(h.press().start_count(), 1);
        assert!(!h.release().is_armed());
        assert_eq!(h.release().start_count(), 0);
        assert_eq!(h.release().config().level, crate::timer::ExecutionLevel::Passive);
    }

    #[test]
    fn press_submits_key_down_and_arms_release() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();

        device.context().on_press_timer();
        assert_eq!(h.channel().reports(), vec![vec![0x01]]);
        assert_eq!(h.release().remaining(), Some(Duration::from_millis(200)));

        device.context().on_release_timer();
        assert_eq!(h.channel().reports(), vec![vec![0x01], vec![0x00]]);
        assert_eq!(device.context().cycle_count(), 1);
    }

    #[test]
    fn press_failure_does_not_arm_release() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();
        h.channel().set_fail_submit(true);

        device.context().on_press_timer();
        assert!(!h.release().is_armed());
        assert_eq!(h.release().start_count(), 0);
        assert_eq!(device.context().stats().submit_failures, 1);
        assert_eq!(device.state(), DeviceState::Active);
    }

    #[test]
    fn release_failure_still_counts_cycle() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();

        device.context().on_press_timer();
        h.channel().set_fail_submit(true);
        device.context().on_release_timer();

        assert_eq!(device.context().cycle_count(), 1);
        assert_eq!(
            device.context().stats(),
            DeviceStats {
                cycles: 1,
                reports_submitted: 1,
                submit_failures: 1,
            }
        );
    }

    #[test]
    fn cycle_limit_tears_down() {
        let h = Harness::new(CloseDelivery::Deferred);
        let device = h.create();

        for _ in 0..10 {
            device.context().on_press_timer();
            device.context().on_release_timer();
        }

        assert_eq!(device.context().cycle_count(), 10);
        assert_eq!(device.state(), DeviceState::Terminating);
        assert!(h.channel().is_closing());
        assert_eq!(h.press().stop_count(), 1);
        assert!(!h.press().is_armed());

        device.context().on_press_timer();
        assert_eq!(h.channel().report_count(), 20);

        assert!(h.channel().deliver_pending_close());
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn cleanup_closes_transport_once() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();

        device.cleanup();
        device.cleanup();
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(!device.context().has_transport());
        assert_eq!(h.channel().close_requests(), 1);

        device.context().on_release_timer();
        device.context().on_press_timer();
        assert!(h.channel().reports().is_empty());
    }

    #[test]
    fn drop_runs_cleanup() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();
        let channel = h.channel();
        drop(device);
        assert!(channel.is_closed());
    }

    #[test]
    fn host_teardown_silences_timers() {
        let h = Harness::new(CloseDelivery::Immediate);
        let device = h.create();

        h.channel().host_teardown();
        assert_eq!(device.state(), DeviceState::Closed);

        device.context().on_press_timer();
        device.context().on_release_timer();
        assert!(h.channel().reports().is_empty());
        assert_eq!(device.context().cycle_count(), 0);
    }

    #[test]
    fn open_failure_creates_no_timers() {
        let h = Harness::new(CloseDelivery::Immediate);
        h.backend.set_faults(LoopbackFaults {
            fail_open: true,
            ..Default::default()
        });

        let err = create_device(h.init()).err().expect("open should fail");
        assert!(matches!(err, DeviceError::Open(_)));
        assert_eq!(h.timers.timer_count(), 0);
    }

    #[test]
    fn start_failure_closes_transport() {
        let h = Harness::new(CloseDelivery::Deferred);
        h.backend.set_faults(LoopbackFaults {
            fail_start: true,
            ..Default::default()
        });

        let err = create_device(h.init()).err().expect("start should fail");
        assert!(matches!(err, DeviceError::Start(_)));
        assert!(h.channel().is_closed());
        assert_eq!(h.timers.timer_count(), 0);
    }

    #[test]
    fn timer_failure_closes_transport() {
        let h = Harness::new(CloseDelivery::Immediate);
        h.timers.refuse(RELEASE_TIMER);

        let err = create_device(h.init()).err().expect("timer creation should fail");
        assert!(matches!(
            err,
            DeviceError::Timer {
                timer: RELEASE_TIMER,
                ..
            }
        ));
        assert!(h.channel().is_closed());
        assert!(!h.press().is_armed());
    }
}
