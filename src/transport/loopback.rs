//! In-memory transport
//!
//! Records every report it is handed instead of delivering it to a host input
//! stack. Used for dry runs and as the test double for the device state
//! machine: faults can be injected at each step, and delivery of the closed
//! notification can be held back to exercise teardown races.

use super::{
    ClosedCallback, ClosedNotifier, OpenParams, TransportBackend, TransportError, TransportHandle,
    VirtualHid,
};
use crate::utils::MutexExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// When a requested close is acknowledged with the closed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDelivery {
    /// Inside the `close` call
    Immediate,
    /// On a separate thread, shortly after `close` returns
    Background,
    /// Only when [`LoopbackChannel::deliver_pending_close`] is called
    Deferred,
}

/// Faults to inject into the next opened channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackFaults {
    pub fail_open: bool,
    pub fail_start: bool,
    pub fail_submit: bool,
}

/// Backend handing out [`LoopbackChannel`]s
pub struct LoopbackBackend {
    delivery: CloseDelivery,
    faults: Mutex<LoopbackFaults>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
}

impl LoopbackBackend {
    pub fn new(delivery: CloseDelivery) -> Self {
        Self {
            delivery,
            faults: Mutex::new(LoopbackFaults::default()),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn with_faults(delivery: CloseDelivery, faults: LoopbackFaults) -> Self {
        let backend = Self::new(delivery);
        backend.set_faults(faults);
        backend
    }

    pub fn set_faults(&self, faults: LoopbackFaults) {
        *self.faults.lock_recover() = faults;
    }

    /// Every channel opened so far, oldest first
    pub fn channels(&self) -> Vec<Arc<LoopbackChannel>> {
        self.channels.lock_recover().clone()
    }

    /// The most recently opened channel
    pub fn last_channel(&self) -> Option<Arc<LoopbackChannel>> {
        self.channels.lock_recover().last().cloned()
    }
}

impl TransportBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open(
        &self,
        params: &OpenParams<'_>,
        on_closed: ClosedCallback,
    ) -> Result<TransportHandle, TransportError> {
        let faults = *self.faults.lock_recover();
        if faults.fail_open {
            return Err(TransportError::OpenFailed("injected open failure".to_string()));
        }

        let channel = Arc::new(LoopbackChannel {
            name: params.identity.name.clone(),
            descriptor: params.descriptor.to_vec(),
            report_len: params.report_len,
            delivery: self.delivery,
            fail_start: faults.fail_start,
            fail_submit: AtomicBool::new(faults.fail_submit),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_requests: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
            notifier: Arc::new(ClosedNotifier::new(on_closed)),
        });

        self.channels.lock_recover().push(Arc::clone(&channel));
        log::debug!(
            "loopback: opened channel for '{}' ({} byte descriptor)",
            channel.name,
            channel.descriptor.len()
        );

        Ok(channel)
    }
}

/// A channel that stores delivered reports in memory
pub struct LoopbackChannel {
    name: String,
    descriptor: Vec<u8>,
    report_len: usize,
    delivery: CloseDelivery,
    fail_start: bool,
    fail_submit: AtomicBool,
    started: AtomicBool,
    closing: AtomicBool,
    close_requests: AtomicUsize,
    reports: Mutex<Vec<Vec<u8>>>,
    notifier: Arc<ClosedNotifier>,
}

impl LoopbackChannel {
    /// Reports delivered so far, in order
    pub fn reports(&self) -> Vec<Vec<u8>> {
        self.reports.lock_recover().clone()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock_recover().len()
    }

    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True once teardown was requested by either side
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// True once the closed notification has been delivered
    pub fn is_closed(&self) -> bool {
        self.notifier.has_fired()
    }

    /// Number of `close` calls, including ignored repeats
    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Deliver a closed notification held back by [`CloseDelivery::Deferred`].
    ///
    /// Returns true if a notification was delivered.
    pub fn deliver_pending_close(&self) -> bool {
        self.is_closing() && self.notifier.fire()
    }

    /// Tear the channel down from the host side
    pub fn host_teardown(&self) {
        log::debug!("loopback: host tore down channel for '{}'", self.name);
        self.closing.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.notifier.fire();
    }
}

impl VirtualHid for LoopbackChannel {
    fn start(&self) -> Result<(), TransportError> {
        if self.fail_start {
            return Err(TransportError::StartFailed(
                "injected start failure".to_string(),
            ));
        }
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn submit_report(&self, report: &[u8]) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        if report.len() != self.report_len {
            return Err(TransportError::ReportLength {
                expected: self.report_len,
                actual: report.len(),
            });
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("injected submit failure".to_string()));
        }

        self.reports.lock_recover().push(report.to_vec());
        Ok(())
    }

    fn close(&self, force_immediate: bool) {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.started.store(false, Ordering::SeqCst);

        let delivery = if force_immediate {
            CloseDelivery::Immediate
        } else {
            self.delivery
        };

        match delivery {
            CloseDelivery::Immediate => {
                self.notifier.fire();
            }
            CloseDelivery::Background => {
                let notifier = Arc::clone(&self.notifier);
                let spawned = thread::Builder::new()
                    .name("loopback-close".to_string())
                    .spawn(move || {
                        notifier.fire();
                    });
                if let Err(e) = spawned {
                    log::warn!("loopback: could not defer close notification: {}", e);
                    self.notifier.fire();
                }
            }
            CloseDelivery::Deferred => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceIdentity;
    use std::time::{Duration, Instant};

    fn open(backend: &LoopbackBackend, on_closed: ClosedCallback) -> TransportHandle {
        let identity = DeviceIdentity::default();
        let params = OpenParams {
            descriptor: &[0x05, 0x01, 0xc0],
            report_len: 1,
            identity: &identity,
        };
        backend.open(&params, on_closed).expect("open should succeed")
    }

    fn flag() -> (Arc<AtomicBool>, ClosedCallback) {
        let fired = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&fired);
        (
            fired,
            Box::new(move || setter.store(true, Ordering::SeqCst)),
        )
    }

    #[test]
    fn submit_requires_start() {
        let backend = LoopbackBackend::new(CloseDelivery::Immediate);
        let hid = open(&backend, Box::new(|| {}));

        assert!(matches!(hid.submit_report(&[1]), Err(TransportError::NotStarted)));
        hid.start().unwrap();
        hid.submit_report(&[1]).unwrap();

        let channel = backend.last_channel().unwrap();
        assert_eq!(channel.reports(), vec![vec![1]]);
        assert_eq!(channel.descriptor(), &[0x05, 0x01, 0xc0]);
    }

    #[test]
    fn submit_checks_report_length() {
        let backend = LoopbackBackend::new(CloseDelivery::Immediate);
        let hid = open(&backend, Box::new(|| {}));
        hid.start().unwrap();

        let err = hid.submit_report(&[1, 0]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ReportLength {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn injected_faults() {
        let backend = LoopbackBackend::with_faults(
            CloseDelivery::Immediate,
            LoopbackFaults {
                fail_open: true,
                ..Default::default()
            },
        );
        let identity = DeviceIdentity::default();
        let params = OpenParams {
            descriptor: &[],
            report_len: 1,
            identity: &identity,
        };
        assert!(backend.open(&params, Box::new(|| {})).is_err());
        assert!(backend.channels().is_empty());

        backend.set_faults(LoopbackFaults {
            fail_start: true,
            fail_submit: true,
            ..Default::default()
        });
        let hid = open(&backend, Box::new(|| {}));
        assert!(matches!(hid.start(), Err(TransportError::StartFailed(_))));
    }

    #[test]
    fn immediate_close_notifies_once() {
        let backend = LoopbackBackend::new(CloseDelivery::Immediate);
        let (fired, on_closed) = flag();
        let hid = open(&backend, on_closed);

        hid.close(false);
        assert!(fired.load(Ordering::SeqCst));
        hid.close(false);

        let channel = backend.last_channel().unwrap();
        assert!(channel.is_closed());
        assert_eq!(channel.close_requests(), 2);
        assert!(matches!(hid.submit_report(&[0]), Err(TransportError::Closed)));
    }

    #[test]
    fn deferred_close_waits_for_delivery() {
        let backend = LoopbackBackend::new(CloseDelivery::Deferred);
        let (fired, on_closed) = flag();
        let hid = open(&backend, on_closed);
        let channel = backend.last_channel().unwrap();

        assert!(!channel.deliver_pending_close());
        hid.close(false);
        assert!(channel.is_closing());
        assert!(!fired.load(Ordering::SeqCst));

        assert!(channel.deliver_pending_close());
        assert!(fired.load(Ordering::SeqCst));
        assert!(!channel.deliver_pending_close());
    }

    #[test]
    fn forced_close_overrides_deferral() {
        let backend = LoopbackBackend::new(CloseDelivery::Deferred);
        let (fired, on_closed) = flag();
        let hid = open(&backend, on_closed);

        hid.close(true);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn background_close_notifies_eventually() {
        let backend = LoopbackBackend::new(CloseDelivery::Background);
        let (fired, on_closed) = flag();
        let hid = open(&backend, on_closed);

        hid.close(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn host_teardown_notifies() {
        let backend = LoopbackBackend::new(CloseDelivery::Deferred);
        let (fired, on_closed) = flag();
        let hid = open(&backend, on_closed);
        hid.start().unwrap();

        backend.last_channel().unwrap().host_teardown();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(hid.submit_report(&[1]), Err(TransportError::Closed)));
    }
}
