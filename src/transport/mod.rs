//! Virtual HID transport
//!
//! A transport is a channel through which synthetic input reports reach the
//! host input stack as if a physical device produced them. Backends open a
//! channel for a report descriptor and hand back a [`TransportHandle`]; the
//! channel reports its own teardown through a one-shot [`ClosedCallback`].

pub mod loopback;
#[cfg(target_os = "linux")]
pub mod uhid;

use crate::utils::MutexExt;
use std::io;
use std::sync::{Arc, Mutex};

pub use loopback::{CloseDelivery, LoopbackBackend, LoopbackChannel, LoopbackFaults};
#[cfg(target_os = "linux")]
pub use uhid::UhidBackend;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel could not be allocated
    #[error("could not allocate virtual HID channel: {0}")]
    OpenFailed(String),
    /// The channel could not be activated
    #[error("could not start virtual HID channel: {0}")]
    StartFailed(String),
    /// A report was submitted before `start`
    #[error("channel is not started")]
    NotStarted,
    /// A report was submitted after teardown was requested
    #[error("channel is closed")]
    Closed,
    /// Report size does not match the descriptor
    #[error("report is {actual} bytes, descriptor expects {expected}")]
    ReportLength { expected: usize, actual: usize },
    /// The channel refused the report
    #[error("report rejected: {0}")]
    Rejected(String),
    /// The backend is not available on this platform
    #[error("{0} backend is not supported on this platform")]
    Unsupported(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One-time notification that a channel has been torn down
pub type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

/// An open virtual HID channel
pub type TransportHandle = Arc<dyn VirtualHid>;

/// Identity the emulated device advertises to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u32,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            name: "Virtual Keyboard".to_string(),
            vendor_id: 0x1209,
            product_id: 0x0001,
            version: 1,
        }
    }
}

/// Parameters for opening a channel
#[derive(Debug, Clone, Copy)]
pub struct OpenParams<'a> {
    /// Report descriptor the channel advertises
    pub descriptor: &'a [u8],
    /// Size every submitted report must have
    pub report_len: usize,
    pub identity: &'a DeviceIdentity,
}

/// An open virtual HID channel.
///
/// Implementations must be safe to call from several timer callbacks at once.
pub trait VirtualHid: Send + Sync {
    /// Activate the channel so submitted reports are delivered to the host.
    fn start(&self) -> Result<(), TransportError>;

    /// Deliver exactly one input report to the host.
    fn submit_report(&self, report: &[u8]) -> Result<(), TransportError>;

    /// Request teardown.
    ///
    /// Completion is signalled through the channel's [`ClosedCallback`]. With
    /// `force_immediate` the callback has run by the time this returns.
    /// Calling `close` again is a no-op.
    fn close(&self, force_immediate: bool);
}

/// Opens virtual HID channels
pub trait TransportBackend: Send + Sync {
    /// Short backend name used in logs and summaries
    fn name(&self) -> &'static str;

    /// Establish a channel advertising `params.descriptor`.
    ///
    /// `on_closed` is invoked at most once, when the channel is torn down by
    /// either side. It is dropped without being called if opening fails.
    fn open(
        &self,
        params: &OpenParams<'_>,
        on_closed: ClosedCallback,
    ) -> Result<TransportHandle, TransportError>;
}

/// Fires a [`ClosedCallback`] at most once, from whichever path gets there first
pub struct ClosedNotifier {
    callback: Mutex<Option<ClosedCallback>>,
}

impl ClosedNotifier {
    pub fn new(callback: ClosedCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Run the callback if it has not run yet. Returns true if this call ran it.
    pub fn fire(&self) -> bool {
        let callback = self.callback.lock_recover().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.callback.lock_recover().is_none()
    }
}

#[derive(Default)]
enum SlotState {
    #[default]
    Vacant,
    Open(TransportHandle),
    Cleared,
}

/// Holds the owner's transport handle.
///
/// The slot is filled once, at creation. After it has been emptied it stays
/// empty, so a cleared handle can never be observed again. Readers clone the
/// handle out and never hold the guard while talking to the channel.
#[derive(Default)]
pub struct TransportSlot {
    state: Mutex<SlotState>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly opened handle. Fails if the slot was ever filled or cleared.
    pub fn install(&self, handle: TransportHandle) -> bool {
        let mut state = self.state.lock_recover();
        match *state {
            SlotState::Vacant => {
                *state = SlotState::Open(handle);
                true
            }
            _ => false,
        }
    }

    /// The live handle, if any
    pub fn get(&self) -> Option<TransportHandle> {
        match &*self.state.lock_recover() {
            SlotState::Open(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Remove the live handle so the caller can tear it down
    pub fn take(&self) -> Option<TransportHandle> {
        let mut state = self.state.lock_recover();
        match std::mem::replace(&mut *state, SlotState::Cleared) {
            SlotState::Open(handle) => Some(handle),
            _ => None,
        }
    }

    /// Empty the slot. Safe to call any number of times.
    pub fn clear(&self) {
        *self.state.lock_recover() = SlotState::Cleared;
    }

    pub fn is_empty(&self) -> bool {
        !matches!(*self.state.lock_recover(), SlotState::Open(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_loopback() -> TransportHandle {
        let backend = LoopbackBackend::new(CloseDelivery::Immediate);
        let identity = DeviceIdentity::default();
        let params = OpenParams {
            descriptor: &[0xc0],
            report_len: 1,
            identity: &identity,
        };
        backend
            .open(&params, Box::new(|| {}))
            .expect("loopback open should succeed")
    }

    #[test]
    fn slot_starts_empty() {
        let slot = TransportSlot::new();
        assert!(slot.is_empty());
        assert!(slot.get().is_none());
        assert!(slot.take().is_none());
    }

    #[test]
    fn slot_install_then_take() {
        let slot = TransportSlot::new();
        assert!(slot.install(open_loopback()));
        assert!(!slot.is_empty());
        assert!(slot.get().is_some());
        assert!(slot.take().is_some());
        assert!(slot.is_empty());
        assert!(slot.take().is_none());
    }

    #[test]
    fn slot_never_refills_after_clear() {
        let slot = TransportSlot::new();
        assert!(slot.install(open_loopback()));
        slot.clear();
        assert!(!slot.install(open_loopback()));
        assert!(slot.is_empty());
    }

    #[test]
    fn slot_rejects_install_after_early_clear() {
        let slot = TransportSlot::new();
        slot.clear();
        assert!(!slot.install(open_loopback()));
        assert!(slot.get().is_none());
    }

    #[test]
    fn notifier_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let notifier = ClosedNotifier::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!notifier.has_fired());
        assert!(notifier.fire());
        assert!(!notifier.fire());
        assert!(notifier.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::ReportLength {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "report is 2 bytes, descriptor expects 1");
        assert_eq!(TransportError::Closed.to_string(), "channel is closed");
    }
}
