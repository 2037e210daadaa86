//! Linux UHID transport
//!
//! Creates a kernel HID device through `/dev/uhid`. The kernel binds the
//! regular HID drivers to it, so reports show up on the host's input stack
//! like those of a physical keyboard.
//!
//! Event encoding is left to `uhid-virt`. The channel only adds the
//! lifecycle on top: started/closed checks and the one-shot closed
//! notification.

use super::{
    ClosedCallback, ClosedNotifier, OpenParams, TransportBackend, TransportError, TransportHandle,
    VirtualHid,
};
use crate::utils::MutexExt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use uhid_virt::{Bus, CreateParams, UHIDDevice};

const UHID_PATH: &str = "/dev/uhid";

/// Largest descriptor or report the kernel accepts in one event
const UHID_DATA_MAX: usize = 4096;

/// The calls a channel makes on a created uhid device
trait UhidNode: Send {
    fn write_report(&mut self, report: &[u8]) -> io::Result<()>;
    fn destroy(&mut self) -> io::Result<()>;
}

impl UhidNode for UHIDDevice<File> {
    fn write_report(&mut self, report: &[u8]) -> io::Result<()> {
        UHIDDevice::<File>::write(self, report).map(|_| ())
    }

    fn destroy(&mut self) -> io::Result<()> {
        UHIDDevice::<File>::destroy(self).map(|_| ())
    }
}

/// Backend creating devices through `/dev/uhid`
pub struct UhidBackend {
    path: PathBuf,
}

impl UhidBackend {
    pub fn new() -> Self {
        Self::with_path(UHID_PATH)
    }

    /// Use a different character device, e.g. inside a container
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for UhidBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBackend for UhidBackend {
    fn name(&self) -> &'static str {
        "uhid"
    }

    fn open(
        &self,
        params: &OpenParams<'_>,
        on_closed: ClosedCallback,
    ) -> Result<TransportHandle, TransportError> {
        if params.descriptor.len() > UHID_DATA_MAX {
            return Err(TransportError::OpenFailed(format!(
                "descriptor is {} bytes, uhid accepts at most {}",
                params.descriptor.len(),
                UHID_DATA_MAX
            )));
        }
        if params.report_len == 0 || params.report_len > UHID_DATA_MAX {
            return Err(TransportError::OpenFailed(format!(
                "report length {} outside 1..={}",
                params.report_len, UHID_DATA_MAX
            )));
        }

        let identity = params.identity;
        let create = CreateParams {
            name: identity.name.clone(),
            phys: String::new(),
            uniq: String::new(),
            bus: Bus::VIRTUAL,
            vendor: u32::from(identity.vendor_id),
            product: u32::from(identity.product_id),
            version: identity.version,
            country: 0,
            rd_data: params.descriptor.to_vec(),
        };

        let device = UHIDDevice::create_with_path(create, &self.path).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                TransportError::OpenFailed(format!(
                    "permission denied accessing {}. Try running with sudo.",
                    self.path.display()
                ))
            } else {
                TransportError::Io(e)
            }
        })?;

        log::info!(
            "uhid: created '{}' ({:04x}:{:04x})",
            identity.name,
            identity.vendor_id,
            identity.product_id
        );

        Ok(Arc::new(UhidChannel::new(
            Box::new(device),
            params.report_len,
            on_closed,
        )))
    }
}

/// An open uhid device
pub struct UhidChannel {
    /// Emptied once the device is destroyed
    node: Mutex<Option<Box<dyn UhidNode>>>,
    report_len: usize,
    started: AtomicBool,
    notifier: Arc<ClosedNotifier>,
}

impl UhidChannel {
    fn new(node: Box<dyn UhidNode>, report_len: usize, on_closed: ClosedCallback) -> Self {
        Self {
            node: Mutex::new(Some(node)),
            report_len,
            started: AtomicBool::new(false),
            notifier: Arc::new(ClosedNotifier::new(on_closed)),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.node.lock_recover().is_none()
    }

    /// Notify the owner off the caller's thread
    fn notify_later(&self) {
        let notifier = Arc::clone(&self.notifier);
        let spawned = thread::Builder::new()
            .name("uhid-close".to_string())
            .spawn(move || {
                notifier.fire();
            });
        if let Err(e) = spawned {
            log::warn!("uhid: could not spawn close notifier ({}), notifying inline", e);
            self.notifier.fire();
        }
    }
}

impl VirtualHid for UhidChannel {
    fn start(&self) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn submit_report(&self, report: &[u8]) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) && !self.is_destroyed() {
            return Err(TransportError::NotStarted);
        }
        if report.len() != self.report_len {
            return Err(TransportError::ReportLength {
                expected: self.report_len,
                actual: report.len(),
            });
        }

        let mut node = self.node.lock_recover();
        let Some(device) = node.as_mut() else {
            return Err(TransportError::Closed);
        };

        if let Err(e) = device.write_report(report) {
            // The kernel side is gone: the device cannot come back.
            log::warn!("uhid: write returned {}, device lost", e);
            if let Some(mut device) = node.take() {
                let _ = device.destroy();
            }
            drop(node);
            self.started.store(false, Ordering::SeqCst);
            self.notify_later();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn close(&self, force_immediate: bool) {
        let Some(mut device) = self.node.lock_recover().take() else {
            return;
        };
        self.started.store(false, Ordering::SeqCst);

        if let Err(e) = device.destroy() {
            log::warn!("uhid: destroy returned {}", e);
        }
        drop(device);
        log::debug!("uhid: device destroyed");

        if force_immediate {
            self.notifier.fire();
        } else {
            self.notify_later();
        }
    }
}

impl Drop for UhidChannel {
    fn drop(&mut self) {
        if let Some(mut device) = self.node.lock_recover().take() {
            let _ = device.destroy();
            self.notifier.fire();
        }
    }
}
