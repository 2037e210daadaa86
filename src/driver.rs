//! Driver entry and device creation
//!
//! The [`Driver`] holds the host services a device is built from. Creating it
//! is the driver-entry point; [`Driver::device_add`] is called once per
//! device the host wants.

use crate::config::{BackendKind, Config};
use crate::device::{create_device, Cadence, Device, DeviceError, DeviceInit};
use crate::timer::{ThreadTimerService, TimerService};
use crate::trace;
use crate::transport::loopback::{CloseDelivery, LoopbackBackend};
use crate::transport::{DeviceIdentity, TransportBackend, TransportError};
use std::sync::Arc;

/// Error type for driver setup
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("backend {0} is not available: {1}")]
    Backend(&'static str, #[source] TransportError),
}

pub struct Driver {
    init: DeviceInit,
}

impl Driver {
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        timers: Arc<dyn TimerService>,
        cadence: Cadence,
        identity: DeviceIdentity,
    ) -> Self {
        trace::enter("driver_entry");
        log::debug!("driver using {} backend", backend.name());
        Self {
            init: DeviceInit {
                backend,
                timers,
                cadence,
                identity,
            },
        }
    }

    /// Build a driver from configuration with thread-backed timers.
    ///
    /// `dry_run` forces the loopback backend regardless of the configured one.
    pub fn from_config(config: &Config, dry_run: bool) -> Result<Self, DriverError> {
        let kind = if dry_run {
            BackendKind::Loopback
        } else {
            config.device.backend
        };

        Ok(Self::new(
            backend_for(kind)?,
            Arc::new(ThreadTimerService::new()),
            config.cadence.to_cadence(),
            config.device.identity(),
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.init.backend.name()
    }

    pub fn cadence(&self) -> Cadence {
        self.init.cadence
    }

    /// Create one emulated keyboard.
    pub fn device_add(&self) -> Result<Device, DeviceError> {
        trace::enter("device_add");
        create_device(self.init.clone())
    }
}

fn backend_for(kind: BackendKind) -> Result<Arc<dyn TransportBackend>, DriverError> {
    match kind {
        BackendKind::Loopback => Ok(Arc::new(LoopbackBackend::new(CloseDelivery::Background))),
        #[cfg(target_os = "linux")]
        BackendKind::Uhid => Ok(Arc::new(crate::transport::uhid::UhidBackend::new())),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Uhid => Err(DriverError::Backend(
            "uhid",
            TransportError::Unsupported("uhid requires Linux"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::timer::ManualTimerService;
    use crate::transport::loopback::LoopbackFaults;
    use std::time::Duration;

    fn loopback_driver(
        faults: LoopbackFaults,
    ) -> (Driver, Arc<LoopbackBackend>, Arc<ManualTimerService>) {
        let backend = Arc::new(LoopbackBackend::with_faults(CloseDelivery::Immediate, faults));
        let timers = Arc::new(ManualTimerService::new());
        let driver = Driver::new(
            backend.clone(),
            timers.clone(),
            Cadence::default(),
            DeviceIdentity::default(),
        );
        (driver, backend, timers)
    }

    #[test]
    fn device_add_creates_active_device() {
        let (driver, backend, timers) = loopback_driver(LoopbackFaults::default());

        let device = driver.device_add().unwrap();
        assert_eq!(device.state(), DeviceState::Active);
        assert_eq!(backend.channels().len(), 1);

        timers.advance(Duration::from_millis(10_000));
        assert_eq!(backend.last_channel().unwrap().reports(), vec![vec![0x01]]);
    }

    #[test]
    fn device_add_propagates_open_failure() {
        let (driver, _, _) = loopback_driver(LoopbackFaults {
            fail_open: true,
            ..Default::default()
        });
        assert!(matches!(driver.device_add(), Err(DeviceError::Open(_))));
    }

    #[test]
    fn each_device_add_gets_its_own_channel() {
        let (driver, backend, _) = loopback_driver(LoopbackFaults::default());
        let first = driver.device_add().unwrap();
        let second = driver.device_add().unwrap();

        assert_eq!(backend.channels().len(), 2);
        drop(first);
        assert_eq!(second.state(), DeviceState::Active);
    }

    #[test]
    fn from_config_dry_run_uses_loopback() {
        let mut config = Config::default();
        config.cadence.cycle_limit = 2;

        let driver = Driver::from_config(&config, true).unwrap();
        assert_eq!(driver.backend_name(), "loopback");
        assert_eq!(driver.cadence().cycle_limit, 2);
    }

    #[test]
    fn from_config_honors_backend_setting() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Loopback;
        let driver = Driver::from_config(&config, false).unwrap();
        assert_eq!(driver.backend_name(), "loopback");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn from_config_selects_uhid_on_linux() {
        let driver = Driver::from_config(&Config::default(), false).unwrap();
        assert_eq!(driver.backend_name(), "uhid");
    }
}
