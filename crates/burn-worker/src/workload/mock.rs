//! Scripted workload for exercising the supervisor without real compute.

use std::thread;
use std::time::Duration;

use super::{BatchReport, DeviceBackend, Workload, WorkloadSettings};
use crate::base::{Error, Result};

/// Products reported per mock batch.
pub const MOCK_BATCH: u64 = 16;

/// Fault injection knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSettings {
    /// Devices that fail.
    pub fail_devices: Vec<usize>,
    /// Batches a failing device completes before its fault; 0 fails at init.
    pub fail_after: u64,
    /// Devices that report one mismatch per batch.
    pub error_devices: Vec<usize>,
    /// Wall time per batch.
    pub batch_interval: Duration,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            fail_devices: Vec::new(),
            fail_after: 0,
            error_devices: Vec::new(),
            batch_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    devices: usize,
    settings: MockSettings,
}

impl MockBackend {
    pub fn new(devices: usize, settings: MockSettings) -> Self {
        Self { devices, settings }
    }
}

impl DeviceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_count(&self) -> Result<usize> {
        if self.devices == 0 {
            return Err(Error::NoDevices);
        }
        Ok(self.devices)
    }

    fn open(&self, device_id: usize, _settings: &WorkloadSettings) -> Result<Box<dyn Workload>> {
        if device_id >= self.devices {
            return Err(Error::InvalidDevice {
                device: device_id,
                count: self.devices,
            });
        }

        let failing = self.settings.fail_devices.contains(&device_id);
        if failing && self.settings.fail_after == 0 {
            return Err(Error::AllocationFailed(format!(
                "injected allocation fault on device {}",
                device_id
            )));
        }

        Ok(Box::new(MockWorkload {
            device_id,
            interval: self.settings.batch_interval,
            fail_after: failing.then_some(self.settings.fail_after),
            errors_per_batch: u64::from(self.settings.error_devices.contains(&device_id)),
            completed: 0,
        }))
    }
}

#[derive(Debug)]
pub struct MockWorkload {
    device_id: usize,
    interval: Duration,
    fail_after: Option<u64>,
    errors_per_batch: u64,
    completed: u64,
}

impl Workload for MockWorkload {
    fn batch_size(&self) -> u64 {
        MOCK_BATCH
    }

    fn run_batch(&mut self) -> Result<BatchReport> {
        if self.fail_after.is_some_and(|limit| self.completed >= limit) {
            return Err(Error::LaunchFailed {
                device: self.device_id,
                reason: format!("injected compute fault after {} batches", self.completed),
            });
        }

        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        self.completed += 1;

        Ok(BatchReport {
            ops: MOCK_BATCH,
            errors: self.errors_per_batch,
        })
    }
}
