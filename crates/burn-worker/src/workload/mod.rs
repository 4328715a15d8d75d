//! Compute workloads driven by a worker process.
//!
//! A [`DeviceBackend`] enumerates devices and opens a [`Workload`] on one of
//! them. The worker loop only ever talks to these two traits, so the
//! arithmetic behind a batch (host matrix products, a scripted mock) is
//! interchangeable.

pub mod device;
pub mod host;
pub mod mock;

use std::fmt;

use crate::base::Result;

pub use device::{system_memory, SystemMemory};
pub use host::{HostBackend, HostWorkload};
pub use mock::{MockBackend, MockSettings, MockWorkload};

/// Element type used for the matrix products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

impl Precision {
    pub fn from_doubles(doubles: bool) -> Self {
        if doubles {
            Self::Double
        } else {
            Self::Single
        }
    }

    pub fn is_double(self) -> bool {
        matches!(self, Self::Double)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "FLOATS"),
            Self::Double => write!(f, "DOUBLES"),
        }
    }
}

/// Per-run parameters every worker receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadSettings {
    pub precision: Precision,
    /// Percentage of the per-device memory budget to use (1..=90).
    pub memory_pct: u8,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            precision: Precision::Single,
            memory_pct: 50,
        }
    }
}

impl WorkloadSettings {
    pub fn memory_fraction(&self) -> f64 {
        f64::from(self.memory_pct) / 100.0
    }
}

/// Outcome of one batch: products computed and mismatching result cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub ops: u64,
    pub errors: u64,
}

/// A workload bound to one device.
pub trait Workload {
    /// Number of products computed per batch.
    fn batch_size(&self) -> u64;

    /// Run one batch and verify it.
    fn run_batch(&mut self) -> Result<BatchReport>;
}

/// Device enumeration and workload construction.
pub trait DeviceBackend {
    fn name(&self) -> &'static str;

    fn device_count(&self) -> Result<usize>;

    fn open(&self, device_id: usize, settings: &WorkloadSettings) -> Result<Box<dyn Workload>>;
}

/// Which backend a worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Backend {
    /// Dense matrix products on the host
    #[default]
    Host,
    /// Scripted workload for exercising the supervisor
    Mock,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Mock => "mock",
        }
    }

    pub fn open_backend(self, devices: usize, mock: &MockSettings) -> Box<dyn DeviceBackend> {
        match self {
            Self::Host => Box::new(HostBackend::new(devices)),
            Self::Mock => Box::new(MockBackend::new(devices, mock.clone())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
