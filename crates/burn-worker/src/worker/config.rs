//! Worker Configuration Module
//!
//! Command line of the `burn-worker` binary and the configuration derived
//! from it. The supervisor builds these arguments in
//! [`WorkerPlan::build_command_args`](crate::spawner::WorkerPlan::build_command_args).

use std::time::Duration;

use clap::Parser;

use crate::workload::{Backend, MockSettings, Precision, WorkloadSettings};

/// Command line arguments for one compute worker
#[derive(Parser, Debug, Clone)]
#[command(name = "burn-worker")]
#[command(about = "Compute worker driven by gpu-burn", long_about = None)]
pub struct WorkerArgs {
    /// Device this worker stresses
    #[arg(long)]
    pub device: usize,

    /// Write the device count before the first record
    #[arg(long)]
    pub announce_devices: bool,

    /// Use doubles instead of floats
    #[arg(long)]
    pub doubles: bool,

    /// Percentage of the per-device memory budget to use
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(1..=90))]
    pub memory: u8,

    /// Workload backend
    #[arg(long, value_enum, default_value_t = Backend::Host)]
    pub backend: Backend,

    /// Number of device slots the backend exposes
    #[arg(long, default_value_t = 1)]
    pub devices: usize,

    /// Devices the mock backend fails
    #[arg(long, value_delimiter = ',')]
    pub mock_fail_device: Vec<usize>,

    /// Batches before an injected mock fault (0 = fail at init)
    #[arg(long, default_value_t = 0)]
    pub mock_fail_after: u64,

    /// Devices the mock backend reports mismatches on
    #[arg(long, value_delimiter = ',')]
    pub mock_error_device: Vec<usize>,

    /// Wall time per mock batch in milliseconds
    #[arg(long, default_value_t = 100)]
    pub mock_batch_ms: u64,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub device_id: usize,
    pub announce_devices: bool,
    pub settings: WorkloadSettings,
    pub backend: Backend,
    pub devices: usize,
    pub mock: MockSettings,
}

impl WorkerConfig {
    pub fn new(device_id: usize) -> Self {
        Self {
            device_id,
            announce_devices: device_id == 0,
            settings: WorkloadSettings::default(),
            backend: Backend::Host,
            devices: 1,
            mock: MockSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkloadSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_backend(mut self, backend: Backend, devices: usize) -> Self {
        self.backend = backend;
        self.devices = devices;
        self
    }

    pub fn with_mock(mut self, mock: MockSettings) -> Self {
        self.mock = mock;
        self
    }

    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce_devices = announce;
        self
    }
}

impl From<&WorkerArgs> for WorkerConfig {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            device_id: args.device,
            announce_devices: args.announce_devices,
            settings: WorkloadSettings {
                precision: Precision::from_doubles(args.doubles),
                memory_pct: args.memory,
            },
            backend: args.backend,
            devices: args.devices,
            mock: MockSettings {
                fail_devices: args.mock_fail_device.clone(),
                fail_after: args.mock_fail_after,
                error_devices: args.mock_error_device.clone(),
                batch_interval: Duration::from_millis(args.mock_batch_ms),
            },
        }
    }
}
