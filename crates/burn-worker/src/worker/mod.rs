//! Worker Module - one compute worker per device
//!
//! A worker owns a single device. It opens a workload, runs batches forever
//! and streams one telemetry record per batch to standard output. Worker 0
//! additionally announces how many devices exist before anything else.
//!
//! # Usage
//!
//! ```ignore
//! let config = WorkerConfig::from(&WorkerArgs::parse());
//! let backend = config.backend.open_backend(config.devices, &config.mock);
//! let reason = ComputeWorker::new(config, backend, channel).run();
//! std::process::exit(reason.code());
//! ```

mod config;
mod worker;

pub use config::{WorkerArgs, WorkerConfig};
pub use worker::ComputeWorker;
