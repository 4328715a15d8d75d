//! Compute worker loop.
//!
//! ```text
//!   announce? ──> open workload ──> run batch ──> write record ─┐
//!                      │                ^                       │
//!                      │ init failure   └───────────────────────┘
//!                      v                     │ batch failure
//!               write sentinel, 124          v
//!                                     write sentinel, 111
//! ```
//!
//! The worker never exits on its own while healthy; the supervisor ends it
//! with SIGTERM. A write failure means the supervisor is gone and the loop
//! stops quietly.

use std::io::Write;

use tracing::{error, info, warn};

use burn_protocol::{write_device_count, ExitReason, TelemetryRecord};

use super::config::WorkerConfig;
use crate::workload::DeviceBackend;

/// One worker bound to a device and a telemetry sink.
pub struct ComputeWorker<W: Write> {
    config: WorkerConfig,
    backend: Box<dyn DeviceBackend>,
    channel: W,
}

impl<W: Write> ComputeWorker<W> {
    pub fn new(config: WorkerConfig, backend: Box<dyn DeviceBackend>, channel: W) -> Self {
        Self {
            config,
            backend,
            channel,
        }
    }

    /// Run until a failure or until the channel closes.
    pub fn run(mut self) -> ExitReason {
        let device = self.config.device_id;

        if self.config.announce_devices {
            let count = match self.backend.device_count() {
                Ok(count) => count,
                Err(e) => {
                    error!(error = %e, "Couldn't enumerate devices");
                    0
                }
            };
            if let Err(e) = write_device_count(&mut self.channel, count) {
                warn!(error = %e, "Supervisor channel closed before announcement");
                return ExitReason::DeviceInitFailure;
            }
            if count == 0 {
                return ExitReason::DeviceInitFailure;
            }
            info!(devices = count, backend = self.backend.name(), "Announced devices");
        }

        let mut workload = match self.backend.open(device, &self.config.settings) {
            Ok(workload) => workload,
            Err(e) => {
                error!(device, error = %e, kind = %e.exit_reason(), "Couldn't init a GPU test");
                self.signal_fatal();
                return ExitReason::DeviceInitFailure;
            }
        };

        info!(
            device,
            batch = workload.batch_size(),
            precision = %self.config.settings.precision,
            "Running stress loop"
        );

        loop {
            let report = match workload.run_batch() {
                Ok(report) => report,
                Err(e) => {
                    error!(device, error = %e, kind = %e.exit_reason(), "Failure during compute");
                    self.signal_fatal();
                    return ExitReason::ComputeFailure;
                }
            };

            let record = TelemetryRecord::new(report.ops, report.errors);
            if let Err(e) = record.write_to(&mut self.channel) {
                info!(device, error = %e, "Supervisor channel closed, stopping");
                return ExitReason::Completed;
            }
        }
    }

    fn signal_fatal(&mut self) {
        if let Err(e) = TelemetryRecord::FATAL.write_to(&mut self.channel) {
            warn!(error = %e, "Couldn't deliver fatal sentinel");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::workload::mock::MOCK_BATCH;
    use crate::workload::{Backend, MockSettings};

    /// Accepts `capacity` writes, then fails like a closed pipe.
    struct LimitedSink {
        buf: Vec<u8>,
        capacity: usize,
    }

    impl LimitedSink {
        fn new(capacity: usize) -> Self {
            Self {
                buf: Vec::new(),
                capacity,
            }
        }

        fn records(&self, skip: usize) -> Vec<TelemetryRecord> {
            self.buf[skip..]
                .chunks_exact(burn_protocol::RECORD_SIZE)
                .map(|c| {
                    let mut bytes = [0u8; burn_protocol::RECORD_SIZE];
                    bytes.copy_from_slice(c);
                    TelemetryRecord::from_bytes(bytes)
                })
                .collect()
        }
    }

    impl Write for LimitedSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.capacity == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.capacity -= 1;
            self.buf.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn mock(settings: MockSettings, devices: usize) -> Box<dyn DeviceBackend> {
        Backend::Mock.open_backend(devices, &settings)
    }

    fn fast() -> MockSettings {
        MockSettings {
            batch_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_announce_then_records() {
        let mut sink = LimitedSink::new(4);
        let config = WorkerConfig::new(0).with_backend(Backend::Mock, 2);
        let reason = ComputeWorker::new(config, mock(fast(), 2), &mut sink).run();

        assert_eq!(reason, ExitReason::Completed);
        assert_eq!(&sink.buf[..4], &2i32.to_le_bytes());
        let records = sink.records(4);
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.ops_completed() == MOCK_BATCH && r.errors_detected() == 0));
    }

    #[test]
    fn test_init_failure_writes_sentinel() {
        let mut sink = LimitedSink::new(8);
        let settings = MockSettings {
            fail_devices: vec![1],
            ..fast()
        };
        let config = WorkerConfig::new(1).with_backend(Backend::Mock, 2);
        let reason = ComputeWorker::new(config, mock(settings, 2), &mut sink).run();

        assert_eq!(reason, ExitReason::DeviceInitFailure);
        assert_eq!(sink.records(0), vec![TelemetryRecord::FATAL]);
    }

    #[test]
    fn test_compute_failure_writes_sentinel_last() {
        let mut sink = LimitedSink::new(16);
        let settings = MockSettings {
            fail_devices: vec![0],
            fail_after: 2,
            ..fast()
        };
        let config = WorkerConfig::new(0)
            .with_backend(Backend::Mock, 1)
            .with_announce(false);
        let reason = ComputeWorker::new(config, mock(settings, 1), &mut sink).run();

        assert_eq!(reason, ExitReason::ComputeFailure);
        let records = sink.records(0);
        assert_eq!(records.len(), 3);
        assert!(!records[0].is_fatal());
        assert!(!records[1].is_fatal());
        assert!(records[2].is_fatal());
    }

    #[test]
    fn test_no_devices_announces_zero() {
        let mut sink = LimitedSink::new(4);
        let config = WorkerConfig::new(0).with_backend(Backend::Mock, 0);
        let reason = ComputeWorker::new(config, mock(fast(), 0), &mut sink).run();

        assert_eq!(reason, ExitReason::DeviceInitFailure);
        assert_eq!(sink.buf, 0i32.to_le_bytes().to_vec());
    }
}
