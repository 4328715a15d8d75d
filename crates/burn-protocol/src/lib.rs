//! Worker -> Supervisor wire contract.
//!
//! Every compute worker owns exactly one unidirectional byte channel back to
//! the supervisor (its standard output pipe). The channel carries:
//!
//! ```text
//! worker 0 only:  [device count: i32 LE]
//! every worker:   [ops: i32 LE][errors: i32 LE] [ops][errors] ...
//! ```
//!
//! There is no length prefix and no framing beyond the fixed record width.
//! A record whose two fields both equal [`SENTINEL`] is the worker's last
//! record: it hit a fatal fault and is about to exit.

mod codec;

use std::io::{self, Write};

pub use codec::TelemetryCodec;

/// Size in bytes of one [`TelemetryRecord`] on the wire.
pub const RECORD_SIZE: usize = 8;

/// Size in bytes of the device-count announcement sent by worker 0.
pub const ANNOUNCE_SIZE: usize = 4;

/// Reserved field value. Both fields set to it means "fatal, last record".
pub const SENTINEL: i32 = -1;

/// Matrices are `MATRIX_DIM x MATRIX_DIM`.
pub const MATRIX_DIM: usize = 2048;

/// Floating point operations credited to one `MATRIX_DIM` multiply.
///
/// Measured for a 2048^3 GEMM; slightly above the naive `2 * n^3`.
pub const OPS_PER_MUL: u64 = 17_188_257_792;

/// One telemetry report: the batch just completed and the verification
/// mismatches seen since the previous report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub ops: i32,
    pub errors: i32,
}

impl TelemetryRecord {
    /// The fatal-failure record.
    pub const FATAL: Self = Self {
        ops: SENTINEL,
        errors: SENTINEL,
    };

    /// Build a record, saturating counts that do not fit the wire width.
    pub fn new(ops: u64, errors: u64) -> Self {
        Self {
            ops: i32::try_from(ops).unwrap_or(i32::MAX),
            errors: i32::try_from(errors).unwrap_or(i32::MAX),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.ops == SENTINEL && self.errors == SENTINEL
    }

    /// Operations completed, with negative garbage read as zero.
    pub fn ops_completed(&self) -> u64 {
        u64::try_from(self.ops).unwrap_or(0)
    }

    /// Verification mismatches, with negative garbage read as zero.
    pub fn errors_detected(&self) -> u64 {
        u64::try_from(self.errors).unwrap_or(0)
    }

    pub fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..4].copy_from_slice(&self.ops.to_le_bytes());
        out[4..].copy_from_slice(&self.errors.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        let [o0, o1, o2, o3, e0, e1, e2, e3] = bytes;
        Self {
            ops: i32::from_le_bytes([o0, o1, o2, o3]),
            errors: i32::from_le_bytes([e0, e1, e2, e3]),
        }
    }

    /// Write the record with a single `write_all` and flush it.
    ///
    /// A single 8-byte write on a pipe is atomic, so the reader never sees
    /// half a record when the channel turns readable.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()
    }
}

/// Write worker 0's device-count announcement.
pub fn write_device_count<W: Write>(writer: &mut W, count: usize) -> io::Result<()> {
    let count = i32::try_from(count).unwrap_or(i32::MAX);
    writer.write_all(&count.to_le_bytes())?;
    writer.flush()
}

/// Decode a device-count announcement. Zero or negative means "no devices".
pub fn decode_device_count(bytes: [u8; ANNOUNCE_SIZE]) -> usize {
    usize::try_from(i32::from_le_bytes(bytes)).unwrap_or(0)
}

/// Process exit statuses shared by the supervisor and the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Run length reached (or operator stop) with at least one worker alive.
    Completed,
    /// Bad command line.
    Usage,
    /// A worker's compute loop hit an unrecoverable fault.
    ComputeFailure,
    /// Every worker died before the run length elapsed.
    FleetFailure,
    /// A worker could not bring up its device or workload.
    DeviceInitFailure,
}

impl ExitReason {
    pub const fn code(self) -> i32 {
        match self {
            ExitReason::Completed => 0,
            ExitReason::Usage => 1,
            ExitReason::ComputeFailure => 111,
            ExitReason::FleetFailure => 123,
            ExitReason::DeviceInitFailure => 124,
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Usage => "usage error",
            ExitReason::ComputeFailure => "failure during compute",
            ExitReason::FleetFailure => "no workers alive",
            ExitReason::DeviceInitFailure => "device initialization failed",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            ExitReason::Completed,
            ExitReason::Usage,
            ExitReason::ComputeFailure,
            ExitReason::FleetFailure,
            ExitReason::DeviceInitFailure,
        ]
        .into_iter()
        .find(|reason| reason.code() == code)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.describe(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_record() {
        assert!(TelemetryRecord::FATAL.is_fatal());
        assert!(!TelemetryRecord::new(0, 0).is_fatal());
        // Only both fields together form the sentinel.
        assert!(!TelemetryRecord { ops: SENTINEL, errors: 0 }.is_fatal());
    }

    #[test]
    fn test_record_saturates() {
        let record = TelemetryRecord::new(u64::MAX, 3);
        assert_eq!(record.ops, i32::MAX);
        assert_eq!(record.errors, 3);
    }

    #[test]
    fn test_wire_layout_is_ops_then_errors_le() {
        let bytes = TelemetryRecord { ops: 1, errors: 2 }.to_bytes();
        assert_eq!(bytes, [1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(TelemetryRecord::FATAL.to_bytes(), [0xff; RECORD_SIZE]);
    }

    #[test]
    fn test_negative_fields_read_as_zero() {
        let record = TelemetryRecord { ops: -7, errors: -2 };
        assert_eq!(record.ops_completed(), 0);
        assert_eq!(record.errors_detected(), 0);
    }

    #[test]
    fn test_device_count_announcement() {
        let mut buf = Vec::new();
        write_device_count(&mut buf, 3).unwrap();
        assert_eq!(buf.len(), ANNOUNCE_SIZE);
        assert_eq!(decode_device_count([buf[0], buf[1], buf[2], buf[3]]), 3);
        assert_eq!(decode_device_count((-1i32).to_le_bytes()), 0);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::FleetFailure.code(), 123);
        assert_eq!(ExitReason::DeviceInitFailure.code(), 124);
        assert_eq!(ExitReason::ComputeFailure.code(), 111);
        assert_eq!(ExitReason::from_code(111), Some(ExitReason::ComputeFailure));
        assert_eq!(ExitReason::from_code(42), None);
    }
}
