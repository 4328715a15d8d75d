use thiserror::Error;

use burn_protocol::ExitReason;

/// Device and workload failures.
///
/// The message of each variant is fixed at compile time; there is no
/// runtime table of error descriptions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("No compute devices found")]
    NoDevices,

    #[error("Invalid device {device}: only {count} device(s) present")]
    InvalidDevice { device: usize, count: usize },

    #[error("Launch failed on device {device}: {reason}")]
    LaunchFailed { device: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Process status of a worker that stops on this error.
    pub const fn exit_reason(&self) -> ExitReason {
        match self {
            Error::LaunchFailed { .. } => ExitReason::ComputeFailure,
            Error::AllocationFailed(_)
            | Error::NoDevices
            | Error::InvalidDevice { .. }
            | Error::Io(_)
            | Error::InvalidArgument(_) => ExitReason::DeviceInitFailure,
        }
    }

    pub const fn exit_code(&self) -> i32 {
        self.exit_reason().code()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
