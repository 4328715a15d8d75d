//! Compute Worker Binary Entry Point
//!
//! One process per device. Telemetry records go to standard output, which
//! the supervisor reads; diagnostics go to standard error.
//!
//! # Usage
//!
//! ```bash
//! # Normally launched by gpu-burn; by hand for device 0 on the host backend:
//! burn-worker --device 0 --announce-devices --memory 10 | xxd
//!
//! # Mock backend, device 1 of 3 failing after 5 batches
//! burn-worker --device 1 --backend mock --devices 3 \
//!     --mock-fail-device 1 --mock-fail-after 5
//! ```

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::process;

use clap::Parser;
use tracing::error;

use burn_protocol::ExitReason;
use burn_worker::base::init_logging;
use burn_worker::worker::{ComputeWorker, WorkerArgs, WorkerConfig};

fn main() {
    let args = match WorkerArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() {
                ExitReason::Usage.code()
            } else {
                0
            };
            process::exit(code);
        }
    };

    if let Err(e) = init_logging(&args.log_level, None) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    let config = WorkerConfig::from(&args);

    // Unbuffered handle on fd 1: records must reach the pipe whole and at once
    let channel = match io::stdout().as_fd().try_clone_to_owned() {
        Ok(fd) => File::from(fd),
        Err(e) => {
            error!(error = %e, "Couldn't open the telemetry channel");
            process::exit(ExitReason::DeviceInitFailure.code());
        }
    };

    let backend = config.backend.open_backend(config.devices, &config.mock);
    let reason = ComputeWorker::new(config, backend, channel).run();

    process::exit(reason.code());
}
