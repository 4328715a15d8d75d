//! gpu-burn - Fleet Supervisor Entry Point
//!
//! Discovers the devices through worker 0, launches one worker per device and
//! reports throughput, errors and temperatures until the run length elapses.
//!
//! # Usage
//!
//! ```bash
//! # Burn every GPU for an hour with doubles and 80% of memory
//! gpu-burn -d -m 80 3600
//!
//! # Dashboard instead of the status line, logs under ./logs
//! gpu-burn --tui 600
//!
//! # Exercise the supervisor without a GPU
//! gpu-burn --backend mock --devices 4 --temp-command true 20
//! ```

use std::future::Future;
use std::io::{self, IsTerminal};
use std::process;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info, warn};

use burn_protocol::ExitReason;
use burn_worker::base::init_logging;
use burn_worker::spawner::{
    wait_for_quit_key, BurnArgs, Dashboard, ReportSink, Reporter, RunOutcome, RunState,
    SpawnedWorker, SpawnerConfig, Supervisor, TemperatureSampler, WorkerLogs, WorkerSpawner,
    DEFAULT_RUN_LENGTH,
};

fn main() {
    let args = match BurnArgs::try_parse() {
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

    if args.run_length_defaulted() {
        println!(
            "Run length not specified in the command line.  Burning for {} secs",
            DEFAULT_RUN_LENGTH
        );
    }

    let config: SpawnerConfig = match args.try_into() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(ExitReason::Usage.code());
        }
    };

    let logs = match WorkerLogs::new(config.log_dir.as_deref()) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(ExitReason::Usage.code());
        }
    };
    // The dashboard owns the terminal, so the supervisor logs to a file
    let log_file = config
        .enable_tui
        .then(|| logs.supervisor_log_path())
        .flatten();
    if let Err(e) = init_logging(&config.log_level, log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start the runtime: {}", e);
            process::exit(ExitReason::Usage.code());
        }
    };

    process::exit(runtime.block_on(run(config)));
}

async fn run(config: SpawnerConfig) -> i32 {
    let spawner = match WorkerSpawner::new(config.clone()) {
        Ok(spawner) => spawner,
        Err(e) => {
            eprintln!("Couldn't launch workers: {:#}", e);
            return ExitReason::DeviceInitFailure.code();
        }
    };

    let workers = match spawner.spawn_all().await {
        Ok(workers) => workers,
        Err(e) => {
            eprintln!("Couldn't init a GPU test: {:#}", e);
            return ExitReason::DeviceInitFailure.code();
        }
    };
    info!(
        workers = workers.len(),
        exe = %spawner.exe_path().display(),
        "Fleet launched"
    );

    let sampler = match TemperatureSampler::launch(config.temperature_command.as_deref()) {
        Ok(sampler) => Some(sampler),
        Err(e) => {
            warn!(error = %e, "Temperature sampling unavailable");
            None
        }
    };

    let run = RunState::new(Instant::now(), config.run_length, config.report_interval);

    let outcome = if config.enable_tui {
        match Dashboard::enter() {
            Ok(dashboard) => {
                let stop = async {
                    tokio::select! {
                        _ = operator_interrupt() => {}
                        _ = wait_for_quit_key() => {}
                    }
                };
                supervise(workers, sampler, run, &config, dashboard, stop).await
            }
            Err(e) => {
                warn!(error = %e, "Couldn't open the dashboard, using the status line");
                let reporter = Reporter::new(io::stdout(), io::stdout().is_terminal());
                supervise(workers, sampler, run, &config, reporter, operator_interrupt()).await
            }
        }
    } else {
        let reporter = Reporter::new(io::stdout(), io::stdout().is_terminal());
        supervise(workers, sampler, run, &config, reporter, operator_interrupt()).await
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Supervisor failed");
            eprintln!("Supervisor failed: {:#}", e);
            return ExitReason::Usage.code();
        }
    };

    if let Err(e) = Reporter::new(io::stdout(), false).summary(&outcome.workers) {
        warn!(error = %e, "Couldn't print the summary");
    }
    info!(reason = %outcome.reason, "Run finished");
    outcome.reason.code()
}

async fn supervise<S: ReportSink>(
    workers: Vec<SpawnedWorker>,
    sampler: Option<TemperatureSampler>,
    run: RunState,
    config: &SpawnerConfig,
    sink: S,
    stop: impl Future<Output = ()>,
) -> anyhow::Result<RunOutcome> {
    Supervisor::new(workers, sampler, run, config.tick_interval, sink)
        .run(stop)
        .await
}

/// Ctrl+C; never resolves when the handler can't be installed.
async fn operator_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Couldn't install the Ctrl+C handler");
        std::future::pending::<()>().await
    }
}
