//! Worker Spawner Module
//!
//! Launches the fleet: worker 0 first, which announces how many devices
//! exist, then one worker for each remaining device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tracing::{info, warn};

use burn_protocol::{decode_device_count, ANNOUNCE_SIZE};

use super::config::{SpawnerConfig, WorkerPlan};
use super::logger::WorkerLogs;
use super::process_manager::ProcessManager;

/// Name of the worker executable looked up next to the supervisor.
pub const WORKER_BIN: &str = "burn-worker";

/// A running worker and the read end of its telemetry channel
#[derive(Debug)]
pub struct SpawnedWorker {
    pub device_id: usize,
    pub process: ProcessManager,
    pub channel: ChildStdout,
}

/// Worker Spawner - launches one worker process per device
pub struct WorkerSpawner {
    config: SpawnerConfig,
    logs: WorkerLogs,
    exe_path: PathBuf,
}

impl WorkerSpawner {
    /// Create a new WorkerSpawner
    pub fn new(config: SpawnerConfig) -> Result<Self> {
        let exe_path = resolve_worker_exe(&config)?;
        let logs = WorkerLogs::new(config.log_dir.as_deref())?;

        Ok(Self {
            config,
            logs,
            exe_path,
        })
    }

    pub fn exe_path(&self) -> &std::path::Path {
        &self.exe_path
    }

    /// Start all workers
    ///
    /// Fails when worker 0 cannot be started, announces no devices, closes its
    /// channel early, or stays silent past the startup timeout.
    pub async fn spawn_all(&self) -> Result<Vec<SpawnedWorker>> {
        let mut first = self.spawn_worker(&self.config.plan(0))?;

        let mut announcement = [0u8; ANNOUNCE_SIZE];
        let read = tokio::time::timeout(
            self.config.worker_startup_timeout,
            first.channel.read_exact(&mut announcement),
        )
        .await;

        let devices = match read {
            Ok(Ok(_)) => decode_device_count(announcement),
            Ok(Err(e)) => {
                self.reap(&mut first).await;
                return Err(e).context("Worker 0 closed its channel before announcing devices");
            }
            Err(_) => {
                self.reap(&mut first).await;
                anyhow::bail!(
                    "Worker 0 did not announce devices within {:?}",
                    self.config.worker_startup_timeout
                );
            }
        };

        if devices == 0 {
            self.reap(&mut first).await;
            anyhow::bail!("No devices found");
        }

        info!(devices, "Device count announced");

        let mut workers = Vec::with_capacity(devices);
        workers.push(first);
        for device_id in 1..devices {
            workers.push(self.spawn_worker(&self.config.plan(device_id))?);
        }

        info!(workers = workers.len(), "All workers started");
        Ok(workers)
    }

    /// Start a single worker process
    pub fn spawn_worker(&self, plan: &WorkerPlan) -> Result<SpawnedWorker> {
        info!(
            worker = %plan.worker_id,
            device = plan.device_id,
            exe = %self.exe_path.display(),
            "Starting worker"
        );

        let mut command = Command::new(&self.exe_path);
        command
            .args(plan.build_command_args())
            .envs(plan.build_env())
            .stderr(self.logs.stderr_for(&plan.worker_id, plan.device_id)?);

        let (process, channel) = ProcessManager::spawn(&plan.worker_id, command)?;

        Ok(SpawnedWorker {
            device_id: plan.device_id,
            process,
            channel,
        })
    }

    async fn reap(&self, worker: &mut SpawnedWorker) {
        if let Err(e) = worker.process.terminate() {
            warn!(error = %e, "Failed to stop worker 0");
        }
        if let Err(e) = worker.process.wait().await {
            warn!(error = %e, "Failed to reap worker 0");
        }
    }
}

/// Explicit path, or `burn-worker` in the directory of the running binary.
pub fn resolve_worker_exe(config: &SpawnerConfig) -> Result<PathBuf> {
    if let Some(exe) = &config.worker_exe {
        return Ok(exe.clone());
    }

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let exe_dir = current_exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Failed to get executable directory"))?;
    Ok(exe_dir.join(WORKER_BIN))
}
