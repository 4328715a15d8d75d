use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};

/// Where worker diagnostics end up.
///
/// Without a log directory workers inherit the supervisor's stderr. With one,
/// each worker appends to its own `<worker-id>.log`, which keeps the live
/// status line and the dashboard clean.
#[derive(Debug, Clone)]
pub struct WorkerLogs {
    log_dir: Option<PathBuf>,
}

impl WorkerLogs {
    pub fn new(log_dir: Option<&Path>) -> Result<Self> {
        let log_dir = if let Some(dir) = log_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            Some(dir.to_path_buf())
        } else {
            None
        };

        Ok(Self { log_dir })
    }

    pub fn log_path(&self, worker_id: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", worker_id)))
    }

    /// Log file for the supervisor itself.
    pub fn supervisor_log_path(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join("gpu-burn.log"))
    }

    /// stderr handle for a worker about to be spawned on `device_id`.
    pub fn stderr_for(&self, worker_id: &str, device_id: usize) -> Result<Stdio> {
        let Some(path) = self.log_path(worker_id) else {
            return Ok(Stdio::inherit());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open worker log {}", path.display()))?;
        write_banner(&mut file, device_id)?;

        Ok(Stdio::from(file))
    }
}

fn write_banner(file: &mut File, device_id: usize) -> Result<()> {
    writeln!(
        file,
        "[{}] [INFO] [device:{}] worker starting",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        device_id
    )?;
    file.flush()?;
    Ok(())
}
