//! Spawner Configuration Module
//!
//! Command line of `gpu-burn`, the supervisor configuration derived from it,
//! and the per-worker launch plan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::workload::{Backend, MockSettings, Precision, WorkloadSettings};

/// Run length used when none is given on the command line.
pub const DEFAULT_RUN_LENGTH: u32 = 10;

/// Supervisor configuration
///
/// Contains all settings needed to launch, monitor and tear down the fleet.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Wall-clock test duration; `None` runs until every worker has died
    pub run_length: Option<Duration>,

    /// Precision and memory share handed to every worker
    pub settings: WorkloadSettings,

    /// Workload backend the workers drive
    pub backend: Backend,

    /// Device slots the backend exposes
    pub devices: usize,

    /// Fault injection for the mock backend
    pub mock: MockSettings,

    /// Explicit worker executable; defaults to `burn-worker` next to this binary
    pub worker_exe: Option<PathBuf>,

    /// Shell command replacing the default temperature sampler
    pub temperature_command: Option<String>,

    /// Time between snapshot boundaries
    pub report_interval: Duration,

    /// Upper bound on the time between two wake-ups of the event loop
    pub tick_interval: Duration,

    /// How long worker 0 may take to announce the device count
    pub worker_startup_timeout: Duration,

    /// Log level for the supervisor and its workers
    pub log_level: String,

    /// Log directory for worker logs
    pub log_dir: Option<PathBuf>,

    /// Enable TUI monitoring dashboard
    pub enable_tui: bool,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            run_length: Some(Duration::from_secs(u64::from(DEFAULT_RUN_LENGTH))),
            settings: WorkloadSettings::default(),
            backend: Backend::Host,
            devices: 1,
            mock: MockSettings::default(),
            worker_exe: None,
            temperature_command: None,
            report_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            worker_startup_timeout: Duration::from_secs(30),
            log_level: "warn".to_string(),
            log_dir: None,
            enable_tui: false,
        }
    }
}

impl SpawnerConfig {
    /// Create a new SpawnerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set run length in seconds (0 = run until every worker has died)
    pub fn with_run_length(mut self, secs: u32) -> Self {
        self.run_length = (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
        self
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

    pub fn with_worker_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    pub fn with_temperature_command(mut self, command: impl Into<String>) -> Self {
        self.temperature_command = Some(command.into());
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set log directory
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Enable/disable TUI monitoring
    pub fn with_tui(mut self, enable_tui: bool) -> Self {
        self.enable_tui = enable_tui;
        self
    }

    /// Check invariants clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=90).contains(&self.settings.memory_pct) {
            return Err(format!(
                "Memory percentage must be within 1..=90, got {}",
                self.settings.memory_pct
            ));
        }
        if self.devices == 0 {
            return Err("At least one device slot is required".to_string());
        }
        if self.report_interval.is_zero() || self.tick_interval.is_zero() {
            return Err("Report and tick intervals must be non-zero".to_string());
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()) {
            return Err(format!("Unknown log level: {}", self.log_level));
        }
        if let Some(command) = &self.temperature_command {
            if command.trim().is_empty() {
                return Err("Temperature command must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Launch plan for the worker bound to `device_id`.
    pub fn plan(&self, device_id: usize) -> WorkerPlan {
        WorkerPlan {
            worker_id: format!("worker-{}", device_id),
            device_id,
            announce_devices: device_id == 0,
            settings: self.settings,
            backend: self.backend,
            devices: self.devices,
            mock: self.mock.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

/// Worker startup plan
///
/// Contains all information needed to start a single worker process.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    /// Unique worker identifier
    pub worker_id: String,

    /// Device to bind to
    pub device_id: usize,

    /// Whether this worker announces the device count
    pub announce_devices: bool,

    pub settings: WorkloadSettings,

    pub backend: Backend,

    pub devices: usize,

    pub mock: MockSettings,

    pub log_level: String,
}

impl WorkerPlan {

    /// Build command line arguments for the worker binary
    pub fn build_command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--device".to_string(),
            self.device_id.to_string(),
            "--memory".to_string(),
            self.settings.memory_pct.to_string(),
            "--backend".to_string(),
            self.backend.as_str().to_string(),
            "--devices".to_string(),
            self.devices.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];

        if self.announce_devices {
            args.push("--announce-devices".to_string());
        }
        if self.settings.precision.is_double() {
            args.push("--doubles".to_string());
        }

        if self.backend == Backend::Mock {
            if !self.mock.fail_devices.is_empty() {
                args.push("--mock-fail-device".to_string());
                args.push(join_ids(&self.mock.fail_devices));
            }
            if !self.mock.error_devices.is_empty() {
                args.push("--mock-error-device".to_string());
                args.push(join_ids(&self.mock.error_devices));
            }
            args.push("--mock-fail-after".to_string());
            args.push(self.mock.fail_after.to_string());
            args.push("--mock-batch-ms".to_string());
            args.push(self.mock.batch_interval.as_millis().to_string());
        }

        args
    }

    /// Build environment variables for the worker process
    pub fn build_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("BURN_WORKER_ID".to_string(), self.worker_id.clone());
        env.insert("BURN_DEVICE_ID".to_string(), self.device_id.to_string());
        env.insert("RUST_LOG".to_string(), self.log_level.clone());

        env
    }
}

fn join_ids(ids: &[usize]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Command-line arguments for gpu-burn
#[derive(Parser, Debug)]
#[command(name = "gpu-burn")]
#[command(version = "0.1.0")]
#[command(about = "Multi-device compute stress test")]
pub struct BurnArgs {
    /// Use doubles instead of floats
    #[arg(short = 'd', long = "doubles")]
    pub doubles: bool,

    /// Use PCT percent of the available memory per device
    #[arg(
        short = 'm',
        long = "memory",
        value_name = "PCT",
        default_value_t = 50,
        value_parser = clap::value_parser!(u8).range(1..=90)
    )]
    pub memory: u8,

    /// Seconds to burn; 0 runs until every worker has died
    #[arg(value_name = "SECONDS", value_parser = clap::value_parser!(u32).range(0..=2_147_483_647))]
    pub run_length: Option<u32>,

    /// Show the live dashboard instead of the status line
    #[arg(long)]
    pub tui: bool,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Directory for per-worker logs (defaults to ./logs with --tui)
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Workload backend
    #[arg(long, value_enum, default_value_t = Backend::Host)]
    pub backend: Backend,

    /// Device slots the backend exposes
    #[arg(long, default_value_t = 1)]
    pub devices: usize,

    /// Worker executable (defaults to burn-worker next to this binary)
    #[arg(long, value_name = "PATH")]
    pub worker_bin: Option<PathBuf>,

    /// Shell command producing temperature reports
    #[arg(long, value_name = "CMD")]
    pub temp_command: Option<String>,

    #[arg(long, value_delimiter = ',', hide = true)]
    pub mock_fail_device: Vec<usize>,

    #[arg(long, default_value_t = 0, hide = true)]
    pub mock_fail_after: u64,

    #[arg(long, value_delimiter = ',', hide = true)]
    pub mock_error_device: Vec<usize>,

    #[arg(long, default_value_t = 100, hide = true)]
    pub mock_batch_ms: u64,
}

impl BurnArgs {
    /// Whether the run length fell back to the default.
    pub fn run_length_defaulted(&self) -> bool {
        self.run_length.is_none()
    }
}

impl TryFrom<BurnArgs> for SpawnerConfig {
    type Error = String;

    fn try_from(args: BurnArgs) -> Result<Self, Self::Error> {
        let log_dir = args
            .log_dir
            .or_else(|| args.tui.then(|| PathBuf::from("./logs")));

        let config = Self {
            settings: WorkloadSettings {
                precision: Precision::from_doubles(args.doubles),
                memory_pct: args.memory,
            },
            backend: args.backend,
            devices: args.devices,
            mock: MockSettings {
                fail_devices: args.mock_fail_device,
                fail_after: args.mock_fail_after,
                error_devices: args.mock_error_device,
                batch_interval: Duration::from_millis(args.mock_batch_ms),
            },
            worker_exe: args.worker_bin,
            temperature_command: args.temp_command,
            log_level: args.log_level,
            log_dir,
            enable_tui: args.tui,
            ..Self::default()
        }
        .with_run_length(args.run_length.unwrap_or(DEFAULT_RUN_LENGTH));

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerArgs, WorkerConfig};

    fn parse(args: &[&str]) -> Result<BurnArgs, clap::Error> {
        BurnArgs::try_parse_from(std::iter::once("gpu-burn").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert!(args.run_length_defaulted());
        let config = SpawnerConfig::try_from(args).unwrap();
        assert_eq!(config.run_length, Some(Duration::from_secs(10)));
        assert_eq!(config.settings.memory_pct, 50);
        assert_eq!(config.settings.precision, Precision::Single);
        assert_eq!(config.report_interval, Duration::from_secs(30));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_flags_and_run_length() {
        let args = parse(&["-d", "-m", "90", "3600"]).unwrap();
        let config = SpawnerConfig::try_from(args).unwrap();
        assert_eq!(config.run_length, Some(Duration::from_secs(3600)));
        assert!(config.settings.precision.is_double());
        assert_eq!(config.settings.memory_pct, 90);
    }

    #[test]
    fn test_zero_run_length_is_indefinite() {
        let config = SpawnerConfig::try_from(parse(&["0"]).unwrap()).unwrap();
        assert_eq!(config.run_length, None);
    }

    #[test]
    fn test_usage_errors() {
        assert!(parse(&["-m", "0"]).is_err());
        assert!(parse(&["-m", "91"]).is_err());
        assert!(parse(&["-m"]).is_err());
        assert!(parse(&["-x"]).is_err());
        assert!(parse(&["ten"]).is_err());
        assert!(parse(&["-5"]).is_err());
        assert!(parse(&["2147483648"]).is_err());
        assert!(parse(&["2147483647"]).is_ok());
    }

    #[test]
    fn test_tui_defaults_log_dir() {
        let config = SpawnerConfig::try_from(parse(&["--tui"]).unwrap()).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("./logs")));
    }

    #[test]
    fn test_validate() {
        assert!(SpawnerConfig::new().validate().is_ok());
        assert!(SpawnerConfig::new().with_log_level("loud").validate().is_err());
        assert!(SpawnerConfig::new()
            .with_backend(Backend::Mock, 0)
            .validate()
            .is_err());
        assert!(SpawnerConfig::new()
            .with_report_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(SpawnerConfig::new()
            .with_temperature_command("  ")
            .validate()
            .is_err());
    }

    #[test]
    fn test_worker_plan_args_parse_back() {
        let config = SpawnerConfig::new()
            .with_settings(WorkloadSettings {
                precision: Precision::Double,
                memory_pct: 30,
            })
            .with_backend(Backend::Mock, 3)
            .with_mock(MockSettings {
                fail_devices: vec![1, 2],
                fail_after: 4,
                error_devices: vec![0],
                batch_interval: Duration::from_millis(25),
            });

        for device in 0..3 {
            let plan = config.plan(device);
            let argv = std::iter::once("burn-worker".to_string()).chain(plan.build_command_args());
            let parsed = WorkerConfig::from(&WorkerArgs::try_parse_from(argv).unwrap());

            assert_eq!(parsed.device_id, device);
            assert_eq!(parsed.announce_devices, device == 0);
            assert_eq!(parsed.settings, config.settings);
            assert_eq!(parsed.backend, Backend::Mock);
            assert_eq!(parsed.devices, 3);
            assert_eq!(parsed.mock, config.mock);
        }
    }

    #[test]
    fn test_worker_plan_build_env() {
        let plan = SpawnerConfig::new().with_log_level("debug").plan(2);
        let env = plan.build_env();
        assert_eq!(env.get("BURN_WORKER_ID"), Some(&"worker-2".to_string()));
        assert_eq!(env.get("BURN_DEVICE_ID"), Some(&"2".to_string()));
        assert_eq!(env.get("RUST_LOG"), Some(&"debug".to_string()));
        assert_eq!(env.len(), 3);
    }
}
