//! Fleet supervisor
//!
//! Launches one worker process per device, merges their telemetry with the
//! temperature stream, renders progress and decides the final verdict.

pub mod aggregator;
pub mod config;
pub mod logger;
pub mod process_manager;
pub mod reporter;
pub mod spawner;
pub mod supervisor;
pub mod temperature;
pub mod tui;

pub use aggregator::{Aggregator, RunPhase, RunState, WorkerStats};
pub use config::{BurnArgs, SpawnerConfig, WorkerPlan, DEFAULT_RUN_LENGTH};
pub use logger::WorkerLogs;
pub use process_manager::ProcessManager;
pub use reporter::{FleetView, ReportSink, Reporter};
pub use spawner::{SpawnedWorker, WorkerSpawner};
pub use supervisor::{FleetEvent, RunOutcome, Supervisor};
pub use temperature::{SmiTemperatureAdapter, TemperatureSampler, TemperatureSource};
pub use tui::{wait_for_quit_key, Dashboard};
