pub mod base;
pub mod workload;
pub mod worker;

// Supervisor side: spawning, telemetry aggregation and reporting
pub mod spawner;
