//! Fleet statistics and the run state machine.
//!
//! Pure bookkeeping: every method takes the current instant, nothing here
//! reads a clock or touches a process, which keeps the transitions testable.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use burn_protocol::{TelemetryRecord, OPS_PER_MUL};

use super::reporter::FleetView;
use super::temperature::SmiTemperatureAdapter;

/// Aggregated statistics of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub id: usize,
    /// Products completed since launch
    pub cumulative_ops: u64,
    /// Mismatches reported since the last snapshot boundary
    pub errors_since_snapshot: u64,
    /// Set at a boundary that saw pending errors; never cleared
    pub latched_faulty: bool,
    /// Cleared once, on the fatal sentinel or channel close
    pub alive: bool,
    pub last_sample: Instant,
    /// Latest throughput estimate in flop/s
    pub throughput: f64,
}

impl WorkerStats {
    pub fn new(id: usize, registered: Instant) -> Self {
        Self {
            id,
            cumulative_ops: 0,
            errors_since_snapshot: 0,
            latched_faulty: false,
            alive: true,
            last_sample: registered,
            throughput: 0.0,
        }
    }

    pub fn gflops(&self) -> f64 {
        self.throughput / 1e9
    }

    pub fn has_pending_errors(&self) -> bool {
        self.errors_since_snapshot > 0
    }
}

/// Run timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    start: Instant,
    run_length: Option<Duration>,
    report_interval: Duration,
    next_report: Duration,
}

impl RunState {
    /// `run_length` of `None` runs until every worker has died.
    pub fn new(start: Instant, run_length: Option<Duration>, report_interval: Duration) -> Self {
        Self {
            start,
            run_length: run_length.filter(|len| !len.is_zero()),
            report_interval,
            next_report: report_interval,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn run_length(&self) -> Option<Duration> {
        self.run_length
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    pub fn deadline_reached(&self, now: Instant) -> bool {
        self.run_length.is_some_and(|len| self.elapsed(now) >= len)
    }

    pub fn boundary_due(&self, now: Instant) -> bool {
        self.elapsed(now) > self.next_report
    }

    fn mark_boundary(&mut self, now: Instant) {
        self.next_report = self.elapsed(now) + self.report_interval;
    }
}

/// Where the run is heading after a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    /// No worker is alive
    Aborting,
    /// Run length reached (or operator stop) with workers alive
    Completing,
}

/// Owns every worker's statistics, the temperature table and the run timing.
#[derive(Debug, Clone)]
pub struct Aggregator {
    workers: Vec<WorkerStats>,
    temperatures: SmiTemperatureAdapter,
    run: RunState,
    any_reported: bool,
}

impl Aggregator {
    /// Register `devices` workers at the start of `run`.
    pub fn new(devices: usize, run: RunState, temperatures: SmiTemperatureAdapter) -> Self {
        Self {
            workers: (0..devices).map(|id| WorkerStats::new(id, run.start)).collect(),
            temperatures,
            run,
            any_reported: false,
        }
    }

    pub fn workers(&self) -> &[WorkerStats] {
        &self.workers
    }

    pub fn into_workers(self) -> Vec<WorkerStats> {
        self.workers
    }

    pub fn temperatures(&self) -> &SmiTemperatureAdapter {
        &self.temperatures
    }

    pub fn run(&self) -> &RunState {
        &self.run
    }

    /// Whether any worker has sent a record yet.
    pub fn any_reported(&self) -> bool {
        self.any_reported
    }

    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    pub fn record_telemetry(&mut self, worker: usize, record: TelemetryRecord, now: Instant) {
        self.any_reported = true;

        if record.is_fatal() {
            self.mark_dead(worker, "fatal sentinel");
            return;
        }

        let Some(stats) = self.workers.get_mut(worker) else {
            warn!(worker, "Record from unknown worker");
            return;
        };
        if !stats.alive {
            return;
        }

        let ops = record.ops_completed();
        stats.cumulative_ops = stats.cumulative_ops.saturating_add(ops);
        stats.errors_since_snapshot = stats
            .errors_since_snapshot
            .saturating_add(record.errors_detected());

        let dt = now.saturating_duration_since(stats.last_sample).as_secs_f64();
        if dt > 0.0 {
            stats.throughput = ops as f64 * OPS_PER_MUL as f64 / dt;
        }
        stats.last_sample = now;
    }

    /// The worker's channel failed or reached end of stream.
    pub fn close_channel(&mut self, worker: usize) {
        self.mark_dead(worker, "channel closed");
    }

    pub fn ingest_temperature(&mut self, line: &str) {
        self.temperatures.ingest_line(line);
    }

    pub fn end_temperature(&mut self) {
        self.temperatures.finish();
    }

    /// Aborting wins over Completing.
    pub fn evaluate(&self, now: Instant) -> RunPhase {
        if self.alive_count() == 0 {
            RunPhase::Aborting
        } else if self.run.deadline_reached(now) {
            RunPhase::Completing
        } else {
            RunPhase::Running
        }
    }

    pub fn boundary_due(&self, now: Instant) -> bool {
        self.run.boundary_due(now)
    }

    /// Latch pending errors into the fault flag and start a new interval.
    pub fn latch_snapshot(&mut self, now: Instant) {
        for stats in self.workers.iter_mut() {
            if stats.errors_since_snapshot > 0 {
                if !stats.latched_faulty {
                    warn!(worker = stats.id, errors = stats.errors_since_snapshot, "Worker latched faulty");
                }
                stats.latched_faulty = true;
            }
            stats.errors_since_snapshot = 0;
        }
        self.run.mark_boundary(now);
    }

    pub fn view(&self, now: Instant) -> FleetView<'_> {
        FleetView {
            elapsed: self.run.elapsed(now),
            run_length: self.run.run_length,
            workers: &self.workers,
            temperatures: &self.temperatures,
        }
    }

    fn mark_dead(&mut self, worker: usize, cause: &str) {
        match self.workers.get_mut(worker) {
            Some(stats) if stats.alive => {
                stats.alive = false;
                warn!(worker, cause, "Worker died");
            }
            Some(_) => debug!(worker, cause, "Worker already dead"),
            None => warn!(worker, "Unknown worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn aggregator(devices: usize, run_length: Option<u64>) -> (Aggregator, Instant) {
        let start = Instant::now();
        let run = RunState::new(start, run_length.map(Duration::from_secs), INTERVAL);
        (
            Aggregator::new(devices, run, SmiTemperatureAdapter::new(devices)),
            start,
        )
    }

    #[test]
    fn test_throughput_estimate() {
        let (mut agg, start) = aggregator(1, Some(60));

        agg.record_telemetry(0, TelemetryRecord::new(10, 0), start + secs(2.0));
        let expected = 10.0 * OPS_PER_MUL as f64 / 2.0;
        assert!((agg.workers()[0].throughput - expected).abs() / expected < 1e-9);

        agg.record_telemetry(0, TelemetryRecord::new(4, 0), start + secs(2.5));
        let expected = 4.0 * OPS_PER_MUL as f64 / 0.5;
        assert!((agg.workers()[0].throughput - expected).abs() / expected < 1e-9);
        assert_eq!(agg.workers()[0].cumulative_ops, 14);
        assert!(agg.any_reported());
    }

    #[test]
    fn test_zero_interval_keeps_estimate() {
        let (mut agg, start) = aggregator(1, None);
        let t = start + secs(1.0);
        agg.record_telemetry(0, TelemetryRecord::new(1, 0), t);
        let before = agg.workers()[0].throughput;
        agg.record_telemetry(0, TelemetryRecord::new(1, 0), t);
        assert_eq!(agg.workers()[0].throughput, before);
        assert_eq!(agg.workers()[0].cumulative_ops, 2);
    }

    #[test]
    fn test_snapshot_latching() {
        let (mut agg, start) = aggregator(2, Some(120));
        agg.record_telemetry(0, TelemetryRecord::new(1, 5), start + secs(1.0));
        assert!(agg.workers()[0].has_pending_errors());
        assert!(!agg.boundary_due(start + secs(30.0)));
        assert!(agg.boundary_due(start + secs(30.5)));

        agg.latch_snapshot(start + secs(30.5));
        assert!(agg.workers()[0].latched_faulty);
        assert_eq!(agg.workers()[0].errors_since_snapshot, 0);
        assert!(!agg.workers()[1].latched_faulty);
        assert!(!agg.boundary_due(start + secs(60.5)));
        assert!(agg.boundary_due(start + secs(61.0)));

        // Latch survives clean intervals
        agg.latch_snapshot(start + secs(61.0));
        assert!(agg.workers()[0].latched_faulty);
    }

    #[test]
    fn test_errors_between_boundaries_only_count_at_boundary() {
        let (mut agg, start) = aggregator(1, None);
        agg.record_telemetry(0, TelemetryRecord::new(1, 0), start + secs(1.0));
        agg.latch_snapshot(start + secs(31.0));
        assert!(!agg.workers()[0].latched_faulty);
    }

    #[test]
    fn test_sole_worker_death_aborts() {
        let (mut agg, start) = aggregator(1, Some(60));
        agg.record_telemetry(0, TelemetryRecord::FATAL, start + secs(1.0));
        assert!(!agg.workers()[0].alive);
        assert_eq!(agg.evaluate(start + secs(1.0)), RunPhase::Aborting);
        // Aborting takes precedence over an elapsed deadline
        assert_eq!(agg.evaluate(start + secs(61.0)), RunPhase::Aborting);
    }

    #[test]
    fn test_one_of_three_dies() {
        let (mut agg, start) = aggregator(3, Some(10));
        agg.record_telemetry(1, TelemetryRecord::FATAL, start + secs(1.0));
        agg.close_channel(1);
        agg.record_telemetry(1, TelemetryRecord::new(7, 0), start + secs(2.0));

        assert_eq!(agg.alive_count(), 2);
        assert_eq!(agg.workers()[1].cumulative_ops, 0);
        assert_eq!(agg.evaluate(start + secs(5.0)), RunPhase::Running);
        assert_eq!(agg.evaluate(start + secs(10.0)), RunPhase::Completing);
    }

    #[test]
    fn test_indefinite_run_never_completes() {
        let (agg, start) = aggregator(1, Some(0));
        assert_eq!(agg.run().run_length(), None);
        assert_eq!(agg.evaluate(start + secs(1e6)), RunPhase::Running);
    }

    #[test]
    fn test_close_channel_is_idempotent() {
        let (mut agg, _) = aggregator(2, None);
        agg.close_channel(0);
        agg.close_channel(0);
        agg.close_channel(9);
        assert_eq!(agg.alive_count(), 1);
    }

    #[test]
    fn test_temperatures_flow_into_view() {
        let (mut agg, start) = aggregator(2, None);
        agg.ingest_temperature("GPU Current Temp : 70 C");
        agg.end_temperature();
        agg.ingest_temperature("GPU Current Temp : 71 C");

        let view = agg.view(start + secs(3.0));
        assert_eq!(view.temperatures.sample(0), Some(70));
        assert_eq!(view.temperatures.sample(1), None);
        assert_eq!(view.elapsed, secs(3.0));
    }
}
