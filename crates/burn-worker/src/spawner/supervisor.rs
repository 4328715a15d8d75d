//! Supervisor event loop.
//!
//! One task owns everything: the aggregator, the process table and the
//! multiplexed set of channels. It sleeps in a single `select!` over all open
//! channels, a housekeeping tick and the operator stop, and performs no
//! computation of its own.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use tokio::process::ChildStdout;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use burn_protocol::{ExitReason, TelemetryCodec, TelemetryRecord};

use super::aggregator::{Aggregator, RunPhase, RunState, WorkerStats};
use super::process_manager::ProcessManager;
use super::reporter::ReportSink;
use super::spawner::SpawnedWorker;
use super::temperature::{BoundedLineCodec, SmiTemperatureAdapter, TemperatureSampler};

/// Everything that can wake the supervisor from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Telemetry {
        worker: usize,
        record: TelemetryRecord,
    },
    ChannelClosed {
        worker: usize,
    },
    TemperatureLine(String),
    TemperatureEnded,
}

/// How the run ended and what each worker looked like at the end.
#[derive(Debug)]
pub struct RunOutcome {
    pub reason: ExitReason,
    pub workers: Vec<WorkerStats>,
}

pub struct Supervisor<S: ReportSink> {
    aggregator: Aggregator,
    processes: Vec<ProcessManager>,
    sampler: Option<ProcessManager>,
    events: SelectAll<BoxStream<'static, FleetEvent>>,
    tick_interval: Duration,
    sink: S,
}

impl<S: ReportSink> Supervisor<S> {
    /// Take ownership of the fleet. Workers are registered at `run.start()`.
    pub fn new(
        workers: Vec<SpawnedWorker>,
        sampler: Option<TemperatureSampler>,
        run: RunState,
        tick_interval: Duration,
        sink: S,
    ) -> Self {
        let devices = workers.len();
        let mut events = SelectAll::new();
        let mut processes = Vec::with_capacity(devices);

        for worker in workers {
            events.push(telemetry_stream(worker.device_id, worker.channel));
            processes.push(worker.process);
        }

        let (temperatures, sampler) = match sampler {
            Some(sampler) => {
                events.push(temperature_stream(sampler.lines));
                (SmiTemperatureAdapter::new(devices), Some(sampler.process))
            }
            None => (SmiTemperatureAdapter::disabled(devices), None),
        };

        Self {
            aggregator: Aggregator::new(devices, run, temperatures),
            processes,
            sampler,
            events,
            tick_interval,
            sink,
        }
    }

    /// Drive the run to completion, then tear the fleet down.
    ///
    /// `stop` resolving counts as reaching the run length.
    pub async fn run(mut self, stop: impl Future<Output = ()>) -> Result<RunOutcome> {
        tokio::pin!(stop);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopped = false;

        let reason = loop {
            let event = tokio::select! {
                Some(event) = self.events.next() => Some(event),
                _ = ticker.tick() => None,
                _ = &mut stop, if !stopped => {
                    info!("Operator stop requested");
                    stopped = true;
                    None
                }
            };

            let now = Instant::now();
            if let Some(event) = event {
                self.apply(event, now);
            }

            let mut phase = self.aggregator.evaluate(now);
            if stopped && phase == RunPhase::Running {
                phase = RunPhase::Completing;
            }

            if let Err(e) = self.report(now, phase) {
                warn!(error = %e, "Failed to write report");
            }

            match phase {
                RunPhase::Running => {}
                RunPhase::Aborting => {
                    error!("No clients are alive!  Aborting");
                    break ExitReason::FleetFailure;
                }
                RunPhase::Completing => {
                    info!("Run complete");
                    break ExitReason::Completed;
                }
            }
        };

        self.terminate().await;

        Ok(RunOutcome {
            reason,
            workers: self.aggregator.into_workers(),
        })
    }

    fn apply(&mut self, event: FleetEvent, now: Instant) {
        match event {
            FleetEvent::Telemetry { worker, record } => {
                self.aggregator.record_telemetry(worker, record, now)
            }
            FleetEvent::ChannelClosed { worker } => self.aggregator.close_channel(worker),
            FleetEvent::TemperatureLine(line) => self.aggregator.ingest_temperature(&line),
            FleetEvent::TemperatureEnded => self.aggregator.end_temperature(),
        }
    }

    /// Render and latch. Leaving `Running` always counts as a boundary.
    fn report(&mut self, now: Instant, phase: RunPhase) -> std::io::Result<()> {
        let boundary = phase != RunPhase::Running || self.aggregator.boundary_due(now);

        let mut result = Ok(());
        if self.aggregator.any_reported() {
            result = self.render(now, boundary);
        }

        if boundary {
            self.aggregator.latch_snapshot(now);
        }
        result
    }

    fn render(&mut self, now: Instant, boundary: bool) -> std::io::Result<()> {
        let view = self.aggregator.view(now);
        if self.sink.interactive() || boundary {
            self.sink.live(&view)?;
        }
        if boundary {
            self.sink.checkpoint(&view, Local::now())?;
        }
        Ok(())
    }

    /// SIGTERM every child, close every channel, reap everything.
    async fn terminate(&mut self) {
        if let Err(e) = self.sink.shutdown_started() {
            warn!(error = %e, "Failed to write report");
        }

        for process in self.processes.iter_mut() {
            if let Err(e) = process.terminate() {
                warn!(process = process.label(), error = %e, "Failed to signal");
            }
        }
        if let Some(sampler) = self.sampler.as_mut() {
            if let Err(e) = sampler.terminate() {
                warn!(error = %e, "Failed to signal temperature sampler");
            }
        }

        self.events = SelectAll::new();

        for (id, process) in self.processes.iter_mut().enumerate() {
            match process.wait().await {
                Ok(status) => {
                    let reason = status.code().and_then(ExitReason::from_code);
                    match reason {
                        Some(reason) => debug!(worker = id, %reason, "Worker reaped"),
                        None => debug!(worker = id, %status, "Worker reaped"),
                    }
                }
                Err(e) => warn!(worker = id, error = %e, "Failed to reap worker"),
            }
        }
        if let Some(sampler) = self.sampler.as_mut() {
            if let Err(e) = sampler.wait().await {
                warn!(error = %e, "Failed to reap temperature sampler");
            }
        }

        if let Err(e) = self.sink.shutdown_finished() {
            warn!(error = %e, "Failed to write report");
        }
    }
}

/// Records from one worker, always ending with exactly one close event.
fn telemetry_stream(worker: usize, channel: ChildStdout) -> BoxStream<'static, FleetEvent> {
    FramedRead::new(channel, TelemetryCodec)
        .take_while(|item| futures::future::ready(item.is_ok()))
        .filter_map(move |item| {
            futures::future::ready(item.ok().map(|record| FleetEvent::Telemetry { worker, record }))
        })
        .chain(stream::once(async move { FleetEvent::ChannelClosed { worker } }))
        .boxed()
}

/// Producer lines, ending with one end-of-stream event.
fn temperature_stream(lines: FramedRead<ChildStdout, BoundedLineCodec>) -> BoxStream<'static, FleetEvent> {
    lines
        .take_while(|item| futures::future::ready(item.is_ok()))
        .filter_map(|item| futures::future::ready(item.ok().map(FleetEvent::TemperatureLine)))
        .chain(stream::once(async { FleetEvent::TemperatureEnded }))
        .boxed()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::spawner::reporter::{live_line, FleetView, Reporter};
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;
    use tokio::process::Command;

    #[derive(Default)]
    struct Recorded {
        lives: Vec<String>,
        checkpoints: usize,
        shutdown: bool,
    }

    /// Collects every call; clones share the log.
    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Recorded>>);

    impl ReportSink for RecordingSink {
        fn interactive(&self) -> bool {
            true
        }

        fn live(&mut self, view: &FleetView<'_>) -> io::Result<()> {
            self.0.borrow_mut().lives.push(live_line(view));
            Ok(())
        }

        fn checkpoint(
            &mut self,
            _view: &FleetView<'_>,
            _at: chrono::DateTime<Local>,
        ) -> io::Result<()> {
            self.0.borrow_mut().checkpoints += 1;
            Ok(())
        }

        fn shutdown_finished(&mut self) -> io::Result<()> {
            self.0.borrow_mut().shutdown = true;
            Ok(())
        }
    }

    fn script_worker(device_id: usize, script: &str) -> SpawnedWorker {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        let (process, channel) =
            ProcessManager::spawn(&format!("worker-{}", device_id), command).unwrap();
        SpawnedWorker {
            device_id,
            process,
            channel,
        }
    }

    /// One record (ops=1, errors=0) every 100 ms, forever.
    fn healthy(device_id: usize) -> SpawnedWorker {
        script_worker(
            device_id,
            r"while true; do printf '\001\000\000\000\000\000\000\000'; sleep 0.1; done",
        )
    }

    fn fatal(device_id: usize) -> SpawnedWorker {
        script_worker(device_id, r"printf '\377\377\377\377\377\377\377\377'; exit 111")
    }

    fn run_state(run_length: Option<u64>) -> RunState {
        RunState::new(
            Instant::now(),
            run_length.map(Duration::from_secs),
            Duration::from_secs(30),
        )
    }

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_sole_worker_failure_aborts() {
        let sink = RecordingSink::default();
        let supervisor = Supervisor::new(vec![fatal(0)], None, run_state(Some(30)), TICK, sink.clone());

        let outcome = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.reason, ExitReason::FleetFailure);
        assert!(!outcome.workers[0].alive);

        let recorded = sink.0.borrow();
        assert!(recorded.shutdown);
        assert!(recorded.lives.last().unwrap().contains("(DIED!)"));
    }

    #[tokio::test]
    async fn test_one_of_three_dies_run_completes() {
        let supervisor = Supervisor::new(
            vec![healthy(0), fatal(1), healthy(2)],
            None,
            run_state(Some(1)),
            TICK,
            Reporter::new(Vec::new(), false),
        );

        let outcome = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.reason, ExitReason::Completed);
        assert!(outcome.workers[0].alive);
        assert!(!outcome.workers[1].alive);
        assert!(outcome.workers[2].alive);
        assert!(outcome.workers[0].cumulative_ops > 0);
        assert!(outcome.workers.iter().all(|w| !w.latched_faulty));
    }

    #[tokio::test]
    async fn test_errors_latched_at_final_boundary() {
        let erring = script_worker(
            0,
            r"while true; do printf '\002\000\000\000\001\000\000\000'; sleep 0.1; done",
        );
        let sink = RecordingSink::default();
        let supervisor = Supervisor::new(vec![erring], None, run_state(Some(1)), TICK, sink.clone());

        let outcome = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.reason, ExitReason::Completed);
        assert!(outcome.workers[0].latched_faulty);
        assert_eq!(outcome.workers[0].errors_since_snapshot, 0);
        assert_eq!(sink.0.borrow().checkpoints, 1);
    }

    /// Writer whose bytes stay readable after the supervisor consumes it.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plain_output_only_at_boundaries() {
        // Two erring records up front, clean afterwards
        let worker = script_worker(
            0,
            r"printf '\001\000\000\000\001\000\000\000\001\000\000\000\001\000\000\000'; \
              while true; do printf '\001\000\000\000\000\000\000\000'; sleep 0.1; done",
        );
        let run = RunState::new(
            Instant::now(),
            Some(Duration::from_millis(1900)),
            Duration::from_millis(500),
        );
        let out = SharedBuf::default();
        let supervisor =
            Supervisor::new(vec![worker], None, run, TICK, Reporter::new(out.clone(), false));

        let outcome = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.reason, ExitReason::Completed);
        assert!(outcome.workers[0].latched_faulty);

        let text = String::from_utf8(out.0.borrow().clone()).unwrap();
        let lives: Vec<&str> = text.lines().filter(|l| l.contains("proc'd: ")).collect();
        assert!(lives.len() >= 3);
        assert!(lives.len() < 10);
        assert_eq!(text.matches("proc'd: ").count(), text.matches("  at:   ").count());

        assert!(lives[0].contains("errors: 2  (WARNING!)"));
        let last = lives[lives.len() - 1];
        assert!(last.contains("errors: 0 "));
        assert!(!last.contains("WARNING"));
    }

    #[tokio::test]
    async fn test_operator_stop_completes() {
        let supervisor = Supervisor::new(
            vec![healthy(0)],
            None,
            run_state(None),
            TICK,
            RecordingSink::default(),
        );

        let stop = tokio::time::sleep(Duration::from_millis(300));
        let outcome = supervisor.run(stop).await.unwrap();
        assert_eq!(outcome.reason, ExitReason::Completed);
        assert!(outcome.workers[0].alive);
    }

    #[tokio::test]
    async fn test_temperatures_reach_live_line() {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("printf 'GPU Current Temp : 48 C\\n'; exec sleep 30");
        let (process, stdout) = ProcessManager::spawn("temperature sampler", command).unwrap();
        let sampler = TemperatureSampler {
            process,
            lines: FramedRead::new(stdout, Default::default()),
        };

        let sink = RecordingSink::default();
        let supervisor =
            Supervisor::new(vec![healthy(0)], Some(sampler), run_state(Some(1)), TICK, sink.clone());
        let outcome = supervisor.run(std::future::pending()).await.unwrap();

        assert_eq!(outcome.reason, ExitReason::Completed);
        assert!(sink.0.borrow().lives.last().unwrap().contains("temps: 48 C"));
    }

    #[tokio::test]
    async fn test_live_output_waits_for_first_record() {
        let silent = script_worker(0, "exec sleep 30");
        let sink = RecordingSink::default();
        let mut supervisor = Supervisor::new(vec![silent], None, run_state(None), TICK, sink.clone());

        supervisor.report(Instant::now(), RunPhase::Running).unwrap();
        assert!(sink.0.borrow().lives.is_empty());

        supervisor.apply(
            FleetEvent::Telemetry {
                worker: 0,
                record: TelemetryRecord::new(3, 0),
            },
            Instant::now(),
        );
        supervisor.report(Instant::now(), RunPhase::Running).unwrap();
        assert_eq!(sink.0.borrow().lives.len(), 1);
        assert_eq!(sink.0.borrow().checkpoints, 0);

        supervisor.terminate().await;
        assert!(sink.0.borrow().shutdown);
    }
}
