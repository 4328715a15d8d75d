//! Status line, checkpoints and the final verdict.
//!
//! Formatting is pure over a [`FleetView`]; [`Reporter`] only decides where
//! the text goes and whether a carriage return rewinds the line.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Local};

use super::aggregator::WorkerStats;
use super::temperature::TemperatureSource;

/// Read-only snapshot handed to renderers.
pub struct FleetView<'a> {
    pub elapsed: Duration,
    pub run_length: Option<Duration>,
    pub workers: &'a [WorkerStats],
    pub temperatures: &'a dyn TemperatureSource,
}

impl FleetView<'_> {
    /// Percent of the run length covered, `None` for indefinite runs.
    pub fn percent(&self) -> Option<f64> {
        self.run_length
            .map(|len| 100.0 * self.elapsed.as_secs() as f64 / len.as_secs_f64())
    }

    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    pub fn faulty_count(&self) -> usize {
        self.workers.iter().filter(|w| w.latched_faulty).count()
    }
}

/// Where live output goes: a scrolling line or the dashboard.
pub trait ReportSink {
    /// Whether every wake should be rendered.
    fn interactive(&self) -> bool;

    fn live(&mut self, view: &FleetView<'_>) -> io::Result<()>;

    /// Called at every boundary, right after `live`.
    fn checkpoint(&mut self, view: &FleetView<'_>, at: DateTime<Local>) -> io::Result<()>;

    fn shutdown_started(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown_finished(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Status line without the leading carriage return.
pub fn live_line(view: &FleetView<'_>) -> String {
    let mut line = match view.percent() {
        None => format!("{}s ", view.elapsed.as_secs()),
        Some(pct) => format!("{:.1}%  ", pct),
    };
    let last = view.workers.len().saturating_sub(1);

    line.push_str("proc'd: ");
    for (i, w) in view.workers.iter().enumerate() {
        let _ = write!(line, "{} ({:.0} Gflop/s) ", w.cumulative_ops, w.gflops());
        if i != last {
            line.push_str("- ");
        }
    }

    line.push_str("  errors: ");
    for (i, w) in view.workers.iter().enumerate() {
        let _ = write!(line, "{} ", w.errors_since_snapshot);
        if !w.alive {
            line.push_str(" (DIED!)");
        } else if w.has_pending_errors() {
            line.push_str(" (WARNING!)");
        }
        if i != last {
            line.push_str("- ");
        }
    }

    line.push_str("  temps: ");
    for (i, w) in view.workers.iter().enumerate() {
        match view.temperatures.sample(w.id) {
            Some(temp) => {
                let _ = write!(line, "{} C ", temp);
            }
            None => line.push_str("-- "),
        }
        if i != last {
            line.push_str("- ");
        }
    }

    line
}

pub fn checkpoint_line(at: DateTime<Local>) -> String {
    format!("  at:   {}", at.format("%a %b %e %H:%M:%S %Y"))
}

pub fn final_summary(workers: &[WorkerStats]) -> String {
    let mut out = format!("\nTested {} GPUs:\n", workers.len());
    for w in workers {
        let verdict = if w.latched_faulty { "FAULTY" } else { "OK" };
        let note = if w.alive { "" } else { " (died during run)" };
        let _ = writeln!(out, "\tGPU {}: {}{}", w.id, verdict, note);
    }
    out
}

/// Plain-text sink over any writer.
pub struct Reporter<W: Write> {
    out: W,
    interactive: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, interactive: bool) -> Self {
        Self { out, interactive }
    }

    pub fn summary(&mut self, workers: &[WorkerStats]) -> io::Result<()> {
        self.out.write_all(final_summary(workers).as_bytes())?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for Reporter<W> {
    fn interactive(&self) -> bool {
        self.interactive
    }

    fn live(&mut self, view: &FleetView<'_>) -> io::Result<()> {
        if self.interactive {
            self.out.write_all(b"\r")?;
        }
        self.out.write_all(live_line(view).as_bytes())?;
        self.out.flush()
    }

    fn checkpoint(&mut self, _view: &FleetView<'_>, at: DateTime<Local>) -> io::Result<()> {
        writeln!(self.out, "{}", checkpoint_line(at))?;
        self.out.flush()
    }

    fn shutdown_started(&mut self) -> io::Result<()> {
        self.out.write_all(b"\nKilling processes.. ")?;
        self.out.flush()
    }

    fn shutdown_finished(&mut self) -> io::Result<()> {
        writeln!(self.out, "done")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::temperature::SmiTemperatureAdapter;
    use chrono::TimeZone;
    use std::time::Instant;

    fn workers(n: usize) -> Vec<WorkerStats> {
        let now = Instant::now();
        (0..n).map(|id| WorkerStats::new(id, now)).collect()
    }

    fn view<'a>(
        workers: &'a [WorkerStats],
        temps: &'a SmiTemperatureAdapter,
        elapsed: u64,
        run_length: Option<u64>,
    ) -> FleetView<'a> {
        FleetView {
            elapsed: Duration::from_secs(elapsed),
            run_length: run_length.map(Duration::from_secs),
            workers,
            temperatures: temps,
        }
    }

    #[test]
    fn test_live_line_percent() {
        let mut ws = workers(2);
        ws[0].cumulative_ops = 120;
        ws[0].throughput = 2_500e9;
        ws[1].cumulative_ops = 64;
        ws[1].errors_since_snapshot = 3;

        let mut temps = SmiTemperatureAdapter::new(2);
        temps.ingest_line("GPU Current Temp : 61 C");

        let line = live_line(&view(&ws, &temps, 5, Some(10)));
        assert_eq!(
            line,
            "50.0%  proc'd: 120 (2500 Gflop/s) - 64 (0 Gflop/s)   \
             errors: 0 - 3  (WARNING!)  temps: 61 C - -- "
        );
    }

    #[test]
    fn test_live_line_indefinite_and_died() {
        let mut ws = workers(1);
        ws[0].alive = false;
        ws[0].errors_since_snapshot = 2;
        let temps = SmiTemperatureAdapter::new(1);

        let line = live_line(&view(&ws, &temps, 42, None));
        assert_eq!(line, "42s proc'd: 0 (0 Gflop/s)   errors: 2  (DIED!)  temps: -- ");
    }

    #[test]
    fn test_checkpoint_line() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 9, 7, 1).unwrap();
        assert_eq!(checkpoint_line(at), "  at:   Tue Mar  5 09:07:01 2024");
    }

    #[test]
    fn test_final_summary() {
        let mut ws = workers(3);
        ws[1].latched_faulty = true;
        ws[2].alive = false;

        assert_eq!(
            final_summary(&ws),
            "\nTested 3 GPUs:\n\tGPU 0: OK\n\tGPU 1: FAULTY\n\tGPU 2: OK (died during run)\n"
        );
    }

    #[test]
    fn test_interactive_rewinds_line() {
        let ws = workers(1);
        let temps = SmiTemperatureAdapter::new(1);

        let mut tty = Reporter::new(Vec::new(), true);
        tty.live(&view(&ws, &temps, 1, Some(10))).unwrap();
        tty.live(&view(&ws, &temps, 2, Some(10))).unwrap();
        let out = String::from_utf8(tty.into_inner()).unwrap();
        assert_eq!(out.matches('\r').count(), 2);
        assert!(out.starts_with("\r10.0%"));

        let mut plain = Reporter::new(Vec::new(), false);
        plain.live(&view(&ws, &temps, 1, Some(10))).unwrap();
        plain.shutdown_started().unwrap();
        plain.shutdown_finished().unwrap();
        let out = String::from_utf8(plain.into_inner()).unwrap();
        assert!(!out.contains('\r'));
        assert!(out.ends_with("\nKilling processes.. done\n"));
    }
}
