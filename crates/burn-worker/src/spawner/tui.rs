//! TUI (Terminal User Interface) Module
//!
//! Full-screen alternative to the status line: fleet counts, a per-worker
//! table, run progress and recent checkpoints.

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};

use super::aggregator::WorkerStats;
use super::reporter::{checkpoint_line, FleetView, ReportSink};

const REDRAW_INTERVAL: Duration = Duration::from_millis(200);
const LOG_CAPACITY: usize = 10;

/// Dashboard state that outlives a single frame
#[derive(Debug, Default)]
pub struct DashboardState {
    pub log_lines: Vec<String>,
}

impl DashboardState {
    /// Add a log line
    pub fn add_log_line(&mut self, line: String) {
        self.log_lines.push(line);
        if self.log_lines.len() > LOG_CAPACITY {
            self.log_lines.remove(0);
        }
    }
}

/// Terminal dashboard; a terminal taken over by [`Dashboard::enter`] is
/// restored on drop.
pub struct Dashboard<B: Backend = CrosstermBackend<Stdout>> {
    terminal: Terminal<B>,
    state: DashboardState,
    last_draw: Option<Instant>,
    owns_terminal: bool,
}

impl Dashboard {
    /// Switch the terminal to raw mode on the alternate screen
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let terminal = undo_on_error(open_alternate_screen(), || {
            disable_raw_mode()?;
            execute!(io::stdout(), LeaveAlternateScreen)
        })?;

        let mut dashboard = Self::new(terminal);
        dashboard.owns_terminal = true;
        Ok(dashboard)
    }
}

impl<B: Backend> Dashboard<B> {
    /// Draw on an already prepared terminal.
    pub fn new(terminal: Terminal<B>) -> Self {
        Self {
            terminal,
            state: DashboardState::default(),
            last_draw: None,
            owns_terminal: false,
        }
    }

    fn restore(&mut self) -> io::Result<()> {
        if !self.owns_terminal {
            return Ok(());
        }
        self.owns_terminal = false;
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()
    }

    fn redraw(&mut self, view: &FleetView<'_>) -> io::Result<()> {
        let state = &self.state;
        self.terminal.draw(|f| draw_ui(f, view, state))?;
        self.last_draw = Some(Instant::now());
        Ok(())
    }
}

impl<B: Backend> Drop for Dashboard<B> {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

impl<B: Backend> ReportSink for Dashboard<B> {
    fn interactive(&self) -> bool {
        true
    }

    fn live(&mut self, view: &FleetView<'_>) -> io::Result<()> {
        if self
            .last_draw
            .is_some_and(|at| at.elapsed() < REDRAW_INTERVAL)
        {
            return Ok(());
        }
        self.redraw(view)
    }

    /// Always redraws, so the frame at a boundary is never throttled away.
    fn checkpoint(&mut self, view: &FleetView<'_>, at: DateTime<Local>) -> io::Result<()> {
        self.state.add_log_line(format!("checkpoint{}", checkpoint_line(at)));
        self.redraw(view)
    }

    fn shutdown_started(&mut self) -> io::Result<()> {
        self.state.add_log_line("Killing processes..".to_string());
        Ok(())
    }
}

fn open_alternate_screen() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

/// Run `undo` when `result` failed; the original error is kept.
fn undo_on_error<T>(
    result: io::Result<T>,
    undo: impl FnOnce() -> io::Result<()>,
) -> io::Result<T> {
    if result.is_err() {
        let _ = undo();
    }
    result
}

/// Resolves on `q`, `Esc` or Ctrl+C; never resolves if input ends.
pub async fn wait_for_quit_key() {
    let mut events = EventStream::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Key(key)) if is_quit_key(&key) => return,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    std::future::pending::<()>().await
}

fn is_quit_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Status word and color of one worker.
fn worker_status(worker: &WorkerStats) -> (&'static str, Color) {
    if !worker.alive {
        ("DIED", Color::Red)
    } else if worker.has_pending_errors() {
        ("WARNING", Color::Yellow)
    } else if worker.latched_faulty {
        ("FAULTY", Color::Magenta)
    } else {
        ("Running", Color::Green)
    }
}

/// Draw the UI
fn draw_ui(f: &mut Frame, view: &FleetView<'_>, state: &DashboardState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Min(6),     // Workers table
            Constraint::Length(3),  // Progress
            Constraint::Length(8),  // Checkpoints
            Constraint::Length(2),  // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], view);
    draw_workers_table(f, chunks[1], view);
    draw_progress(f, chunks[2], view);
    draw_logs(f, chunks[3], state);
    draw_footer(f, chunks[4]);
}

/// Draw the header with summary statistics
fn draw_header(f: &mut Frame, area: Rect, view: &FleetView<'_>) {
    let total = view.workers.len();
    let alive = view.alive_count();

    let header_text = vec![
        Line::from(vec![
            Span::styled(
                "╔ gpu-burn Fleet Monitor ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::raw("╗"),
        ]),
        Line::from(vec![
            Span::raw("  Workers: "),
            Span::styled(
                total.to_string(),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::raw(" Total  │  "),
            Span::styled(
                alive.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw(" Alive  │  "),
            Span::styled(
                (total - alive).to_string(),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ),
            Span::raw(" Died  │  "),
            Span::styled(
                view.faulty_count().to_string(),
                Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
            ),
            Span::raw(" Faulty"),
        ]),
    ];

    let header = Paragraph::new(header_text).alignment(Alignment::Left);
    f.render_widget(header, area);
}

fn worker_row(worker: &WorkerStats, temperature: Option<i32>) -> String {
    let (status, _) = worker_status(worker);
    let temp = temperature.map_or_else(|| "--".to_string(), |t| format!("{} C", t));
    format!(
        "│ {:>3} │ {:>12} │ {:>9.0} │ {:>6} │ {:>5} │ {:<7} │",
        worker.id,
        worker.cumulative_ops,
        worker.gflops(),
        worker.errors_since_snapshot,
        temp,
        status
    )
}

/// Draw the workers table
fn draw_workers_table(f: &mut Frame, area: Rect, view: &FleetView<'_>) {
    let header = "│ GPU │ Proc'd       │ Gflop/s   │ Errors │ Temp  │ Status  │";
    let separator = "├─────┼──────────────┼───────────┼────────┼───────┼─────────┤";

    let mut lines = vec![
        Line::from(Span::styled(
            header,
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::raw(separator)),
    ];

    for worker in view.workers {
        let (_, color) = worker_status(worker);
        lines.push(Line::from(Span::styled(
            worker_row(worker, view.temperatures.sample(worker.id)),
            Style::default().fg(color),
        )));
    }

    let table = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Workers"))
        .alignment(Alignment::Left);

    f.render_widget(table, area);
}

fn progress_label(view: &FleetView<'_>) -> (f64, String) {
    let elapsed = format_duration(view.elapsed);
    match (view.percent(), view.run_length) {
        (Some(pct), Some(len)) => (
            (pct / 100.0).clamp(0.0, 1.0),
            format!("{:.1}%  ({} of {})", pct, elapsed, format_duration(len)),
        ),
        _ => (0.0, format!("{} (until every worker stops)", elapsed)),
    }
}

/// Draw the run progress gauge
fn draw_progress(f: &mut Frame, area: Rect, view: &FleetView<'_>) {
    let (ratio, label) = progress_label(view);
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio)
        .label(label);
    f.render_widget(gauge, area);
}

/// Draw recent checkpoints
fn draw_logs(f: &mut Frame, area: Rect, state: &DashboardState) {
    let log_lines: Vec<Line> = state
        .log_lines
        .iter()
        .rev()
        .take(6)
        .map(|line| Line::from(Span::raw(line.clone())))
        .collect();

    let logs = Paragraph::new(log_lines)
        .block(Block::default().borders(Borders::ALL).title("Checkpoints"))
        .alignment(Alignment::Left);

    f.render_widget(logs, area);
}

/// Draw the footer with instructions
fn draw_footer(f: &mut Frame, area: Rect) {
    let footer_text = vec![Line::from(vec![
        Span::styled("  q", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" stop  │  "),
        Span::styled("Esc", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" stop  │  "),
        Span::styled("Ctrl+C", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" stop"),
    ])];

    let footer = Paragraph::new(footer_text)
        .alignment(Alignment::Left)
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(footer, area);
}

/// Format duration as human-readable string
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let mins = secs / 60;
    let hours = mins / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {:02}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, mins % 60)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
