use anyhow::{Context, Result};
use clap::Parser;
use pipeline::{
    registry::read_status, CommandFile, EngineStatus, JobSnapshot, JobStatus, PipelineConfig, StatusSnapshot,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::System;
use humansize::{format_size, DECIMAL};
use walkdir::WalkDir;

const DISK_SCAN_EVERY: Duration = Duration::from_secs(10);
const REFRESH_EVERY: Duration = Duration::from_secs(1);

struct App {
    snapshot: Option<StatusSnapshot>,
    load_error: Option<String>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    status_path: PathBuf,
    command_dir: PathBuf,
    storage_root: PathBuf,
    storage_bytes: u64,
    last_disk_scan: Option<Instant>,
    notice: Option<String>,
}

impl App {
    fn new(cfg: &PipelineConfig) -> Self {
        Self {
            snapshot: None,
            load_error: None,
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            status_path: cfg.status_path(),
            command_dir: cfg.command_dir(),
            storage_root: cfg.storage_root.clone(),
            storage_bytes: 0,
            last_disk_scan: None,
            notice: None,
        }
    }

    fn jobs(&self) -> &[JobSnapshot] {
        self.snapshot.as_ref().map(|s| s.jobs.as_slice()).unwrap_or(&[])
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        match read_status(&self.status_path) {
            Ok(mut snapshot) => {
                // newest first
                snapshot.jobs.reverse();
                self.snapshot = Some(snapshot);
                self.load_error = None;
            }
            Err(e) => {
                // keep the last good snapshot on screen
                self.load_error = Some(e.to_string());
            }
        }

        let len = self.jobs().len();
        match self.table_state.selected() {
            Some(i) if i >= len => self.table_state.select(len.checked_sub(1)),
            None if len > 0 => self.table_state.select(Some(0)),
            _ => {}
        }

        if self.last_disk_scan.map(|t| t.elapsed() >= DISK_SCAN_EVERY).unwrap_or(true) {
            self.storage_bytes = WalkDir::new(&self.storage_root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();
            self.last_disk_scan = Some(Instant::now());
        }
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.snapshot.as_ref().map(|s| s.count(status)).unwrap_or(0)
    }

    fn select_offset(&mut self, delta: isize) {
        let len = self.jobs().len();
        if len == 0 {
            return;
        }
        let current = self.table_state.selected().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, len as isize - 1);
        self.table_state.select(Some(next as usize));
    }

    /// Ask the daemon to retry the selected job if it failed
    fn request_retry(&mut self) {
        let selected = self
            .table_state
            .selected()
            .and_then(|i| self.jobs().get(i))
            .map(|job| (job.file_id.clone(), job.status));

        self.notice = Some(match selected {
            Some((file_id, JobStatus::Failed)) => match CommandFile::retry(&file_id).write_to(&self.command_dir) {
                Ok(()) => format!("Retry requested for {}", file_id),
                Err(e) => format!("Could not request retry: {}", e),
            },
            Some((file_id, status)) => format!("{} is {:?}; only failed jobs can be retried", file_id, status),
            None => "No job selected".to_string(),
        });
    }
}

/// Media pipeline status monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = PipelineConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(&cfg);
    let mut last_refresh: Option<Instant> = None;

    loop {
        if last_refresh.map(|t| t.elapsed() >= REFRESH_EVERY).unwrap_or(true) {
            app.refresh();
            last_refresh = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                use crossterm::event::KeyCode;
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                    KeyCode::Down | KeyCode::Char('j') => app.select_offset(1),
                    KeyCode::Up | KeyCode::Char('k') => app.select_offset(-1),
                    KeyCode::Char('r') => app.request_retry(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(terminal.backend_mut(), crossterm::terminal::LeaveAlternateScreen)?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(3), Constraint::Length(3)])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(50),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let (engine_text, engine_color) = match app.snapshot.as_ref().map(|s| &s.engine) {
        Some(EngineStatus::Available { version }) => (format!("{}", version), Color::Green),
        Some(EngineStatus::Unavailable { reason, .. }) => {
            (format!("UNAVAILABLE: {}", truncate_string(reason, 40)), Color::Red)
        }
        Some(EngineStatus::Unknown) | None => ("unknown".to_string(), Color::Yellow),
    };
    let engine = Paragraph::new(format!(
        "{} | storage {}",
        engine_text,
        format_size(app.storage_bytes, DECIMAL)
    ))
    .block(Block::default().borders(Borders::ALL).title("Engine"))
    .style(Style::default().fg(engine_color));
    f.render_widget(engine, chunks[2]);
}

/// Text progress bar for table cells
fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((clamp_percent(percent) / 100.0) * width as f64).round() as usize;
    format!(
        "{}{} {:>5.1}%",
        "█".repeat(filled),
        "░".repeat(width.saturating_sub(filled)),
        percent
    )
}

fn status_label(status: JobStatus) -> (&'static str, Color) {
    match status {
        JobStatus::Queued => ("QUEUE", Color::Gray),
        JobStatus::Preparing => ("PREP", Color::Cyan),
        JobStatus::ExtractingMetadata => ("META", Color::Cyan),
        JobStatus::ConvertingMaster => ("MSTR", Color::Blue),
        JobStatus::GeneratingRenditions => ("REND", Color::Blue),
        JobStatus::GeneratingThumbnails => ("THMB", Color::Blue),
        JobStatus::ExtractingSubtitles => ("SUBS", Color::Blue),
        JobStatus::Finalizing => ("FINAL", Color::Magenta),
        JobStatus::Completed => ("OK", Color::Green),
        JobStatus::Failed => ("FAIL", Color::Red),
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "FILE", "STEP", "PROGRESS", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs().is_empty() {
        let hint = match &app.load_error {
            Some(e) => format!("No status yet: {}", truncate_string(e, 60)),
            None => "No jobs".to_string(),
        };
        vec![Row::new(vec![
            "-".to_string(),
            hint,
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.jobs()
            .iter()
            .map(|job| {
                let (label, color) = status_label(job.status);
                Row::new(vec![
                    label.to_string(),
                    truncate_string(&job.original_name, 40),
                    truncate_string(&job.step, 40),
                    progress_bar(job.progress, 12),
                    truncate_string(job.error.as_deref().unwrap_or("-"), 40),
                ])
                .style(Style::default().fg(color))
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(6),
        Constraint::Percentage(25),
        Constraint::Percentage(30),
        Constraint::Length(20),
        Constraint::Percentage(25),
    ];

    let title = format!("Jobs ({})", app.jobs().len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let total = app.jobs().len();
    let active = app.snapshot.as_ref().map(|s| s.active()).unwrap_or(0);
    let completed = app.count_by_status(JobStatus::Completed);
    let failed = app.count_by_status(JobStatus::Failed);
    let updated = app
        .snapshot
        .as_ref()
        .map(|s| s.updated_at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut status_text = format!(
        "Total: {} | Active: {} | Completed: {} | Failed: {} | Updated: {} | q=quit r=retry ↑↓=select",
        total, active, completed, failed, updated
    );
    if let Some(notice) = &app.notice {
        status_text = format!("{} | {}", notice, status_text);
    }

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
