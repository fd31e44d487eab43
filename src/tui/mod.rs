mod help;
mod state;

use crate::cli::{Cli, RunStatus};
use crate::model::{RunConfig, RunEvent};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Sparkline, Tabs, Wrap},
    Terminal,
};
use state::UiState;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli, cfg: RunConfig) -> Result<RunStatus> {
    // Unbounded channels avoid backpressure on the engine side.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let title = format!("chunkscan: {}", cfg.source.display());
    let ui_handle = std::thread::spawn(move || run_threaded(title, event_rx, cmd_tx));

    let res = orchestrator::run_controller(cfg.clone(), event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    // The terminal is restored by now; print the summary like headless mode does.
    let report = res?;
    let processed = orchestrator::process_run_completion(&cfg, args.export_csv.as_deref(), &report);
    for line in &processed.summary.lines {
        println!("{line}");
    }
    for msg in &processed.export_messages {
        eprintln!("{msg}");
    }
    Ok(RunStatus::from_report(&report))
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    title: String,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::default();
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &title, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        if !state.is_done() {
                            let _ = cmd_tx.send(UiCommand::Quit);
                        }
                        break Ok(());
                    }
                    (_, KeyCode::Char('p')) => {
                        if !state.is_done() && !state.cancelling {
                            // The engine acknowledges with an Info event that flips `paused`.
                            let _ = cmd_tx.send(UiCommand::Pause(!state.paused));
                        }
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 1 {
                            state.failures_scroll = state.failures_scroll.saturating_sub(1);
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 1
                            && state.failures_scroll + 1 < state.failures.len()
                        {
                            state.failures_scroll += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, title: &str, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from(format!("Failures ({})", state.failures.len())),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title(title.to_string()))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_failures(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // Progress gauge
                Constraint::Length(9), // Counts + rate cards
                Constraint::Length(6), // Completion sparkline
                Constraint::Min(0),    // In flight + recent events
                Constraint::Length(3), // Status row
            ]
            .as_ref(),
        )
        .split(area);

    let snap = &state.snapshot;
    let ratio = if snap.total == 0 {
        0.0
    } else {
        (snap.terminal() as f64 / snap.total as f64).clamp(0.0, 1.0)
    };
    let gauge_color = if snap.failed > 0 {
        Color::Yellow
    } else {
        Color::Green
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(gauge_color))
        .ratio(ratio)
        .label(format!(
            "{}/{} partitions ({:.1}%)",
            snap.terminal(),
            snap.total,
            ratio * 100.0
        ));
    f.render_widget(gauge, main[0]);

    let cards = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(main[1]);

    let count = |label: &'static str, n: usize, color: Color| {
        Line::from(vec![
            Span::raw(format!("{label:<12}")),
            Span::styled(n.to_string(), Style::default().fg(color)),
        ])
    };
    let mut counts = vec![
        count("Completed", snap.completed, Color::Green),
        count("Failed", snap.failed, Color::Red),
        count("Processing", snap.processing, Color::Yellow),
        count("Pending", snap.pending, Color::Gray),
    ];
    if snap.unknown > 0 {
        counts.push(count("Unknown", snap.unknown, Color::Magenta));
    }
    counts.push(Line::from(format!(
        "Items       {}/{}",
        snap.items_completed, snap.items_total
    )));
    f.render_widget(
        Paragraph::new(counts).block(Block::default().borders(Borders::ALL).title("Partitions")),
        cards[0],
    );

    let eta = snap
        .eta_minutes
        .map(|m| humantime::format_duration(Duration::from_secs((m * 60.0).round() as u64)).to_string())
        .unwrap_or_else(|| "-".into());
    let elapsed = humantime::format_duration(Duration::from_secs(snap.elapsed_seconds as u64));
    let mut rate = vec![
        Line::from(vec![
            Span::raw("Throughput  "),
            Span::styled(
                format!("{:.2}", snap.throughput_per_minute),
                Style::default().fg(Color::Cyan),
            ),
            Span::raw(" partitions/min"),
        ]),
        Line::from(format!("ETA         {eta}")),
        Line::from(format!("Elapsed     {elapsed}")),
    ];
    if let Some((mean, median, p25, p75)) = crate::metrics::compute_metrics(&state.rate_samples) {
        rate.push(Line::from(format!(
            "Rate        avg {mean:.2} med {median:.2} p25 {p25:.2} p75 {p75:.2}"
        )));
    }
    f.render_widget(
        Paragraph::new(rate).block(Block::default().borders(Borders::ALL).title("Rate")),
        cards[1],
    );

    let width = main[2].width.saturating_sub(2) as usize;
    let series = &state.completion_series[state.completion_series.len().saturating_sub(width)..];
    let spark = Sparkline::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Partitions finished per refresh"),
        )
        .style(Style::default().fg(Color::Green))
        .data(series);
    f.render_widget(spark, main[2]);

    let lists = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)].as_ref())
        .split(main[3]);

    let running: Vec<ListItem> = state
        .running
        .iter()
        .map(|id| ListItem::new(format!("chunk_{id}")))
        .collect();
    f.render_widget(
        List::new(running).block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("In flight ({})", state.running.len())),
        ),
        lists[0],
    );

    let visible = lists[1].height.saturating_sub(2) as usize;
    let recent: Vec<ListItem> = state
        .recent
        .iter()
        .rev()
        .take(visible)
        .map(|line| {
            let color = if line.starts_with('✗') {
                Color::Red
            } else if line.starts_with('✓') {
                Color::Green
            } else {
                Color::Reset
            };
            ListItem::new(line.as_str()).style(Style::default().fg(color))
        })
        .collect();
    f.render_widget(
        List::new(recent).block(Block::default().borders(Borders::ALL).title("Recent")),
        lists[1],
    );

    let mut status = Vec::new();
    if state.paused {
        status.push(Span::styled(
            "PAUSED ",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ));
    }
    if snap.is_settled() && !state.is_done() {
        status.push(Span::raw("Writing report… "));
    }
    status.push(Span::raw(state.info.as_str()));
    f.render_widget(
        Paragraph::new(Line::from(status))
            .block(Block::default().borders(Borders::ALL).title("Status")),
        main[4],
    );
}

fn draw_failures(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut lines: Vec<Line> = if state.summary_lines.is_empty() {
        Vec::new()
    } else {
        let mut l: Vec<Line> = state
            .summary_lines
            .iter()
            .map(|s| Line::from(s.as_str()))
            .collect();
        l.push(Line::from(""));
        l
    };
    if state.failures.is_empty() {
        lines.push(Line::from("No failed partitions."));
    }
    for (id, detail) in state.failures.iter().skip(state.failures_scroll) {
        lines.push(Line::from(vec![
            Span::styled(format!("{id:>6} "), Style::default().fg(Color::Red)),
            Span::raw(detail.as_str()),
        ]));
    }
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Failures"));
    f.render_widget(p, area);
}
