//! Terminal dashboard for the controller

use crate::metrics::{ControllerStatus, LogLevel, Metrics};
use crate::network::{self, ControlCommand, ControllerConfig};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
}

/// Run the dashboard
pub async fn run(
    config: ControllerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (command_tx, command_rx) = mpsc::unbounded_channel::<ControlCommand>();

    // Start network in background
    let metrics_for_network = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = network::run(config, Arc::clone(&metrics_for_network), command_rx).await {
            let mut m = metrics_for_network.write();
            m.status = ControllerStatus::Error;
            m.log(LogLevel::Error, format!("Network error: {}", e));
        }
    });

    let mut state = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
    };

    let tick_rate = Duration::from_millis(100);
    let mut should_quit = false;

    while !should_quit {
        terminal.draw(|f| draw(f, &metrics, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = metrics.read().logs.len();

                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => should_quit = true,
                        KeyCode::Char('c') if key.modifiers.contains(event::KeyModifiers::CONTROL) => {
                            should_quit = true
                        }
                        // Device commands
                        KeyCode::Char(c @ ('p' | 's' | 'x' | 'i' | 'r' | 'c')) => {
                            if let Some(command) = ControlCommand::parse(&c.to_string()) {
                                let _ = command_tx.send(command);
                            }
                            if state.auto_scroll {
                                state.log_scroll = 0;
                            }
                        }
                        // Scroll up (older logs)
                        KeyCode::Up | KeyCode::Char('k') => {
                            if log_count > 0 {
                                state.log_scroll = (state.log_scroll + 1).min(log_count.saturating_sub(1));
                                state.auto_scroll = false;
                            }
                        }
                        // Scroll down (newer logs)
                        KeyCode::Down | KeyCode::Char('j') => {
                            if state.log_scroll > 0 {
                                state.log_scroll -= 1;
                            }
                            if state.log_scroll == 0 {
                                state.auto_scroll = true;
                            }
                        }
                        KeyCode::PageUp => {
                            if log_count > 0 {
                                state.log_scroll = (state.log_scroll + 10).min(log_count.saturating_sub(1));
                                state.auto_scroll = false;
                            }
                        }
                        KeyCode::PageDown => {
                            state.log_scroll = state.log_scroll.saturating_sub(10);
                            if state.log_scroll == 0 {
                                state.auto_scroll = true;
                            }
                        }
                        KeyCode::End => {
                            state.log_scroll = 0;
                            state.auto_scroll = true;
                        }
                        KeyCode::Char('a') => {
                            state.auto_scroll = !state.auto_scroll;
                            if state.auto_scroll {
                                state.log_scroll = 0;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Length(7),  // Stats
            Constraint::Min(8),     // Logs
            Constraint::Length(1),  // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);
    draw_logs(f, chunks[2], &m, state);
    draw_footer(f, chunks[3], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let status_style = match m.status {
        ControllerStatus::Discovering | ControllerStatus::Connecting => Style::default().fg(Color::Yellow),
        ControllerStatus::Connected => Style::default().fg(Color::Green),
        ControllerStatus::Disconnected => Style::default().fg(Color::DarkGray),
        ControllerStatus::Error => Style::default().fg(Color::Red),
    };

    let title = vec![Line::from(vec![
        Span::styled("Capture Controller", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  "),
        Span::styled(m.controller_id.clone(), Style::default().fg(Color::Cyan)),
        Span::raw("  │  Status: "),
        Span::styled(m.status.as_str(), status_style),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header = Paragraph::new(title)
        .block(Block::default().borders(Borders::ALL).title(" Dashboard "));

    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(33),
            Constraint::Percentage(33),
        ])
        .split(area);

    // Device
    let state_text = m
        .device_state
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let device_info = vec![
        Line::from(vec![
            Span::raw("Peer: "),
            Span::styled(
                m.peer.clone().unwrap_or_else(|| "not connected".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("State: "),
            Span::styled(state_text, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        ]),
        Line::from(vec![
            Span::raw("Session: "),
            Span::styled(
                m.session_id.clone().unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::raw("Found: "),
            Span::styled(m.devices.len().to_string(), Style::default().fg(Color::Magenta)),
        ]),
    ];
    let device_block = Paragraph::new(device_info)
        .block(Block::default().borders(Borders::ALL).title(" Device "));
    f.render_widget(device_block, chunks[0]);

    // Sync
    let (sync_text, sync_color) = if m.device_synchronized {
        ("yes", Color::Green)
    } else {
        ("no", Color::Red)
    };
    let sync_info = vec![
        Line::from(vec![
            Span::raw("Synchronized: "),
            Span::styled(sync_text, Style::default().fg(sync_color)),
        ]),
        Line::from(vec![
            Span::raw("Offset: "),
            Span::styled(
                m.device_offset_ms.map(|o| format!("{} ms", o)).unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Quality: "),
            Span::styled(
                m.device_sync_quality.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Last start error: "),
            Span::styled(
                m.last_timing_error_ms.map(|e| format!("{} ms", e)).unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Magenta),
            ),
        ]),
    ];
    let sync_block = Paragraph::new(sync_info)
        .block(Block::default().borders(Borders::ALL).title(" Sync "));
    f.render_widget(sync_block, chunks[1]);

    // Traffic
    let data_total: u64 = m.data_packets.values().sum();
    let traffic_info = vec![
        Line::from(vec![
            Span::raw("Pings answered: "),
            Span::styled(m.sync_pings_answered.to_string(), Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::raw("Heartbeats: "),
            Span::styled(m.heartbeats.to_string(), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::raw("Commands / errors: "),
            Span::styled(
                format!("{} / {}", m.commands_sent, m.errors_received),
                Style::default().fg(Color::Yellow),
            ),
        ]),
        Line::from(vec![
            Span::raw("Data packets: "),
            Span::styled(data_total.to_string(), Style::default().fg(Color::Cyan)),
        ]),
    ];
    let traffic_block = Paragraph::new(traffic_info)
        .block(Block::default().borders(Borders::ALL).title(" Traffic "));
    f.render_widget(traffic_block, chunks[2]);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Connection => Style::default().fg(Color::Green),
                LogLevel::Command => Style::default().fg(Color::Cyan),
                LogLevel::Sync => Style::default().fg(Color::Magenta),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items)
        .block(Block::default().borders(Borders::ALL).title(format!(" Activity Log{}", scroll_indicator)));

    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state = ScrollbarState::new(total_logs)
            .position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin { vertical: 1, horizontal: 0 }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };
    let key = Style::default().fg(Color::Black).bg(Color::White);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" P ", key),
        Span::raw(" Prepare  "),
        Span::styled(" S ", key),
        Span::raw(" Start  "),
        Span::styled(" C ", key),
        Span::raw(" Sync start  "),
        Span::styled(" X ", key),
        Span::raw(" Stop  "),
        Span::styled(" I ", key),
        Span::raw(" Status  "),
        Span::styled(" R ", key),
        Span::raw(" Reset  "),
        Span::styled(" A ", key),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}
