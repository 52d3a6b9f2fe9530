//! Terminal rendering.
//!
//! All draw functions take `&App` and read state through the view
//! projections; nothing here decides what a control does.

use chrono::Local;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, List, ListItem, Paragraph};
use ratatui::Frame;

use crate::app::{App, Connection, Mode};
use crate::chart::{self, ChartWindow};
use crate::views::{self, ControlId};

fn rgb((r, g, b): (u8, u8, u8)) -> Color {
    Color::Rgb(r, g, b)
}

const DISABLED: Style = Style::new().fg(Color::DarkGray);

fn control_key(id: ControlId) -> char {
    match id {
        ControlId::OpenHeatSwitch => 'o',
        ControlId::CloseHeatSwitch => 'c',
        ControlId::MagUp => 'm',
        ControlId::Regulate => 'r',
        ControlId::Compressor => 'p',
        ControlId::RefreshInstruments => 'f',
    }
}

/// Render a gray message in an empty panel.
fn draw_placeholder(f: &mut Frame, area: Rect, title: String, message: &str) {
    let block = Block::default().borders(Borders::ALL).title(title);
    let p = Paragraph::new(message).style(DISABLED).block(block);
    f.render_widget(p, area);
}

// ---------------------------------------------------------------------------
// Main draw entry point
// ---------------------------------------------------------------------------

pub fn draw(f: &mut Frame, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // header
            Constraint::Min(12),   // main
            Constraint::Length(1), // keys
        ])
        .split(f.area());

    draw_header(f, rows[0], app);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(46), Constraint::Min(30)])
        .split(rows[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(9), // controls + notice
            Constraint::Length(6), // temperatures
            Constraint::Length(6), // readouts
            Constraint::Min(4),    // instruments
        ])
        .split(cols[0]);
    draw_controls(f, left[0], app);
    draw_gauges(f, left[1], app);
    draw_readouts(f, left[2], app);
    draw_instruments(f, left[3], app);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(8),     // chart
            Constraint::Length(10), // log
            Constraint::Length(3),  // input
        ])
        .split(cols[1]);
    draw_chart(f, right[0], app);
    draw_log(f, right[1], app);
    draw_input(f, right[2], app);

    draw_keys(f, rows[2]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn draw_header(f: &mut Frame, area: Rect, app: &App) {
    let status = match &app.connection {
        Connection::Connecting => Span::styled("\u{25CB} connecting", Style::default().fg(Color::Yellow)),
        Connection::Connected { url } => {
            Span::styled(format!("\u{25CF} {}", url), Style::default().fg(Color::Green))
        }
        Connection::Offline { reason, retry_in } => Span::styled(
            format!(
                "\u{25CB} offline ({}), retrying in {:.1}s",
                reason,
                retry_in.as_secs_f64()
            ),
            Style::default().fg(Color::Red),
        ),
    };
    let line = Line::from(vec![
        Span::styled(" ADR Monitor ", Style::default().add_modifier(Modifier::BOLD)),
        status,
    ]);
    f.render_widget(Paragraph::new(line), area);
}

// ---------------------------------------------------------------------------
// Left column
// ---------------------------------------------------------------------------

fn draw_controls(f: &mut Frame, area: Rect, app: &App) {
    let mut lines: Vec<Line> = app
        .controls()
        .into_iter()
        .map(|c| {
            let style = if c.is_active() {
                Style::default()
            } else {
                DISABLED
            };
            Line::from(Span::styled(format!(" [{}] {}", control_key(c.id), c.label), style))
        })
        .collect();
    if let Some(notice) = &app.notice {
        lines.push(Line::from(Span::styled(
            format!(" {}", notice),
            Style::default().fg(Color::Cyan),
        )));
    }
    let block = Block::default().borders(Borders::ALL).title(" Controls ");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_gauges(f: &mut Frame, area: Rect, app: &App) {
    let lines: Vec<Line> = views::temp_gauges(app.store.state())
        .into_iter()
        .map(|g| {
            let color = rgb(g.sensor.rgb());
            Line::from(vec![
                Span::styled(
                    format!(" {} ", g.sensor.label()),
                    Style::default().fg(Color::White).bg(color),
                ),
                Span::styled(format!(" {:>11} ", g.value_text), Style::default().fg(color)),
                Span::styled(g.rate_text, Style::default().fg(color)),
            ])
        })
        .collect();
    let block = Block::default().borders(Borders::ALL).title(" Temperatures ");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_readouts(f: &mut Frame, area: Rect, app: &App) {
    let lines: Vec<Line> = views::status_readouts(app.store.state())
        .into_iter()
        .map(|r| {
            Line::from(vec![
                Span::styled(format!(" {:<11}", r.label), Style::default().fg(Color::Gray)),
                Span::raw(format!("{:>12} {}", r.value_text, r.units)),
            ])
        })
        .collect();
    let block = Block::default().borders(Borders::ALL).title(" Readouts ");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_instruments(f: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = views::instrument_lights(app.store.state())
        .into_iter()
        .map(|(name, light)| {
            ListItem::new(Line::from(vec![
                Span::styled(" \u{25C9} ", Style::default().fg(rgb(light.rgb()))),
                Span::raw(name),
            ]))
        })
        .collect();
    let block = Block::default().borders(Borders::ALL).title(" Instruments ");
    f.render_widget(List::new(items).block(block), area);
}

// ---------------------------------------------------------------------------
// Right column
// ---------------------------------------------------------------------------

fn draw_chart(f: &mut Frame, area: Rect, app: &App) {
    let title = format!(" Temperature [K] ({}) ", app.chart_window.label());
    let max_points = (area.width as usize * 2).max(100);
    let Some(data) = chart::project(app.store.state(), app.chart_window, max_points, &Local) else {
        draw_placeholder(f, area, title, "waiting for temperature data");
        return;
    };

    // One dataset per unbroken run; only the first carries the legend name.
    let mut datasets: Vec<Dataset> = Vec::new();
    for trace in &data.traces {
        let style = Style::default().fg(rgb(trace.sensor.rgb()));
        for (i, segment) in trace.segments.iter().enumerate() {
            let mut ds = Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(style)
                .data(segment);
            if i == 0 {
                ds = ds.name(chart::trace_name(trace.sensor));
            }
            datasets.push(ds);
        }
    }

    let x_title = match app.chart_window {
        ChartWindow::All => "time (all)".to_string(),
        w => format!("time (last {})", w.label()),
    };
    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title(x_title)
                .style(Style::default().fg(Color::Gray))
                .bounds(data.x_bounds)
                .labels(data.x_labels.clone()),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(data.y_bounds)
                .labels(data.y_labels.clone()),
        );
    f.render_widget(chart, area);
}

fn draw_log(f: &mut Frame, area: Rect, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = views::log_lines(app.store.state(), &Local)
        .into_iter()
        .take(visible)
        .map(|line| {
            let style = if line.alert {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            ListItem::new(Span::styled(line.text, style))
        })
        .collect();
    let block = Block::default().borders(Borders::ALL).title(" Log ");
    f.render_widget(List::new(items).block(block), area);
}

fn draw_input(f: &mut Frame, area: Rect, app: &App) {
    let (title, text, style) = match app.mode {
        Mode::LogEntry => (" Log message ", format!("{}_", app.log_input), Style::default()),
        Mode::RegulateEntry => (
            " Regulation temperature [K] ",
            format!("{}_", app.regulate_input),
            Style::default(),
        ),
        Mode::Normal => (
            " Input ",
            "[l] log a message  [r] regulate".to_string(),
            DISABLED,
        ),
    };
    let block = Block::default().borders(Borders::ALL).title(title);
    f.render_widget(Paragraph::new(Span::styled(text, style)).block(block), area);
}

fn draw_keys(f: &mut Frame, area: Rect) {
    let help = " o/c heat switch  m mag up  r regulate  p compressor  f refresh  l log  w window  q quit";
    f.render_widget(Paragraph::new(help).style(DISABLED), area);
}
