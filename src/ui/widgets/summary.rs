// src/ui/widgets/summary.rs

use crate::app::App;
use ratatui::{
    prelude::*,
    text::Line,
    widgets::{Block, Borders, Gauge, Paragraph},
};
use vanguard_recon::core::models::{JobStatus, Severity};

/// Renders the summary widget: overall progress and asset counts.
pub fn render_summary(frame: &mut Frame, app: &App, area: Rect) {
    let summary_container = Block::default().borders(Borders::ALL).title("Summary");
    frame.render_widget(summary_container, area);

    let summary_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(2), // Target & status
            Constraint::Length(1), // Gauge
            Constraint::Length(1), // Spacer
            Constraint::Length(4), // Asset counts
            Constraint::Length(1), // Spacer
            Constraint::Min(0),    // Severity breakdown
        ])
        .split(area);

    let Some(snapshot) = &app.snapshot else {
        return;
    };

    let status_style = match snapshot.status {
        JobStatus::Completed => Style::default().fg(Color::Green),
        JobStatus::Failed => Style::default().fg(Color::Red),
        JobStatus::Cancelled => Style::default().fg(Color::Yellow),
        _ => Style::default().fg(Color::Cyan),
    };
    let header = Text::from(vec![
        Line::from(snapshot.target.as_str().bold()),
        Line::from(format!("{} ({:.1}s)", snapshot.status, snapshot.elapsed_ms as f64 / 1000.0)).style(status_style),
    ]);
    frame.render_widget(Paragraph::new(header).alignment(Alignment::Center), summary_chunks[0]);

    let gauge = Gauge::default().percent(snapshot.percent()).style(status_style);
    frame.render_widget(gauge, summary_chunks[1]);

    let counts = Text::from(vec![
        Line::from("ASSETS".bold()),
        Line::from(format!("Hosts:    {}", snapshot.hosts)),
        Line::from(format!("Services: {}", snapshot.services)),
        Line::from(format!("Findings: {}", snapshot.findings)),
    ]);
    frame.render_widget(Paragraph::new(counts), summary_chunks[3]);

    if app.findings.is_empty() {
        return;
    }
    let mut breakdown = vec![Line::from("BY SEVERITY".bold())];
    for (severity, color) in [
        (Severity::High, Color::Red),
        (Severity::Medium, Color::Yellow),
        (Severity::Low, Color::Cyan),
        (Severity::Info, Color::DarkGray),
    ] {
        let count = app.findings.iter().filter(|f| f.severity == severity).count();
        breakdown.push(Line::from(vec![
            Span::raw(format!("{severity:<8}")),
            Span::styled(count.to_string(), Style::default().fg(color)),
        ]));
    }
    frame.render_widget(Paragraph::new(breakdown), summary_chunks[5]);
}
