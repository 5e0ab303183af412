// src/ui/widgets/findings.rs

use crate::app::{App, AppState};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, Wrap},
};
use vanguard_recon::core::models::{Finding, Severity};

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::High => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        Severity::Medium => Style::default().fg(Color::Yellow),
        Severity::Low => Style::default().fg(Color::Cyan),
        Severity::Info => Style::default().fg(Color::DarkGray),
    }
}

fn finding_lines(finding: &Finding, selected: bool) -> Vec<Line<'_>> {
    let location = match finding.port {
        Some(port) => format!("{}:{}", finding.host, port),
        None => finding.host.clone(),
    };
    let marker = if selected { "> " } else { "  " };
    let mut lines = vec![Line::from(vec![
        Span::raw(marker),
        Span::styled(format!("[{}] ", finding.severity), severity_style(finding.severity)),
        Span::raw(finding.title.as_str()).bold(),
        Span::styled(format!("  {location}"), Style::default().fg(Color::DarkGray)),
    ])];
    if selected {
        lines.push(Line::from(format!("    {}", finding.description)));
        let sources: Vec<&str> = finding.sources.iter().map(String::as_str).collect();
        lines.push(Line::from(format!("    reported by {}", sources.join(", "))).fg(Color::DarkGray));
    }
    lines
}

/// Findings of a finished job, most severe first. The selected one is expanded.
pub fn render_findings(frame: &mut Frame, app: &mut App, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title(format!("Findings ({})", app.findings.len()));

    if app.state != AppState::Finished {
        let text = match &app.message {
            Some(message) => Text::from(Line::from(message.as_str()).fg(Color::Red)),
            None => Text::from("Findings are listed once the scan ends."),
        };
        frame.render_widget(Paragraph::new(text).block(block).wrap(Wrap { trim: true }), area);
        return;
    }
    if app.findings.is_empty() {
        let text = Line::from("No findings.").fg(Color::Green);
        frame.render_widget(Paragraph::new(text).block(block), area);
        return;
    }

    let lines: Vec<Line> = app
        .findings
        .iter()
        .enumerate()
        .skip(app.scroll_offset)
        .flat_map(|(idx, finding)| finding_lines(finding, idx == app.scroll_offset))
        .collect();
    frame.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
    frame.render_stateful_widget(
        Scrollbar::new(ScrollbarOrientation::VerticalRight),
        area.inner(Margin { vertical: 1, horizontal: 0 }),
        &mut app.findings_scroll_state,
    );
}
