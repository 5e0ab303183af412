// src/ui/widgets/phases.rs

use crate::app::{App, AppState};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
};
use vanguard_recon::core::models::{JobState, PhaseStatus};

fn status_style(status: PhaseStatus) -> Style {
    match status {
        PhaseStatus::Succeeded => Style::default().fg(Color::Green),
        PhaseStatus::PartiallyFailed => Style::default().fg(Color::Yellow),
        PhaseStatus::Failed => Style::default().fg(Color::Red),
        PhaseStatus::Running => Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        PhaseStatus::NotStarted | PhaseStatus::Skipped => Style::default().fg(Color::DarkGray),
    }
}

/// Live table of the job's phases: status and adapters finished so far.
pub fn render_phases(frame: &mut Frame, app: &App, area: Rect) {
    let title = match &app.snapshot {
        Some(snapshot) => format!("Job {} ({})", snapshot.job_id, snapshot.state),
        None => "Phases".to_string(),
    };
    let block = Block::default().borders(Borders::ALL).title(title);

    let Some(snapshot) = &app.snapshot else {
        let hint = match app.state {
            AppState::Idle => "Enter a domain and press Enter to start a scan.",
            _ => "Starting...",
        };
        frame.render_widget(Paragraph::new(hint).block(block), area);
        return;
    };

    let rows = snapshot.phases.iter().map(|p| {
        let adapters = if p.adapters_total == 0 && p.status == PhaseStatus::NotStarted {
            "-".to_string()
        } else {
            format!("{}/{}", p.adapters_done, p.adapters_total)
        };
        Row::new(vec![
            Cell::from(p.phase.to_string()),
            Cell::from(p.status.to_string()).style(status_style(p.status)),
            Cell::from(adapters),
        ])
    });
    let header = Row::new(vec!["Phase", "Status", "Adapters"]).style(Style::new().bold());
    let border_style = match snapshot.state {
        JobState::Failed => Style::default().fg(Color::Red),
        JobState::Cancelled => Style::default().fg(Color::Yellow),
        _ => Style::default(),
    };
    let table = Table::new(rows, [Constraint::Length(16), Constraint::Length(18), Constraint::Min(8)])
        .header(header)
        .block(block.border_style(border_style));
    frame.render_widget(table, area);
}
