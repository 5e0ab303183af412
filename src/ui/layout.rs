// src/ui/layout.rs

use ratatui::layout::{Constraint, Direction, Layout, Rect};

/// Screen regions of the dashboard.
pub struct AppLayout {
    pub input: Rect,
    pub phases: Rect,
    pub findings: Rect,
    pub summary: Rect,
    pub footer: Rect,
}

/// Input on top, footer at the bottom; in between the phase table and the
/// findings list on the left, the summary on the right.
pub fn create_layout(frame_size: Rect) -> AppLayout {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)])
        .split(frame_size);

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(main_chunks[1]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(7), Constraint::Min(0)])
        .split(content_chunks[0]);

    AppLayout {
        input: main_chunks[0],
        phases: left_chunks[0],
        findings: left_chunks[1],
        summary: content_chunks[1],
        footer: main_chunks[2],
    }
}
