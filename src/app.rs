// src/app.rs

use ratatui::widgets::ScrollbarState;
use vanguard_recon::core::models::{Finding, JobId, ScanMode};
use vanguard_recon::core::progress::ProgressSnapshot;
use vanguard_recon::core::storage::Checkpoint;

/// Messages from background scan tasks to the UI loop.
#[derive(Debug)]
pub enum AppEvent {
    Progress(ProgressSnapshot),
    Finished(Box<Checkpoint>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Idle,
    Scanning,
    Finished,
}

pub struct App {
    pub should_quit: bool,
    pub state: AppState,
    pub input: String,
    pub mode: ScanMode,
    pub job_id: Option<JobId>,
    pub snapshot: Option<ProgressSnapshot>,
    /// Final findings, most severe first. Filled once the job ends.
    pub findings: Vec<Finding>,
    pub message: Option<String>,
    pub scroll_offset: usize,
    pub findings_scroll_state: ScrollbarState,
}

impl App {
    pub fn new() -> Self {
        Self {
            should_quit: false,
            state: AppState::Idle,
            input: String::new(),
            mode: ScanMode::Full,
            job_id: None,
            snapshot: None,
            findings: Vec::new(),
            message: None,
            scroll_offset: 0,
            findings_scroll_state: ScrollbarState::default(),
        }
    }

    pub fn cycle_mode(&mut self) {
        self.mode = self.mode.next();
    }

    pub fn begin_scan(&mut self, id: JobId) {
        self.state = AppState::Scanning;
        self.job_id = Some(id);
        self.message = None;
    }

    pub fn handle(&mut self, event: AppEvent) {
        match event {
            AppEvent::Progress(snapshot) => {
                if self.job_id == Some(snapshot.job_id) {
                    self.snapshot = Some(snapshot);
                }
            }
            AppEvent::Finished(checkpoint) => {
                if self.job_id != Some(checkpoint.job.id) {
                    return;
                }
                let mut findings = checkpoint.assets.findings;
                findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.host.cmp(&b.host)));
                self.findings = findings;
                self.findings_scroll_state = ScrollbarState::new(self.findings.len());
                self.message = checkpoint.job.error;
                self.state = AppState::Finished;
            }
            AppEvent::Error(message) => {
                self.message = Some(message);
                if self.state == AppState::Scanning && self.snapshot.is_none() {
                    self.state = AppState::Idle;
                }
            }
        }
    }

    pub fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(1);
        self.findings_scroll_state = self.findings_scroll_state.position(self.scroll_offset);
    }

    pub fn scroll_down(&mut self) {
        if self.scroll_offset + 1 < self.findings.len() {
            self.scroll_offset += 1;
        }
        self.findings_scroll_state = self.findings_scroll_state.position(self.scroll_offset);
    }

    pub fn quit(&mut self) {
        self.should_quit = true;
    }

    /// Back to an empty input, keeping the selected mode.
    pub fn reset(&mut self) {
        let mode = self.mode;
        *self = Self::new();
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vanguard_recon::core::models::{AssetGraph, Job};

    #[test]
    fn ignores_events_from_other_jobs() {
        let job = Job::new("example.com", ScanMode::Full).unwrap();
        let other = Job::new("example.org", ScanMode::Full).unwrap();
        let mut app = App::new();
        app.begin_scan(job.id);

        app.handle(AppEvent::Progress(ProgressSnapshot::from_job(&other)));
        assert!(app.snapshot.is_none());
        app.handle(AppEvent::Finished(Box::new(Checkpoint { job: other, assets: AssetGraph::default() })));
        assert_eq!(app.state, AppState::Scanning);

        app.handle(AppEvent::Progress(ProgressSnapshot::from_job(&job)));
        assert!(app.snapshot.is_some());
        app.handle(AppEvent::Finished(Box::new(Checkpoint { job, assets: AssetGraph::default() })));
        assert_eq!(app.state, AppState::Finished);
    }

    #[test]
    fn reset_keeps_mode() {
        let mut app = App::new();
        app.cycle_mode();
        app.input.push_str("example.com");
        app.reset();
        assert_eq!(app.mode, ScanMode::DiscoveryOnly);
        assert!(app.input.is_empty());
    }
}
