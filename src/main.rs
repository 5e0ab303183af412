// src/main.rs

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use crossterm::{
    ExecutableCommand,
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vanguard_recon::config::Settings;
use vanguard_recon::core::adapters::default_registry;
use vanguard_recon::core::models::{JobId, JobState, ScanMode};
use vanguard_recon::core::orchestrator::ScanOrchestrator;
use vanguard_recon::core::storage::JsonFileStore;
use vanguard_recon::logging::initialize_logging;

mod app;
mod ui;

use app::{App, AppEvent, AppState};

/// Multi-phase reconnaissance: subdomain discovery, port scanning and
/// vulnerability checks against one domain.
#[derive(Debug, Parser)]
#[command(name = "vanguard-recon", version, about)]
struct Cli {
    /// Path to a JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also log JSON lines to stderr (headless commands only).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a scan without the dashboard.
    Scan {
        domain: String,
        /// full, discovery, port or vuln.
        #[arg(long, default_value = "full")]
        mode: ScanMode,
        /// Print the final checkpoint as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Resume a checkpointed job.
    Resume {
        id: JobId,
        #[arg(long)]
        json: bool,
    },
    /// Print a stored checkpoint.
    Show { id: JobId },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    initialize_logging(cli.log_json && cli.command.is_some())?;

    let settings = Settings::load(cli.config.as_deref(), |key| std::env::var(key).ok())
        .wrap_err("failed to load settings")?;
    let store = Arc::new(JsonFileStore::new(settings.jobs_dir()));
    let registry = default_registry(&settings).wrap_err("failed to build adapter registry")?;
    let orchestrator = Arc::new(ScanOrchestrator::new(store, registry, settings.orchestrator_config()));

    match cli.command {
        None => run_dashboard(orchestrator).await,
        Some(Command::Scan { domain, mode, json }) => {
            let id = orchestrator.start(&domain, mode).await?;
            follow(&orchestrator, id, json).await
        }
        Some(Command::Resume { id, json }) => {
            orchestrator.resume(id).await?;
            follow(&orchestrator, id, json).await
        }
        Some(Command::Show { id }) => {
            let checkpoint = orchestrator.load(id).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            Ok(())
        }
    }
}

/// Prints every progress change of a headless job until it ends. Ctrl-C
/// requests cancellation and keeps following until the job stops.
async fn follow(orchestrator: &ScanOrchestrator, id: JobId, json: bool) -> Result<()> {
    let mut rx = orchestrator.subscribe(id).await?;
    let mut interrupted = false;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        eprintln!(
            "[{:>3}%] {} {} hosts={} services={} findings={}",
            snapshot.percent(),
            snapshot.target,
            snapshot.state,
            snapshot.hosts,
            snapshot.services,
            snapshot.findings
        );
        if let Some(previous) = snapshot.resumed_from.filter(|_| snapshot.state == JobState::Pending) {
            eprintln!("        resumed from {previous}");
        }
        if snapshot.state.is_terminal() {
            break;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(job_id = %id, "Interrupted, cancelling job.");
                orchestrator.cancel(id).await?;
            }
        }
    }

    let checkpoint = orchestrator.load(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    } else {
        println!("job {} {}", id, checkpoint.job.status);
        if let Some(error) = &checkpoint.job.error {
            println!("error: {error}");
        }
        for finding in &checkpoint.assets.findings {
            let location = finding.port.map(|p| format!("{}:{p}", finding.host)).unwrap_or_else(|| finding.host.clone());
            println!("[{}] {} ({location})", finding.severity, finding.title);
        }
    }
    Ok(())
}

async fn run_dashboard(orchestrator: Arc<ScanOrchestrator>) -> Result<()> {
    stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let result = dashboard_loop(&mut terminal, orchestrator).await;

    stdout().execute(LeaveAlternateScreen)?;
    disable_raw_mode()?;
    result
}

async fn dashboard_loop<B: Backend>(terminal: &mut Terminal<B>, orchestrator: Arc<ScanOrchestrator>) -> Result<()> {
    let mut app = App::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    while !app.should_quit {
        terminal.draw(|frame| ui::render(&mut app, frame))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    handle_key(&mut app, key.code, &orchestrator, &tx).await;
                }
            }
        }

        while let Ok(event) = rx.try_recv() {
            app.handle(event);
        }
    }

    if let Some(id) = app.job_id.filter(|_| app.state == AppState::Scanning) {
        orchestrator.cancel(id).await?;
    }
    Ok(())
}

async fn handle_key(
    app: &mut App,
    key_code: KeyCode,
    orchestrator: &Arc<ScanOrchestrator>,
    tx: &mpsc::UnboundedSender<AppEvent>,
) {
    match app.state {
        AppState::Idle => match key_code {
            KeyCode::Esc => app.quit(),
            KeyCode::Tab => app.cycle_mode(),
            KeyCode::Char(c) => app.input.push(c),
            KeyCode::Backspace => {
                app.input.pop();
            }
            KeyCode::Enter if !app.input.trim().is_empty() => match orchestrator.start(app.input.trim(), app.mode).await {
                Ok(id) => {
                    app.begin_scan(id);
                    watch_job(Arc::clone(orchestrator), id, tx.clone());
                }
                Err(e) => app.handle(AppEvent::Error(e.to_string())),
            },
            _ => {}
        },
        AppState::Scanning => match key_code {
            KeyCode::Char('q') => app.quit(),
            KeyCode::Char('c') => {
                if let Some(id) = app.job_id {
                    if let Err(e) = orchestrator.cancel(id).await {
                        app.handle(AppEvent::Error(e.to_string()));
                    }
                }
            }
            _ => {}
        },
        AppState::Finished => match key_code {
            KeyCode::Char('q') => app.quit(),
            KeyCode::Char('n') => app.reset(),
            KeyCode::Up => app.scroll_up(),
            KeyCode::Down => app.scroll_down(),
            _ => {}
        },
    }
}

/// Forwards progress of `id` to the UI loop, then the final checkpoint.
fn watch_job(orchestrator: Arc<ScanOrchestrator>, id: JobId, tx: mpsc::UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let mut rx = match orchestrator.subscribe(id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = tx.send(AppEvent::Error(e.to_string()));
                return;
            }
        };
        loop {
            let snapshot = rx.borrow_and_update().clone();
            let done = snapshot.state.is_terminal();
            if tx.send(AppEvent::Progress(snapshot)).is_err() || done || rx.changed().await.is_err() {
                break;
            }
        }
        let event = match orchestrator.load(id).await {
            Ok(checkpoint) => AppEvent::Finished(Box::new(checkpoint)),
            Err(e) => AppEvent::Error(e.to_string()),
        };
        info!(job_id = %id, "Dashboard job finished.");
        let _ = tx.send(event);
    });
}
