//! CLI application for huddle

use anyhow::Result;
use audio::{
    CaptureBackend, CpalCapture, CpalPlayback, MediaCaptureController, PlaybackMixer,
    SyntheticCapture, Waveform,
};
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, error, info, warn};
use mesh::{MeshCoordinator, MeshHandle, MeshSnapshot, Roster};
use mesh_core::{EventKind, MeshEvent};
use network::NetworkStack;
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use settings_manager::ConfigManager;
use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// huddle - voice chat with everyone in the room
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Display name, overrides the configured username
    #[clap(short, long)]
    name: Option<String>,

    /// Config file to use instead of the one in the user config directory
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Send generated noise instead of opening the microphone
    #[clap(long)]
    synthetic: bool,
}

/// Something the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Join,
    Leave,
    ToggleMute,
    Quit,
}

/// App state
struct App {
    /// Whether the app should exit
    should_quit: bool,
    /// Name we join under
    display_name: String,
    /// Participants, fed by event subscriptions
    roster: Arc<Mutex<Roster>>,
    /// Latest coordinator state
    snapshot: MeshSnapshot,
    /// Last thing worth telling the user
    status: String,
}

impl App {
    fn new(display_name: String, roster: Arc<Mutex<Roster>>) -> Self {
        Self {
            should_quit: false,
            display_name,
            roster,
            snapshot: MeshSnapshot::default(),
            status: "Press 'j' to join".to_string(),
        }
    }

    /// Map input events to actions
    fn handle_event(&mut self, event: Event) -> Option<Action> {
        if let Event::Key(key) = event {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => {
                    self.should_quit = true;
                    return Some(Action::Quit);
                }
                KeyCode::Char('j') => return Some(Action::Join),
                KeyCode::Char('l') => return Some(Action::Leave),
                KeyCode::Char('m') => return Some(Action::ToggleMute),
                _ => {}
            }
        }
        None
    }

    /// Run an action against the coordinator
    async fn perform(&mut self, action: Action, mesh: &MeshHandle) {
        let outcome = match action {
            Action::Join => {
                self.status = format!("Joining as {}...", self.display_name);
                mesh.join(&self.display_name)
                    .await
                    .map(|_| "Joined, looking for peers".to_string())
            }
            Action::Leave => mesh.leave().await.map(|_| "Left the room".to_string()),
            Action::ToggleMute => {
                let muted = !self.snapshot.muted;
                if let Ok(mut roster) = self.roster.lock() {
                    roster.set_muted(muted);
                }
                mesh.set_muted(muted)
                    .await
                    .map(|_| (if muted { "Muted" } else { "Unmuted" }).to_string())
            }
            Action::Quit => return,
        };

        match outcome {
            Ok(status) => self.status = status,
            Err(e) => {
                warn!("{:?} failed: {}", action, e);
                self.status = format!("Error: {}", e);
            }
        }
    }

    async fn refresh(&mut self, mesh: &MeshHandle) {
        match mesh.snapshot().await {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => debug!("Snapshot unavailable: {}", e),
        }
    }
}

/// Keep the roster and the playback mixer in step with the mesh
async fn wire_events(mesh: &MeshHandle, roster: Arc<Mutex<Roster>>, mixer: PlaybackMixer) -> Result<()> {
    for kind in [
        EventKind::Connected,
        EventKind::PeerJoined,
        EventKind::PeerLeft,
        EventKind::SpeakingChanged,
        EventKind::Disconnected,
    ] {
        let roster = roster.clone();
        mesh.subscribe(kind, move |event| {
            if let Ok(mut roster) = roster.lock() {
                roster.apply(event);
            }
        })
        .await?;
    }

    let playing = mixer.clone();
    mesh.subscribe(EventKind::Stream, move |event| {
        if let MeshEvent::Stream { media, .. } = event {
            playing.add(media.clone());
        }
    })
    .await?;
    mesh.subscribe(EventKind::PeerLeft, move |event| {
        if let Some(peer) = event.peer() {
            mixer.remove(peer);
        }
    })
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("Starting huddle CLI");

    let config = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    }
    .map_err(|e| {
        error!("Failed to load config: {}", e);
        anyhow::anyhow!("Failed to load config: {}", e)
    })?;
    debug!("Using config {:?}", config.path());
    let settings = config.settings().clone();
    let display_name = args.name.clone().unwrap_or_else(|| settings.username.clone());

    let backend: Box<dyn CaptureBackend> = if args.synthetic {
        Box::new(SyntheticCapture::new(
            settings.capture.frame_ms,
            Waveform::Noise,
            0.3,
        ))
    } else {
        Box::new(CpalCapture::new(settings.capture.clone()))
    };
    let stack = NetworkStack::from_settings(&settings)?;
    let (mesh, coordinator) =
        MeshCoordinator::spawn(&settings, stack, MediaCaptureController::new(backend));

    let roster = Arc::new(Mutex::new(Roster::new()));
    let mixer = PlaybackMixer::new();
    wire_events(&mesh, roster.clone(), mixer.clone()).await?;

    // Without an output device the mesh still works, we just hear nothing
    let _playback = match CpalPlayback::start(mixer).await {
        Ok(playback) => Some(playback),
        Err(e) => {
            warn!("Audio output unavailable: {}", e);
            None
        }
    };

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(display_name, roster);
    let result = run_app(&mut terminal, &mut app, &mesh).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(e) = mesh.shutdown().await {
        debug!("Mesh already stopped: {}", e);
    }
    match coordinator.await {
        Ok(Err(e)) => error!("Mesh coordinator failed: {}", e),
        Err(e) => error!("Mesh coordinator panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Exiting huddle CLI");

    result
}

/// Main event loop
async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    mesh: &MeshHandle,
) -> Result<()> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    loop {
        // Render the UI
        terminal.draw(|f| ui(f, app))?;

        // Poll for events
        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_millis(0));

        if event::poll(timeout)? {
            if let Some(action) = app.handle_event(event::read()?) {
                app.perform(action, mesh).await;
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.refresh(mesh).await;
            last_tick = Instant::now();
        }

        // Check if we should quit
        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Percentage(25), // Menu area
            Constraint::Percentage(50), // Participants area
            Constraint::Percentage(25), // Status area
        ])
        .split(f.size());

    // Menu area
    let menu = Paragraph::new(Text::from(vec![
        Line::from(vec![
            Span::styled("huddle", Style::default().fg(Color::Green)),
            Span::raw(" - voice chat with everyone in the room"),
        ]),
        Line::raw(""),
        Line::raw("'j' join  'l' leave  'm' mute  'q' quit"),
    ]))
    .block(Block::default().title("Menu").borders(Borders::ALL));
    f.render_widget(menu, chunks[0]);

    // Participants area
    let participants = app
        .roster
        .lock()
        .map(|roster| roster.participants())
        .unwrap_or_default();
    let lines: Vec<Line> = if participants.is_empty() {
        vec![Line::raw("No peers connected")]
    } else {
        participants
            .iter()
            .map(|p| {
                let marker = if p.is_speaking { "* " } else { "  " };
                let mut spans = vec![Span::raw(marker)];
                let style = if p.is_speaking {
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                spans.push(Span::styled(p.display_name.clone(), style));
                if p.is_self {
                    spans.push(Span::raw(" (you)"));
                }
                if p.muted {
                    spans.push(Span::styled(" [muted]", Style::default().fg(Color::Red)));
                }
                Line::from(spans)
            })
            .collect()
    };
    let peers = Paragraph::new(Text::from(lines))
        .block(Block::default().title("Participants").borders(Borders::ALL));
    f.render_widget(peers, chunks[1]);

    // Status area
    let status = Paragraph::new(Text::from(vec![
        Line::raw(format!(
            "Signaling: {}  Calls: {}{}",
            app.snapshot.state,
            app.snapshot.sessions.len(),
            if app.snapshot.muted { "  Muted" } else { "" }
        )),
        Line::raw(app.status.clone()),
    ]))
    .block(Block::default().title("Status").borders(Borders::ALL));
    f.render_widget(status, chunks[2]);
}
