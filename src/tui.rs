#![cfg(feature = "tui")]

use crate::app::Setup;
use crate::chat::Chat;
use crate::message::Role;
use crate::render::{self, Renderer};
use crate::session::ConversationSession;
use crate::stream::SlotKey;
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use std::path::Path;
use tokio::sync::mpsc;

/// What the chat worker reports back to the screen.
#[derive(Debug, Clone, PartialEq)]
enum UiEvent {
    BeginTurn,
    Fragment(Role, SlotKey, String),
    Panel(String, String),
    Error(String),
    Info(String),
    /// A new transcript was started; the screen starts over.
    Cleared,
    Status { model: String, session: String },
    Idle,
}

/// What the screen asks of the chat worker.
#[derive(Debug)]
enum Request {
    Send(String),
    NewChat,
    SetModel(String),
}

/// Forwards renderer calls to the screen.
struct ChannelRenderer(mpsc::UnboundedSender<UiEvent>);

impl Renderer for ChannelRenderer {
    fn begin_turn(&mut self) {
        self.0.send(UiEvent::BeginTurn).ok();
    }

    fn fragment(&mut self, role: Role, key: &SlotKey, text: &str) {
        self.0.send(UiEvent::Fragment(role, key.clone(), text.to_string())).ok();
    }

    fn panel(&mut self, label: &str, payload: &str) {
        self.0.send(UiEvent::Panel(label.to_string(), payload.to_string())).ok();
    }

    fn error(&mut self, message: &str) {
        self.0.send(UiEvent::Error(message.to_string())).ok();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Chat { role: Role, key: SlotKey, text: String },
    Panel { label: String, payload: String },
    Note { error: bool, text: String },
}

#[derive(Debug, Default)]
struct Screen {
    entries: Vec<Entry>,
    /// First entry of the turn being streamed; slot keys are only unique within a turn.
    turn_start: usize,
    expanded: bool,
    busy: bool,
    scroll_back: u16,
    model: String,
    session: String,
}

impl Screen {
    fn apply(&mut self, ev: UiEvent) {
        match ev {
            UiEvent::BeginTurn => self.turn_start = self.entries.len(),
            UiEvent::Fragment(role, key, text) => {
                let existing = self.entries[self.turn_start..].iter_mut().find_map(|e| match e {
                    Entry::Chat { key: k, text: t, .. } if *k == key => Some(t),
                    _ => None,
                });
                match existing {
                    Some(t) => *t = text,
                    None => self.entries.push(Entry::Chat { role, key, text }),
                }
            }
            UiEvent::Panel(label, payload) => self.entries.push(Entry::Panel { label, payload }),
            UiEvent::Error(text) => self.entries.push(Entry::Note { error: true, text }),
            UiEvent::Info(text) => self.entries.push(Entry::Note { error: false, text }),
            UiEvent::Cleared => {
                self.entries.clear();
                self.turn_start = 0;
                self.scroll_back = 0;
            }
            UiEvent::Status { model, session } => {
                self.model = model;
                self.session = session;
            }
            UiEvent::Idle => self.busy = false,
        }
    }

    fn push_user(&mut self, text: &str) {
        self.entries.push(Entry::Chat {
            role: Role::User,
            key: SlotKey::Fixed,
            text: text.to_string(),
        });
        self.turn_start = self.entries.len();
        self.scroll_back = 0;
    }

    fn text(&self) -> Text<'static> {
        let mut text = Text::default();
        for e in &self.entries {
            match e {
                Entry::Chat { role, text: body, .. } => {
                    let style = match role {
                        Role::User => Style::default().add_modifier(Modifier::BOLD),
                        _ => Style::default().fg(Color::Cyan),
                    };
                    text.lines.push(Line::styled(format!("{}:", role.as_str()), style));
                    text.lines.extend(Text::from(body.clone()).lines);
                }
                Entry::Panel { label, payload } => {
                    let dim = Style::default().fg(Color::DarkGray);
                    if self.expanded {
                        text.lines.push(Line::styled(format!("▾ [{label}]"), dim));
                        for l in payload.lines() {
                            text.lines.push(Line::styled(format!("  {l}"), dim));
                        }
                    } else {
                        let first: String = payload.lines().next().unwrap_or("").chars().take(80).collect();
                        text.lines.push(Line::styled(format!("▸ [{label}] {first}"), dim));
                    }
                }
                Entry::Note { error, text: body } => {
                    let style = if *error {
                        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
                    } else {
                        Style::default().fg(Color::Yellow)
                    };
                    let prefix = if *error { "error: " } else { "" };
                    text.lines.push(Line::styled(format!("{prefix}{body}"), style));
                }
            }
            text.lines.push(Line::from(""));
        }
        text
    }
}

/// Rows `text` takes when wrapped to `width` columns.
fn wrapped_height(text: &Text<'_>, width: u16) -> u16 {
    let width = usize::from(width.max(1));
    let rows: usize = text.lines.iter().map(|l| l.width().max(1).div_ceil(width)).sum();
    u16::try_from(rows).unwrap_or(u16::MAX)
}

async fn worker(
    setup: Setup,
    mut chat: Chat,
    mut session: ConversationSession,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<UiEvent>,
) {
    let status = |chat: &Chat, session: &ConversationSession| UiEvent::Status {
        model: format!("{} / {}", chat.provider_name(), chat.model()),
        session: session.location(),
    };
    let mut renderer = ChannelRenderer(events.clone());

    events.send(status(&chat, &session)).ok();
    render::replay(session.history(), &mut renderer);

    while let Some(req) = requests.recv().await {
        match req {
            Request::Send(input) => {
                if let Err(e) = chat.send(&mut session, &input, &mut renderer).await {
                    tracing::warn!(error = %format!("{e:#}"), "turn-cycle failed");
                    renderer.error(&format!("{e:#}"));
                }
            }
            Request::NewChat => match setup.new_session() {
                Ok(s) => {
                    session = s;
                    events.send(UiEvent::Cleared).ok();
                }
                Err(e) => renderer.error(&format!("{e:#}")),
            },
            Request::SetModel(name) => {
                let choice = setup.choice_for(&name, chat.provider_name());
                match setup.chat_for(&choice) {
                    Ok(c) => {
                        chat = c;
                        events
                            .send(UiEvent::Info(format!("model set to {} / {}", choice.provider, choice.model)))
                            .ok();
                    }
                    Err(e) => renderer.error(&format!("{e:#}")),
                }
            }
        }
        events.send(status(&chat, &session)).ok();
        events.send(UiEvent::Idle).ok();
    }
}

pub async fn run_tui(setup: &Setup, resume: Option<&Path>) -> anyhow::Result<()> {
    let chat = setup.chat()?;
    let session = setup.session(resume)?;

    let (req_tx, req_rx) = mpsc::unbounded_channel::<Request>();
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel::<UiEvent>();
    let worker = tokio::spawn(worker(setup.clone(), chat, session, req_rx, ui_tx));

    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut input = String::new();
    let mut screen = Screen::default();
    screen.apply(UiEvent::Info(
        "Enter sends. Tab expands tool panels. PgUp/PgDn scroll. Commands: /new, /model <name>, /clear, /quit".into(),
    ));

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = draw(&mut terminal, &screen, &input) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                if let Event::Key(key) = ev {
                    if handle_key(key, &mut input, &mut screen, &req_tx) {
                        break Ok(());
                    }
                }
            }
            Some(ev) = ui_rx.recv() => screen.apply(ev),
        }
    };

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    drop(req_tx);
    worker.abort();
    res
}

/// Returns true when the UI should exit.
fn handle_key(
    key: KeyEvent,
    input: &mut String,
    screen: &mut Screen,
    requests: &mpsc::UnboundedSender<Request>,
) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return true;
    }

    match key.code {
        KeyCode::Esc => return true,
        KeyCode::Tab => screen.expanded = !screen.expanded,
        KeyCode::PageUp => screen.scroll_back = screen.scroll_back.saturating_add(5),
        KeyCode::PageDown => screen.scroll_back = screen.scroll_back.saturating_sub(5),
        KeyCode::Char(c) => input.push(c),
        KeyCode::Backspace => {
            input.pop();
        }
        KeyCode::Enter => {
            let msg = input.trim().to_string();
            input.clear();
            if msg.is_empty() {
                return false;
            }

            if msg == "/quit" {
                return true;
            }
            if msg == "/clear" {
                screen.apply(UiEvent::Cleared);
                return false;
            }
            if screen.busy {
                screen.apply(UiEvent::Info("(a reply is in progress; wait for it to finish)".into()));
                return false;
            }

            let req = if msg == "/new" {
                Request::NewChat
            } else if let Some(rest) = msg.strip_prefix("/model ") {
                Request::SetModel(rest.trim().to_string())
            } else {
                screen.push_user(&msg);
                Request::Send(msg)
            };
            screen.busy = true;
            if requests.send(req).is_err() {
                screen.busy = false;
                screen.apply(UiEvent::Error("chat worker stopped".into()));
            }
        }
        _ => {}
    }

    false
}

fn draw(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, screen: &Screen, input: &str) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(3)])
            .split(f.area());

        let text = screen.text();
        let inner_height = chunks[0].height.saturating_sub(2);
        let total = wrapped_height(&text, chunks[0].width.saturating_sub(2));
        let bottom = total.saturating_sub(inner_height);
        let scroll = bottom.saturating_sub(screen.scroll_back);

        let title = format!(
            "mcp-chat: {}{}  [{}]",
            screen.model,
            if screen.busy { " …" } else { "" },
            screen.session
        );
        let chat = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: false })
            .scroll((scroll, 0));

        let input_w = Paragraph::new(input.to_string())
            .block(Block::default().borders(Borders::ALL).title("input"));

        f.render_widget(chat, chunks[0]);
        f.render_widget(input_w, chunks[1]);

        let x = chunks[1].x + 1 + input.chars().count() as u16;
        let y = chunks[1].y + 1;
        f.set_cursor_position((x.min(chunks[1].x + chunks[1].width.saturating_sub(2)), y));
    })?;
    Ok(())
}
