//! Terminal front end: header with counts, the scrolling grid, chat log and a
//! prompt line, driven by crossterm events and the frame clock.

use std::{
    collections::HashMap,
    io::{self, Stdout},
    time::Instant,
};

use anyhow::{bail, Context, Result};
use crossterm::{
    event::{
        DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyCode, KeyEvent,
        KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use tidepool_core::{chat_len, CellIndex};
use tracing::{info, warn};

use crate::{
    chat::{ChatInputError, ChatLine},
    config::AppConfig,
    connection::{Backoff, Connection},
    reactor::GridClient,
    renderer::CellHost,
    scheduler::FrameClock,
};

const WHEEL_ROWS: i64 = 3;
const CHAT_PANEL_HEIGHT: u16 = 8;

/// Live cell widgets, keyed by index.
#[derive(Debug, Default)]
pub struct TerminalCells {
    cells: HashMap<CellIndex, bool>,
}

impl TerminalCells {
    pub fn get(&self, index: CellIndex) -> Option<bool> {
        self.cells.get(&index).copied()
    }
}

impl CellHost for TerminalCells {
    fn create(&mut self, index: CellIndex, checked: bool) {
        self.cells.insert(index, checked);
    }

    fn destroy(&mut self, index: CellIndex) {
        self.cells.remove(&index);
    }

    fn update(&mut self, index: CellIndex, checked: bool) {
        if let Some(cell) = self.cells.get_mut(&index) {
            *cell = checked;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    None,
    Jump(String),
    Chat(String),
}

struct ScreenAreas {
    header: Rect,
    grid: Rect,
    chat: Rect,
    prompt: Rect,
}

impl ScreenAreas {
    fn of(screen: Rect) -> Self {
        let rows = Layout::vertical([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(CHAT_PANEL_HEIGHT),
            Constraint::Length(3),
        ])
        .split(screen);
        Self {
            header: rows[0],
            grid: rows[1],
            chat: rows[2],
            prompt: rows[3],
        }
    }

    /// Grid area minus its border.
    fn grid_inner(&self) -> Rect {
        Block::default().borders(Borders::ALL).inner(self.grid)
    }
}

pub struct App {
    client: GridClient<TerminalCells>,
    prompt: Prompt,
    cursor: CellIndex,
    screen: Rect,
    quit: bool,
}

impl App {
    pub fn new(client: GridClient<TerminalCells>, screen: Rect) -> Self {
        let mut app = Self {
            client,
            prompt: Prompt::None,
            cursor: 0,
            screen,
            quit: false,
        };
        app.resize(screen);
        app
    }

    pub fn client(&self) -> &GridClient<TerminalCells> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut GridClient<TerminalCells> {
        &mut self.client
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn resize(&mut self, screen: Rect) {
        self.screen = screen;
        let areas = ScreenAreas::of(screen);
        let inner = areas.grid_inner();
        self.client
            .resize(u32::from(areas.grid.width), u32::from(inner.height));
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            Event::Mouse(mouse) => self.handle_mouse(mouse),
            Event::Resize(width, height) => self.resize(Rect::new(0, 0, width, height)),
            _ => {}
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.quit = true;
            return;
        }
        if self.prompt == Prompt::None {
            self.handle_grid_key(key.code);
            return;
        }
        match key.code {
            KeyCode::Esc => self.prompt = Prompt::None,
            KeyCode::Enter => self.submit_prompt(),
            KeyCode::Backspace => {
                if let Prompt::Jump(buffer) | Prompt::Chat(buffer) = &mut self.prompt {
                    buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Prompt::Jump(buffer) | Prompt::Chat(buffer) = &mut self.prompt {
                    buffer.push(c);
                }
            }
            _ => {}
        }
    }

    fn handle_grid_key(&mut self, code: KeyCode) {
        let columns = self.client.layout().columns() as i64;
        let page = self.client.viewport().visible_rows().max(1) as i64;
        match code {
            KeyCode::Char('q') => self.quit = true,
            KeyCode::Char('g') => self.prompt = Prompt::Jump(String::new()),
            KeyCode::Char('m') => self.prompt = Prompt::Chat(String::new()),
            KeyCode::Char(' ') | KeyCode::Enter => {
                self.client.toggle(self.cursor);
            }
            KeyCode::Left => self.move_cursor(-1),
            KeyCode::Right => self.move_cursor(1),
            KeyCode::Up => self.move_cursor(-columns),
            KeyCode::Down => self.move_cursor(columns),
            KeyCode::PageUp => {
                self.client.scroll_pages(-1);
                self.move_cursor(-page * columns);
            }
            KeyCode::PageDown => {
                self.client.scroll_pages(1);
                self.move_cursor(page * columns);
            }
            KeyCode::Home => {
                self.client.scroll_to_top();
                self.cursor = 0;
            }
            KeyCode::End => {
                self.client.scroll_to_bottom();
                self.cursor = self.client.layout().domain_size().saturating_sub(1);
            }
            _ => {}
        }
    }

    fn move_cursor(&mut self, delta: i64) {
        let last = self.client.layout().domain_size().saturating_sub(1);
        let target = if delta < 0 {
            self.cursor.saturating_sub(delta.unsigned_abs())
        } else {
            self.cursor.saturating_add(delta.unsigned_abs())
        };
        self.cursor = target.min(last);
        self.client.ensure_visible(self.cursor);
    }

    fn submit_prompt(&mut self) {
        match std::mem::replace(&mut self.prompt, Prompt::None) {
            Prompt::Jump(input) => {
                if let Ok(index) = self.client.jump_to(&input) {
                    self.cursor = index;
                }
            }
            Prompt::Chat(input) => {
                if let Err(ChatInputError::TooLong { .. }) = self.client.send_chat(&input) {
                    self.prompt = Prompt::Chat(input);
                }
            }
            Prompt::None => {}
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::ScrollUp => self.client.scroll_rows(-WHEEL_ROWS),
            MouseEventKind::ScrollDown => self.client.scroll_rows(WHEEL_ROWS),
            MouseEventKind::Down(MouseButton::Left) => {
                if let Some(index) = self.cell_at(mouse.column, mouse.row) {
                    self.cursor = index;
                    self.client.toggle(index);
                }
            }
            _ => {}
        }
    }

    fn cell_at(&self, column: u16, row: u16) -> Option<CellIndex> {
        let inner = ScreenAreas::of(self.screen).grid_inner();
        if column < inner.x
            || row < inner.y
            || column >= inner.x + inner.width
            || row >= inner.y + inner.height
        {
            return None;
        }
        let metrics = self.client.layout().metrics();
        let grid_row = self.client.viewport().first_visible_row() + u64::from(row - inner.y);
        let grid_col = u64::from(column - inner.x) / u64::from(metrics.cell_width.max(1));
        self.client.layout().index_at(grid_row, grid_col)
    }

    pub fn draw(&self, frame: &mut Frame) {
        let areas = ScreenAreas::of(frame.area());
        self.draw_header(frame, areas.header);
        self.draw_grid(frame, areas.grid);
        self.draw_chat(frame, areas.chat);
        self.draw_prompt(frame, areas.prompt);
    }

    fn draw_header(&self, frame: &mut Frame, area: Rect) {
        let mirror = self.client.mirror();
        let percent = mirror.progress_percent();
        let mut label = format!(
            "{} of {} checked ({percent:.4}%) | you: {}",
            mirror.total_checked(),
            mirror.domain().size(),
            mirror.own_checked(),
        );
        if !self.client.is_connected() {
            label.push_str(" | offline");
        }
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("tidepool"))
            .gauge_style(Style::default().fg(Color::Cyan))
            .ratio((percent / 100.0).clamp(0.0, 1.0))
            .label(label);
        frame.render_widget(gauge, area);
    }

    fn draw_grid(&self, frame: &mut Frame, area: Rect) {
        let block = Block::default().borders(Borders::ALL);
        let inner = block.inner(area);
        let layout = self.client.layout();
        let cells = self.client.renderer().host();
        let highlighted = self.client.highlighted();
        let first_row = self.client.viewport().first_visible_row();

        let lines: Vec<Line> = (0..u64::from(inner.height))
            .map(|offset| {
                let row = first_row + offset;
                let spans: Vec<Span> = (0..layout.columns())
                    .map_while(|col| layout.index_at(row, col))
                    .map(|index| {
                        let (glyph, mut style) = match cells.get(index) {
                            Some(true) => ("[x] ", Style::default().fg(Color::Green)),
                            Some(false) => ("[ ] ", Style::default()),
                            None => ("[.] ", Style::default().add_modifier(Modifier::DIM)),
                        };
                        if Some(index) == highlighted {
                            style = style.bg(Color::Yellow).fg(Color::Black);
                        }
                        if index == self.cursor {
                            style = style.add_modifier(Modifier::REVERSED);
                        }
                        Span::styled(glyph, style)
                    })
                    .collect();
                Line::from(spans)
            })
            .collect();

        let title = format!("cell {} of {}", self.cursor + 1, layout.domain_size());
        frame.render_widget(Paragraph::new(lines).block(block.title(title)), area);
    }

    fn draw_chat(&self, frame: &mut Frame, area: Rect) {
        let visible = usize::from(area.height.saturating_sub(2));
        let log = self.client.chat();
        let lines: Vec<Line> = log
            .lines()
            .skip(log.len().saturating_sub(visible))
            .map(|line| match line {
                ChatLine::Message { from, text } => Line::from(vec![
                    Span::styled(format!("{from}: "), Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw(text.clone()),
                ]),
                ChatLine::Notice(text) => {
                    Line::styled(text.clone(), Style::default().add_modifier(Modifier::ITALIC))
                }
            })
            .collect();
        let block = Block::default().borders(Borders::ALL).title("chat");
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn draw_prompt(&self, frame: &mut Frame, area: Rect) {
        let text = match &self.prompt {
            Prompt::None => self.client.status().map(str::to_string).unwrap_or_else(|| {
                "arrows move | space toggle | g jump | m chat | q quit".to_string()
            }),
            Prompt::Jump(input) => format!("Jump to cell (1-{}): {input}", self.client.layout().domain_size()),
            Prompt::Chat(input) => format!(
                "Say ({}/{}): {input}",
                chat_len(input),
                self.client.max_chat_len()
            ),
        };
        let block = Block::default().borders(Borders::ALL);
        frame.render_widget(Paragraph::new(text).block(block), area);
    }
}

/// Raw mode plus alternate screen for as long as it lives.
struct TerminalSession {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalSession {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
            .context("failed to enter alternate screen")?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.clear()?;
        Ok(Self { terminal })
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Err(err) = disable_raw_mode() {
            warn!(error = %err, "failed to disable raw mode");
        }
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        );
        let _ = self.terminal.show_cursor();
    }
}

pub async fn run(config: AppConfig) -> Result<()> {
    let (width, height) = crossterm::terminal::size().context("failed to query terminal size")?;
    let screen = Rect::new(0, 0, width, height);
    let client = GridClient::new(config.client.clone(), TerminalCells::default(), 0, 0)
        .context("invalid grid configuration")?;
    let mut app = App::new(client, screen);

    let mut session = TerminalSession::enter()?;
    let mut connection = Connection::spawn(config.url.clone(), Backoff::default());
    let mut clock = FrameClock::new(config.frame);
    let mut events = EventStream::new();
    info!(url = %config.url, "terminal client started");

    while !app.should_quit() {
        tokio::select! {
            _ = clock.tick() => {
                app.client_mut().on_frame(Instant::now());
                session.terminal.draw(|frame| app.draw(frame))?;
            }
            event = connection.recv() => match event {
                Some(event) => app.client_mut().on_connection_event(event),
                None => bail!("connection task stopped"),
            },
            event = events.next() => match event {
                Some(Ok(event)) => app.handle_event(event),
                Some(Err(err)) => return Err(err).context("failed to read terminal event"),
                None => break,
            },
        }
        for message in app.client_mut().drain_outbox() {
            connection.send(message);
        }
    }
    info!("terminal client exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use ratatui::backend::TestBackend;
    use tidepool_core::{ClientMessage, InitialState, ServerMessage};

    use super::*;
    use crate::{
        layout::GridMetrics,
        reactor::ClientConfig,
        viewport::ViewportConfig,
    };

    fn app(domain: u64) -> App {
        let metrics = GridMetrics::terminal();
        let config = ClientConfig {
            expected_domain_size: domain,
            chunk_size: 100,
            render_batch: 10_000,
            viewport: ViewportConfig {
                row_height: metrics.row_height,
                buffer_rows: 1,
            },
            metrics,
            max_chat_len: 100,
        };
        let client = GridClient::new(config, TerminalCells::default(), 0, 0).unwrap();
        // 42 wide: 10 columns; 30 tall: 14 grid rows inside the border.
        App::new(client, Rect::new(0, 0, 42, 30))
    }

    fn press(app: &mut App, code: KeyCode) {
        app.handle_event(Event::Key(KeyEvent::new(code, KeyModifiers::NONE)));
    }

    fn connect(app: &mut App, domain: u64) {
        app.client_mut().on_connected();
        app.client_mut()
            .on_server_message(ServerMessage::InitialState(InitialState {
                count_true: 0,
                domain_size: domain,
                checked_boxes: None,
            }));
        app.client_mut().on_frame(Instant::now());
        let _: Vec<ClientMessage> = app.client_mut().drain_outbox().collect();
    }

    #[test_timeout::timeout]
    fn geometry_follows_the_screen() {
        let app = app(1_000);
        assert_eq!(app.client().layout().columns(), 10);
        assert_eq!(app.client().viewport().visible_rows(), 14);
    }

    #[test_timeout::timeout]
    fn jump_prompt_moves_the_cursor() {
        let mut app = app(1_000);
        press(&mut app, KeyCode::Char('g'));
        for c in "205".chars() {
            press(&mut app, KeyCode::Char(c));
        }
        press(&mut app, KeyCode::Enter);
        assert_eq!(app.cursor, 204);
        assert_eq!(app.prompt, Prompt::None);
        assert_eq!(app.client().viewport().first_visible_row(), 20);
    }

    #[test_timeout::timeout]
    fn space_toggles_the_cursor_cell() {
        let mut app = app(1_000);
        connect(&mut app, 1_000);
        press(&mut app, KeyCode::Right);
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char(' '));
        assert!(app.client().mirror().is_checked(11));
        assert_eq!(
            app.client_mut().drain_outbox().collect::<Vec<_>>(),
            vec![ClientMessage::CheckboxUpdate(
                tidepool_core::CheckboxUpdate::request(11, true)
            )]
        );
    }

    #[test_timeout::timeout]
    fn left_click_toggles_the_clicked_cell() {
        let mut app = app(1_000);
        connect(&mut app, 1_000);
        // Grid border starts at row 3, so row 5 is grid row 1; column 9 is cell 2.
        app.handle_event(Event::Mouse(MouseEvent {
            kind: MouseEventKind::Down(MouseButton::Left),
            column: 9,
            row: 5,
            modifiers: KeyModifiers::NONE,
        }));
        assert_eq!(app.cursor, 12);
        assert!(app.client().mirror().is_checked(12));
    }

    #[test_timeout::timeout]
    fn chat_prompt_sends_and_escape_cancels() {
        let mut app = app(100);
        press(&mut app, KeyCode::Char('m'));
        for c in "hey".chars() {
            press(&mut app, KeyCode::Char(c));
        }
        press(&mut app, KeyCode::Enter);
        assert_eq!(
            app.client_mut().drain_outbox().collect::<Vec<_>>(),
            vec![ClientMessage::ChatMessage("hey".into())]
        );

        press(&mut app, KeyCode::Char('m'));
        press(&mut app, KeyCode::Char('x'));
        press(&mut app, KeyCode::Esc);
        assert_eq!(app.prompt, Prompt::None);
        press(&mut app, KeyCode::Char('q'));
        assert!(app.should_quit());
    }

    #[test_timeout::timeout]
    fn draw_shows_checked_cells() {
        let mut app = app(1_000);
        connect(&mut app, 1_000);
        app.client_mut().toggle(0);
        app.client_mut().on_frame(Instant::now());

        let mut terminal = Terminal::new(TestBackend::new(42, 30)).unwrap();
        terminal.draw(|frame| app.draw(frame)).unwrap();
        let rendered: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(rendered.contains("[x]"));
        assert!(rendered.contains("1 of 1000 checked"));
    }
}
