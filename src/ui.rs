use std::collections::{hash_map::DefaultHasher, HashMap, HashSet, VecDeque};
use std::env;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::io::{self, Cursor, Stdout, Write};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::cursor::{MoveTo, Show};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::style::Print;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, window_size, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use rand::rngs::ThreadRng;
use ratatui::backend::CrosstermBackend;
use ratatui::buffer::Buffer;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal};
use tracing::{debug, info, warn};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::config::{SlideshowConfig, UIConfig};
use crate::controller::{Controller, PlayState, Presenter};
use crate::data::FeedSource;
use crate::feed::{Feed, Item};
use crate::media::{self, Picture};

const TICK_RATE: Duration = Duration::from_millis(120);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const TOAST_DURATION: Duration = Duration::from_secs(2);
const NUMERIC_JUMP_TIMEOUT: Duration = Duration::from_millis(800);
const FILMSTRIP_WIDTH: u16 = 34;
const MAX_CACHED_PICTURES: usize = 24;
const KITTY_CHUNK_SIZE: usize = 4096;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub struct Options {
    pub source: Arc<dyn FeedSource>,
    pub loader: Option<media::Loader>,
    pub slideshow: SlideshowConfig,
    pub ui: UIConfig,
    pub poll_interval: Duration,
    pub status_message: String,
}

enum AsyncResponse {
    Feed {
        request_id: u64,
        result: Result<Vec<Item>>,
    },
}

struct Toast {
    message: String,
    until: Instant,
}

enum Slot {
    Loading,
    Ready(Box<Shown>),
    Failed(String),
}

struct Shown {
    picture: Picture,
    halfblocks: Option<((u16, u16), RgbImage)>,
    kitty: Option<KittyImage>,
}

/// What the controller renders into. Holds decoded pictures for recently
/// shown items and everything the next frame needs to know.
struct Stage {
    current: Option<(usize, String)>,
    slots: HashMap<String, Slot>,
    order: VecDeque<String>,
    queued: Vec<Item>,
    degraded: bool,
    toast: Option<Toast>,
    dirty: bool,
}

impl Stage {
    fn new() -> Self {
        Self {
            current: None,
            slots: HashMap::new(),
            order: VecDeque::new(),
            queued: Vec::new(),
            degraded: false,
            toast: None,
            dirty: true,
        }
    }

    fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|(_, id)| id.as_str())
    }

    fn current_slot(&self) -> Option<&Slot> {
        self.current_id().and_then(|id| self.slots.get(id))
    }

    fn take_queued(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.queued)
    }

    fn loaded(&mut self, loaded: media::Loaded) {
        let is_current = self.current_id() == Some(loaded.id.as_str());
        if !is_current && !self.slots.contains_key(&loaded.id) {
            return;
        }
        let slot = match loaded.result {
            Ok(picture) => Slot::Ready(Box::new(Shown {
                picture,
                halfblocks: None,
                kitty: None,
            })),
            Err(err) => Slot::Failed(err.to_string()),
        };
        self.slots.insert(loaded.id.clone(), slot);
        self.remember(&loaded.id);
        if is_current {
            self.dirty = true;
        }
    }

    fn remember(&mut self, id: &str) {
        self.order.retain(|existing| existing != id);
        self.order.push_back(id.to_string());
        while self.order.len() > MAX_CACHED_PICTURES {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.current_id() == Some(oldest.as_str()) {
                self.order.push_back(oldest);
                if self.order.len() <= 1 {
                    break;
                }
                continue;
            }
            self.slots.remove(&oldest);
        }
    }

    fn expire_toast(&mut self, now: Instant) -> bool {
        if self.toast.as_ref().is_some_and(|toast| toast.until <= now) {
            self.toast = None;
            return true;
        }
        false
    }
}

impl Presenter for Stage {
    fn feed_changed(&mut self, feed: &Feed) {
        let ids: HashSet<&str> = feed.items().iter().map(|item| item.id.as_str()).collect();
        self.slots.retain(|id, _| ids.contains(id.as_str()));
        self.order.retain(|id| ids.contains(id.as_str()));
        self.dirty = true;
    }

    fn show(&mut self, index: usize, item: &Item) {
        self.current = Some((index, item.id.clone()));
        let needs_load = match self.slots.get(&item.id) {
            None | Some(Slot::Failed(_)) => true,
            Some(Slot::Loading) | Some(Slot::Ready(_)) => false,
        };
        if needs_load {
            self.slots.insert(item.id.clone(), Slot::Loading);
            self.queued.push(item.clone());
        }
        self.remember(&item.id);
        self.dirty = true;
    }

    fn set_degraded(&mut self, degraded: bool) {
        if self.degraded != degraded {
            self.degraded = degraded;
            self.dirty = true;
        }
    }

    fn notify(&mut self, message: &str) {
        self.toast = Some(Toast {
            message: message.to_string(),
            until: Instant::now() + TOAST_DURATION,
        });
        self.dirty = true;
    }
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= TICK_RATE {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

struct NumericJump {
    value: usize,
    last_input: Instant,
}

/// Wall-clock deadlines for the three recurring jobs.
struct Schedule {
    next_poll: Instant,
    next_slide: Option<Instant>,
    next_idle_check: Instant,
}

#[derive(Clone)]
struct KittyImage {
    id: u32,
    transmit_chunks: Vec<String>,
    transmitted: bool,
    wrap_tmux: bool,
}

impl KittyImage {
    fn ensure_transmitted<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.transmitted {
            return Ok(());
        }
        for chunk in &self.transmit_chunks {
            writer.write_all(chunk.as_bytes())?;
        }
        writer.flush()?;
        self.transmitted = true;
        Ok(())
    }

    fn placement_sequence(&self, cols: u16, rows: u16) -> String {
        let base = format!(
            "\x1b_Ga=p,q=2,C=1,i={},c={},r={};\x1b\\",
            self.id, cols, rows
        );
        if self.wrap_tmux {
            format!("\x1bPtmux;\x1b{base}\x1b\\")
        } else {
            base
        }
    }

    fn delete_sequence_for(id: u32, wrap_tmux: bool) -> String {
        let base = format!("\x1b_Ga=d,q=2,i={id};\x1b\\");
        if wrap_tmux {
            format!("\x1bPtmux;\x1b{}\x1b\\", base)
        } else {
            base
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ActiveKitty {
    image_id: u32,
    col: u16,
    row: u16,
    cols: u16,
    rows: u16,
    wrap_tmux: bool,
}

#[derive(Clone, Copy)]
struct CellMetrics {
    width: f64,
    height: f64,
}

pub struct Model {
    controller: Controller,
    stage: Stage,
    source: Arc<dyn FeedSource>,
    loader: Option<media::Loader>,
    rng: ThreadRng,
    poll_interval: Duration,
    slide_interval: Duration,
    schedule: Schedule,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    next_request_id: u64,
    in_flight: usize,
    status_message: String,
    show_filmstrip: bool,
    time_format: String,
    filmstrip_state: ListState,
    filmstrip_inner: Option<Rect>,
    stage_inner: Option<Rect>,
    numeric_jump: Option<NumericJump>,
    spinner: Spinner,
    kitty_enabled: bool,
    active_kitty: Option<ActiveKitty>,
    needs_redraw: bool,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let now = Instant::now();
        let (response_tx, response_rx) = unbounded();
        Self {
            controller: Controller::new(&opts.slideshow, now),
            stage: Stage::new(),
            source: opts.source,
            loader: opts.loader,
            rng: rand::thread_rng(),
            poll_interval: opts.poll_interval,
            slide_interval: opts.slideshow.slide_interval,
            schedule: Schedule {
                next_poll: now,
                next_slide: None,
                next_idle_check: now + IDLE_CHECK_INTERVAL,
            },
            response_tx,
            response_rx,
            next_request_id: 1,
            in_flight: 0,
            status_message: opts.status_message,
            show_filmstrip: opts.ui.show_filmstrip,
            time_format: opts.ui.time_format,
            filmstrip_state: ListState::default(),
            filmstrip_inner: None,
            stage_inner: None,
            numeric_jump: None,
            spinner: Spinner::new(),
            kitty_enabled: is_kitty_terminal(),
            active_kitty: None,
            needs_redraw: true,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        stdout.execute(EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        let cleanup = self.emit_active_kitty_delete(terminal.backend_mut());
        let restore = restore_terminal(terminal.backend_mut());
        info!(items = self.controller.feed().len(), "slideshow closed");

        result?;
        restore?;
        cleanup.context("ui: remove inline image")
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        loop {
            let now = Instant::now();
            self.run_timers(now);
            self.poll_async();
            self.dispatch_image_loads();

            if self.needs_redraw || self.stage.dirty {
                terminal.draw(|frame| self.draw(frame))?;
                self.flush_inline_image(terminal.backend_mut())?;
                self.needs_redraw = false;
                self.stage.dirty = false;
            }

            let timeout = self
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(TICK_RATE);

            if event::poll(timeout)? {
                let now = Instant::now();
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        self.controller.mark_interaction(now);
                        match self.handle_key(key.code, now) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                            }
                        }
                        self.needs_redraw = true;
                    }
                    Event::Mouse(mouse) => {
                        self.controller.mark_interaction(now);
                        self.handle_mouse(mouse, now);
                    }
                    Event::Resize(_, _) => {
                        self.active_kitty = None;
                        self.needs_redraw = true;
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.schedule.next_poll.min(self.schedule.next_idle_check);
        if let Some(slide) = self.schedule.next_slide {
            deadline = deadline.min(slide);
        }
        deadline
    }

    fn run_timers(&mut self, now: Instant) {
        if now >= self.schedule.next_poll {
            self.request_poll();
            self.schedule.next_poll = now + self.poll_interval;
        }

        if self
            .schedule
            .next_slide
            .is_some_and(|deadline| now >= deadline)
        {
            self.controller.tick_autoplay(&mut self.rng, &mut self.stage);
            self.schedule.next_slide = Some(now + self.slide_interval);
        }

        if now >= self.schedule.next_idle_check {
            self.controller.check_idle(now, &mut self.stage);
            self.schedule.next_idle_check = now + IDLE_CHECK_INTERVAL;
        }

        self.sync_slide_timer(now);

        if self.stage.expire_toast(now) {
            self.needs_redraw = true;
        }

        let loading = self.in_flight > 0
            || matches!(self.stage.current_slot(), Some(Slot::Loading));
        if loading {
            if self.spinner.advance() {
                self.needs_redraw = true;
            }
        } else {
            self.spinner.reset();
        }
    }

    /// Arms the autoplay timer when playback starts and disarms it when it
    /// stops; an armed timer is left alone.
    fn sync_slide_timer(&mut self, now: Instant) {
        let playing = self.controller.state().is_playing() && !self.controller.feed().is_empty();
        match (playing, self.schedule.next_slide) {
            (true, None) => self.schedule.next_slide = Some(now + self.slide_interval),
            (false, Some(_)) => self.schedule.next_slide = None,
            _ => {}
        }
    }

    fn request_poll(&mut self) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.in_flight += 1;
        let source = self.source.clone();
        let tx = self.response_tx.clone();
        debug!(request_id, source = source.describe(), "polling feed");
        thread::spawn(move || {
            let result = source.fetch();
            let _ = tx.send(AsyncResponse::Feed { request_id, result });
        });
    }

    fn poll_async(&mut self) {
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
        }
        if let Some(loader) = &self.loader {
            while let Some(loaded) = loader.try_recv() {
                self.stage.loaded(loaded);
            }
        }
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Feed { request_id, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if let Ok(items) = &result {
                    debug!(request_id, received = items.len(), "feed response");
                }
                self.controller
                    .apply_fetch(result, Instant::now(), &mut self.stage);
                self.sync_slide_timer(Instant::now());
                self.needs_redraw = true;
            }
        }
    }

    fn dispatch_image_loads(&mut self) {
        for item in self.stage.take_queued() {
            match &self.loader {
                Some(loader) => loader.enqueue(item),
                None => {
                    self.stage
                        .slots
                        .insert(item.id.clone(), Slot::Failed("image loading disabled".into()));
                }
            }
        }
    }

    fn handle_key(&mut self, code: KeyCode, now: Instant) -> Result<bool> {
        if !matches!(code, KeyCode::Char(ch) if ch.is_ascii_digit()) {
            self.numeric_jump = None;
        }
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Left | KeyCode::Up | KeyCode::Char('k') => {
                self.controller.prev(now, &mut self.stage);
            }
            KeyCode::Right | KeyCode::Down | KeyCode::Char('j') => {
                self.controller.next(now, &mut self.stage);
            }
            KeyCode::Home => self.controller.select(0, now, &mut self.stage),
            KeyCode::End => {
                let last = self.controller.feed().len().saturating_sub(1);
                self.controller.select(last, now, &mut self.stage);
            }
            KeyCode::Char(' ') => self.controller.toggle_play(now, &mut self.stage),
            KeyCode::Char('l') | KeyCode::Char('L') => {
                self.controller.go_live(now, &mut self.stage)
            }
            KeyCode::Char('r') => {
                self.request_poll();
                self.stage.notify("Refreshing…");
            }
            KeyCode::Char('f') => {
                self.show_filmstrip = !self.show_filmstrip;
                self.active_kitty = None;
            }
            KeyCode::Char(ch) if ch.is_ascii_digit() => self.numeric_select(ch, now),
            _ => {}
        }
        self.sync_slide_timer(now);
        Ok(false)
    }

    fn numeric_select(&mut self, ch: char, now: Instant) {
        let digit = ch.to_digit(10).unwrap_or(0) as usize;
        let (base, continuing) = match &self.numeric_jump {
            Some(jump) if now.duration_since(jump.last_input) <= NUMERIC_JUMP_TIMEOUT => {
                (jump.value, true)
            }
            _ => (0, false),
        };
        let value = if continuing {
            base.saturating_mul(10).saturating_add(digit)
        } else if digit == 0 {
            10
        } else {
            digit
        };
        self.numeric_jump = Some(NumericJump {
            value,
            last_input: now,
        });

        let len = self.controller.feed().len();
        if len == 0 {
            self.status_message = "No photos loaded yet.".to_string();
            return;
        }
        let target = value.saturating_sub(1);
        if target >= len {
            self.status_message = format!(
                "Only {} photo{} loaded right now.",
                len,
                if len == 1 { " is" } else { "s are" }
            );
            return;
        }
        self.controller.select(target, now, &mut self.stage);
        self.status_message = format!("Jumped to photo #{}.", value);
    }

    fn handle_mouse(&mut self, event: MouseEvent, now: Instant) {
        match event.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                let Some(inner) = self.filmstrip_inner else {
                    return;
                };
                if !self.show_filmstrip {
                    return;
                }
                if let Some(index) = filmstrip_hit(
                    inner,
                    self.filmstrip_state.offset(),
                    event.column,
                    event.row,
                    self.controller.feed().len(),
                ) {
                    self.controller.select(index, now, &mut self.stage);
                    self.sync_slide_timer(now);
                    self.needs_redraw = true;
                }
            }
            MouseEventKind::ScrollDown => {
                self.controller.next(now, &mut self.stage);
                self.sync_slide_timer(now);
            }
            MouseEventKind::ScrollUp => {
                self.controller.prev(now, &mut self.stage);
                self.sync_slide_timer(now);
            }
            _ => {}
        }
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(2),
                Constraint::Length(1),
            ])
            .split(full);

        frame.render_widget(Paragraph::new(self.header_line()), layout[0]);

        let body = if self.show_filmstrip && layout[1].width > FILMSTRIP_WIDTH * 2 {
            let chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Min(10), Constraint::Length(FILMSTRIP_WIDTH)])
                .split(layout[1]);
            self.draw_filmstrip(frame, chunks[1]);
            chunks[0]
        } else {
            self.filmstrip_inner = None;
            layout[1]
        };
        self.draw_stage(frame, body);

        frame.render_widget(Paragraph::new(self.caption_lines()), layout[2]);

        let footer = Paragraph::new(
            "←/→ prev/next · space play/pause · l live · r refresh · f filmstrip · q quit",
        )
        .style(
            Style::default()
                .fg(COLOR_TEXT_SECONDARY)
                .bg(COLOR_PANEL_BG)
                .add_modifier(Modifier::ITALIC),
        )
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });
        frame.render_widget(footer, layout[3]);

        if let Some(toast) = &self.stage.toast {
            let width = (toast.message.width() as u16 + 4).min(full.width);
            let area = Rect {
                x: full.x + full.width.saturating_sub(width) / 2,
                y: layout[1].y + layout[1].height.saturating_sub(3),
                width,
                height: 3.min(full.height),
            };
            frame.render_widget(Clear, area);
            let toast = Paragraph::new(toast.message.as_str())
                .alignment(Alignment::Center)
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(COLOR_ACCENT))
                        .style(Style::default().bg(COLOR_PANEL_FOCUSED_BG).fg(COLOR_TEXT_PRIMARY)),
                );
            frame.render_widget(toast, area);
        }
    }

    fn header_line(&self) -> Line<'static> {
        let state = self.controller.state();
        let badge_color = match state {
            PlayState::Live => COLOR_SUCCESS,
            PlayState::Sequential => COLOR_ACCENT,
            PlayState::Paused => COLOR_TEXT_SECONDARY,
        };
        let bar = Style::default().bg(COLOR_PANEL_FOCUSED_BG).fg(COLOR_TEXT_PRIMARY);
        let mut spans = vec![
            Span::styled(" slidefeed ", bar.add_modifier(Modifier::BOLD)),
            Span::styled(
                format!(" {} ", state.label()),
                Style::default()
                    .bg(badge_color)
                    .fg(COLOR_BG)
                    .add_modifier(Modifier::BOLD),
            ),
        ];
        if self.stage.degraded {
            spans.push(Span::raw(" "));
            spans.push(Span::styled(
                " OFFLINE ",
                Style::default()
                    .bg(COLOR_ERROR)
                    .fg(COLOR_BG)
                    .add_modifier(Modifier::BOLD),
            ));
        }
        let len = self.controller.feed().len();
        let position = if len == 0 {
            " 0/0 ".to_string()
        } else {
            format!(" {}/{} ", self.controller.index() + 1, len)
        };
        spans.push(Span::styled(position, bar));
        let status = if self.in_flight > 0 {
            format!(" {} {}", self.spinner.frame(), self.status_message)
        } else {
            format!(" {}", self.status_message)
        };
        spans.push(Span::styled(status, Style::default().fg(COLOR_TEXT_SECONDARY)));
        Line::from(spans)
    }

    fn caption_lines(&self) -> Vec<Line<'static>> {
        let Some(item) = self.controller.current() else {
            return vec![Line::from(Span::styled(
                "Waiting for photos…",
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ))];
        };
        let when = format_created(item, &self.time_format);
        let mut detail = vec![Span::styled(when, Style::default().fg(COLOR_TEXT_SECONDARY))];
        if let Some(qr) = item.qr_code_url.as_deref().filter(|url| !url.is_empty()) {
            detail.push(Span::raw("  "));
            detail.push(Span::styled(
                format!("QR: {qr}"),
                Style::default().fg(COLOR_ACCENT),
            ));
        }
        vec![
            Line::from(Span::styled(
                item.display_name().to_string(),
                Style::default()
                    .fg(COLOR_TEXT_PRIMARY)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(detail),
        ]
    }

    fn draw_filmstrip(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = panel_block("Filmstrip");
        let inner = block.inner(area);
        self.filmstrip_inner = Some(inner);

        let width = inner.width as usize;
        let items: Vec<ListItem> = self
            .controller
            .feed()
            .items()
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let label = format!("{:>3} {}", index + 1, item.display_name());
                ListItem::new(Line::from(truncate_to_width(&label, width)))
            })
            .collect();

        let selected = (!self.controller.feed().is_empty()).then(|| self.controller.index());
        self.filmstrip_state.select(selected);
        let list = List::new(items)
            .block(block)
            .style(Style::default().fg(COLOR_TEXT_PRIMARY))
            .highlight_style(
                Style::default()
                    .bg(COLOR_PANEL_SELECTED_BG)
                    .fg(COLOR_ACCENT)
                    .add_modifier(Modifier::BOLD),
            );
        frame.render_stateful_widget(list, area, &mut self.filmstrip_state);
    }

    fn draw_stage(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = panel_block("Photo");
        let inner = block.inner(area);
        frame.render_widget(block, area);
        if self.stage_inner != Some(inner) {
            self.active_kitty = None;
        }
        self.stage_inner = Some(inner);

        let message = match self.stage.current.clone() {
            None if self.stage.degraded => "Feed unreachable, retrying…".to_string(),
            None => format!("{} Waiting for photos…", self.spinner.frame()),
            Some((_, id)) => match self.stage.slots.get_mut(&id) {
                None | Some(Slot::Loading) => format!("{} Loading…", self.spinner.frame()),
                Some(Slot::Failed(_)) => "Failed to load image".to_string(),
                Some(Slot::Ready(shown)) => {
                    if !self.kitty_enabled {
                        let size = (inner.width, inner.height);
                        if shown.halfblocks.as_ref().map(|(cached, _)| *cached) != Some(size) {
                            let pixels = scale_for_halfblocks(&shown.picture.image, size.0, size.1);
                            shown.halfblocks = Some((size, pixels));
                        }
                        if let Some((_, pixels)) = &shown.halfblocks {
                            frame.render_widget(HalfBlocks { pixels }, inner);
                        }
                    }
                    return;
                }
            },
        };

        let vertical_pad = inner.height.saturating_sub(1) / 2;
        let placeholder_area = Rect {
            y: inner.y + vertical_pad,
            height: inner.height.saturating_sub(vertical_pad).min(1),
            ..inner
        };
        frame.render_widget(
            Paragraph::new(message)
                .alignment(Alignment::Center)
                .style(Style::default().fg(COLOR_TEXT_SECONDARY)),
            placeholder_area,
        );
    }

    fn flush_inline_image(&mut self, backend: &mut CrosstermBackend<Stdout>) -> Result<()> {
        if !self.kitty_enabled {
            return Ok(());
        }
        let Some(inner) = self.stage_inner else {
            return self.emit_active_kitty_delete(backend);
        };
        let Some(id) = self.stage.current_id().map(str::to_owned) else {
            return self.emit_active_kitty_delete(backend);
        };
        let Some(Slot::Ready(shown)) = self.stage.slots.get_mut(&id) else {
            return self.emit_active_kitty_delete(backend);
        };

        let image = &shown.picture.image;
        let (cols, rows) = fit_cells(
            image.width(),
            image.height(),
            inner.width,
            inner.height,
            terminal_cell_metrics(),
        );
        let image_id = kitty_image_id(&id);
        let wrap_tmux = tmux_passthrough_enabled();
        let wanted = ActiveKitty {
            image_id,
            col: inner.x + inner.width.saturating_sub(cols) / 2,
            row: inner.y + inner.height.saturating_sub(rows) / 2,
            cols,
            rows,
            wrap_tmux,
        };
        if self.active_kitty == Some(wanted) {
            return Ok(());
        }

        if shown.kitty.is_none() {
            match kitty_transmit_inline(image, image_id) {
                Ok(kitty) => shown.kitty = Some(kitty),
                Err(err) => {
                    warn!(id = id.as_str(), error = %format!("{err:#}"), "kitty encode failed");
                    self.stage.slots.insert(id, Slot::Failed(err.to_string()));
                    self.stage.dirty = true;
                    return Ok(());
                }
            }
        }
        let Some(kitty) = shown.kitty.as_mut() else {
            return Ok(());
        };

        if let Some(active) = self.active_kitty.take() {
            let sequence = KittyImage::delete_sequence_for(active.image_id, active.wrap_tmux);
            crossterm::queue!(backend, Print(sequence))?;
        }
        kitty.ensure_transmitted(backend)?;
        let sequence = kitty.placement_sequence(cols, rows);
        crossterm::queue!(backend, MoveTo(wanted.col, wanted.row), Print(sequence))?;
        backend.flush()?;
        self.active_kitty = Some(wanted);
        Ok(())
    }

    fn emit_active_kitty_delete(&mut self, backend: &mut CrosstermBackend<Stdout>) -> Result<()> {
        if let Some(active) = self.active_kitty.take() {
            let sequence = KittyImage::delete_sequence_for(active.image_id, active.wrap_tmux);
            crossterm::queue!(backend, Print(sequence))?;
            backend.flush()?;
        }
        Ok(())
    }
}

/// Leaves raw mode and the alternate screen, attempting every step even when
/// an earlier one fails.
fn restore_terminal<W: Write>(out: &mut W) -> Result<()> {
    let raw = disable_raw_mode();
    let mouse = out.execute(DisableMouseCapture).map(|_| ());
    let screen = out.execute(LeaveAlternateScreen).map(|_| ());
    let cursor = out.execute(Show).map(|_| ());
    raw.context("ui: disable raw mode")?;
    mouse.context("ui: disable mouse capture")?;
    screen.context("ui: leave alternate screen")?;
    cursor.context("ui: show cursor")?;
    Ok(())
}

fn panel_block(title: &'static str) -> Block<'static> {
    Block::default()
        .title(Span::styled(
            title,
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(COLOR_BORDER_IDLE))
        .style(Style::default().bg(COLOR_PANEL_BG))
}

fn format_created(item: &Item, time_format: &str) -> String {
    let Some(created) = item.created_at() else {
        return String::new();
    };
    let local = created.with_timezone(&Local);
    let mut out = String::new();
    if write!(out, "{}", local.format(time_format)).is_err() {
        return local.to_rfc3339();
    }
    out
}

fn truncate_to_width(text: &str, width: usize) -> String {
    if text.width() <= width {
        return text.to_string();
    }
    let budget = width.saturating_sub(1);
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
    }
    if width > 0 {
        out.push('…');
    }
    out
}

fn filmstrip_hit(inner: Rect, offset: usize, column: u16, row: u16, len: usize) -> Option<usize> {
    let inside = column >= inner.x
        && column < inner.x + inner.width
        && row >= inner.y
        && row < inner.y + inner.height;
    if !inside {
        return None;
    }
    let index = offset + (row - inner.y) as usize;
    (index < len).then_some(index)
}

/// Draws an RGB image two pixels per cell with the upper half block.
struct HalfBlocks<'a> {
    pixels: &'a RgbImage,
}

impl Widget for HalfBlocks<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let (width, height) = self.pixels.dimensions();
        let cols = width.min(area.width as u32) as u16;
        let rows = height.div_ceil(2).min(area.height as u32) as u16;
        let x0 = area.x + (area.width - cols) / 2;
        let y0 = area.y + (area.height - rows) / 2;
        for row in 0..rows {
            for col in 0..cols {
                let x = col as u32;
                let top_y = row as u32 * 2;
                let top = self.pixels.get_pixel(x, top_y);
                let bottom = if top_y + 1 < height {
                    self.pixels.get_pixel(x, top_y + 1)
                } else {
                    top
                };
                buf.get_mut(x0 + col, y0 + row)
                    .set_char('▀')
                    .set_fg(Color::Rgb(top[0], top[1], top[2]))
                    .set_bg(Color::Rgb(bottom[0], bottom[1], bottom[2]));
            }
        }
    }
}

fn scale_for_halfblocks(image: &DynamicImage, cols: u16, rows: u16) -> RgbImage {
    let width = cols.max(1) as u32;
    let height = rows.max(1) as u32 * 2;
    image.resize(width, height, FilterType::Triangle).to_rgb8()
}

/// Largest cell box with the image's aspect ratio that fits the stage.
fn fit_cells(
    width_px: u32,
    height_px: u32,
    max_cols: u16,
    max_rows: u16,
    metrics: CellMetrics,
) -> (u16, u16) {
    let max_cols_f = max_cols.max(1) as f64;
    let max_rows_f = max_rows.max(1) as f64;
    let native_cols = width_px.max(1) as f64 / metrics.width.max(1.0);
    let native_rows = height_px.max(1) as f64 / metrics.height.max(1.0);
    let scale = (max_cols_f / native_cols).min(max_rows_f / native_rows);
    let cols = (native_cols * scale).floor().clamp(1.0, max_cols_f) as u16;
    let rows = (native_rows * scale).floor().clamp(1.0, max_rows_f) as u16;
    (cols, rows)
}

fn terminal_cell_metrics() -> CellMetrics {
    static METRICS: OnceLock<CellMetrics> = OnceLock::new();
    *METRICS.get_or_init(|| {
        let fallback = CellMetrics {
            width: 8.0,
            height: 16.0,
        };
        match window_size() {
            Ok(size) if size.width > 0 && size.height > 0 && size.columns > 0 && size.rows > 0 => {
                CellMetrics {
                    width: f64::from(size.width) / f64::from(size.columns),
                    height: f64::from(size.height) / f64::from(size.rows),
                }
            }
            _ => fallback,
        }
    })
}

fn kitty_image_id(item_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    item_id.hash(&mut hasher);
    ((hasher.finish() & 0xFFFF_FFFF) as u32).max(1)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("encode photo as png")?;
    Ok(png_bytes)
}

fn kitty_transmit_inline(image: &DynamicImage, image_id: u32) -> Result<KittyImage> {
    let png_data = encode_png(image)?;
    let encoded = general_purpose::STANDARD.encode(&png_data);
    Ok(KittyImage {
        id: image_id,
        transmit_chunks: kitty_chunks(&encoded, image_id, tmux_passthrough_enabled()),
        transmitted: false,
        wrap_tmux: tmux_passthrough_enabled(),
    })
}

fn kitty_chunks(encoded: &str, image_id: u32, wrap_tmux: bool) -> Vec<String> {
    let prefix = if wrap_tmux { "\x1bPtmux;\x1b" } else { "" };
    let suffix = if wrap_tmux { "\x1b\\" } else { "" };

    let mut chunks: Vec<String> = Vec::new();
    let mut offset = 0;
    while offset < encoded.len() {
        let end = usize::min(offset + KITTY_CHUNK_SIZE, encoded.len());
        let more = if end < encoded.len() { 1 } else { 0 };
        let mut out = String::from(prefix);
        if offset == 0 {
            out.push_str(&format!("\x1b_Ga=t,q=2,i={},f=100,m={more};", image_id));
        } else {
            out.push_str(&format!("\x1b_Ga=t,q=2,i={},m={more};", image_id));
        }
        out.push_str(&encoded[offset..end]);
        out.push_str("\x1b\\");
        out.push_str(suffix);
        chunks.push(out);
        offset = end;
    }
    chunks
}

fn env_truthy(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "YES"))
        .unwrap_or(false)
}

fn tmux_passthrough_enabled() -> bool {
    env::var("TMUX").map(|v| !v.is_empty()).unwrap_or(false)
}

fn is_kitty_terminal() -> bool {
    if env_truthy("SLIDEFEED_DISABLE_KITTY") {
        return false;
    }
    if env_truthy("SLIDEFEED_FORCE_KITTY") {
        return true;
    }
    if tmux_passthrough_enabled() {
        return false;
    }
    if env::var("KITTY_WINDOW_ID")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
    {
        return true;
    }
    if env::var("WEZTERM_PANE")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
    {
        return true;
    }
    env::var("TERM")
        .map(|term| {
            let lower = term.to_lowercase();
            lower.contains("kitty") || lower.contains("wezterm")
        })
        .unwrap_or(false)
}
