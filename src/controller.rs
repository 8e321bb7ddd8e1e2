//! Slideshow state machine.
//!
//! The controller owns the merged [`Feed`] and the viewing position. It never
//! touches the terminal: everything it wants shown goes through a
//! [`Presenter`], time is passed in as an [`Instant`], and randomness comes
//! from the caller's [`Rng`]. The UI event loop decides *when* to call it.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SlideshowConfig;
use crate::feed::{Feed, Item};

/// Rendering boundary.
pub trait Presenter {
    /// The feed contents changed; refresh anything listing all items.
    fn feed_changed(&mut self, feed: &Feed);
    /// Show `item`, which sits at `index` in the feed.
    fn show(&mut self, index: usize, item: &Item);
    fn set_degraded(&mut self, degraded: bool);
    fn notify(&mut self, message: &str);
}

/// Playback mode.
///
/// Live playback follows the newest photos and snaps to new arrivals;
/// sequential playback walks the whole feed. Stopping always leaves live
/// mode, so there is no paused-but-live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Live,
    Sequential,
    Paused,
}

impl PlayState {
    pub fn is_live(self) -> bool {
        matches!(self, PlayState::Live)
    }

    pub fn is_playing(self) -> bool {
        !matches!(self, PlayState::Paused)
    }

    pub fn label(self) -> &'static str {
        match self {
            PlayState::Live => "LIVE",
            PlayState::Sequential => "PLAYING",
            PlayState::Paused => "PAUSED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    recent_window: usize,
    random_jump_prob: f64,
    snap_delay: Duration,
    snap_cooldown: Duration,
    idle_timeout: Duration,
}

impl From<&SlideshowConfig> for Tuning {
    fn from(cfg: &SlideshowConfig) -> Self {
        let random_jump_prob = if cfg.random_jump_prob.is_finite() {
            cfg.random_jump_prob.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            recent_window: cfg.recent_window.max(1),
            random_jump_prob,
            snap_delay: cfg.snap_delay,
            snap_cooldown: cfg.snap_cooldown,
            idle_timeout: cfg.idle_timeout,
        }
    }
}

pub struct Controller {
    feed: Feed,
    index: usize,
    state: PlayState,
    tuning: Tuning,
    degraded: bool,
    last_interaction: Instant,
    new_top_at: Option<Instant>,
    last_snap_at: Option<Instant>,
    pending_snap: Option<String>,
}

impl Controller {
    pub fn new(cfg: &SlideshowConfig, now: Instant) -> Self {
        Self {
            feed: Feed::new(cfg.max_items),
            index: 0,
            state: PlayState::Live,
            tuning: Tuning::from(cfg),
            degraded: false,
            last_interaction: now,
            new_top_at: None,
            last_snap_at: None,
            pending_snap: None,
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn current(&self) -> Option<&Item> {
        self.feed.get(self.index)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn pending_snap(&self) -> Option<&str> {
        self.pending_snap.as_deref()
    }

    /// Applies the outcome of one poll.
    pub fn apply_fetch(
        &mut self,
        result: anyhow::Result<Vec<Item>>,
        now: Instant,
        presenter: &mut dyn Presenter,
    ) {
        match result {
            Ok(items) => self.apply_items(items, now, presenter),
            Err(err) => self.apply_failure(&err, presenter),
        }
    }

    pub fn apply_failure(&mut self, err: &anyhow::Error, presenter: &mut dyn Presenter) {
        warn!(error = %format!("{err:#}"), "feed fetch failed");
        self.degraded = true;
        presenter.set_degraded(true);
    }

    pub fn apply_items(&mut self, items: Vec<Item>, now: Instant, presenter: &mut dyn Presenter) {
        self.degraded = false;
        presenter.set_degraded(false);

        let had_items = !self.feed.is_empty();
        let previous_top = self.feed.newest_id().map(str::to_owned);
        let received = items.len();
        self.feed.merge(items);
        debug!(received, retained = self.feed.len(), "merged feed");

        presenter.feed_changed(&self.feed);

        if !had_items && !self.feed.is_empty() {
            self.index = 0;
            self.start_playing();
            self.pending_snap = None;
            info!(items = self.feed.len(), "first photos loaded");
            self.present(presenter);
            return;
        }

        let newest = self.feed.newest_id().map(str::to_owned);
        if self.state.is_live() && newest.is_some() && newest != previous_top {
            self.new_top_at = Some(now);
            self.pending_snap = newest.clone();
        }

        if self.snap_due(newest.as_deref(), now) {
            self.index = 0;
            self.last_snap_at = Some(now);
            self.pending_snap = None;
            info!(id = newest.as_deref().unwrap_or_default(), "snapped to newest photo");
            presenter.notify("New photo");
        } else if self.index >= self.feed.len() {
            self.index = self.feed.len().saturating_sub(1);
        }

        self.present(presenter);
    }

    fn snap_due(&self, newest: Option<&str>, now: Instant) -> bool {
        let pending_matches = self.state.is_live()
            && newest.is_some()
            && self.pending_snap.as_deref() == newest;
        if !pending_matches {
            return false;
        }
        let delay_ok = self
            .new_top_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.tuning.snap_delay);
        let cooldown_ok = self
            .last_snap_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.tuning.snap_cooldown);
        delay_ok && cooldown_ok
    }

    /// Advances one autoplay step. Returns whether the position moved.
    pub fn tick_autoplay<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        presenter: &mut dyn Presenter,
    ) -> bool {
        if !self.state.is_playing() || self.feed.is_empty() {
            return false;
        }
        self.index = match self.state {
            PlayState::Live => self.live_step(rng),
            _ => (self.index + 1) % self.feed.len(),
        };
        self.present(presenter);
        true
    }

    fn live_step<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let len = self.feed.len();
        let window = len.min(self.tuning.recent_window).max(1);

        if len > 1 && rng.gen_bool(self.tuning.random_jump_prob) {
            if len > window {
                return rng.gen_range(window..len);
            }
            let target = rng.gen_range(0..len - 1);
            return if target >= self.index { target + 1 } else { target };
        }

        let current = if self.index >= window { 0 } else { self.index };
        (current + 1) % window
    }

    /// Called once a second. Returns whether live mode was reasserted.
    ///
    /// Past the idle timeout every call forces live mode and index 0 until
    /// the next interaction.
    pub fn check_idle(&mut self, now: Instant, presenter: &mut dyn Presenter) -> bool {
        if now.saturating_duration_since(self.last_interaction) <= self.tuning.idle_timeout {
            return false;
        }
        let was_live = self.state.is_live();
        self.state = PlayState::Live;
        if !self.feed.is_empty() {
            self.index = 0;
            self.present(presenter);
        }
        if !was_live {
            info!("idle timeout reached, resuming live mode");
            presenter.notify("Live");
        }
        true
    }

    pub fn mark_interaction(&mut self, now: Instant) {
        self.last_interaction = now;
    }

    pub fn next(&mut self, now: Instant, presenter: &mut dyn Presenter) {
        if !self.feed.is_empty() {
            self.index = (self.index + 1) % self.feed.len();
            self.present(presenter);
        }
        self.take_manual_control(now);
    }

    pub fn prev(&mut self, now: Instant, presenter: &mut dyn Presenter) {
        if !self.feed.is_empty() {
            let len = self.feed.len();
            self.index = (self.index + len - 1) % len;
            self.present(presenter);
        }
        self.take_manual_control(now);
    }

    /// Jumps to a specific feed position, as when picking from the filmstrip.
    pub fn select(&mut self, index: usize, now: Instant, presenter: &mut dyn Presenter) {
        if index < self.feed.len() {
            self.index = index;
            self.present(presenter);
        }
        self.take_manual_control(now);
    }

    pub fn toggle_play(&mut self, now: Instant, presenter: &mut dyn Presenter) {
        if self.state.is_playing() {
            self.state = PlayState::Paused;
            presenter.notify("Paused");
        } else {
            self.state = PlayState::Live;
            presenter.notify("Live");
        }
        self.mark_interaction(now);
    }

    pub fn go_live(&mut self, now: Instant, presenter: &mut dyn Presenter) {
        self.enter_live(presenter);
        self.mark_interaction(now);
    }

    fn enter_live(&mut self, presenter: &mut dyn Presenter) {
        self.state = PlayState::Live;
        if !self.feed.is_empty() {
            self.index = 0;
            self.present(presenter);
        }
        presenter.notify("Live");
    }

    fn take_manual_control(&mut self, now: Instant) {
        self.state = PlayState::Paused;
        self.mark_interaction(now);
    }

    fn start_playing(&mut self) {
        if self.state == PlayState::Paused {
            self.state = PlayState::Sequential;
        }
    }

    fn present(&self, presenter: &mut dyn Presenter) {
        if let Some(item) = self.feed.get(self.index) {
            presenter.show(self.index, item);
        }
    }
}
