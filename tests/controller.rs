use std::time::{Duration, Instant};

use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::SeedableRng;
use slidefeed::config::SlideshowConfig;
use slidefeed::controller::{Controller, PlayState, Presenter};
use slidefeed::data::{FeedSource, MockFeedSource};
use slidefeed::feed::{Feed, Item};

#[derive(Default)]
struct Screen {
    shown: Vec<String>,
    degraded: bool,
    toasts: Vec<String>,
}

impl Presenter for Screen {
    fn feed_changed(&mut self, _feed: &Feed) {}

    fn show(&mut self, _index: usize, item: &Item) {
        self.shown.push(item.id.clone());
    }

    fn set_degraded(&mut self, degraded: bool) {
        self.degraded = degraded;
    }

    fn notify(&mut self, message: &str) {
        self.toasts.push(message.to_string());
    }
}

fn photo(id: &str, minute: u32) -> Item {
    let mut item = Item::new(id);
    item.name = Some(format!("{id}.jpg"));
    item.created_time = Some(format!("2024-05-01T10:{minute:02}:00Z"));
    item
}

#[test]
fn scripted_session_snaps_survives_outage_and_resumes() {
    let cfg = SlideshowConfig::default();
    let source = MockFeedSource::new([
        Ok(vec![photo("1", 3), photo("2", 2), photo("3", 1)]),
        Err(anyhow!("connection refused")),
        Ok(vec![photo("4", 4)]),
    ]);
    let t0 = Instant::now();
    let mut controller = Controller::new(&cfg, t0);
    let mut screen = Screen::default();
    let mut rng = StdRng::seed_from_u64(11);

    controller.apply_fetch(source.fetch(), t0, &mut screen);
    assert_eq!(controller.feed().len(), 3);
    assert_eq!(controller.state(), PlayState::Live);
    assert_eq!(screen.shown.last().map(String::as_str), Some("1"));

    controller.go_live(t0, &mut screen);
    assert!(controller.state().is_live());
    controller.tick_autoplay(&mut rng, &mut screen);

    let t1 = t0 + Duration::from_secs(7);
    controller.apply_fetch(source.fetch(), t1, &mut screen);
    assert!(screen.degraded);
    assert_eq!(controller.feed().len(), 3);

    let t2 = t1 + Duration::from_secs(7);
    controller.apply_fetch(source.fetch(), t2, &mut screen);
    assert!(!screen.degraded);
    assert_eq!(controller.feed().newest_id(), Some("4"));

    let t3 = t2 + cfg.snap_delay + cfg.snap_cooldown;
    controller.apply_fetch(source.fetch(), t3, &mut screen);
    assert_eq!(controller.index(), 0);
    assert_eq!(controller.current().map(|item| item.id.as_str()), Some("4"));

    controller.next(t3, &mut screen);
    assert_eq!(controller.state(), PlayState::Paused);
    assert!(!controller.tick_autoplay(&mut rng, &mut screen));

    let idle = t3 + cfg.idle_timeout + Duration::from_secs(1);
    assert!(controller.check_idle(idle, &mut screen));
    assert_eq!(controller.state(), PlayState::Live);
    assert_eq!(controller.index(), 0);

    controller.tick_autoplay(&mut rng, &mut screen);
    assert!(controller.check_idle(idle + Duration::from_secs(1), &mut screen));
    assert_eq!(controller.index(), 0);
    assert_eq!(controller.state(), PlayState::Live);
}

#[test]
fn overlapping_polls_never_duplicate_photos() {
    let cfg = SlideshowConfig {
        max_items: 5,
        ..SlideshowConfig::default()
    };
    let now = Instant::now();
    let mut controller = Controller::new(&cfg, now);
    let mut screen = Screen::default();

    let first: Vec<Item> = (0..5).map(|n| photo(&n.to_string(), n)).collect();
    let second: Vec<Item> = (3..8).map(|n| photo(&n.to_string(), n)).collect();
    controller.apply_items(first, now, &mut screen);
    controller.apply_items(second, now, &mut screen);

    let ids: Vec<&str> = controller
        .feed()
        .items()
        .iter()
        .map(|item| item.id.as_str())
        .collect();
    assert_eq!(ids, vec!["7", "6", "5", "4", "3"]);
}
