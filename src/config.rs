use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "SLIDEFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub slideshow: SlideshowConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub ui: UIConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// http(s) URL, `file://` URL or a plain path to a local JSON file.
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            poll_interval: default_poll_interval(),
            timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_feed_url() -> String {
    "image-data.json".into()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(7)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_user_agent() -> String {
    format!("slidefeed/{}", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlideshowConfig {
    #[serde(default = "default_slide_interval", with = "humantime_serde")]
    pub slide_interval: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// How many of the newest photos live mode mostly cycles through.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Chance per autoplay tick of jumping to an older photo.
    #[serde(default = "default_random_jump_prob")]
    pub random_jump_prob: f64,
    #[serde(default = "default_snap_delay", with = "humantime_serde")]
    pub snap_delay: Duration,
    #[serde(default = "default_snap_cooldown", with = "humantime_serde")]
    pub snap_cooldown: Duration,
}

impl Default for SlideshowConfig {
    fn default() -> Self {
        Self {
            slide_interval: default_slide_interval(),
            idle_timeout: default_idle_timeout(),
            max_items: default_max_items(),
            recent_window: default_recent_window(),
            random_jump_prob: default_random_jump_prob(),
            snap_delay: default_snap_delay(),
            snap_cooldown: default_snap_cooldown(),
        }
    }
}

fn default_slide_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_max_items() -> usize {
    500
}

fn default_recent_window() -> usize {
    12
}

fn default_random_jump_prob() -> f64 {
    0.2
}

fn default_snap_delay() -> Duration {
    Duration::from_secs(8)
}

fn default_snap_cooldown() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            workers: default_workers(),
        }
    }
}

pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("slidefeed"))
}

fn default_max_size_bytes() -> i64 {
    200 * 1024 * 1024
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_show_filmstrip")]
    pub show_filmstrip: bool,
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            show_filmstrip: default_show_filmstrip(),
            time_format: default_time_format(),
        }
    }
}

fn default_show_filmstrip() -> bool {
    true
}

fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        cfg = read_config_file(path)?;
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);
    sanitize(&mut cfg);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "feed.url" => cfg.feed.url = value,
        "feed.user_agent" => cfg.feed.user_agent = value,
        "feed.poll_interval" => set_duration(&mut cfg.feed.poll_interval, &value),
        "feed.timeout" => set_duration(&mut cfg.feed.timeout, &value),
        "slideshow.slide_interval" => set_duration(&mut cfg.slideshow.slide_interval, &value),
        "slideshow.idle_timeout" => set_duration(&mut cfg.slideshow.idle_timeout, &value),
        "slideshow.snap_delay" => set_duration(&mut cfg.slideshow.snap_delay, &value),
        "slideshow.snap_cooldown" => set_duration(&mut cfg.slideshow.snap_cooldown, &value),
        "slideshow.max_items" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.slideshow.max_items = parsed;
            }
        }
        "slideshow.recent_window" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.slideshow.recent_window = parsed;
            }
        }
        "slideshow.random_jump_prob" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.slideshow.random_jump_prob = parsed;
            }
        }
        "media.cache_dir" => cfg.media.cache_dir = Some(PathBuf::from(value)),
        "media.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.media.max_size_bytes = parsed;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        "ui.show_filmstrip" => {
            cfg.ui.show_filmstrip = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "ui.time_format" => cfg.ui.time_format = value,
        _ => {}
    }
}

fn set_duration(slot: &mut Duration, value: &str) {
    if let Ok(duration) = humantime::parse_duration(value.trim()) {
        *slot = duration;
    }
}

fn sanitize(cfg: &mut Config) {
    if cfg.feed.url.trim().is_empty() {
        cfg.feed.url = default_feed_url();
    }
    if cfg.feed.user_agent.trim().is_empty() {
        cfg.feed.user_agent = default_user_agent();
    }
    if cfg.feed.poll_interval.is_zero() {
        cfg.feed.poll_interval = default_poll_interval();
    }
    if cfg.feed.timeout.is_zero() {
        cfg.feed.timeout = default_request_timeout();
    }

    let show = &mut cfg.slideshow;
    if show.slide_interval.is_zero() {
        show.slide_interval = default_slide_interval();
    }
    if show.idle_timeout.is_zero() {
        show.idle_timeout = default_idle_timeout();
    }
    if show.max_items == 0 {
        show.max_items = default_max_items();
    }
    if show.recent_window == 0 {
        show.recent_window = default_recent_window();
    }
    show.random_jump_prob = if show.random_jump_prob.is_finite() {
        show.random_jump_prob.clamp(0.0, 1.0)
    } else {
        default_random_jump_prob()
    };

    if cfg.media.workers == 0 {
        cfg.media.workers = default_workers();
    }
    if cfg.media.max_size_bytes <= 0 {
        cfg.media.max_size_bytes = default_max_size_bytes();
    }
    if cfg.ui.time_format.trim().is_empty() {
        cfg.ui.time_format = default_time_format();
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("slidefeed").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "{}\n").unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("SLIDEFEED_TEST_DEFAULTS".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.url, "image-data.json");
        assert_eq!(cfg.feed.poll_interval, Duration::from_secs(7));
        assert_eq!(cfg.slideshow.slide_interval, Duration::from_secs(10));
        assert_eq!(cfg.slideshow.idle_timeout, Duration::from_secs(45));
        assert_eq!(cfg.slideshow.max_items, 500);
        assert_eq!(cfg.slideshow.recent_window, 12);
        assert_eq!(cfg.slideshow.snap_delay, Duration::from_secs(8));
        assert_eq!(cfg.slideshow.snap_cooldown, Duration::from_secs(15));
    }

    #[test]
    fn reads_yaml_with_humantime_durations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "feed:\n  url: https://example.com/image-data.json\n  poll_interval: 3s\nslideshow:\n  snap_delay: 1m\n  max_items: 50\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("SLIDEFEED_TEST_YAML".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.url, "https://example.com/image-data.json");
        assert_eq!(cfg.feed.poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.slideshow.snap_delay, Duration::from_secs(60));
        assert_eq!(cfg.slideshow.max_items, 50);
        assert_eq!(cfg.slideshow.recent_window, 12);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = load(LoadOptions {
            config_file: Some(dir.path().join("absent.yaml")),
            env_prefix: Some("SLIDEFEED_TEST_ABSENT".into()),
        });
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "slideshow:\n  recent_window: 4\n").unwrap();
        env::set_var("SLIDEFEED_TEST_ENV_FEED__URL", "https://photos.example/feed.json");
        env::set_var("SLIDEFEED_TEST_ENV_SLIDESHOW__SNAP_COOLDOWN", "30s");
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("SLIDEFEED_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.url, "https://photos.example/feed.json");
        assert_eq!(cfg.slideshow.snap_cooldown, Duration::from_secs(30));
        assert_eq!(cfg.slideshow.recent_window, 4);
        env::remove_var("SLIDEFEED_TEST_ENV_FEED__URL");
        env::remove_var("SLIDEFEED_TEST_ENV_SLIDESHOW__SNAP_COOLDOWN");
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let mut cfg = Config::default();
        cfg.slideshow.random_jump_prob = 4.0;
        cfg.slideshow.recent_window = 0;
        cfg.slideshow.slide_interval = Duration::ZERO;
        cfg.media.workers = 0;
        sanitize(&mut cfg);
        assert_eq!(cfg.slideshow.random_jump_prob, 1.0);
        assert_eq!(cfg.slideshow.recent_window, 12);
        assert_eq!(cfg.slideshow.slide_interval, Duration::from_secs(10));
        assert_eq!(cfg.media.workers, 2);
    }
}
