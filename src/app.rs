use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::data;
use crate::feed::Feed;
use crate::logging;
use crate::media;
use crate::ui;

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub url: Option<String>,
    pub once: bool,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = load_config(&opts)?;
    let cache_dir = cfg
        .media
        .cache_dir
        .clone()
        .or_else(config::default_cache_dir);

    if let Some(dir) = cache_dir.as_deref() {
        if let Err(err) = logging::init(dir) {
            eprintln!("warning: {err:#}");
        }
    }

    let source = data::source_for(&cfg.feed).context("open feed source")?;
    info!(source = source.describe(), "starting slidefeed {}", crate::VERSION);

    if opts.once {
        let stdout = io::stdout();
        return print_once(source.as_ref(), &cfg, &mut stdout.lock());
    }

    let disk_cache = cache_dir.as_deref().and_then(|dir| {
        media::DiskCache::open(dir.join("images"), cfg.media.max_size_bytes)
            .map_err(|err| warn!(error = %format!("{err:#}"), "image cache disabled"))
            .ok()
    });
    let loader = match media::HttpImageResolver::new(&cfg.feed.user_agent, disk_cache) {
        Ok(resolver) => Some(media::Loader::new(Arc::new(resolver), cfg.media.workers)),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "image loading disabled");
            None
        }
    };

    let config_path = opts.config_file.clone().or_else(config::default_path);
    let status_message = format!(
        "Watching {} · config {}",
        source.describe(),
        friendly_path(config_path.as_deref())
    );

    let options = ui::Options {
        source,
        loader,
        slideshow: cfg.slideshow.clone(),
        ui: cfg.ui.clone(),
        poll_interval: cfg.feed.poll_interval,
        status_message,
    };

    let mut model = ui::Model::new(options);
    model.run()
}

fn load_config(opts: &RunOptions) -> Result<Config> {
    let mut cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    if let Some(url) = opts.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        cfg.feed.url = url.to_string();
    }
    Ok(cfg)
}

/// Fetches the feed a single time and prints it newest first, one photo per
/// line: position, id, creation time and name separated by tabs.
pub fn print_once<W: Write>(source: &dyn data::FeedSource, cfg: &Config, out: &mut W) -> Result<()> {
    let items = source
        .fetch()
        .with_context(|| format!("fetch {}", source.describe()))?;
    let mut feed = Feed::new(cfg.slideshow.max_items);
    feed.merge(items);

    writeln!(out, "{} photos from {}", feed.len(), source.describe())?;
    for (index, item) in feed.items().iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            index + 1,
            item.id,
            item.created_time.as_deref().unwrap_or("-"),
            item.display_name()
        )?;
    }
    out.flush()?;
    Ok(())
}

fn friendly_path(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return "~/.config/slidefeed/config.yaml".to_string();
    };
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            let mut display = String::from("~");
            if !stripped.as_os_str().is_empty() {
                display.push_str(&format!("/{}", stripped.display()));
            }
            return display;
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockFeedSource;
    use crate::feed::Item;

    #[test]
    fn print_once_lists_newest_first() {
        let mut older = Item::new("old");
        older.created_time = Some("2024-01-01T00:00:00Z".into());
        older.name = Some("older.jpg".into());
        let mut newer = Item::new("new");
        newer.created_time = Some("2024-06-01T00:00:00Z".into());

        let source = MockFeedSource::new([Ok(vec![older, newer])]);
        let mut out = Vec::new();
        print_once(&source, &Config::default(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "2 photos from mock feed");
        assert!(lines[1].starts_with("1\tnew\t2024-06-01T00:00:00Z\t"));
        assert_eq!(lines[2], "2\told\t2024-01-01T00:00:00Z\tolder.jpg");
    }

    #[test]
    fn print_once_propagates_fetch_errors() {
        let source = MockFeedSource::new([Err(anyhow::anyhow!("offline"))]);
        let mut out = Vec::new();
        let err = print_once(&source, &Config::default(), &mut out).unwrap_err();
        assert!(format!("{err:#}").contains("offline"));
    }

    #[test]
    fn friendly_path_shortens_home() {
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config/slidefeed/config.yaml");
            assert_eq!(friendly_path(Some(&path)), "~/.config/slidefeed/config.yaml");
        }
        assert_eq!(friendly_path(Some(Path::new("/etc/slidefeed.yaml"))), "/etc/slidefeed.yaml");
    }
}
