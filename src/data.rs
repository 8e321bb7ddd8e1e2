use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CACHE_CONTROL, PRAGMA, USER_AGENT};
use url::Url;

use crate::config::FeedConfig;
use crate::feed::Item;

pub trait FeedSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<Item>>;
    fn describe(&self) -> String;
}

pub struct HttpFeedSource {
    http: HttpClient,
    url: String,
    user_agent: String,
}

impl HttpFeedSource {
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        if user_agent.trim().is_empty() {
            bail!("feed: user agent required");
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("feed: build http client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            user_agent: user_agent.to_string(),
        })
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self) -> Result<Vec<Item>> {
        let response = self
            .http
            .get(&self.url)
            .header(USER_AGENT, &self.user_agent)
            .header(CACHE_CONTROL, "no-cache, no-store")
            .header(PRAGMA, "no-cache")
            .send()
            .with_context(|| format!("feed: request {}", self.url))?;

        if !response.status().is_success() {
            bail!("feed: HTTP {}", response.status());
        }

        response
            .json::<Vec<Item>>()
            .context("feed: decode item list")
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads the feed from a JSON file on disk, re-reading it on every poll.
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl FeedSource for FileFeedSource {
    fn fetch(&self) -> Result<Vec<Item>> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("feed: read {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("feed: decode item list from {}", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Picks a source for the configured endpoint: http(s) URLs go over the
/// network, `file://` URLs and bare paths are read from disk.
pub fn source_for(cfg: &FeedConfig) -> Result<Arc<dyn FeedSource>> {
    let endpoint = cfg.url.trim();
    match Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Arc::new(HttpFeedSource::new(
            endpoint,
            &cfg.user_agent,
            cfg.timeout,
        )?)),
        Ok(url) if url.scheme() == "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("feed: invalid file url {endpoint}"))?;
            Ok(Arc::new(FileFeedSource::new(path)))
        }
        // Single-letter schemes are Windows drive prefixes.
        Ok(url) if url.scheme().len() > 1 => bail!("feed: unsupported scheme {}", url.scheme()),
        _ => Ok(Arc::new(FileFeedSource::new(endpoint))),
    }
}

/// Replays a scripted list of poll results; an exhausted script yields
/// empty batches.
#[derive(Default)]
pub struct MockFeedSource {
    script: Mutex<VecDeque<Result<Vec<Item>>>>,
}

impl MockFeedSource {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<Vec<Item>>>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

impl FeedSource for MockFeedSource {
    fn fetch(&self) -> Result<Vec<Item>> {
        self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn describe(&self) -> String {
        "mock feed".into()
    }
}
