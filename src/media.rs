use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::DynamicImage;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::blocking::Client;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::feed::Item;

/// Longest edge kept in memory after decoding.
const MAX_DECODED_EDGE: u32 = 1600;
const HIRES_SUFFIX: &str = "=s2000";

static SIZE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)=s\d+$").expect("valid thumbnail size pattern"));

/// Same set `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no image source for this photo")]
    NoCandidates,
    #[error("all {tried} image sources failed (last: {last})")]
    AllFailed { tried: usize, last: String },
}

/// A decoded photo and the source it came from.
#[derive(Clone)]
pub struct Picture {
    pub source: String,
    pub image: Arc<DynamicImage>,
}

/// Turns a feed item into something displayable.
pub trait ImageResolver: Send + Sync {
    fn resolve(&self, item: &Item) -> Result<Picture, ResolveError>;
}

/// Ordered list of URLs worth trying for `item`, best first.
pub fn candidate_urls(item: &Item) -> Vec<String> {
    let mut candidates = Vec::with_capacity(4);
    if let Some(thumb) = item.thumbnail_link.as_deref() {
        candidates.push(hires_thumbnail(thumb));
    }
    if !item.id.is_empty() {
        let id = utf8_percent_encode(&item.id, COMPONENT).to_string();
        candidates.push(format!(
            "https://drive.usercontent.google.com/uc?export=view&id={id}"
        ));
        candidates.push(format!("https://drive.google.com/uc?export=view&id={id}"));
    }
    if let Some(link) = item.web_content_link.as_deref() {
        candidates.push(view_link(link));
    }
    candidates.retain(|url| !url.trim().is_empty());
    candidates
}

fn hires_thumbnail(thumb: &str) -> String {
    let thumb = thumb.trim();
    if thumb.is_empty() {
        return String::new();
    }
    if SIZE_SUFFIX.is_match(thumb) {
        return SIZE_SUFFIX.replace(thumb, HIRES_SUFFIX).into_owned();
    }
    match Url::parse(thumb) {
        Ok(url) => {
            let normalized = url.to_string();
            if SIZE_SUFFIX.is_match(&normalized) {
                normalized
            } else {
                normalized + HIRES_SUFFIX
            }
        }
        Err(_) => thumb.to_string(),
    }
}

fn view_link(link: &str) -> String {
    let Ok(mut url) = Url::parse(link.trim()) else {
        return String::new();
    };
    let mut replaced = false;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            if key != "export" {
                return Some((key.into_owned(), value.into_owned()));
            }
            if replaced {
                return None;
            }
            replaced = true;
            Some((key.into_owned(), "view".to_string()))
        })
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in &pairs {
            query.append_pair(key, value);
        }
        if !replaced {
            query.append_pair("export", "view");
        }
    }
    url.to_string()
}

/// Downloaded image bytes on disk, keyed by the SHA-1 of the source URL.
pub struct DiskCache {
    dir: PathBuf,
    max_size_bytes: u64,
    pruning: Mutex<()>,
}

impl DiskCache {
    pub fn open<P: Into<PathBuf>>(dir: P, max_size_bytes: i64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("media: create cache dir {}", dir.display()))?;
        Ok(Self {
            dir,
            max_size_bytes: max_size_bytes.max(0) as u64,
            pruning: Mutex::new(()),
        })
    }

    fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", sha1_hex(url.as_bytes())))
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(url)).ok()
    }

    pub fn put(&self, url: &str, bytes: &[u8]) -> Result<()> {
        self.prune_for(bytes.len() as u64)?;
        let path = self.path_for(url);
        fs::write(&path, bytes).with_context(|| format!("media: write {}", path.display()))
    }

    /// Removes the least recently written files until `incoming` more bytes fit.
    fn prune_for(&self, incoming: u64) -> Result<()> {
        let _guard = self.pruning.lock();
        let mut entries: Vec<(SystemTime, u64, PathBuf)> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((modified, meta.len(), entry.into_path()))
            })
            .collect();

        let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum::<u64>() + incoming;
        if total <= self.max_size_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(modified, _, _)| *modified);
        for (_, len, path) in entries {
            if total <= self.max_size_bytes {
                break;
            }
            fs::remove_file(&path)
                .with_context(|| format!("media: prune {}", path.display()))?;
            total = total.saturating_sub(len);
        }
        Ok(())
    }
}

/// Fetches candidates over HTTP in order, using the disk cache when present.
pub struct HttpImageResolver {
    client: Client,
    cache: Option<DiskCache>,
}

impl HttpImageResolver {
    pub fn new(user_agent: &str, cache: Option<DiskCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent.to_string())
            .build()
            .context("media: build http client")?;
        Ok(Self { client, cache })
    }

    pub fn resolve_urls(&self, urls: &[String]) -> Result<Picture, ResolveError> {
        let mut last = None;
        for url in urls {
            match self.load(url) {
                Ok(image) => {
                    return Ok(Picture {
                        source: url.clone(),
                        image: Arc::new(image),
                    })
                }
                Err(err) => {
                    debug!(url = url.as_str(), error = %format!("{err:#}"), "image candidate failed");
                    last = Some(format!("{err:#}"));
                }
            }
        }
        match last {
            Some(last) => Err(ResolveError::AllFailed {
                tried: urls.len(),
                last,
            }),
            None => Err(ResolveError::NoCandidates),
        }
    }

    fn load(&self, url: &str) -> Result<DynamicImage> {
        if let Some(bytes) = self.cache.as_ref().and_then(|cache| cache.get(url)) {
            if let Ok(image) = decode(&bytes) {
                return Ok(image);
            }
        }

        let response = self.client.get(url).send().context("media: download")?;
        if !response.status().is_success() {
            return Err(anyhow!("media: request failed: {}", response.status()));
        }
        let bytes = response.bytes().context("media: body")?.to_vec();
        let image = decode(&bytes)?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(url, &bytes) {
                warn!(error = %format!("{err:#}"), "media: cache write failed");
            }
        }
        Ok(image)
    }
}

impl ImageResolver for HttpImageResolver {
    fn resolve(&self, item: &Item) -> Result<Picture, ResolveError> {
        self.resolve_urls(&candidate_urls(item))
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(anyhow!("media: empty body"));
    }
    let image = image::load_from_memory(bytes).context("media: decode image")?;
    if image.width() > MAX_DECODED_EDGE || image.height() > MAX_DECODED_EDGE {
        Ok(image.thumbnail(MAX_DECODED_EDGE, MAX_DECODED_EDGE))
    } else {
        Ok(image)
    }
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub struct Loaded {
    pub id: String,
    pub result: Result<Picture, ResolveError>,
}

struct Inner {
    resolver: Arc<dyn ImageResolver>,
    results: Sender<Loaded>,
}

/// Resolves items on a small worker pool so the UI thread never blocks on
/// image downloads.
pub struct Loader {
    jobs: Sender<Item>,
    stop: Sender<()>,
    results: Receiver<Loaded>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Loader {
    pub fn new(resolver: Arc<dyn ImageResolver>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = unbounded::<Item>();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let (result_tx, result_rx) = unbounded();

        let inner = Arc::new(Inner {
            resolver,
            results: result_tx,
        });

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            handles.push(thread::spawn(move || worker_inner.worker(rx_jobs, rx_stop)));
        }

        Self {
            jobs: job_tx,
            stop: stop_tx,
            results: result_rx,
            handles,
        }
    }

    pub fn enqueue(&self, item: Item) {
        let _ = self.jobs.send(item);
    }

    pub fn try_recv(&self) -> Option<Loaded> {
        self.results.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Loaded> {
        self.results.recv_timeout(timeout).ok()
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Item>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(item) => self.process(item),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, item: Item) {
        let result = self.resolver.resolve(&item);
        if let Err(err) = &result {
            warn!(id = item.id.as_str(), error = %err, "image unavailable");
        }
        let _ = self.results.send(Loaded {
            id: item.id,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, image::Rgb([200, 10, 10])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn candidates_follow_preference_order() {
        let item = Item {
            id: "abc 1".into(),
            thumbnail_link: Some("https://lh3.googleusercontent.com/xyz=s220".into()),
            web_content_link: Some(
                "https://drive.google.com/uc?id=abc&export=download".into(),
            ),
            ..Default::default()
        };
        let urls = candidate_urls(&item);
        assert_eq!(
            urls,
            vec![
                "https://lh3.googleusercontent.com/xyz=s2000".to_string(),
                "https://drive.usercontent.google.com/uc?export=view&id=abc%201".to_string(),
                "https://drive.google.com/uc?export=view&id=abc%201".to_string(),
                "https://drive.google.com/uc?id=abc&export=view".to_string(),
            ]
        );
    }

    #[test]
    fn thumbnail_without_size_gets_suffix() {
        assert_eq!(
            hires_thumbnail("https://lh3.example.com/photo"),
            "https://lh3.example.com/photo=s2000"
        );
        assert_eq!(
            hires_thumbnail("https://lh3.example.com/photo=S64"),
            "https://lh3.example.com/photo=s2000"
        );
        assert_eq!(hires_thumbnail("not a url"), "not a url");
    }

    #[test]
    fn web_content_link_gains_export_view() {
        assert_eq!(
            view_link("https://drive.google.com/uc?id=abc"),
            "https://drive.google.com/uc?id=abc&export=view"
        );
        assert_eq!(view_link("::::"), "");
    }

    #[test]
    fn item_without_links_has_no_candidates() {
        let resolver = HttpImageResolver::new("slidefeed-test", None).unwrap();
        let err = resolver.resolve(&Item::default()).err().unwrap();
        assert!(matches!(err, ResolveError::NoCandidates));
    }

    #[test]
    fn resolver_falls_through_to_next_candidate() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let body = png_bytes();
        let handle = thread::spawn(move || {
            for request in server.incoming_requests().take(2) {
                let response = if request.url().starts_with("/missing") {
                    Response::from_data(Vec::new()).with_status_code(404)
                } else {
                    Response::from_data(body.clone())
                };
                let _ = request.respond(response);
            }
        });

        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1024 * 1024).unwrap();
        let resolver = HttpImageResolver::new("slidefeed-test", Some(cache)).unwrap();
        let urls = vec![
            format!("http://{addr}/missing.jpg"),
            format!("http://{addr}/photo.png"),
        ];
        let picture = resolver.resolve_urls(&urls).ok().unwrap();
        assert_eq!(picture.source, urls[1]);
        assert_eq!(picture.image.width(), 4);
        handle.join().unwrap();

        // Served from disk now that the server is gone.
        let again = resolver.resolve_urls(&urls[1..]).ok().unwrap();
        assert_eq!(again.image.height(), 3);
    }

    #[test]
    fn cache_prunes_oldest_files() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 10).unwrap();
        cache.put("https://a", &[0u8; 6]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cache.put("https://b", &[0u8; 6]).unwrap();
        assert!(cache.get("https://a").is_none());
        assert_eq!(cache.get("https://b").map(|bytes| bytes.len()), Some(6));
    }

    struct Fixed;

    impl ImageResolver for Fixed {
        fn resolve(&self, item: &Item) -> Result<Picture, ResolveError> {
            if item.id == "bad" {
                return Err(ResolveError::AllFailed {
                    tried: 1,
                    last: "boom".into(),
                });
            }
            Ok(Picture {
                source: item.id.clone(),
                image: Arc::new(DynamicImage::new_rgb8(1, 1)),
            })
        }
    }

    #[test]
    fn loader_reports_each_request() {
        let loader = Loader::new(Arc::new(Fixed), 2);
        loader.enqueue(Item::new("good"));
        loader.enqueue(Item::new("bad"));

        let mut seen = Vec::new();
        for _ in 0..2 {
            let loaded = loader.recv_timeout(Duration::from_secs(5)).unwrap();
            seen.push((loaded.id, loaded.result.is_ok()));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![("bad".to_string(), false), ("good".to_string(), true)]
        );
    }
}
