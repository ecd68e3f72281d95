//! Source prefetcher.
//!
//! Server-list sources live at remote URLs but are consumed from local
//! files. A single background loop wakes every minute, refreshes whatever
//! is due and atomically swaps the cached copy. Verification of the
//! fetched content is the consumer's business, not ours.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{ProxyError, Result};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// One mirrored URL and when it next needs fetching.
struct UrlToPrefetch {
    url: String,
    cache_file: PathBuf,
    cache_duration: Duration,
    when: Instant,
}

/// Background mirror of the configured sources.
pub struct Prefetcher {
    urls: Mutex<Vec<UrlToPrefetch>>,
    client: reqwest::Client,
}

impl Prefetcher {
    pub fn new(sources: &[SourceConfig], timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Http(format!("HTTP client: {e}")))?;
        let urls = sources
            .iter()
            .map(|source| UrlToPrefetch {
                url: source.url.clone(),
                cache_file: source.cache_file.clone(),
                cache_duration: source.cache_duration,
                // Anything without a fresh local copy is due immediately.
                when: Instant::now(),
            })
            .collect();
        Ok(Self {
            urls: Mutex::new(urls),
            client,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.urls.lock().is_empty()
    }

    /// Run the refresh loop until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    async fn tick(&self) {
        let now = Instant::now();
        let due: Vec<(usize, String, PathBuf)> = {
            let urls = self.urls.lock();
            urls.iter()
                .enumerate()
                .filter(|(_, u)| u.when <= now)
                .map(|(i, u)| (i, u.url.clone(), u.cache_file.clone()))
                .collect()
        };

        for (index, url, cache_file) in due {
            match self.fetch_to_file(&url, &cache_file).await {
                Ok(len) => debug!("prefetched [{url}] ({len} bytes)"),
                Err(e) => warn!("prefetching [{url}] failed: {e}"),
            }
            // Success and failure reschedule alike; one attempt per tick.
            let mut urls = self.urls.lock();
            if let Some(entry) = urls.get_mut(index) {
                entry.when = Instant::now() + entry.cache_duration;
            }
        }
    }

    /// Download one source and atomically replace its local mirror.
    async fn fetch_to_file(&self, url: &str, cache_file: &PathBuf) -> Result<usize> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProxyError::Http(format!("status {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let tmp = cache_file.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, cache_file).await?;
        Ok(body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str, dir: &std::path::Path) -> SourceConfig {
        SourceConfig {
            url: url.to_string(),
            cache_file: dir.join("servers.md"),
            cache_duration: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn fetches_and_replaces_cache_file() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Minimal HTTP server for one request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = b"## server list";
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(&format!("http://{addr}/list.md"), dir.path())];
        let prefetcher = Prefetcher::new(&sources, Duration::from_secs(5)).unwrap();

        prefetcher.tick().await;
        let contents = std::fs::read_to_string(dir.path().join("servers.md")).unwrap();
        assert_eq!(contents, "## server list");

        // Freshly fetched entries are no longer due; a second tick is a
        // no-op rather than a retry.
        prefetcher.tick().await;
    }

    #[tokio::test]
    async fn failure_reschedules_without_retry_within_tick() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens here; the fetch fails fast.
        let sources = vec![source("http://127.0.0.1:9/unreachable", dir.path())];
        let prefetcher = Prefetcher::new(&sources, Duration::from_millis(300)).unwrap();

        prefetcher.tick().await;
        assert!(!dir.path().join("servers.md").exists());
        let next_due = prefetcher.urls.lock()[0].when;
        assert!(next_due > Instant::now() + Duration::from_secs(3000));
    }
}
