//! Source fetcher with a local cache
//!
//! Downloads package sources concurrently into a disk cache keyed by the
//! URL basename. Cached files are reused unless the caller forces a
//! re-download. Each transfer streams into a `.part` sibling that is only
//! renamed into place on success, so a crash or failed retry never leaves a
//! partial file visible in the cache.

use futures_util::{stream, StreamExt};
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("All {attempts} attempts failed for {url}")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("Cannot derive a cache filename from URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Concurrent, cached source downloader.
pub struct Fetcher {
    cache_dir: PathBuf,
    retry: u32,
    parallel: usize,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>, retry: u32, parallel: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .user_agent(format!("ferrite/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            cache_dir: cache_dir.into(),
            retry: retry.max(1),
            parallel: parallel.max(1),
            client,
        }
    }

    /// Cache location a URL resolves to (its basename inside the cache).
    pub fn cached_path(&self, url: &str) -> Result<PathBuf, FetchError> {
        Ok(self.cache_dir.join(basename(url)?))
    }

    /// Fetch every source of one package, bounded by the parallel budget.
    ///
    /// Returns the cache paths in the same order as `sources`. Fails if any
    /// source exhausts its retries; failed transfers leave no `.part` files
    /// behind.
    pub async fn fetch_all(
        &self,
        package: &str,
        sources: &[String],
        force: bool,
    ) -> Result<Vec<PathBuf>, FetchError> {
        fs::create_dir_all(&self.cache_dir)?;

        let results: Vec<Result<PathBuf, FetchError>> =
            stream::iter(sources.iter().map(|url| self.fetch_one(url, force)))
                .buffer_unordered(self.parallel)
                .collect()
                .await;

        let mut failed = None;
        for result in results {
            if let Err(e) = result {
                warn!("Fetch failure for {}: {}", package, e);
                failed = Some(e);
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }

        // Report paths in source order, not completion order.
        sources.iter().map(|url| self.cached_path(url)).collect()
    }

    /// Fetch one source, honoring the cache.
    async fn fetch_one(&self, url: &str, force: bool) -> Result<PathBuf, FetchError> {
        let dest = self.cached_path(url)?;

        if dest.exists() && !force {
            debug!("Reusing cached {}", dest.display());
            return Ok(dest);
        }

        let part = dest.with_extension(format!(
            "{}.part",
            dest.extension().and_then(|e| e.to_str()).unwrap_or("dl")
        ));

        let mut last_error: Option<FetchError> = None;
        for attempt in 0..self.retry {
            if attempt > 0 {
                let base = Duration::from_secs(2u64.pow(attempt.min(5)));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                warn!(
                    "Retry {}/{} for {} in {:?}",
                    attempt + 1,
                    self.retry,
                    url,
                    base + jitter
                );
                tokio::time::sleep(base + jitter).await;
            }

            match self.transfer(url, &part).await {
                Ok(()) => {
                    fs::rename(&part, &dest)?;
                    info!("Fetched {} -> {}", url, dest.display());
                    return Ok(dest);
                }
                Err(e) => {
                    let _ = fs::remove_file(&part);
                    last_error = Some(e);
                }
            }
        }

        // Never leave a partial file visible after giving up.
        let _ = fs::remove_file(&part);
        Err(last_error.unwrap_or(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: self.retry,
        }))
    }

    /// Single transfer attempt into the `.part` file.
    async fn transfer(&self, url: &str, part: &Path) -> Result<(), FetchError> {
        if let Some(local) = url.strip_prefix("file://") {
            let src = Path::new(local);
            if !src.exists() {
                return Err(FetchError::Download {
                    url: url.to_string(),
                    reason: "local file does not exist".into(),
                });
            }
            fs::copy(src, part)?;
            return Ok(());
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Download {
                url: url.to_string(),
                reason: format!("server returned {}", response.status()),
            });
        }

        let mut file = fs::File::create(part)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            file.write_all(&chunk)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Synchronous entry point for the stage runner, which is serial.
    pub fn fetch_blocking(
        &self,
        package: &str,
        sources: &[String],
        force: bool,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.fetch_all(package, sources, force))
    }

    /// Remove stale `.part` files from the cache (crash hygiene).
    pub fn cleanup_partials(&self) -> Result<usize, FetchError> {
        let mut removed = 0;
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "part") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Last path segment of a URL, without any query string.
fn basename(url: &str) -> Result<String, FetchError> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    if name.is_empty() || name.contains("://") {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }
    Ok(name.to_string())
}
