// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Blocking URL-or-file fetch with a short-lived download cache.
//!
//! Sandbox threads are plain OS threads, so fetches issued from guest code
//! (`fetch`, `importScripts`, WASM module downloads) block the calling
//! thread directly. Dispatch code running on the async runtime must wrap
//! calls through [`Fetcher`] in `spawn_blocking`.
//!
//! The cache exists for one burst pattern: a script that `importScripts`
//! the same URL from several sandboxes in quick succession. Entries are
//! evicted roughly [`CACHE_TTL`] after their last use, so the cache holds
//! nothing in steady state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// How long an unused cache entry survives.
pub const CACHE_TTL: Duration = Duration::from_millis(500);

/// Errors raised while downloading a resource on behalf of a sandbox.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Could not read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Seam for everything a sandbox downloads.
///
/// Production uses [`CachingFetcher`]; tests substitute a canned
/// implementation so no sandbox test touches the network.
pub trait Fetcher: Send + Sync {
    /// Downloads `url` and returns the response body.
    fn fetch_bytes(&self, url: &str) -> Result<Arc<Vec<u8>>, FetchError>;

    /// Downloads `url` and returns the body as UTF-8 text.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; scripts served with
    /// stray bytes still evaluate up to the damage.
    fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

struct CacheEntry {
    body: Arc<Vec<u8>>,
    last_used: Instant,
}

/// Byte cache keyed by URL with touch-based eviction.
///
/// Every access first sweeps entries whose last use is older than the TTL,
/// then refreshes the hit entry. There is no background task; an idle
/// cache simply holds stale entries until the next access sweeps them.
pub struct FileCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached body for `url`, or stores and returns the result
    /// of `load`. Failed loads are not cached.
    pub fn get_or_load<E>(
        &self,
        url: &str,
        load: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Arc<Vec<u8>>, E> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| now.duration_since(entry.last_used) < self.ttl);

        if let Some(entry) = entries.get_mut(url) {
            debug!("Download cache hit for {}", url);
            entry.last_used = now;
            return Ok(Arc::clone(&entry.body));
        }

        let body = Arc::new(load()?);
        entries.insert(
            url.to_owned(),
            CacheEntry {
                body: Arc::clone(&body),
                last_used: now,
            },
        );
        Ok(body)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// The production [`Fetcher`]: a blocking `reqwest` client in front of a
/// [`FileCache`].
pub struct CachingFetcher {
    client: reqwest::blocking::Client,
    cache: FileCache,
}

impl CachingFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            cache: FileCache::new(CACHE_TTL),
        }
    }
}

impl Default for CachingFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for CachingFetcher {
    fn fetch_bytes(&self, url: &str) -> Result<Arc<Vec<u8>>, FetchError> {
        // Anything that is not http(s) is treated as a local path, which is
        // how test-mode scripts and wasm binaries are served.
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return self.cache.get_or_load(url, || {
                std::fs::read(url).map_err(|source| FetchError::File {
                    path: url.to_owned(),
                    source,
                })
            });
        }

        self.cache.get_or_load(url, || {
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|source| FetchError::Transport {
                    url: url.to_owned(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_owned(),
                    status,
                });
            }

            let body = response.bytes().map_err(|source| FetchError::Transport {
                url: url.to_owned(),
                source,
            })?;
            Ok(body.to_vec())
        })
    }
}

/// Resolves a possibly-relative `url` against a worker's base URL.
///
/// Absolute URLs pass through. Root-relative paths replace the base path;
/// other relative paths append to the base's directory. Workers created
/// without a base URL pass relative references through unchanged and the
/// request fails downstream with a transport error.
pub fn resolve_url(base: Option<&str>, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }
    let Some(base) = base else {
        return url.to_owned();
    };

    if let Some(path) = url.strip_prefix('/') {
        // Keep scheme and authority, replace the path.
        let origin_end = base
            .find("://")
            .map(|i| i + 3)
            .and_then(|i| base[i..].find('/').map(|j| i + j))
            .unwrap_or(base.len());
        return format!("{}/{}", &base[..origin_end], path);
    }

    let dir_end = base.rfind('/').map(|i| i + 1).unwrap_or(base.len());
    format!("{}{}", &base[..dir_end], url)
}
