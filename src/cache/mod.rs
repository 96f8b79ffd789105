//! # Cache Module
//!
//! Process-wide cache shared by every session and every resolution worker.
//!
//! Resolving a track means running the extractor at least twice (metadata,
//! then a stream reference), and search queries add a third run. The cache
//! keeps the results of those runs so repeated requests for the same input
//! skip the external process entirely.
//!
//! ## Features
//!
//! - **LRU Eviction**: capacity-bounded, least recently *accessed* entry goes first
//! - **TTL Support**: per-entry absolute expiry, checked on access and by a sweeper
//! - **Thread Safety**: one lock per cache, safe from any task or thread
//! - **Metrics**: hit/miss/eviction counters via [`LRUCache::stats`]
//!
//! ## Keys
//!
//! Keys are namespaced strings built with [`keys`]:
//!
//! - `meta:<url>` → [`CacheValue::Metadata`]
//! - `stream:<url>` → [`CacheValue::StreamUrl`]
//! - `search:<query>` → [`CacheValue::SearchHit`]
//!
//! ## Example Usage
//!
//! ```rust
//! use voicecast::cache::{keys, CacheValue, MusicCache};
//! use std::time::Duration;
//!
//! let cache = MusicCache::with_ttl(100, Some(Duration::from_secs(3600)));
//! cache.set(keys::stream("https://youtu.be/abc"), CacheValue::StreamUrl("https://cdn/abc".into()));
//!
//! assert!(cache.get(&keys::stream("https://youtu.be/abc")).is_some());
//! ```

pub mod lru_cache;

pub use lru_cache::{CacheStats, LRUCache};

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sources::TrackMetadata;

/// Primary cache for resolution results.
pub type MusicCache = LRUCache<String, CacheValue>;

/// Cached payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Extracted metadata for a URL.
    Metadata(TrackMetadata),
    /// Direct media URL returned by the extractor.
    StreamUrl(String),
    /// Canonical page URL of the top search result for a query.
    SearchHit(String),
}

/// Cache key builders.
pub mod keys {
    pub fn metadata(url: &str) -> String {
        format!("meta:{url}")
    }

    pub fn stream(url: &str) -> String {
        format!("stream:{url}")
    }

    pub fn search(query: &str) -> String {
        format!("search:{}", query.trim().to_lowercase())
    }
}

impl MusicCache {
    /// Performs cache maintenance by removing expired entries.
    ///
    /// Called periodically by the sweeper so expired entries do not hold
    /// capacity until someone happens to read them.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }

    /// Spawns the background sweeper. It stops when `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.cleanup_old_entries(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_keys_are_normalized() {
        assert_eq!(keys::search("  Daft Punk "), keys::search("daft punk"));
        assert_ne!(keys::metadata("x"), keys::stream("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let cache = Arc::new(MusicCache::new(4));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
