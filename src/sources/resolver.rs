use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{CatalogLookup, MediaExtractor, SourceKind, Track, TrackMetadata};
use crate::{
    cache::{keys, CacheValue, MusicCache},
    error::ResolveError,
};

/// Result of resolving a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub metadata: TrackMetadata,
    pub stream_url: String,
}

/// Turns a track's raw input into metadata plus a stream reference.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, track: &Track) -> Result<Resolution, ResolveError>;
}

/// Production resolver: extractor runs, fronted by the shared cache.
pub struct TrackResolver {
    extractor: Arc<dyn MediaExtractor>,
    cache: Arc<MusicCache>,
    catalog: Option<Arc<dyn CatalogLookup>>,
}

impl TrackResolver {
    pub fn new(extractor: Arc<dyn MediaExtractor>, cache: Arc<MusicCache>) -> Self {
        Self {
            extractor,
            cache,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogLookup>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// URL resolution: metadata first, then the stream reference.
    async fn resolve_url(
        &self,
        url: &str,
        known: Option<TrackMetadata>,
    ) -> Result<Resolution, ResolveError> {
        let metadata = self.metadata_for(url, known).await?;
        let stream_url = self.stream_url_for(url).await?;
        Ok(Resolution {
            metadata,
            stream_url,
        })
    }

    async fn metadata_for(
        &self,
        url: &str,
        known: Option<TrackMetadata>,
    ) -> Result<TrackMetadata, ResolveError> {
        let key = keys::metadata(url);
        if let Some(CacheValue::Metadata(metadata)) = self.cache.get(&key) {
            debug!("💾 Metadata cache hit: {}", url);
            return Ok(metadata);
        }

        // playlist entries arrive with flat metadata that is good enough to show
        let metadata = match known.filter(|m| !m.title.is_empty()) {
            Some(metadata) => metadata,
            None => self.extractor.extract_metadata(url).await?,
        };
        self.cache.set(key, CacheValue::Metadata(metadata.clone()));
        Ok(metadata)
    }

    async fn stream_url_for(&self, url: &str) -> Result<String, ResolveError> {
        let key = keys::stream(url);
        if let Some(CacheValue::StreamUrl(stream_url)) = self.cache.get(&key) {
            debug!("💾 Stream cache hit: {}", url);
            return Ok(stream_url);
        }

        let stream_url = self.extractor.stream_url(url).await?;
        self.cache.set(key, CacheValue::StreamUrl(stream_url.clone()));
        Ok(stream_url)
    }

    /// Top-1 search; the hit's page URL is cached per normalized query.
    async fn search_hit(&self, query: &str) -> Result<(String, TrackMetadata), ResolveError> {
        let key = keys::search(query);
        if let Some(CacheValue::SearchHit(url)) = self.cache.get(&key) {
            debug!("💾 Search cache hit: {}", query);
            return Ok((url, TrackMetadata::default()));
        }

        let hit = self
            .extractor
            .search(query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoResults(query.to_string()))?;
        self.cache.set(key, CacheValue::SearchHit(hit.url.clone()));
        Ok((hit.url, hit.metadata))
    }

    async fn resolve_search(&self, query: &str) -> Result<Resolution, ResolveError> {
        let (url, flat) = self.search_hit(query).await?;
        info!("🔎 '{}' resolved to {}", query, url);
        self.resolve_url(&url, Some(flat)).await
    }

    async fn resolve_other_streaming(&self, input: &str) -> Result<Resolution, ResolveError> {
        let catalog = self.catalog.as_ref().ok_or_else(|| {
            ResolveError::Unsupported(format!("no catalog configured for {input}"))
        })?;
        let found = catalog.lookup(input).await?;
        let query = found.search_query();
        info!("🎧 Catalog lookup mapped {} to '{}'", input, query);

        let mut resolution = self.resolve_search(&query).await?;
        // catalog names are cleaner than video titles
        resolution.metadata.title = found.title;
        if let Some(artist) = found.artists.into_iter().next() {
            resolution.metadata.artist = Some(artist);
        }
        if found.duration.is_some() {
            resolution.metadata.duration = found.duration;
        }
        Ok(resolution)
    }

    async fn resolve_playlist(&self, url: &str) -> Result<Resolution, ResolveError> {
        let first = self
            .extractor
            .enumerate_playlist(url, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoResults(url.to_string()))?;
        self.resolve_url(&first.url, Some(first.metadata)).await
    }
}

#[async_trait]
impl Resolve for TrackResolver {
    async fn resolve(&self, track: &Track) -> Result<Resolution, ResolveError> {
        let input = track.input().trim();
        match track.kind() {
            SourceKind::CatalogVideo | SourceKind::GenericUrl => {
                self.resolve_url(input, track.metadata()).await
            }
            SourceKind::SearchQuery => self.resolve_search(input).await,
            SourceKind::CatalogPlaylist => self.resolve_playlist(input).await,
            SourceKind::OtherStreaming => self.resolve_other_streaming(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{spotify::CatalogTrack, ytdlp::FlatEntry, ytdlp::MockMediaExtractor};
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn meta(title: &str) -> TrackMetadata {
        TrackMetadata {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn resolver(extractor: MockMediaExtractor) -> TrackResolver {
        TrackResolver::new(Arc::new(extractor), Arc::new(MusicCache::new(64)))
    }

    #[tokio::test]
    async fn url_resolution_populates_and_reuses_cache() {
        let mut extractor = MockMediaExtractor::new();
        extractor
            .expect_extract_metadata()
            .times(1)
            .returning(|_| Ok(meta("Song")));
        extractor
            .expect_stream_url()
            .times(1)
            .returning(|_| Ok("https://cdn/song".to_string()));
        let resolver = resolver(extractor);

        let track = Track::new("https://youtu.be/abc", UserId::new(1));
        let first = resolver.resolve(&track).await.unwrap();
        let again = Track::new("https://youtu.be/abc", UserId::new(2));
        let second = resolver.resolve(&again).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.metadata.title, "Song");
        assert_eq!(resolver.cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn search_resolves_top_hit_like_a_url() {
        let mut extractor = MockMediaExtractor::new();
        extractor
            .expect_search()
            .withf(|query, limit| query == "daft punk" && *limit == 1)
            .times(1)
            .returning(|_, _| {
                Ok(vec![FlatEntry {
                    url: "https://www.youtube.com/watch?v=dp".to_string(),
                    metadata: meta("Around the World"),
                }])
            });
        extractor.expect_extract_metadata().never();
        extractor
            .expect_stream_url()
            .withf(|url| url == "https://www.youtube.com/watch?v=dp")
            .times(1)
            .returning(|_| Ok("https://cdn/dp".to_string()));

        let resolution = resolver(extractor)
            .resolve(&Track::new("daft punk", UserId::new(1)))
            .await
            .unwrap();
        assert_eq!(resolution.metadata.title, "Around the World");
        assert_eq!(resolution.stream_url, "https://cdn/dp");
    }

    #[tokio::test]
    async fn empty_search_is_no_results() {
        let mut extractor = MockMediaExtractor::new();
        extractor.expect_search().returning(|_, _| Ok(Vec::new()));
        let err = resolver(extractor)
            .resolve(&Track::new("zzzz qqqq", UserId::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoResults(_)));
    }

    #[tokio::test]
    async fn other_streaming_needs_a_catalog() {
        let err = resolver(MockMediaExtractor::new())
            .resolve(&Track::new("https://open.spotify.com/track/abc", UserId::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unsupported(_)));
    }

    struct FixedCatalog;

    #[async_trait]
    impl CatalogLookup for FixedCatalog {
        async fn lookup(&self, _input: &str) -> Result<CatalogTrack, ResolveError> {
            Ok(CatalogTrack {
                title: "One More Time".into(),
                artists: vec!["Daft Punk".into()],
                duration: Some(std::time::Duration::from_secs(320)),
                external_id: None,
            })
        }

        async fn search(&self, query: &str) -> Result<CatalogTrack, ResolveError> {
            Err(ResolveError::NoResults(query.to_string()))
        }
    }

    #[tokio::test]
    async fn catalog_lookup_builds_the_search_query() {
        let mut extractor = MockMediaExtractor::new();
        extractor
            .expect_search()
            .withf(|query, _| query == "Daft Punk - One More Time")
            .returning(|_, _| {
                Ok(vec![FlatEntry {
                    url: "https://www.youtube.com/watch?v=omt".to_string(),
                    metadata: meta("Daft Punk - One More Time (Official Video)"),
                }])
            });
        extractor
            .expect_stream_url()
            .returning(|_| Ok("https://cdn/omt".to_string()));

        let resolver = resolver(extractor).with_catalog(Arc::new(FixedCatalog));
        let resolution = resolver
            .resolve(&Track::new("https://open.spotify.com/track/abc", UserId::new(1)))
            .await
            .unwrap();
        assert_eq!(resolution.metadata.title, "One More Time");
        assert_eq!(resolution.metadata.artist.as_deref(), Some("Daft Punk"));
    }
}
