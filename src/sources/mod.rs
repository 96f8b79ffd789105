//! # Sources Module
//!
//! Everything between raw user input and a playable stream reference:
//!
//! - [`track`]: the [`Track`] model and its resolution lifecycle
//! - [`ytdlp`]: the media-extraction process wrapper
//! - [`spotify`]: catalog lookups used to build better search queries
//! - [`resolver`]: source-specific resolution with cache consultation
//! - [`worker_pool`]: the bounded, de-duplicating resolution pool

pub mod resolver;
pub mod spotify;
pub mod track;
pub mod worker_pool;
pub mod ytdlp;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};

pub use resolver::{Resolution, Resolve, TrackResolver};
pub use spotify::{CatalogLookup, CatalogTrack, SpotifyCatalog};
pub use track::{Track, TrackMetadata, TrackSnapshot, TrackStatus};
pub use worker_pool::{PoolStats, Priority, WorkerPool};
pub use ytdlp::{MediaExtractor, YtDlpClient};

static YOUTUBE_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?|embed/|v/|shorts/)|youtu\.be/|music\.youtube\.com/watch\?)",
    )
    .expect("static regex is valid")
});

static YOUTUBE_PLAYLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.|music\.)?youtube\.com/playlist\?(.*&)?list=")
        .expect("static regex is valid")
});

static OTHER_STREAMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(open\.spotify\.com|spotify\.link)/|^spotify:(track|album|playlist):")
        .expect("static regex is valid")
});

/// Where a track's input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// A single video on the primary catalog (YouTube).
    CatalogVideo,
    /// A playlist on the primary catalog.
    CatalogPlaylist,
    /// Any other http(s) URL the extractor may understand.
    GenericUrl,
    /// Free-form search text.
    SearchQuery,
    /// A link to another streaming service, resolved through a catalog lookup.
    OtherStreaming,
}

impl SourceKind {
    /// Classifies raw user input.
    pub fn detect(input: &str) -> Self {
        let input = input.trim();
        if OTHER_STREAMING.is_match(input) {
            SourceKind::OtherStreaming
        } else if YOUTUBE_PLAYLIST.is_match(input) {
            SourceKind::CatalogPlaylist
        } else if YOUTUBE_VIDEO.is_match(input) {
            SourceKind::CatalogVideo
        } else if url::Url::parse(input)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
        {
            SourceKind::GenericUrl
        } else {
            SourceKind::SearchQuery
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::CatalogVideo => "youtube",
            SourceKind::CatalogPlaylist => "youtube_playlist",
            SourceKind::GenericUrl => "direct",
            SourceKind::SearchQuery => "search",
            SourceKind::OtherStreaming => "spotify",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_source_kinds() {
        assert_eq!(
            SourceKind::detect("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            SourceKind::CatalogVideo
        );
        assert_eq!(SourceKind::detect("https://youtu.be/dQw4w9WgXcQ"), SourceKind::CatalogVideo);
        assert_eq!(
            SourceKind::detect("https://music.youtube.com/watch?v=test"),
            SourceKind::CatalogVideo
        );
        assert_eq!(
            SourceKind::detect("https://www.youtube.com/playlist?list=PL123"),
            SourceKind::CatalogPlaylist
        );
        assert_eq!(
            SourceKind::detect("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"),
            SourceKind::OtherStreaming
        );
        assert_eq!(
            SourceKind::detect("https://example.com/stream.mp3"),
            SourceKind::GenericUrl
        );
        assert_eq!(SourceKind::detect("never gonna give you up"), SourceKind::SearchQuery);
    }
}
