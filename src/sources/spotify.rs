use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ResolveError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Refresh this long before the token actually expires.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// Catalog data used to build a search query for the extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogTrack {
    pub title: String,
    pub artists: Vec<String>,
    pub duration: Option<Duration>,
    pub external_id: Option<String>,
}

impl CatalogTrack {
    /// "Artist - Title", the form that matches best on the video catalog.
    pub fn search_query(&self) -> String {
        match self.artists.first() {
            Some(artist) => format!("{} - {}", artist, self.title),
            None => self.title.clone(),
        }
    }
}

/// Metadata lookup against another streaming service.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// Looks up a link or URI from the service.
    async fn lookup(&self, input: &str) -> Result<CatalogTrack, ResolveError>;

    /// Best match for free text.
    async fn search(&self, query: &str) -> Result<CatalogTrack, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    artists: Vec<SpotifyArtist>,
    duration_ms: Option<u64>,
    external_ids: Option<ExternalIds>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchTracks,
}

#[derive(Debug, Deserialize)]
struct SearchTracks {
    items: Vec<SpotifyTrack>,
}

impl From<SpotifyTrack> for CatalogTrack {
    fn from(track: SpotifyTrack) -> Self {
        Self {
            title: track.name,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            duration: track.duration_ms.map(Duration::from_millis),
            external_id: track.external_ids.and_then(|ids| ids.isrc),
        }
    }
}

/// Spotify Web API client using the client-credentials flow.
pub struct SpotifyCatalog {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl SpotifyCatalog {
    pub fn new(client_id: String, client_secret: String) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ResolveError::Catalog(e.to_string()))?;
        Ok(Self {
            http,
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    /// Returns a valid access token, refreshing it when close to expiry.
    async fn access_token(&self) -> Result<String, ResolveError> {
        let mut token = self.token.lock().await;
        if let Some((value, expires_at)) = token.as_ref() {
            if Instant::now() + TOKEN_MARGIN < *expires_at {
                return Ok(value.clone());
            }
        }

        debug!("🔑 Refreshing catalog access token");
        let credentials = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http
            .post(TOKEN_URL)
            .header("Authorization", format!("Basic {credentials}"))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(catalog_error)?
            .error_for_status()
            .map_err(catalog_error)?
            .json::<TokenResponse>()
            .await
            .map_err(catalog_error)?;

        let expires_at = Instant::now() + Duration::from_secs(response.expires_in);
        *token = Some((response.access_token.clone(), expires_at));
        info!("✅ Catalog token refreshed");
        Ok(response.access_token)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, ResolveError> {
        let token = self.access_token().await?;
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(catalog_error)?
            .error_for_status()
            .map_err(catalog_error)?
            .json::<T>()
            .await
            .map_err(catalog_error)
    }
}

#[async_trait]
impl CatalogLookup for SpotifyCatalog {
    async fn lookup(&self, input: &str) -> Result<CatalogTrack, ResolveError> {
        let id = spotify_track_id(input)
            .ok_or_else(|| ResolveError::Unsupported(format!("not a Spotify track link: {input}")))?;
        let track: SpotifyTrack = self.get(&format!("{API_BASE}/tracks/{id}")).await?;
        Ok(track.into())
    }

    async fn search(&self, query: &str) -> Result<CatalogTrack, ResolveError> {
        let url = format!(
            "{API_BASE}/search?type=track&limit=1&q={}",
            urlencoding::encode(query)
        );
        let response: SearchResponse = self.get(&url).await?;
        response
            .tracks
            .items
            .into_iter()
            .next()
            .map(CatalogTrack::from)
            .ok_or_else(|| ResolveError::NoResults(query.to_string()))
    }
}

fn catalog_error(e: reqwest::Error) -> ResolveError {
    ResolveError::Catalog(e.to_string())
}

/// Extracts a track id from `open.spotify.com/track/<id>` links or `spotify:track:<id>` URIs.
pub fn spotify_track_id(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(id) = input.strip_prefix("spotify:track:") {
        return Some(id.to_string()).filter(|id| !id.is_empty());
    }

    let parsed = url::Url::parse(input).ok()?;
    if parsed.host_str() != Some("open.spotify.com") {
        return None;
    }
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    // localized links look like /intl-es/track/<id>
    let mut kind = segments.next()?;
    if kind.starts_with("intl-") {
        kind = segments.next()?;
    }
    if kind != "track" {
        return None;
    }
    segments.next().map(str::to_string)
}
