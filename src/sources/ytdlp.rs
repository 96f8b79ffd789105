use async_trait::async_trait;
use serde::Deserialize;
use std::{process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::TrackMetadata;
use crate::error::ResolveError;

/// One entry from a flat playlist or search enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    pub url: String,
    pub metadata: TrackMetadata,
}

/// The media-extraction capability the resolver depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Full metadata for a single URL.
    async fn extract_metadata(&self, url: &str) -> Result<TrackMetadata, ResolveError>;

    /// Direct media URL of the best available audio.
    async fn stream_url(&self, url: &str) -> Result<String, ResolveError>;

    /// Top `limit` search results.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FlatEntry>, ResolveError>;

    /// Flat enumeration of a playlist, at most `max_items` entries.
    async fn enumerate_playlist(&self, url: &str, max_items: usize)
        -> Result<Vec<FlatEntry>, ResolveError>;
}

/// Information dumped by yt-dlp.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
}

impl YtDlpInfo {
    fn into_metadata(self) -> TrackMetadata {
        TrackMetadata {
            title: self
                .title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            artist: self.uploader.or(self.channel),
            duration: self
                .duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(Duration::from_secs_f64),
            thumbnail: self.thumbnail,
            webpage_url: self.webpage_url,
            is_live: self.is_live.unwrap_or(false),
        }
    }

    /// Flat entries often omit `webpage_url`; fall back to `url`, then the id.
    fn into_flat_entry(mut self) -> Option<FlatEntry> {
        let url = self
            .webpage_url
            .clone()
            .or_else(|| self.url.clone().filter(|u| u.starts_with("http")))
            .or_else(|| {
                self.id
                    .as_ref()
                    .map(|id| format!("https://www.youtube.com/watch?v={id}"))
            })?;
        self.webpage_url = Some(url.clone());
        Some(FlatEntry {
            url,
            metadata: self.into_metadata(),
        })
    }
}

/// Client for the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlpClient {
    binary: String,
    timeout: Duration,
}

impl YtDlpClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Reports the installed yt-dlp version.
    pub async fn version(&self) -> Result<String, ResolveError> {
        let stdout = self.run(&["--version"]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String, ResolveError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ResolveError::Extractor {
                    status: "timeout".to_string(),
                    stderr: format!("no result after {:?}", self.timeout),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("yt-dlp failed ({}): {}", output.status, stderr);
            return Err(ResolveError::Extractor {
                status: output.status.to_string(),
                stderr: if stderr.is_empty() {
                    "no error output".to_string()
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaExtractor for YtDlpClient {
    async fn extract_metadata(&self, url: &str) -> Result<TrackMetadata, ResolveError> {
        debug!("📊 Extracting metadata for: {}", url);
        let stdout = self
            .run(&["--no-playlist", "--dump-json", "--skip-download", "--no-warnings", url])
            .await?;
        parse_metadata(&stdout)
    }

    async fn stream_url(&self, url: &str) -> Result<String, ResolveError> {
        debug!("🎵 Fetching stream URL for: {}", url);
        let stdout = self
            .run(&["--no-playlist", "-f", "bestaudio/best", "--get-url", "--no-warnings", url])
            .await?;

        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ResolveError::Parse("empty stream URL".to_string()))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FlatEntry>, ResolveError> {
        info!("🔍 Searching: {}", query);
        let search = format!("ytsearch{}:{}", limit.max(1), query);
        let stdout = self
            .run(&["--flat-playlist", "--dump-json", "--skip-download", "--no-warnings", &search])
            .await?;
        Ok(parse_flat_lines(&stdout))
    }

    async fn enumerate_playlist(
        &self,
        url: &str,
        max_items: usize,
    ) -> Result<Vec<FlatEntry>, ResolveError> {
        info!("📋 Enumerating playlist: {}", url);
        let end = max_items.max(1).to_string();
        let stdout = self
            .run(&["--flat-playlist", "--dump-json", "--playlist-end", &end, "--no-warnings", url])
            .await?;
        Ok(parse_flat_lines(&stdout))
    }
}

/// Parses a single JSON metadata object.
///
/// yt-dlp may print log lines before the object, so on a direct parse failure
/// the output is re-read from the first `{`.
pub fn parse_metadata(stdout: &str) -> Result<TrackMetadata, ResolveError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::Parse("empty metadata output".to_string()));
    }

    let info = match serde_json::from_str::<YtDlpInfo>(trimmed) {
        Ok(info) => info,
        Err(first) => {
            let start = trimmed
                .find('{')
                .ok_or_else(|| ResolveError::Parse(first.to_string()))?;
            let mut stream =
                serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<YtDlpInfo>();
            stream
                .next()
                .ok_or_else(|| ResolveError::Parse(first.to_string()))?
                .map_err(|e| ResolveError::Parse(e.to_string()))?
        }
    };

    Ok(info.into_metadata())
}

/// Parses one-object-per-line output, skipping lines that are not entries.
pub fn parse_flat_lines(stdout: &str) -> Vec<FlatEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
        .filter_map(YtDlpInfo::into_flat_entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_metadata() {
        let json = r#"{"id":"abc","title":"Song","duration":212.5,"uploader":"Artist",
            "thumbnail":"https://i/abc.jpg","webpage_url":"https://www.youtube.com/watch?v=abc"}"#;
        let meta = parse_metadata(json).unwrap();
        assert_eq!(meta.title, "Song");
        assert_eq!(meta.artist.as_deref(), Some("Artist"));
        assert_eq!(meta.duration, Some(Duration::from_secs_f64(212.5)));
        assert!(!meta.is_live);
    }

    #[test]
    fn tolerates_leading_log_lines() {
        let out = "[youtube] abc: Downloading webpage\nWARNING: something\n{\"title\":\"Song\",\"channel\":\"Chan\"}\n";
        let meta = parse_metadata(out).unwrap();
        assert_eq!(meta.title, "Song");
        assert_eq!(meta.artist.as_deref(), Some("Chan"));
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(matches!(parse_metadata(""), Err(ResolveError::Parse(_))));
        assert!(matches!(parse_metadata("ERROR: nope"), Err(ResolveError::Parse(_))));
    }

    #[test]
    fn flat_lines_build_urls_from_ids() {
        let out = concat!(
            "{\"id\":\"one\",\"title\":\"First\",\"url\":\"one\"}\n",
            "not json\n",
            "{\"id\":\"two\",\"title\":\"Second\",\"url\":\"https://www.youtube.com/watch?v=two\"}\n",
        );
        let entries = parse_flat_lines(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://www.youtube.com/watch?v=one");
        assert_eq!(entries[1].url, "https://www.youtube.com/watch?v=two");
        assert_eq!(entries[1].metadata.title, "Second");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_extractor_error() {
        let client = YtDlpClient::new("false");
        let err = client.extract_metadata("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, ResolveError::Extractor { .. }));
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let client = YtDlpClient::new("/nonexistent/yt-dlp");
        let err = client.stream_url("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, ResolveError::Spawn(_)));
    }
}
