use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::audio::{encoder::OpusApplication, session::SessionSettings};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,

    // Audio
    pub default_volume: u8,
    pub opus_bitrate: u32,
    pub opus_application: OpusApplication,

    // Queue
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub history_size: usize,

    // Cache
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,

    // Resolution
    pub worker_threads: usize,
    pub task_queue_size: usize,

    // Timeouts
    pub voice_connect_timeout: Duration,
    pub track_ready_timeout: Duration,

    // External tools
    pub ytdlp_path: String,
    pub ffmpeg_path: String,

    // Catalog lookups (optional)
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Builds a config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            // Discord
            discord_token: get("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            application_id: get("APPLICATION_ID")
                .context("APPLICATION_ID is not set")?
                .trim()
                .parse()
                .context("APPLICATION_ID must be a number")?,

            // Audio
            default_volume: parse_or(get("DEFAULT_VOLUME"), "DEFAULT_VOLUME", defaults.default_volume)?,
            opus_bitrate: parse_or(get("OPUS_BITRATE"), "OPUS_BITRATE", defaults.opus_bitrate)?,
            opus_application: parse_or(
                get("OPUS_APPLICATION"),
                "OPUS_APPLICATION",
                defaults.opus_application,
            )?,

            // Queue
            max_queue_size: parse_or(get("MAX_QUEUE_SIZE"), "MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: parse_or(
                get("MAX_PLAYLIST_SIZE"),
                "MAX_PLAYLIST_SIZE",
                defaults.max_playlist_size,
            )?,
            history_size: parse_or(get("HISTORY_SIZE"), "HISTORY_SIZE", defaults.history_size)?,

            // Cache
            cache_size: parse_or(get("CACHE_SIZE"), "CACHE_SIZE", defaults.cache_size)?,
            cache_ttl: duration_or(get("CACHE_TTL"), "CACHE_TTL", defaults.cache_ttl)?,
            cache_sweep_interval: duration_or(
                get("CACHE_SWEEP_INTERVAL"),
                "CACHE_SWEEP_INTERVAL",
                defaults.cache_sweep_interval,
            )?,

            // Resolution
            worker_threads: parse_or(get("WORKER_THREADS"), "WORKER_THREADS", defaults.worker_threads)?,
            task_queue_size: parse_or(get("TASK_QUEUE_SIZE"), "TASK_QUEUE_SIZE", defaults.task_queue_size)?,

            // Timeouts
            voice_connect_timeout: duration_or(
                get("VOICE_CONNECT_TIMEOUT"),
                "VOICE_CONNECT_TIMEOUT",
                defaults.voice_connect_timeout,
            )?,
            track_ready_timeout: duration_or(
                get("TRACK_READY_TIMEOUT"),
                "TRACK_READY_TIMEOUT",
                defaults.track_ready_timeout,
            )?,

            // External tools
            ytdlp_path: get("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),

            // Catalog lookups
            spotify_client_id: get("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: get("SPOTIFY_CLIENT_SECRET"),

            // Paths
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 100
    /// - Opus bitrate must be within 8–510kbps
    /// - Sizes, worker count and timeouts must be non-zero
    /// - Catalog credentials come in pairs
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", self.default_volume);
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("At least one worker thread is required");
        }

        if self.task_queue_size == 0 {
            anyhow::bail!("Task queue size must be greater than 0");
        }

        if self.voice_connect_timeout.is_zero() || self.track_ready_timeout.is_zero() {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        if self.spotify_client_id.is_some() != self.spotify_client_secret.is_some() {
            anyhow::bail!("SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set together");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Leaves out the token and catalog credentials.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {}\n  \
            Audio: {}% vol, {}kbps, {} profile\n  \
            Queue: {} tracks, {} per playlist, {} history\n  \
            Cache: {} entries, ttl {}, sweep every {}\n  \
            Workers: {} ({} queued max)\n  \
            Tools: {} / {}\n  \
            Catalog lookups: {}",
            self.application_id,
            self.default_volume,
            self.opus_bitrate / 1000,
            self.opus_application.as_str(),
            self.max_queue_size,
            self.max_playlist_size,
            self.history_size,
            self.cache_size,
            humantime::format_duration(self.cache_ttl),
            humantime::format_duration(self.cache_sweep_interval),
            self.worker_threads,
            self.task_queue_size,
            self.ytdlp_path,
            self.ffmpeg_path,
            if self.spotify_client_id.is_some() { "enabled" } else { "disabled" },
        )
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_queue_size: self.max_queue_size,
            history_size: self.history_size,
            default_volume: self.default_volume,
            voice_connect_timeout: self.voice_connect_timeout,
            track_ready_timeout: self.track_ready_timeout,
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {raw:?} ({e})")),
        None => Ok(default),
    }
}

fn duration_or(value: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("invalid {key}: {raw:?} (expected e.g. 30s, 5m, 1h)")),
        None => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,

            // Audio defaults
            default_volume: 20,
            opus_bitrate: 128_000,
            opus_application: OpusApplication::Audio,

            // Queue defaults
            max_queue_size: 1000,
            max_playlist_size: 100,
            history_size: 50,

            // Cache defaults
            cache_size: 1000,
            cache_ttl: Duration::from_secs(3600),
            cache_sweep_interval: Duration::from_secs(300),

            // Resolution defaults
            worker_threads: num_cpus::get(),
            task_queue_size: 100,

            // Timeout defaults
            voice_connect_timeout: Duration::from_secs(10),
            track_ready_timeout: Duration::from_secs(30),

            // Tool defaults
            ytdlp_path: "yt-dlp".into(),
            ffmpeg_path: "ffmpeg".into(),

            spotify_client_id: None,
            spotify_client_secret: None,

            data_dir: "./data".into(),
        }
    }
}
