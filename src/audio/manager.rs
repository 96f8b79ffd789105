//! Application-facing façade over the session registry.
//!
//! Command handlers and the binary talk to [`MusicManager`] only. Every
//! operation is addressed by session id and returns [`anyhow::Result`] so
//! callers can surface a message without matching on component errors.

use anyhow::{Context, Result};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    player::PlayerState,
    queue::{QueuePage, RepeatMode},
    session::{Session, SessionRegistry},
};
use crate::{
    error::PoolError,
    sources::{MediaExtractor, Priority, SourceKind, Track},
    storage::{JsonStorage, PlaylistEntry},
};

/// Result of an enqueue request.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub tracks: Vec<Arc<Track>>,
    /// 1-indexed queue position of the first added track.
    pub first_position: usize,
    /// Tracks that did not fit into the queue.
    pub dropped: usize,
}

pub struct MusicManager {
    registry: SessionRegistry,
    extractor: Arc<dyn MediaExtractor>,
    storage: Option<Arc<JsonStorage>>,
    max_playlist_size: usize,
}

impl MusicManager {
    pub fn new(
        registry: SessionRegistry,
        extractor: Arc<dyn MediaExtractor>,
        max_playlist_size: usize,
    ) -> Self {
        Self {
            registry,
            extractor,
            storage: None,
            max_playlist_size,
        }
    }

    pub fn with_storage(mut self, storage: Arc<JsonStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn session(&self, id: GuildId) -> Result<Arc<Session>> {
        self.registry
            .get(id)
            .with_context(|| format!("no active session for {id}"))
    }

    /// Queues `input`, expanding playlist URLs, and schedules resolution.
    pub async fn enqueue(&self, id: GuildId, input: &str, requested_by: UserId) -> Result<Enqueued> {
        let input = input.trim();
        if input.is_empty() {
            anyhow::bail!("Nothing to play");
        }

        let tracks = match SourceKind::detect(input) {
            SourceKind::CatalogPlaylist => {
                let entries = self
                    .extractor
                    .enumerate_playlist(input, self.max_playlist_size)
                    .await
                    .with_context(|| format!("expanding playlist {input}"))?;
                if entries.is_empty() {
                    anyhow::bail!("Playlist is empty: {input}");
                }
                info!("📋 Playlist expanded to {} tracks", entries.len());
                entries
                    .into_iter()
                    .map(|entry| {
                        let kind = SourceKind::detect(&entry.url);
                        Track::with_metadata(entry.url, kind, requested_by, entry.metadata)
                    })
                    .collect()
            }
            _ => vec![Track::new(input, requested_by)],
        };

        let session = self.registry.get_or_create(id);
        self.add_to_session(&session, tracks)
    }

    fn add_to_session(&self, session: &Session, tracks: Vec<Arc<Track>>) -> Result<Enqueued> {
        let requested = tracks.len();
        let mut added = Vec::with_capacity(requested);
        let mut first_position = 0;

        for track in tracks {
            match session.queue().add(Arc::clone(&track)) {
                Ok(position) => {
                    if added.is_empty() {
                        first_position = position;
                    }
                    added.push(track);
                }
                Err(e) => {
                    warn!("Queue full in {}: {}", session.id(), e);
                    break;
                }
            }
        }

        if added.is_empty() {
            anyhow::bail!("Queue is full ({} tracks)", session.queue().size());
        }

        let idle = session.player().state() == PlayerState::Idle;
        for (index, track) in added.iter().enumerate() {
            let priority = if idle && index == 0 {
                Priority::High
            } else {
                Priority::Normal
            };
            match self.registry.pool().submit(Arc::clone(track), priority) {
                Ok(()) => {}
                Err(PoolError::QueueFull) => {
                    debug!("Resolution deferred for '{}', pool is busy", track.title())
                }
                Err(e) => warn!("Could not schedule '{}': {}", track.title(), e),
            }
        }

        Ok(Enqueued {
            dropped: requested - added.len(),
            tracks: added,
            first_position,
        })
    }

    /// Joins `channel` and starts playing the session's queue.
    pub async fn play(&self, id: GuildId, channel: ChannelId) -> Result<()> {
        let session = self.registry.get_or_create(id);
        session
            .play(channel)
            .await
            .with_context(|| format!("joining voice channel {channel}"))
    }

    /// Stops playback and clears the queue; the voice link stays up.
    pub async fn stop(&self, id: GuildId) -> Result<()> {
        let session = self.session(id)?;
        session.stop().await;
        session.queue().clear();
        info!("⏹️ Playback stopped and queue cleared in {}", id);
        Ok(())
    }

    /// Skips the current track and returns the one that plays next.
    pub async fn skip(&self, id: GuildId) -> Result<Option<Arc<Track>>> {
        let session = self.session(id)?;
        if session.queue().current().is_none() && session.player().now_playing().is_none() {
            anyhow::bail!("Nothing is playing");
        }
        Ok(session.skip().await)
    }

    pub async fn pause(&self, id: GuildId) -> Result<()> {
        Ok(self.session(id)?.player().pause().await?)
    }

    pub async fn resume(&self, id: GuildId) -> Result<()> {
        Ok(self.session(id)?.player().resume().await?)
    }

    /// Returns the applied (clamped) volume.
    pub fn set_volume(&self, id: GuildId, volume: u8) -> Result<u8> {
        Ok(self.registry.get_or_create(id).player().set_volume(volume))
    }

    pub async fn previous(&self, id: GuildId) -> Result<Option<Arc<Track>>> {
        let session = self.session(id)?;
        let track = session.queue().previous();
        if track.is_some() {
            session.interrupt().await;
        }
        Ok(track)
    }

    pub async fn skip_to(&self, id: GuildId, position: usize) -> Result<Arc<Track>> {
        let session = self.session(id)?;
        let track = session.queue().skip_to(position)?;
        session.interrupt().await;
        Ok(track)
    }

    /// Removes a queued track; removing the current one moves playback on.
    pub async fn remove(&self, id: GuildId, position: usize) -> Result<Arc<Track>> {
        let session = self.session(id)?;
        let before = session.queue().revision();
        let removed = session.queue().remove(position)?;
        if session.queue().revision() != before {
            session.interrupt().await;
        }
        Ok(removed)
    }

    pub fn shuffle(&self, id: GuildId) -> Result<()> {
        self.session(id)?.queue().shuffle();
        Ok(())
    }

    pub fn set_shuffle(&self, id: GuildId, enabled: bool) -> Result<()> {
        self.session(id)?.queue().set_shuffle(enabled);
        Ok(())
    }

    pub fn set_repeat(&self, id: GuildId, mode: RepeatMode) -> Result<()> {
        self.registry.get_or_create(id).queue().set_repeat_mode(mode);
        Ok(())
    }

    pub fn queue_page(&self, id: GuildId, page: usize, per_page: usize) -> Option<QueuePage> {
        self.registry.get(id).map(|s| s.queue().page(page, per_page))
    }

    pub fn now_playing(&self, id: GuildId) -> Option<Arc<Track>> {
        self.registry.get(id).and_then(|s| s.player().now_playing())
    }

    /// Stops everything for the session, leaves voice and forgets it.
    pub async fn teardown(&self, id: GuildId) {
        if let Some(session) = self.registry.remove(id) {
            session.teardown().await;
        }
    }

    /// Saves the session's queue under `name`; returns the number of entries.
    pub async fn save_playlist(&self, id: GuildId, name: &str) -> Result<usize> {
        let storage = self.storage()?;
        let session = self.session(id)?;
        let entries: Vec<PlaylistEntry> = session
            .queue()
            .all()
            .iter()
            .map(|track| {
                let metadata = track.metadata();
                PlaylistEntry {
                    input: metadata
                        .as_ref()
                        .and_then(|m| m.webpage_url.clone())
                        .unwrap_or_else(|| track.input().to_string()),
                    title: metadata.as_ref().map(|m| m.title.clone()),
                    duration: metadata.and_then(|m| m.duration),
                }
            })
            .collect();
        if entries.is_empty() {
            anyhow::bail!("Queue is empty, nothing to save");
        }
        let count = entries.len();
        storage.save_playlist(id.get(), name, entries).await?;
        Ok(count)
    }

    /// Appends a saved playlist to the session's queue.
    pub async fn load_playlist(&self, id: GuildId, name: &str, requested_by: UserId) -> Result<Enqueued> {
        let storage = self.storage()?;
        let entries = storage
            .load_playlist(id.get(), name)
            .await?
            .with_context(|| format!("no playlist named '{name}'"))?;

        let tracks = entries
            .into_iter()
            .map(|entry| {
                let kind = SourceKind::detect(&entry.input);
                match entry.title {
                    Some(title) => Track::with_metadata(
                        entry.input,
                        kind,
                        requested_by,
                        crate::sources::TrackMetadata {
                            title,
                            duration: entry.duration,
                            ..Default::default()
                        },
                    ),
                    None => Track::with_kind(entry.input, kind, requested_by),
                }
            })
            .collect();

        let session = self.registry.get_or_create(id);
        self.add_to_session(&session, tracks)
    }

    fn storage(&self) -> Result<&Arc<JsonStorage>> {
        self.storage.as_ref().context("playlist storage is not configured")
    }

    /// Tears every session down, then stops the resolution pool.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        info!("🛑 Shutting down {} sessions", ids.len());
        for id in ids {
            self.teardown(id).await;
        }
        self.registry.pool().shutdown().await;
    }
}
