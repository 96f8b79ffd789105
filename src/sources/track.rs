use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::SourceKind;

/// Resolution lifecycle of a track.
///
/// Transitions only move forward: `Pending → Processing → Ready | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl TrackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackStatus::Ready | TrackStatus::Failed)
    }

    fn can_become(self, next: TrackStatus) -> bool {
        matches!(
            (self, next),
            (TrackStatus::Pending, TrackStatus::Processing)
                | (TrackStatus::Pending, TrackStatus::Ready)
                | (TrackStatus::Pending, TrackStatus::Failed)
                | (TrackStatus::Processing, TrackStatus::Ready)
                | (TrackStatus::Processing, TrackStatus::Failed)
        )
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Processing => "processing",
            TrackStatus::Ready => "ready",
            TrackStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Metadata extracted for a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    /// Canonical page URL, when the extractor reports one.
    pub webpage_url: Option<String>,
    pub is_live: bool,
}

/// Consistent copy of a track's mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub status: TrackStatus,
    pub metadata: Option<TrackMetadata>,
    pub stream_url: Option<String>,
    pub error: Option<String>,
}

/// One user-requested playable item.
///
/// Identity and input are immutable; the resolution state is written by the
/// worker pool under a single lock so readers never see half-written metadata.
#[derive(Debug)]
pub struct Track {
    id: Uuid,
    input: String,
    kind: SourceKind,
    requested_by: UserId,
    added_at: DateTime<Utc>,
    state: RwLock<TrackSnapshot>,
    status_tx: watch::Sender<TrackStatus>,
}

// Test-only: lets `assert_eq!` compare `Option<Arc<Track>>` values.
#[cfg(test)]
impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Track {
    pub fn new(input: impl Into<String>, requested_by: UserId) -> Arc<Self> {
        let input = input.into();
        let kind = SourceKind::detect(&input);
        Self::with_kind(input, kind, requested_by)
    }

    pub fn with_kind(input: impl Into<String>, kind: SourceKind, requested_by: UserId) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TrackStatus::Pending);
        Arc::new(Self {
            id: Uuid::new_v4(),
            input: input.into(),
            kind,
            requested_by,
            added_at: Utc::now(),
            state: RwLock::new(TrackSnapshot {
                status: TrackStatus::Pending,
                metadata: None,
                stream_url: None,
                error: None,
            }),
            status_tx,
        })
    }

    /// Builds a track whose metadata is already known, e.g. a playlist entry.
    /// The track still goes through resolution to obtain a stream reference.
    pub fn with_metadata(
        input: impl Into<String>,
        kind: SourceKind,
        requested_by: UserId,
        metadata: TrackMetadata,
    ) -> Arc<Self> {
        let track = Self::with_kind(input, kind, requested_by);
        track.state.write().metadata = Some(metadata);
        track
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn status(&self) -> TrackStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        self.state.read().clone()
    }

    pub fn metadata(&self) -> Option<TrackMetadata> {
        self.state.read().metadata.clone()
    }

    pub fn stream_url(&self) -> Option<String> {
        self.state.read().stream_url.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    /// Best display name available: resolved title, or the raw input.
    pub fn title(&self) -> String {
        self.state
            .read()
            .metadata
            .as_ref()
            .map(|m| m.title.clone())
            .unwrap_or_else(|| self.input.clone())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.state.read().metadata.as_ref().and_then(|m| m.duration)
    }

    pub fn mark_processing(&self) -> bool {
        self.transition(TrackStatus::Processing, |_| {})
    }

    pub fn mark_ready(&self, metadata: TrackMetadata, stream_url: String) -> bool {
        self.transition(TrackStatus::Ready, |state| {
            state.metadata = Some(metadata);
            state.stream_url = Some(stream_url);
            state.error = None;
        })
    }

    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = "unknown resolution error".to_string();
        }
        self.transition(TrackStatus::Failed, |state| state.error = Some(reason))
    }

    /// Subscribes to status changes. The receiver starts at the current status.
    pub fn subscribe(&self) -> watch::Receiver<TrackStatus> {
        self.status_tx.subscribe()
    }

    /// Waits until the status is terminal and returns it.
    pub async fn wait_resolved(&self) -> TrackStatus {
        let mut rx = self.subscribe();
        let resolved = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            // the sender lives as long as the track, so this is unreachable in practice
            Err(_) => self.status(),
        };
        resolved
    }

    fn transition(&self, next: TrackStatus, apply: impl FnOnce(&mut TrackSnapshot)) -> bool {
        let mut state = self.state.write();
        if !state.status.can_become(next) {
            warn!(
                "Rejected track {} transition {} -> {}",
                self.id, state.status, next
            );
            return false;
        }
        apply(&mut *state);
        state.status = next;
        // publish while still holding the lock so watchers never race the snapshot
        self.status_tx.send_replace(next);
        debug!("Track {} is now {}", self.id, next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user() -> UserId {
        UserId::new(7)
    }

    #[test]
    fn transitions_are_monotonic() {
        let track = Track::new("lofi beats", user());
        assert_eq!(track.status(), TrackStatus::Pending);
        assert!(track.mark_processing());
        assert!(!track.mark_processing());
        assert!(track.mark_ready(TrackMetadata::default(), "https://cdn/x".into()));
        assert!(!track.mark_failed("late"));
        assert_eq!(track.status(), TrackStatus::Ready);
        assert_eq!(track.error(), None);
    }

    #[test]
    fn failure_always_carries_a_reason() {
        let track = Track::new("https://example.com/a.mp3", user());
        assert!(track.mark_failed(""));
        let snapshot = track.snapshot();
        assert_eq!(snapshot.status, TrackStatus::Failed);
        assert!(!snapshot.error.unwrap().is_empty());
    }

    #[test]
    fn title_falls_back_to_input() {
        let track = Track::new("some search", user());
        assert_eq!(track.title(), "some search");
        track.mark_ready(
            TrackMetadata {
                title: "Resolved".into(),
                ..Default::default()
            },
            "u".into(),
        );
        assert_eq!(track.title(), "Resolved");
    }

    #[tokio::test]
    async fn waiters_observe_terminal_status() {
        let track = Track::new("query", user());
        let waiter = {
            let track = Arc::clone(&track);
            tokio::spawn(async move { track.wait_resolved().await })
        };
        track.mark_processing();
        track.mark_failed("boom");
        assert_eq!(waiter.await.unwrap(), TrackStatus::Failed);
    }
}
