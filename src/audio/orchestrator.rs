//! The per-session playback loop.
//!
//! One task per active session: take the current track, wait for it to
//! resolve, play it, then move the queue on. Everything the loop waits on is
//! raced against its cancellation token.

use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{player::SessionPlayer, queue::SessionQueue, voice::VoiceLink};
use crate::{
    error::PlaybackError,
    sources::{Priority, Track, TrackStatus, WorkerPool},
};

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Handle to a running loop.
pub struct OrchestratorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Orchestrator ended abnormally: {}", e);
        }
    }
}

pub struct Orchestrator {
    pub session: GuildId,
    pub queue: Arc<SessionQueue>,
    pub voice: Arc<VoiceLink>,
    pub player: Arc<SessionPlayer>,
    pub pool: Arc<WorkerPool>,
    pub ready_timeout: Duration,
}

enum Step {
    Continue,
    Exit,
}

impl Orchestrator {
    pub fn spawn(self) -> OrchestratorHandle {
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("session", id = %self.session);
        let task = tokio::spawn(self.run(cancel.clone()).instrument(span));
        OrchestratorHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        info!("▶️ Playback loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.step(&cancel).await {
                Step::Continue => {}
                Step::Exit => break,
            }
        }
        info!("⏹️ Playback loop stopped");
    }

    async fn step(&self, cancel: &CancellationToken) -> Step {
        let track = self.queue.current().or_else(|| self.queue.next());
        let revision = self.queue.revision();

        let Some(track) = track else {
            debug!("Queue idle, waiting for tracks");
            tokio::select! {
                _ = cancel.cancelled() => return Step::Exit,
                _ = self.queue.wait_for_tracks() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            return Step::Continue;
        };

        match self.wait_until_ready(&track, cancel).await {
            Some(true) => {}
            Some(false) => {
                self.advance_after_failure(revision);
                return Step::Continue;
            }
            None => return Step::Exit,
        }
        if self.queue.revision() != revision {
            debug!("Queue moved while resolving, re-reading");
            return Step::Continue;
        }

        if !self.voice.is_connected() {
            warn!("🔌 Voice link gone, stopping playback loop");
            return Step::Exit;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let started = self
            .player
            .play(
                Arc::clone(&track),
                Box::new(move |_, error| {
                    let _ = done_tx.send(error);
                }),
            )
            .await;

        match started {
            Ok(()) => {}
            Err(PlaybackError::NoVoiceLink) => {
                warn!("🔌 Voice link gone, stopping playback loop");
                return Step::Exit;
            }
            Err(PlaybackError::AlreadyPlaying) => {
                warn!("Player busy with another stream, stopping it");
                self.player.cleanup().await;
                return Step::Continue;
            }
            Err(e) => {
                warn!("❌ Could not start '{}': {}", track.title(), e);
                self.advance_after_failure(revision);
                return Step::Continue;
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.player.cleanup().await;
                return Step::Exit;
            }
            outcome = done_rx => outcome.ok().flatten(),
        };

        if self.queue.revision() != revision {
            // skip, previous, jump or removal already moved the queue
            return Step::Continue;
        }

        match outcome {
            None => {
                self.queue.next();
                Step::Continue
            }
            Some(PlaybackError::NoVoiceLink) => {
                warn!("🔌 Voice link lost during '{}'", track.title());
                Step::Exit
            }
            Some(e) => {
                warn!("❌ Playback of '{}' failed: {}", track.title(), e);
                self.queue.advance_past_current();
                Step::Continue
            }
        }
    }

    /// `Some(true)` when ready, `Some(false)` on failure or timeout, `None`
    /// when cancelled.
    async fn wait_until_ready(&self, track: &Arc<Track>, cancel: &CancellationToken) -> Option<bool> {
        if track.status() == TrackStatus::Pending && !self.pool.is_in_flight(&track.id()) {
            debug!("Submitting unresolved track {}", track.id());
            if let Err(e) = self.pool.submit(Arc::clone(track), Priority::High) {
                warn!("Could not submit '{}': {}", track.title(), e);
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return None,
            status = tokio::time::timeout(self.ready_timeout, track.wait_resolved()) => status,
        };

        match status {
            Ok(TrackStatus::Ready) => Some(true),
            Ok(status) => {
                warn!(
                    "❌ Skipping '{}' ({}): {}",
                    track.title(),
                    status,
                    track.error().unwrap_or_default()
                );
                Some(false)
            }
            Err(_) => {
                warn!(
                    "⏱️ '{}' not ready after {:?}, skipping",
                    track.title(),
                    self.ready_timeout
                );
                Some(false)
            }
        }
    }

    fn advance_after_failure(&self, revision: u64) {
        if self.queue.revision() == revision {
            self.queue.advance_past_current();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::test_support::{connected_voice, ready_track, FakeSource},
        cache::MusicCache,
        sources::{TrackResolver, YtDlpClient},
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        queue: Arc<SessionQueue>,
        voice: Arc<VoiceLink>,
        player: Arc<SessionPlayer>,
        pool: Arc<WorkerPool>,
        sent: Arc<AtomicUsize>,
        source: Arc<FakeSource>,
    }

    impl Fixture {
        async fn new(frames: usize) -> Self {
            let sent = Arc::new(AtomicUsize::new(0));
            let voice = connected_voice(Arc::clone(&sent)).await;
            Self::with_voice(frames, voice, sent)
        }

        fn with_voice(frames: usize, voice: Arc<VoiceLink>, sent: Arc<AtomicUsize>) -> Self {
            let source = FakeSource::new(frames);
            let player = Arc::new(SessionPlayer::new(
                GuildId::new(1),
                Arc::clone(&voice),
                source.clone(),
                20,
            ));
            let resolver = TrackResolver::new(
                Arc::new(YtDlpClient::new("false")),
                Arc::new(MusicCache::new(16)),
            );
            Self {
                queue: Arc::new(SessionQueue::new(100, 10)),
                voice,
                player,
                pool: Arc::new(WorkerPool::new(Arc::new(resolver), 2, 16)),
                sent,
                source,
            }
        }

        fn spawn(&self) -> OrchestratorHandle {
            Orchestrator {
                session: GuildId::new(1),
                queue: Arc::clone(&self.queue),
                voice: Arc::clone(&self.voice),
                player: Arc::clone(&self.player),
                pool: Arc::clone(&self.pool),
                ready_timeout: Duration::from_secs(10),
            }
            .spawn()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    fn ids(tracks: Vec<Arc<Track>>) -> Vec<uuid::Uuid> {
        tracks.iter().map(|t| t.id()).collect()
    }

    #[tokio::test]
    async fn failed_extraction_is_skipped_and_the_next_track_plays() {
        let f = Fixture::new(3).await;
        let broken = Track::new("https://www.youtube.com/watch?v=broken", UserId::new(1));
        let good = ready_track("https://youtu.be/good");
        f.queue.add(Arc::clone(&broken)).unwrap();
        f.queue.add(Arc::clone(&good)).unwrap();

        let handle = f.spawn();
        wait_for(|| f.queue.history().len() == 2).await;

        assert_eq!(broken.status(), TrackStatus::Failed);
        assert!(!broken.error().unwrap_or_default().is_empty());
        assert_eq!(ids(f.queue.history()), vec![broken.id(), good.id()]);
        assert_eq!(f.sent.load(Ordering::SeqCst), 3);
        assert_eq!(f.source.opened.load(Ordering::SeqCst), 1);

        assert!(handle.is_running());
        handle.stop().await;
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn idle_loop_picks_up_new_tracks() {
        let f = Fixture::new(2).await;
        let handle = f.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = ready_track("https://youtu.be/one");
        f.queue.add(Arc::clone(&first)).unwrap();
        wait_for(|| f.queue.history().len() == 1).await;

        let second = ready_track("https://youtu.be/two");
        f.queue.add(Arc::clone(&second)).unwrap();
        wait_for(|| f.queue.history().len() == 2).await;

        assert_eq!(ids(f.queue.history()), vec![first.id(), second.id()]);
        assert_eq!(f.source.opened.load(Ordering::SeqCst), 2);

        handle.stop().await;
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn user_skip_is_not_advanced_twice() {
        let f = Fixture::new(10_000).await;
        let a = ready_track("https://youtu.be/a");
        let b = ready_track("https://youtu.be/b");
        let c = ready_track("https://youtu.be/c");
        f.queue.add_many([Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)]);

        let handle = f.spawn();
        wait_for(|| f.player.now_playing().map(|t| t.id()) == Some(a.id())).await;

        f.queue.advance_past_current();
        f.player.stop().await.unwrap();
        wait_for(|| f.player.now_playing().map(|t| t.id()) == Some(b.id())).await;

        assert_eq!(f.queue.current().map(|t| t.id()), Some(b.id()));
        assert_eq!(ids(f.queue.history()), vec![a.id()]);

        handle.stop().await;
        assert!(f.player.now_playing().is_none());
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn loop_exits_without_voice() {
        let voice = Arc::new(VoiceLink::new(
            GuildId::new(1),
            Arc::new(crate::audio::voice::MockVoiceGateway::new()),
            Duration::from_secs(1),
        ));
        let f = Fixture::with_voice(1, voice, Arc::new(AtomicUsize::new(0)));
        f.queue.add(ready_track("https://youtu.be/x")).unwrap();

        let handle = f.spawn();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loop should exit on its own");
        assert_eq!(f.source.opened.load(Ordering::SeqCst), 0);
        handle.stop().await;
        f.pool.shutdown().await;
    }
}
