//! Per-session state and the registry that owns it.

use parking_lot::{Mutex, RwLock};
use serenity::model::id::{ChannelId, GuildId};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{
    encoder::FrameSource,
    orchestrator::{Orchestrator, OrchestratorHandle},
    player::SessionPlayer,
    queue::SessionQueue,
    voice::{VoiceGateway, VoiceLink},
};
use crate::{
    error::{VoiceError, PlaybackError},
    sources::WorkerPool,
};

/// Knobs every new session is created with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_queue_size: usize,
    pub history_size: usize,
    pub default_volume: u8,
    pub voice_connect_timeout: Duration,
    pub track_ready_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            history_size: 50,
            default_volume: 20,
            voice_connect_timeout: Duration::from_secs(10),
            track_ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Queue, voice link, player and playback loop of one voice session.
pub struct Session {
    id: GuildId,
    queue: Arc<SessionQueue>,
    voice: Arc<VoiceLink>,
    player: Arc<SessionPlayer>,
    pool: Arc<WorkerPool>,
    ready_timeout: Duration,
    orchestrator: tokio::sync::Mutex<Option<OrchestratorHandle>>,
}

impl Session {
    pub fn id(&self) -> GuildId {
        self.id
    }

    pub fn queue(&self) -> &Arc<SessionQueue> {
        &self.queue
    }

    pub fn voice(&self) -> &Arc<VoiceLink> {
        &self.voice
    }

    pub fn player(&self) -> &Arc<SessionPlayer> {
        &self.player
    }

    /// Joins `channel` and starts the playback loop if it is not running.
    pub async fn play(&self, channel: ChannelId) -> Result<(), VoiceError> {
        self.voice.connect(channel).await?;

        let mut orchestrator = self.orchestrator.lock().await;
        if orchestrator.as_ref().is_some_and(OrchestratorHandle::is_running) {
            debug!("Playback loop already running in {}", self.id);
            return Ok(());
        }
        if let Some(finished) = orchestrator.take() {
            finished.stop().await;
        }
        *orchestrator = Some(
            Orchestrator {
                session: self.id,
                queue: Arc::clone(&self.queue),
                voice: Arc::clone(&self.voice),
                player: Arc::clone(&self.player),
                pool: Arc::clone(&self.pool),
                ready_timeout: self.ready_timeout,
            }
            .spawn(),
        );
        Ok(())
    }

    pub async fn is_looping(&self) -> bool {
        self.orchestrator
            .lock()
            .await
            .as_ref()
            .is_some_and(OrchestratorHandle::is_running)
    }

    /// Stops the playback loop and the current stream. The queue is kept.
    pub async fn stop(&self) {
        if let Some(handle) = self.orchestrator.lock().await.take() {
            handle.stop().await;
        }
        self.player.cleanup().await;
    }

    /// Stops everything, clears the queue and leaves voice.
    pub async fn teardown(&self) {
        self.stop().await;
        self.queue.clear();
        match self.voice.disconnect().await {
            Ok(()) | Err(VoiceError::NotConnected) => {}
            Err(e) => warn!("Leaving voice in {} failed: {}", self.id, e),
        }
        info!("🧹 Session {} torn down", self.id);
    }

    /// Skips the current track.
    ///
    /// The queue moves first so the loop sees a new revision when the
    /// stopped stream reports back.
    pub async fn skip(&self) -> Option<Arc<crate::sources::Track>> {
        let next = self.queue.advance_past_current();
        self.interrupt().await;
        next
    }

    /// Stops the current stream so the loop picks up whatever the queue now
    /// points at.
    pub async fn interrupt(&self) {
        match self.player.stop().await {
            Ok(()) | Err(PlaybackError::NotPlaying) => {}
            Err(e) => warn!("Interrupting playback in {} failed: {}", self.id, e),
        }
    }
}

/// Builds sessions and hands out shared references to them.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<GuildId, Arc<Session>>>,
    creating: Mutex<()>,
    settings: SessionSettings,
    gateway: Arc<dyn VoiceGateway>,
    source: Arc<dyn FrameSource>,
    pool: Arc<WorkerPool>,
}

impl SessionRegistry {
    pub fn new(
        settings: SessionSettings,
        gateway: Arc<dyn VoiceGateway>,
        source: Arc<dyn FrameSource>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
            settings,
            gateway,
            source,
            pool,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn get_or_create(&self, id: GuildId) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(&id) {
            return Arc::clone(session);
        }

        let _creating = self.creating.lock();
        if let Some(session) = self.sessions.read().get(&id) {
            return Arc::clone(session);
        }

        let session = Arc::new(self.build(id));
        self.sessions.write().insert(id, Arc::clone(&session));
        info!("🆕 Session created for {}", id);
        session
    }

    pub fn get(&self, id: GuildId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Removes a session from the registry; the caller tears it down.
    pub fn remove(&self, id: GuildId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn ids(&self) -> Vec<GuildId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn build(&self, id: GuildId) -> Session {
        let voice = Arc::new(VoiceLink::new(
            id,
            Arc::clone(&self.gateway),
            self.settings.voice_connect_timeout,
        ));
        let player = Arc::new(SessionPlayer::new(
            id,
            Arc::clone(&voice),
            Arc::clone(&self.source),
            self.settings.default_volume,
        ));
        Session {
            id,
            queue: Arc::new(SessionQueue::new(
                self.settings.max_queue_size,
                self.settings.history_size,
            )),
            voice,
            player,
            pool: Arc::clone(&self.pool),
            ready_timeout: self.settings.track_ready_timeout,
            orchestrator: tokio::sync::Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::test_support::{counting_gateway, ready_track, FakeSource},
        sources::{Resolution, Resolve, Track},
        error::ResolveError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverResolves;

    #[async_trait]
    impl Resolve for NeverResolves {
        async fn resolve(&self, _track: &Track) -> Result<Resolution, ResolveError> {
            Err(ResolveError::Unsupported("test".into()))
        }
    }

    fn registry(sent: Arc<AtomicUsize>, frames: usize) -> SessionRegistry {
        SessionRegistry::new(
            SessionSettings {
                default_volume: 35,
                ..Default::default()
            },
            counting_gateway(sent),
            FakeSource::new(frames),
            Arc::new(WorkerPool::new(Arc::new(NeverResolves), 1, 4)),
        )
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_session() {
        let registry = registry(Arc::new(AtomicUsize::new(0)), 1);
        let a = registry.get_or_create(GuildId::new(7));
        let b = registry.get_or_create(GuildId::new(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.player().volume(), 35);
        assert_eq!(registry.len(), 1);

        registry.get_or_create(GuildId::new(8));
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![GuildId::new(7), GuildId::new(8)]);

        assert!(registry.remove(GuildId::new(7)).is_some());
        assert!(registry.get(GuildId::new(7)).is_none());
    }

    #[tokio::test]
    async fn concurrent_creation_builds_one_session() {
        let registry = Arc::new(registry(Arc::new(AtomicUsize::new(0)), 1));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(GuildId::new(3)) })
            })
            .collect();
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn play_connects_and_runs_the_queue() {
        let sent = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&sent), 2);
        let session = registry.get_or_create(GuildId::new(1));
        session.queue().add(ready_track("https://youtu.be/a")).unwrap();

        session.play(ChannelId::new(9)).await.unwrap();
        assert!(session.voice().is_connected());
        assert!(session.is_looping().await);
        // second play is a no-op
        session.play(ChannelId::new(9)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.queue().history().len() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        session.teardown().await;
        assert!(!session.is_looping().await);
        assert!(!session.voice().is_connected());
        assert!(session.queue().all().is_empty());
        registry.pool().shutdown().await;
    }

    #[tokio::test]
    async fn skip_moves_to_the_next_track() {
        let registry = registry(Arc::new(AtomicUsize::new(0)), 10_000);
        let session = registry.get_or_create(GuildId::new(1));
        let a = ready_track("https://youtu.be/a");
        let b = ready_track("https://youtu.be/b");
        session.queue().add_many([Arc::clone(&a), Arc::clone(&b)]);
        session.play(ChannelId::new(9)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.player().now_playing().map(|t| t.id()) != Some(a.id()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let next = session.skip().await;
        assert_eq!(next.map(|t| t.id()), Some(b.id()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.player().now_playing().map(|t| t.id()) != Some(b.id()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        session.teardown().await;
        registry.pool().shutdown().await;
    }

    #[tokio::test]
    async fn teardown_of_an_idle_session_is_harmless() {
        let registry = registry(Arc::new(AtomicUsize::new(0)), 1);
        let session = registry.get_or_create(GuildId::new(1));
        session.teardown().await;
        session.stop().await;
        assert!(!session.voice().is_connected());
        registry.pool().shutdown().await;
    }
}
