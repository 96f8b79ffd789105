use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{
    encoder::{FrameSource, FrameStream},
    voice::VoiceLink,
};
use crate::{
    error::{PlaybackError, VoiceError},
    sources::{SourceKind, Track, TrackStatus},
};

const PAUSE_POLL: Duration = Duration::from_millis(50);
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Consecutive rejected frames before the stream is given up on.
const MAX_SEND_FAILURES: u32 = 5;

/// Called exactly once per successful `play`, with the failure if there was one.
pub type OnDone = Box<dyn FnOnce(Arc<Track>, Option<PlaybackError>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

struct Active {
    track: Arc<Track>,
    generation: u64,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

enum Slot {
    Idle,
    Playing(Active),
    Paused(Active),
}

impl Slot {
    fn state(&self) -> PlayerState {
        match self {
            Slot::Idle => PlayerState::Idle,
            Slot::Playing(_) => PlayerState::Playing,
            Slot::Paused(_) => PlayerState::Paused,
        }
    }

    fn active(&self) -> Option<&Active> {
        match self {
            Slot::Idle => None,
            Slot::Playing(active) | Slot::Paused(active) => Some(active),
        }
    }
}

/// Plays one track at a time into a session's voice link.
pub struct SessionPlayer {
    session: GuildId,
    voice: Arc<VoiceLink>,
    source: Arc<dyn FrameSource>,
    volume: AtomicU8,
    generation: AtomicU64,
    ops: tokio::sync::Mutex<()>,
    slot: Arc<Mutex<Slot>>,
}

impl SessionPlayer {
    pub fn new(
        session: GuildId,
        voice: Arc<VoiceLink>,
        source: Arc<dyn FrameSource>,
        volume: u8,
    ) -> Self {
        Self {
            session,
            voice,
            source,
            volume: AtomicU8::new(volume.min(100)),
            generation: AtomicU64::new(0),
            ops: tokio::sync::Mutex::new(()),
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    /// Starts streaming `track`; `on_done` fires when it ends for any reason.
    pub async fn play(&self, track: Arc<Track>, on_done: OnDone) -> Result<(), PlaybackError> {
        let _op = self.ops.lock().await;

        if self.slot.lock().state() != PlayerState::Idle {
            return Err(PlaybackError::AlreadyPlaying);
        }
        if !self.voice.is_connected() {
            return Err(PlaybackError::NoVoiceLink);
        }
        let status = track.status();
        if status != TrackStatus::Ready {
            return Err(PlaybackError::TrackNotReady(status));
        }

        let input = playback_input(&track);
        let volume = self.volume();
        let cancel = CancellationToken::new();
        let stream = self.source.open(&input, volume, cancel.child_token()).await?;

        if let Err(e) = self.voice.set_speaking(true).await {
            warn!("Could not set speaking: {}", e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let paused = Arc::new(AtomicBool::new(false));
        {
            // hold the slot until it is filled so a very short stream cannot finish first
            let mut slot = self.slot.lock();
            let forwarder = tokio::spawn(
                forward(
                    stream,
                    ForwardContext {
                        track: Arc::clone(&track),
                        generation,
                        voice: Arc::clone(&self.voice),
                        paused: Arc::clone(&paused),
                        cancel: cancel.clone(),
                        slot: Arc::clone(&self.slot),
                    },
                    on_done,
                )
                .instrument(tracing::info_span!("player", session = %self.session)),
            );

            *slot = Slot::Playing(Active {
                track: Arc::clone(&track),
                generation,
                cancel,
                paused,
                forwarder,
            });
        }
        info!("🎵 Now playing: {} (volume {}%)", track.title(), volume);
        Ok(())
    }

    /// Stops the current stream and waits briefly for its processes to exit.
    pub async fn stop(&self) -> Result<(), PlaybackError> {
        let _op = self.ops.lock().await;
        let active = match std::mem::replace(&mut *self.slot.lock(), Slot::Idle) {
            Slot::Idle => return Err(PlaybackError::NotPlaying),
            Slot::Playing(active) | Slot::Paused(active) => active,
        };

        active.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, active.forwarder).await.is_err() {
            warn!("⏱️ Stream for '{}' still shutting down after {:?}", active.track.title(), STOP_GRACE);
        }
        if let Err(e) = self.voice.set_speaking(false).await {
            debug!("Could not clear speaking: {}", e);
        }
        info!("⏹️ Stopped: {}", active.track.title());
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        let _op = self.ops.lock().await;
        {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Playing(active) => {
                    active.paused.store(true, Ordering::SeqCst);
                    *slot = Slot::Paused(active);
                }
                Slot::Paused(active) => {
                    *slot = Slot::Paused(active);
                    return Err(PlaybackError::InvalidState("already paused"));
                }
                Slot::Idle => return Err(PlaybackError::NotPlaying),
            }
        }
        if let Err(e) = self.voice.set_speaking(false).await {
            warn!("Could not clear speaking: {}", e);
        }
        info!("⏸️ Paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), PlaybackError> {
        let _op = self.ops.lock().await;
        {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Paused(active) => {
                    active.paused.store(false, Ordering::SeqCst);
                    *slot = Slot::Playing(active);
                }
                Slot::Playing(active) => {
                    *slot = Slot::Playing(active);
                    return Err(PlaybackError::InvalidState("not paused"));
                }
                Slot::Idle => return Err(PlaybackError::NotPlaying),
            }
        }
        if let Err(e) = self.voice.set_speaking(true).await {
            warn!("Could not set speaking: {}", e);
        }
        info!("▶️ Resumed");
        Ok(())
    }

    /// Clamped to 0–100; takes effect on the next `play`.
    pub fn set_volume(&self, volume: u8) -> u8 {
        let volume = volume.min(100);
        self.volume.store(volume, Ordering::SeqCst);
        info!("🔊 Volume set to {}%", volume);
        volume
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlayerState {
        self.slot.lock().state()
    }

    pub fn now_playing(&self) -> Option<Arc<Track>> {
        self.slot.lock().active().map(|a| Arc::clone(&a.track))
    }

    /// Stops whatever is playing; never fails.
    pub async fn cleanup(&self) {
        if self.state() != PlayerState::Idle {
            if let Err(e) = self.stop().await {
                debug!("Cleanup stop: {}", e);
            }
        }
    }
}

/// What to hand the extractor when playback starts.
///
/// Stream URLs from resolution expire, so playback goes back to the page the
/// track was found on.
fn playback_input(track: &Track) -> String {
    match track.kind() {
        SourceKind::CatalogVideo | SourceKind::GenericUrl => track.input().trim().to_string(),
        _ => track
            .metadata()
            .and_then(|m| m.webpage_url)
            .unwrap_or_else(|| format!("ytsearch1:{}", track.input().trim())),
    }
}

struct ForwardContext {
    track: Arc<Track>,
    generation: u64,
    voice: Arc<VoiceLink>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    slot: Arc<Mutex<Slot>>,
}

async fn forward(mut stream: FrameStream, ctx: ForwardContext, on_done: OnDone) {
    let mut failure = None;
    let mut sent: u64 = 0;
    let mut rejected: u32 = 0;

    'frames: loop {
        while ctx.paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break 'frames,
                _ = tokio::time::sleep(PAUSE_POLL) => {}
            }
        }

        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            frame = stream.frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        match ctx.voice.send_frame(frame) {
            Ok(()) => {
                sent += 1;
                rejected = 0;
            }
            Err(VoiceError::NotConnected) => {
                warn!("🔌 Voice link lost while playing");
                failure = Some(PlaybackError::NoVoiceLink);
                break;
            }
            Err(e) => {
                rejected += 1;
                debug!("Dropped a frame: {}", e);
                if rejected >= MAX_SEND_FAILURES {
                    failure = Some(PlaybackError::Transport(e.to_string()));
                    break;
                }
            }
        }
    }

    let stopped = ctx.cancel.is_cancelled();
    ctx.cancel.cancel();
    drop(stream.frames);
    if let Err(e) = stream.finished.await {
        warn!("Stream task ended abnormally: {}", e);
    }
    if failure.is_none() && !stopped {
        failure = stream.errors.try_recv().ok().map(PlaybackError::from);
    }
    debug!("Forwarded {} frames of '{}'", sent, ctx.track.title());

    let was_current = {
        let mut slot = ctx.slot.lock();
        let current = slot.active().is_some_and(|a| a.generation == ctx.generation);
        if current {
            *slot = Slot::Idle;
        }
        current
    };
    if was_current {
        if let Err(e) = ctx.voice.set_speaking(false).await {
            debug!("Could not clear speaking: {}", e);
        }
    }

    match &failure {
        Some(e) => warn!("❌ Playback of '{}' failed: {}", ctx.track.title(), e),
        None => debug!("🏁 Playback of '{}' ended", ctx.track.title()),
    }
    on_done(ctx.track, failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            test_support::{connected_voice, ready_track, FakeSource},
            voice::{MockVoiceConnection, MockVoiceGateway, VoiceConnection},
        },
        error::StreamError,
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, UserId};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn completion() -> (OnDone, oneshot::Receiver<Option<PlaybackError>>) {
        let (tx, rx) = oneshot::channel();
        let on_done: OnDone = Box::new(move |_, error| {
            let _ = tx.send(error);
        });
        (on_done, rx)
    }

    #[tokio::test]
    async fn rejects_tracks_that_are_not_ready() {
        let source = FakeSource::new(3);
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, source.clone(), 20);

        let (on_done, _rx) = completion();
        let err = player
            .play(Track::new("pending", UserId::new(1)), on_done)
            .await
            .unwrap_err();

        assert!(matches!(err, PlaybackError::TrackNotReady(TrackStatus::Pending)));
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn requires_a_voice_link() {
        let voice = Arc::new(VoiceLink::new(
            GuildId::new(1),
            Arc::new(MockVoiceGateway::new()),
            Duration::from_secs(1),
        ));
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::new(1), 20);
        let (on_done, _rx) = completion();
        assert!(matches!(
            player.play(ready_track("x"), on_done).await,
            Err(PlaybackError::NoVoiceLink)
        ));
    }

    #[tokio::test]
    async fn natural_end_completes_once_and_returns_to_idle() {
        let sent = Arc::new(AtomicUsize::new(0));
        let source = FakeSource::new(3);
        let voice = connected_voice(Arc::clone(&sent)).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, source.clone(), 35);

        let (on_done, rx) = completion();
        player.play(ready_track("daft punk"), on_done).await.unwrap();
        assert_eq!(player.state(), PlayerState::Playing);

        assert!(rx.await.unwrap().is_none());
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(player.now_playing().is_none());

        // search input plays from the page it resolved to, not the stream url
        assert_eq!(
            source.inputs.lock().clone(),
            vec![("https://www.youtube.com/watch?v=song".to_string(), 35)]
        );
    }

    #[tokio::test]
    async fn closed_voice_input_ends_the_stream_with_a_transport_error() {
        let mut gateway = MockVoiceGateway::new();
        gateway.expect_join().returning(|_, _| {
            let mut connection = MockVoiceConnection::new();
            connection.expect_is_ready().return_const(true);
            connection.expect_set_speaking().returning(|_| Ok(()));
            connection
                .expect_send_frame()
                .returning(|_| Err(VoiceError::Transport("voice input closed".into())));
            connection.expect_detach().returning(|| ());
            connection.expect_leave().returning(|| Ok(()));
            Ok(Arc::new(connection) as Arc<dyn VoiceConnection>)
        });
        let voice = Arc::new(VoiceLink::new(
            GuildId::new(1),
            Arc::new(gateway),
            Duration::from_secs(1),
        ));
        voice.connect(ChannelId::new(2)).await.unwrap();
        let source = FakeSource::new(1000);
        let player = SessionPlayer::new(GuildId::new(1), voice, source, 20);

        let (on_done, rx) = completion();
        player.play(ready_track("a"), on_done).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Some(PlaybackError::Transport(_))));
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn second_play_is_rejected_while_busy() {
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::new(1000), 20);
        let (first, _rx1) = completion();
        let (second, _rx2) = completion();

        player.play(ready_track("a"), first).await.unwrap();
        assert!(matches!(
            player.play(ready_track("b"), second).await,
            Err(PlaybackError::AlreadyPlaying)
        ));
        player.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_completes_the_callback_and_double_stop_is_not_playing() {
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::new(1000), 20);

        assert!(matches!(player.stop().await, Err(PlaybackError::NotPlaying)));

        let (on_done, rx) = completion();
        player.play(ready_track("a"), on_done).await.unwrap();
        player.stop().await.unwrap();

        assert!(rx.await.unwrap().is_none());
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(matches!(player.stop().await, Err(PlaybackError::NotPlaying)));
        player.cleanup().await;
    }

    #[tokio::test]
    async fn pause_and_resume_follow_the_state_machine() {
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::new(1000), 20);

        assert!(matches!(player.pause().await, Err(PlaybackError::NotPlaying)));
        assert!(matches!(player.resume().await, Err(PlaybackError::NotPlaying)));

        let (on_done, _rx) = completion();
        player.play(ready_track("a"), on_done).await.unwrap();
        assert!(matches!(player.resume().await, Err(PlaybackError::InvalidState(_))));

        player.pause().await.unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(matches!(player.pause().await, Err(PlaybackError::InvalidState(_))));

        player.resume().await.unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        player.cleanup().await;
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn stream_failure_is_reported_through_the_callback() {
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::failing(), 20);

        let (on_done, rx) = completion();
        player.play(ready_track("a"), on_done).await.unwrap();

        assert!(matches!(
            rx.await.unwrap(),
            Some(PlaybackError::Stream(StreamError::NoAudio))
        ));
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn volume_is_clamped() {
        let voice = connected_voice(Arc::new(AtomicUsize::new(0))).await;
        let player = SessionPlayer::new(GuildId::new(1), voice, FakeSource::new(1), 250);
        assert_eq!(player.volume(), 100);
        assert_eq!(player.set_volume(180), 100);
        assert_eq!(player.set_volume(0), 0);
    }

    #[test]
    fn direct_urls_play_from_their_input() {
        let track = ready_track("https://youtu.be/abc");
        assert_eq!(playback_input(&track), "https://youtu.be/abc");

        let unresolved_search = Track::new("lofi", UserId::new(1));
        assert_eq!(playback_input(&unresolved_search), "ytsearch1:lofi");
    }
}
