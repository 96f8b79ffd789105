//! Fakes shared by the audio tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    encoder::{FrameSource, FrameStream},
    voice::{MockVoiceConnection, MockVoiceGateway, VoiceConnection, VoiceGateway, VoiceLink},
};
use crate::{
    error::StreamError,
    sources::{Track, TrackMetadata},
};

/// Produces `frames` frames 20 ms apart, optionally ending with an error.
pub struct FakeSource {
    pub frames: usize,
    pub fail: bool,
    pub opened: AtomicUsize,
    pub inputs: Mutex<Vec<(String, u8)>>,
}

impl FakeSource {
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            frames,
            fail: false,
            opened: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            frames: 0,
            fail: true,
            opened: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn open(
        &self,
        input: &str,
        volume: u8,
        cancel: CancellationToken,
    ) -> Result<FrameStream, StreamError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push((input.to_string(), volume));
        let (frame_tx, frames) = mpsc::channel(4);
        let (error_tx, errors) = mpsc::channel(1);
        let count = self.frames;
        let fail = self.fail;
        let finished = tokio::spawn(async move {
            for n in 0..count {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
                if frame_tx.send(Bytes::from(vec![n as u8])).await.is_err() {
                    return;
                }
            }
            drop(frame_tx);
            if fail {
                let _ = error_tx.send(StreamError::NoAudio).await;
            }
        });
        Ok(FrameStream {
            frames,
            errors,
            finished,
        })
    }
}

/// A gateway whose connections are always ready and count sent frames.
pub fn counting_gateway(sent: Arc<AtomicUsize>) -> Arc<dyn VoiceGateway> {
    let mut gateway = MockVoiceGateway::new();
    gateway.expect_join().returning(move |_, _| {
        let sent = Arc::clone(&sent);
        let mut connection = MockVoiceConnection::new();
        connection.expect_is_ready().return_const(true);
        connection.expect_set_speaking().returning(|_| Ok(()));
        connection.expect_send_frame().returning(move |_| {
            sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        connection.expect_detach().returning(|| ());
        connection.expect_leave().returning(|| Ok(()));
        Ok(Arc::new(connection) as Arc<dyn VoiceConnection>)
    });
    Arc::new(gateway)
}

pub async fn connected_voice(sent: Arc<AtomicUsize>) -> Arc<VoiceLink> {
    let voice = Arc::new(VoiceLink::new(
        GuildId::new(1),
        counting_gateway(sent),
        Duration::from_secs(1),
    ));
    voice
        .connect(ChannelId::new(2))
        .await
        .expect("fake gateway always connects");
    voice
}

pub fn ready_track(input: &str) -> Arc<Track> {
    let track = Track::new(input, UserId::new(1));
    track.mark_processing();
    track.mark_ready(
        TrackMetadata {
            title: format!("{input} (resolved)"),
            webpage_url: Some("https://www.youtube.com/watch?v=song".into()),
            ..Default::default()
        },
        "https://cdn/expiring".into(),
    );
    track
}
