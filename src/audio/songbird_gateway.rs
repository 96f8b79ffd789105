//! Voice transport backed by songbird.
//!
//! songbird mixes PCM, so each Opus frame coming out of the encoder is decoded
//! here and pushed into one long-lived raw PCM input per call. Gaps are filled
//! with silence; "speaking" pauses and resumes that input's track.

use async_trait::async_trait;
use audiopus::{coder::Decoder, packet::Packet, Channels, MutSignals, SampleRate};
use bytes::{Buf, Bytes, BytesMut};
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use symphonia::core::io::MediaSource;
use tracing::{debug, info, warn};

use super::voice::{VoiceConnection, VoiceGateway};
use crate::error::VoiceError;

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u32 = 2;
/// One 20 ms stereo frame of f32 samples.
const SILENCE_BYTES: usize = 960 * CHANNELS as usize * 4;
/// Largest Opus frame (120 ms) per channel.
const MAX_FRAME_SAMPLES: usize = 5_760;
/// About a second of audio may queue up ahead of the mixer.
const PCM_BACKLOG: usize = 50;

pub struct SongbirdGateway {
    manager: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn join(
        &self,
        session: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, VoiceError> {
        let call = self
            .manager
            .join(session, channel)
            .await
            .map_err(|e| VoiceError::Join(format!("{e:?}")))?;

        let (tx, rx) = flume::bounded(PCM_BACKLOG);
        let input: Input = RawAdapter::new(PcmFeed::new(rx), SAMPLE_RATE, CHANNELS).into();

        let ready = Arc::new(AtomicBool::new(false));
        let track = {
            let mut call = call.lock().await;
            ready.store(call.current_connection().is_some(), Ordering::SeqCst);
            for (event, value) in [
                (CoreEvent::DriverConnect, true),
                (CoreEvent::DriverReconnect, true),
                (CoreEvent::DriverDisconnect, false),
            ] {
                call.add_global_event(
                    Event::Core(event),
                    ReadyFlag {
                        ready: Arc::clone(&ready),
                        value,
                    },
                );
            }
            call.play_input(input)
        };

        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| VoiceError::Transport(format!("opus decoder: {e}")))?;

        debug!("🔊 songbird call ready for {}", session);
        Ok(Arc::new(SongbirdConnection {
            manager: Arc::clone(&self.manager),
            session,
            ready,
            track,
            decoder: Mutex::new(decoder),
            pcm: tx,
        }))
    }
}

struct ReadyFlag {
    ready: Arc<AtomicBool>,
    value: bool,
}

#[async_trait]
impl VoiceEventHandler for ReadyFlag {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.ready.store(self.value, Ordering::SeqCst);
        None
    }
}

struct SongbirdConnection {
    manager: Arc<Songbird>,
    session: GuildId,
    ready: Arc<AtomicBool>,
    track: TrackHandle,
    decoder: Mutex<Decoder>,
    pcm: Sender<Vec<f32>>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError> {
        let result = if speaking {
            self.track.play()
        } else {
            self.track.pause()
        };
        result.map_err(|e| VoiceError::Transport(e.to_string()))
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError> {
        let mut pcm = vec![0f32; MAX_FRAME_SAMPLES * CHANNELS as usize];
        let decoded = {
            let packet: Packet<'_> = frame
                .as_ref()
                .try_into()
                .map_err(|e| VoiceError::Transport(format!("bad opus packet: {e}")))?;
            let signals: MutSignals<'_, f32> = (&mut pcm[..])
                .try_into()
                .map_err(|e| VoiceError::Transport(format!("pcm buffer: {e}")))?;
            self.decoder
                .lock()
                .decode_float(Some(packet), signals, false)
                .map_err(|e| VoiceError::Transport(format!("opus decode: {e}")))?
        };
        pcm.truncate(decoded * CHANNELS as usize);

        match self.pcm.try_send(pcm) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Mixer backlog full in {}, dropping a frame", self.session);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(VoiceError::Transport("voice input closed".to_string()))
            }
        }
    }

    async fn detach(&self) {
        if let Err(e) = self.track.stop() {
            warn!("Stopping voice input failed: {}", e);
        }
        self.ready.store(false, Ordering::SeqCst);
    }

    async fn leave(&self) -> Result<(), VoiceError> {
        self.detach().await;
        self.manager
            .remove(self.session)
            .await
            .map_err(|e| VoiceError::Transport(format!("{e:?}")))?;
        info!("👋 Left voice in {}", self.session);
        Ok(())
    }
}

/// Non-blocking PCM byte source for songbird's raw adapter.
///
/// Reads never wait: an empty queue yields one frame of silence, a closed
/// queue ends the stream.
struct PcmFeed {
    rx: Receiver<Vec<f32>>,
    pending: Bytes,
}

impl PcmFeed {
    fn new(rx: Receiver<Vec<f32>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    fn refill(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(samples) => {
                let mut buf = BytesMut::with_capacity(samples.len() * 4);
                for sample in samples {
                    buf.extend_from_slice(&sample.to_le_bytes());
                }
                self.pending = buf.freeze();
                true
            }
            Err(TryRecvError::Empty) => {
                self.pending = Bytes::from(vec![0u8; SILENCE_BYTES]);
                true
            }
            Err(TryRecvError::Disconnected) => false,
        }
    }
}

impl Read for PcmFeed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.has_remaining() && !self.refill() {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Seek for PcmFeed {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live input"))
    }
}

impl MediaSource for PcmFeed {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
