//! yt-dlp → ffmpeg → Ogg/Opus → paced 20 ms frames.
//!
//! The two processes live in a [`Pipeline`] that kills them when dropped.
//! Demuxing runs on a blocking thread (symphonia is synchronous) and hands raw
//! packets to an async pacer, which releases frame `N` no earlier than
//! `start + N × 20 ms`.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::VecDeque,
    io::Read,
    process::{ExitStatus, Stdio},
    str::FromStr,
    time::Duration,
};
use symphonia::{
    core::{
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader},
        io::{MediaSourceStream, ReadOnlySource},
    },
    default::formats::OggReader,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};
use tracing::{debug, info, warn, Instrument};

use crate::error::StreamError;

/// Duration of one Opus frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// How far the pacer may fall behind before it stops catching up.
const REANCHOR_AFTER: Duration = Duration::from_millis(200);

const PACKET_BUFFER: usize = 64;
const FRAME_BUFFER: usize = 16;
const STDERR_TAIL_LINES: usize = 20;
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Opus encoder tuning passed to ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpusApplication {
    #[default]
    Audio,
    Voip,
    LowDelay,
}

impl OpusApplication {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpusApplication::Audio => "audio",
            OpusApplication::Voip => "voip",
            OpusApplication::LowDelay => "lowdelay",
        }
    }
}

impl FromStr for OpusApplication {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "audio" => Ok(OpusApplication::Audio),
            "voip" => Ok(OpusApplication::Voip),
            "lowdelay" => Ok(OpusApplication::LowDelay),
            other => Err(format!("unknown opus application: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub bitrate: u32,
    pub application: OpusApplication,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            bitrate: 128_000,
            application: OpusApplication::Audio,
        }
    }
}

/// A running stream.
///
/// `frames` closes at end of stream. A terminal failure, if any, arrives on
/// `errors` before `finished` completes; `finished` resolves once both
/// processes have been reaped.
pub struct FrameStream {
    pub frames: mpsc::Receiver<Bytes>,
    pub errors: mpsc::Receiver<StreamError>,
    pub finished: JoinHandle<()>,
}

/// Something that turns an input into paced Opus frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(
        &self,
        input: &str,
        volume: u8,
        cancel: CancellationToken,
    ) -> Result<FrameStream, StreamError>;
}

pub struct StreamEncoder {
    options: EncoderOptions,
}

impl StreamEncoder {
    pub fn new(options: EncoderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EncoderOptions {
        &self.options
    }

    /// Checks that both binaries can be executed.
    pub async fn verify_dependencies(&self) -> Result<(), StreamError> {
        for (binary, flag, process) in [
            (&self.options.ytdlp_path, "--version", "yt-dlp"),
            (&self.options.ffmpeg_path, "-version", "ffmpeg"),
        ] {
            let output = Command::new(binary)
                .arg(flag)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|source| StreamError::Spawn { process, source })?;
            if !output.status.success() {
                return Err(StreamError::Pipeline(format!(
                    "{process} --version exited with {}",
                    output.status
                )));
            }
            let version = String::from_utf8_lossy(&output.stdout);
            info!(
                "✅ {} available: {}",
                process,
                version.lines().next().unwrap_or_default().trim()
            );
        }
        Ok(())
    }

    fn ytdlp_args(input: &str) -> Vec<String> {
        [
            "-f",
            "bestaudio/best",
            "--no-playlist",
            "--quiet",
            "--no-warnings",
            "-o",
            "-",
            input,
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    fn ffmpeg_args(&self, volume: u8) -> Vec<String> {
        let gain = f32::from(volume.min(100)) / 100.0;
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
            "-i".into(),
            "pipe:0".into(),
            "-vn".into(),
            "-af".into(),
            format!("volume={gain:.2}"),
            "-c:a".into(),
            "libopus".into(),
            "-b:a".into(),
            self.options.bitrate.to_string(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "2".into(),
            "-frame_duration".into(),
            "20".into(),
            "-application".into(),
            self.options.application.as_str().into(),
            "-f".into(),
            "ogg".into(),
            "pipe:1".into(),
        ]
    }
}

#[async_trait]
impl FrameSource for StreamEncoder {
    async fn open(
        &self,
        input: &str,
        volume: u8,
        cancel: CancellationToken,
    ) -> Result<FrameStream, StreamError> {
        let mut ytdlp = Command::new(&self.options.ytdlp_path)
            .args(Self::ytdlp_args(input))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                process: "yt-dlp",
                source,
            })?;

        let audio: Stdio = ytdlp
            .stdout
            .take()
            .ok_or_else(|| StreamError::Pipeline("yt-dlp stdout unavailable".into()))?
            .try_into()
            .map_err(|e: std::io::Error| StreamError::Pipeline(e.to_string()))?;

        let mut ffmpeg = Command::new(&self.options.ffmpeg_path)
            .args(self.ffmpeg_args(volume))
            .stdin(audio)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                process: "ffmpeg",
                source,
            })?;

        let ogg = ffmpeg
            .stdout
            .take()
            .ok_or_else(|| StreamError::Pipeline("ffmpeg stdout unavailable".into()))?;

        let ytdlp_log = ytdlp.stderr.take().map(tail_lines);
        let ffmpeg_log = ffmpeg.stderr.take().map(tail_lines);
        let pipeline = Pipeline {
            ytdlp,
            ffmpeg,
            ytdlp_log,
            ffmpeg_log,
        };

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_BUFFER);
        let bridge = SyncIoBridge::new(ogg);
        let demux_cancel = cancel.clone();
        let demuxer =
            tokio::task::spawn_blocking(move || demux(bridge, packet_tx, demux_cancel));

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(1);
        debug!("🎼 Pipeline started for {}", input);

        let finished = tokio::spawn(
            run(pipeline, demuxer, packet_rx, frame_tx, error_tx, cancel).in_current_span(),
        );

        Ok(FrameStream {
            frames: frame_rx,
            errors: error_rx,
            finished,
        })
    }
}

/// The two child processes of one stream.
struct Pipeline {
    ytdlp: Child,
    ffmpeg: Child,
    ytdlp_log: Option<JoinHandle<String>>,
    ffmpeg_log: Option<JoinHandle<String>>,
}

struct Reaped {
    ytdlp: Option<ExitStatus>,
    ytdlp_log: String,
    ffmpeg_log: String,
}

impl Pipeline {
    /// Waits for both processes to exit, killing them first when `kill` is set
    /// or when they outlive [`EXIT_WAIT`].
    async fn reap(mut self, kill: bool) -> Reaped {
        if kill {
            let _ = self.ffmpeg.start_kill();
            let _ = self.ytdlp.start_kill();
        }
        let ffmpeg = wait_or_kill(&mut self.ffmpeg).await;
        let ytdlp = wait_or_kill(&mut self.ytdlp).await;
        debug!("Pipeline reaped (yt-dlp: {:?}, ffmpeg: {:?})", ytdlp, ffmpeg);

        Reaped {
            ytdlp,
            ytdlp_log: collect_log(self.ytdlp_log.take()).await,
            ffmpeg_log: collect_log(self.ffmpeg_log.take()).await,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.ffmpeg.start_kill();
        let _ = self.ytdlp.start_kill();
    }
}

async fn wait_or_kill(child: &mut Child) -> Option<ExitStatus> {
    match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

async fn collect_log(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Keeps the last few stderr lines of a child for error reports.
fn tail_lines<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Reads Ogg pages from `source` and forwards every packet.
///
/// Ends quietly at end of input; any other failure is forwarded once.
fn demux<R>(
    source: R,
    packets: mpsc::Sender<Result<Bytes, StreamError>>,
    cancel: CancellationToken,
) where
    R: Read + Send + Sync + 'static,
{
    let stream = MediaSourceStream::new(Box::new(ReadOnlySource::new(source)), Default::default());
    let mut reader = match OggReader::try_new(stream, &FormatOptions::default()) {
        Ok(reader) => reader,
        Err(e) => {
            let _ = packets.blocking_send(Err(StreamError::Demux(e.to_string())));
            return;
        }
    };

    while !cancel.is_cancelled() {
        match reader.next_packet() {
            Ok(packet) => {
                if packets.blocking_send(Ok(Bytes::from(packet.data))).is_err() {
                    return;
                }
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return;
            }
            Err(SymphoniaError::ResetRequired) => return,
            Err(e) => {
                let _ = packets.blocking_send(Err(StreamError::Demux(e.to_string())));
                return;
            }
        }
    }
}

fn is_opus_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

#[derive(Debug, Default)]
struct PaceOutcome {
    frames: u64,
    demux_error: Option<StreamError>,
    cancelled: bool,
    consumer_gone: bool,
}

/// Releases frame `N` (1-indexed) no earlier than `anchor + N × 20 ms`.
async fn pace(
    mut packets: mpsc::Receiver<Result<Bytes, StreamError>>,
    frames: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> PaceOutcome {
    let mut outcome = PaceOutcome::default();
    let mut anchor = Instant::now();
    let mut since_anchor: u32 = 0;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                break;
            }
            packet = packets.recv() => packet,
        };

        let frame = match packet {
            None => break,
            Some(Err(e)) => {
                outcome.demux_error = Some(e);
                break;
            }
            Some(Ok(frame)) if is_opus_header(&frame) => continue,
            Some(Ok(frame)) => frame,
        };

        since_anchor += 1;
        let due = anchor + FRAME_DURATION * since_anchor;
        let now = Instant::now();
        if now > due + REANCHOR_AFTER {
            debug!("Pacer {:?} behind, re-anchoring", now - due);
            anchor = now;
            since_anchor = 1;
        }
        let due = anchor + FRAME_DURATION * since_anchor;

        tokio::select! {
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                break;
            }
            _ = tokio::time::sleep_until(due) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                break;
            }
            sent = frames.send(frame) => {
                if sent.is_err() {
                    outcome.consumer_gone = true;
                    break;
                }
            }
        }
        outcome.frames += 1;
    }
    outcome
}

async fn run(
    pipeline: Pipeline,
    demuxer: JoinHandle<()>,
    packets: mpsc::Receiver<Result<Bytes, StreamError>>,
    frames: mpsc::Sender<Bytes>,
    errors: mpsc::Sender<StreamError>,
    cancel: CancellationToken,
) {
    let outcome = pace(packets, frames, &cancel).await;
    let stopped_early = outcome.cancelled || outcome.consumer_gone;
    let reaped = pipeline.reap(stopped_early).await;
    if let Err(e) = demuxer.await {
        warn!("Demux thread ended abnormally: {}", e);
    }

    if stopped_early {
        debug!("Stream stopped after {} frames", outcome.frames);
        return;
    }

    match (outcome.frames, outcome.demux_error) {
        (0, demux_error) => {
            let error = failure_reason(&reaped, demux_error);
            warn!("❌ Stream failed before any audio: {}", error);
            let _ = errors.send(error).await;
        }
        (frames, Some(e)) => {
            warn!("⚠️ Stream ended early after {} frames: {}", frames, e);
        }
        (frames, None) => {
            debug!("🏁 Stream finished: {} frames", frames);
        }
    }
}

fn failure_reason(reaped: &Reaped, demux_error: Option<StreamError>) -> StreamError {
    if let Some(status) = reaped.ytdlp.filter(|s| !s.success()) {
        let detail = if reaped.ytdlp_log.is_empty() {
            "no error output".to_string()
        } else {
            reaped.ytdlp_log.clone()
        };
        return StreamError::Pipeline(format!("yt-dlp exited with {status}: {detail}"));
    }
    match demux_error {
        Some(e) if !reaped.ffmpeg_log.is_empty() => {
            StreamError::Demux(format!("{e} (ffmpeg: {})", reaped.ffmpeg_log))
        }
        Some(e) => e,
        None => StreamError::NoAudio,
    }
}
