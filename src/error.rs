//! Error types for the streaming core.
//!
//! Each component reports through its own enum so callers can tell
//! policy outcomes (a full queue) apart from real failures (an extractor
//! crash). Application edges wrap these in [`anyhow::Error`].

use std::time::Duration;
use thiserror::Error;

use crate::sources::TrackStatus;

/// Resolution worker pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The bounded task queue has no room; retry policy belongs to the caller.
    #[error("resolution queue is full")]
    QueueFull,

    /// The pool has been shut down.
    #[error("resolution pool is stopped")]
    Stopped,
}

/// Errors raised while turning user input into playable audio.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The extractor ran but exited unsuccessfully.
    #[error("extractor exited with {status}: {stderr}")]
    Extractor { status: String, stderr: String },

    /// The extractor could not be started at all.
    #[error("failed to run extractor: {0}")]
    Spawn(#[from] std::io::Error),

    /// The extractor produced output we could not understand.
    #[error("unparseable extractor output: {0}")]
    Parse(String),

    /// A search returned nothing.
    #[error("no results for: {0}")]
    NoResults(String),

    /// Catalog lookup failed.
    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    /// The input cannot be resolved by any configured source.
    #[error("unsupported source: {0}")]
    Unsupported(String),
}

/// Errors from the extractor/transcoder pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to spawn {process}: {source}")]
    Spawn {
        process: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Container demuxing failed before any audio was produced.
    #[error("demux failed: {0}")]
    Demux(String),

    /// The stream ended without a single audio frame.
    #[error("stream produced no audio")]
    NoAudio,
}

/// Voice link errors.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice connection not ready after {0:?}")]
    ConnectTimeout(Duration),

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("failed to join voice channel: {0}")]
    Join(String),

    #[error("voice transport error: {0}")]
    Transport(String),
}

/// Session player state errors.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("already playing")]
    AlreadyPlaying,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("invalid player state: {0}")]
    InvalidState(&'static str),

    #[error("no voice link for this session")]
    NoVoiceLink,

    #[error("voice transport failed: {0}")]
    Transport(String),

    #[error("track is not ready (status: {0})")]
    TrackNotReady(TrackStatus),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Session queue errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full (max {0} tracks)")]
    Full(usize),

    #[error("no track at position {0}")]
    NotFound(usize),
}
