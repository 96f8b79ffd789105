//! # Audio Module
//!
//! Per-session playback: queue, voice link, transcoding pipeline, player and
//! the loop that ties them together.
//!
//! ## Architecture
//!
//! Each voice session owns one [`session::Session`]:
//!
//! ### [`queue`] - Session Queue
//! - Ordered tracklist with a cursor, bounded history and repeat/shuffle policy
//! - A revision counter lets the playback loop notice user navigation
//!
//! ### [`voice`] - Voice Link
//! - Connection state machine over a [`voice::VoiceGateway`]
//! - [`songbird_gateway`] is the production transport
//!
//! ### [`encoder`] - Stream Encoder
//! - Drives `yt-dlp | ffmpeg` and demuxes Ogg/Opus into 20 ms frames
//! - Emits frames at real-time cadence
//!
//! ### [`player`] - Session Player
//! - Idle/Playing/Paused state machine around one active stream
//! - Forwards frames to the voice link and reports completion once
//!
//! ### [`orchestrator`] - Playback Loop
//! - Waits for the current track to resolve, plays it, moves the queue on
//!
//! [`manager::MusicManager`] is the façade the bot layer talks to.
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo
//! - **Encoding**: Opus, 20 ms frames, bitrate configurable (128kbps default)

pub mod encoder;
pub mod manager;
pub mod orchestrator;
pub mod player;
pub mod queue;
pub mod session;
pub mod songbird_gateway;
pub mod voice;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::MusicManager;
pub use queue::{QueuePage, RepeatMode};
