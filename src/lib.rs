//! Session-scoped voice streaming: asynchronous track resolution, per-session
//! queues and playback loops, and real-time paced Opus delivery.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
