use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::error::VoiceError;

const READY_POLL: Duration = Duration::from_millis(100);

/// Platform capability for joining voice channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(
        &self,
        session: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, VoiceError>;
}

/// An established (or establishing) voice transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError>;

    /// Hands one 20 ms Opus frame to the transport without waiting.
    fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError>;

    /// Stops feeding this connection but keeps the platform call, so a
    /// following `join` moves the call instead of dropping it.
    async fn detach(&self);

    async fn leave(&self) -> Result<(), VoiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Disconnected,
    Connecting,
    Connected,
}

struct LinkState {
    state: VoiceState,
    channel: Option<ChannelId>,
    connection: Option<Arc<dyn VoiceConnection>>,
}

/// One session's voice connection.
///
/// Mutations are serialized by an async mutex; reads go through a sync lock
/// so the frame-forwarding path never waits on a connect in progress.
pub struct VoiceLink {
    session: GuildId,
    gateway: Arc<dyn VoiceGateway>,
    connect_timeout: Duration,
    ops: Mutex<()>,
    link: RwLock<LinkState>,
}

impl VoiceLink {
    pub fn new(session: GuildId, gateway: Arc<dyn VoiceGateway>, connect_timeout: Duration) -> Self {
        Self {
            session,
            gateway,
            connect_timeout,
            ops: Mutex::new(()),
            link: RwLock::new(LinkState {
                state: VoiceState::Disconnected,
                channel: None,
                connection: None,
            }),
        }
    }

    /// Joins `channel`. An existing call is moved rather than left, so the
    /// platform never reports the bot as gone in between.
    pub async fn connect(&self, channel: ChannelId) -> Result<(), VoiceError> {
        let _op = self.ops.lock().await;

        let previous = {
            let link = self.link.read();
            if link.state == VoiceState::Connected && link.channel == Some(channel) {
                debug!("Already connected to {} in {}", channel, self.session);
                return Ok(());
            }
            link.connection.clone()
        };

        if let Some(previous) = &previous {
            info!("🔄 Moving voice link in {} to {}", self.session, channel);
            previous.detach().await;
        }

        self.set(VoiceState::Connecting, Some(channel), None);
        info!("🔗 Joining channel {} in {}", channel, self.session);

        let connection = match self.gateway.join(self.session, channel).await {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(previous) = previous {
                    if let Err(leave_err) = previous.leave().await {
                        warn!("Leaving previous channel failed: {}", leave_err);
                    }
                }
                self.set(VoiceState::Disconnected, None, None);
                return Err(e);
            }
        };

        let deadline = Instant::now() + self.connect_timeout;
        while !connection.is_ready() {
            if Instant::now() >= deadline {
                warn!(
                    "⏱️ Voice link in {} not ready after {:?}, tearing down",
                    self.session, self.connect_timeout
                );
                if let Err(e) = connection.leave().await {
                    warn!("Leaving half-open link failed: {}", e);
                }
                self.set(VoiceState::Disconnected, None, None);
                return Err(VoiceError::ConnectTimeout(self.connect_timeout));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        self.set(VoiceState::Connected, Some(channel), Some(connection));
        info!("✅ Voice link ready in {}", self.session);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), VoiceError> {
        let _op = self.ops.lock().await;
        let connection = self
            .link
            .read()
            .connection
            .clone()
            .ok_or(VoiceError::NotConnected)?;

        let result = connection.leave().await;
        self.set(VoiceState::Disconnected, None, None);
        info!("👋 Voice link closed in {}", self.session);
        result
    }

    pub fn is_connected(&self) -> bool {
        let link = self.link.read();
        link.state == VoiceState::Connected
            && link.connection.as_ref().is_some_and(|c| c.is_ready())
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.link.read().channel
    }

    pub fn state(&self) -> VoiceState {
        self.link.read().state
    }

    pub fn session(&self) -> GuildId {
        self.session
    }

    /// The live connection, only while connected.
    pub fn connection(&self) -> Option<Arc<dyn VoiceConnection>> {
        let link = self.link.read();
        match link.state {
            VoiceState::Connected => link.connection.clone(),
            _ => None,
        }
    }

    pub async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError> {
        let connection = self.connection().ok_or(VoiceError::NotConnected)?;
        connection.set_speaking(speaking).await
    }

    pub fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError> {
        let connection = self.connection().ok_or(VoiceError::NotConnected)?;
        connection.send_frame(frame)
    }

    fn set(
        &self,
        state: VoiceState,
        channel: Option<ChannelId>,
        connection: Option<Arc<dyn VoiceConnection>>,
    ) {
        let mut link = self.link.write();
        link.state = state;
        link.channel = channel;
        link.connection = connection;
    }
}
