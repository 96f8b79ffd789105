//! # Bot Module
//!
//! Gateway glue between serenity and the [`MusicManager`].
//!
//! The handler keeps session state in step with what Discord reports: when
//! the bot is removed from a voice channel (kicked, channel deleted, moved to
//! nothing) the session is torn down so no loop keeps streaming into a dead
//! link. Command handlers reach the manager through [`MusicManagerKey`].

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, VoiceState},
    async_trait,
    prelude::TypeMapKey,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::{voice::VoiceState as LinkState, MusicManager};

/// `TypeMap` slot holding the shared manager.
pub struct MusicManagerKey;

impl TypeMapKey for MusicManagerKey {
    type Value = Arc<MusicManager>;
}

/// Fetches the manager stored in the client's data.
pub async fn manager(ctx: &Context) -> Option<Arc<MusicManager>> {
    ctx.data.read().await.get::<MusicManagerKey>().cloned()
}

pub struct VoicecastBot {
    manager: Arc<MusicManager>,
}

impl VoicecastBot {
    pub fn new(manager: Arc<MusicManager>) -> Self {
        Self { manager }
    }
}

/// The bot was in a channel and now is in none.
fn left_voice(previous: Option<ChannelId>, current: Option<ChannelId>) -> bool {
    previous.is_some() && current.is_none()
}

/// Whether a voice state change means the session lost its link.
///
/// `link` is the session's own view: its state and target channel. A leave
/// reported while the link is joining, or for a channel the link has already
/// moved away from, belongs to a channel move and is ignored.
fn lost_voice(
    previous: Option<ChannelId>,
    current: Option<ChannelId>,
    link: Option<(LinkState, Option<ChannelId>)>,
) -> bool {
    if !left_voice(previous, current) {
        return false;
    }
    match link {
        Some((LinkState::Connecting, _)) => false,
        Some((_, Some(target))) => Some(target) == previous,
        _ => true,
    }
}

#[async_trait]
impl EventHandler for VoicecastBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let previous = old.and_then(|state| state.channel_id);
        let link = self
            .manager
            .registry()
            .get(guild_id)
            .map(|session| (session.voice().state(), session.voice().channel_id()));
        if lost_voice(previous, new.channel_id, link) {
            info!("🔌 Disconnected from voice in {}", guild_id);
            self.teardown(guild_id).await;
        } else if left_voice(previous, new.channel_id) {
            debug!("Ignoring leave from {:?} during a channel move in {}", previous, guild_id);
        } else {
            debug!("Voice state for {} now {:?}", guild_id, new.channel_id);
        }
    }
}

impl VoicecastBot {
    async fn teardown(&self, guild_id: GuildId) {
        self.manager.teardown(guild_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_leaving_every_channel_counts_as_disconnect() {
        let a = ChannelId::new(1);
        let b = ChannelId::new(2);
        assert!(left_voice(Some(a), None));
        assert!(!left_voice(Some(a), Some(b)));
        assert!(!left_voice(None, Some(a)));
        assert!(!left_voice(None, None));
    }

    #[test]
    fn leave_during_a_channel_move_keeps_the_session() {
        let a = ChannelId::new(1);
        let b = ChannelId::new(2);

        // joining b: the old channel reports empty before the move lands
        assert!(!lost_voice(Some(a), None, Some((LinkState::Connecting, Some(b)))));
        // a late leave for a after the link already sits in b
        assert!(!lost_voice(Some(a), None, Some((LinkState::Connected, Some(b)))));
        // the move itself
        assert!(!lost_voice(Some(a), Some(b), Some((LinkState::Connected, Some(b)))));
    }

    #[test]
    fn leave_from_the_linked_channel_tears_down() {
        let a = ChannelId::new(1);
        assert!(lost_voice(Some(a), None, Some((LinkState::Connected, Some(a)))));
        assert!(lost_voice(Some(a), None, Some((LinkState::Disconnected, None))));
        assert!(lost_voice(Some(a), None, None));
    }
}
