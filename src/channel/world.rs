//! Sibling channels sharing one process
//!
//! The widest broadcast scope. Channels hold a weak back-reference, so the
//! world is dropped once the last owner lets go of it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::channel::CharId;
use crate::network::packet::Packet;

#[derive(Default)]
pub struct World {
    channels: RwLock<Vec<Arc<ChannelServer>>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_channel(self: &Arc<Self>, server: Arc<ChannelServer>) {
        server.attach_world(self);
        tracing::info!("Channel {} joined the world", server.id());
        self.channels.write().push(server);
    }

    pub fn channels(&self) -> Vec<Arc<ChannelServer>> {
        self.channels.read().clone()
    }

    pub fn channel(&self, id: u16) -> Option<Arc<ChannelServer>> {
        self.channels.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Send `packet` to every session in the world.
    ///
    /// `excluded_session` is skipped on its own channel; `excluded_channel`
    /// is skipped entirely.
    pub fn worldcast(&self, packet: &Packet, excluded_session: Option<&Session>, excluded_channel: Option<u16>) {
        let data = packet.to_bytes();
        for channel in self.channels() {
            if Some(channel.id()) == excluded_channel {
                continue;
            }
            let excluded = excluded_session
                .filter(|s| s.channel_id == channel.id())
                .map(|s| s.id);
            channel.broadcast_bytes(data.clone(), excluded);
        }
    }

    pub fn find_session_by_char_id(&self, char_id: CharId) -> Option<Arc<Session>> {
        self.channels()
            .iter()
            .find_map(|c| c.local_session_by_char_id(char_id))
    }

    pub fn session_count(&self) -> usize {
        self.channels().iter().map(|c| c.session_count()).sum()
    }
}
