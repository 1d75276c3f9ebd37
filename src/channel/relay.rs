//! Chat relay hook
//!
//! Chat casts are published as [`RelayEvent`]s on a broadcast channel so an
//! external bridge can mirror them. The chat envelope inside a cast payload
//! is little-endian, unlike the rest of the protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::CharId;
use crate::error::{ChannelError, Result};

/// `message_type` of a cast carrying a [`BinChat`]
pub const CHAT_MESSAGE_TYPE: u8 = 1;

/// Chat type used for server notices
const CHAT_TYPE_SERVER: u8 = 5;
const SERVER_NOTICE_FLAGS: u16 = 0x80;

/// Cast broadcast scopes
pub const BROADCAST_TARGETED: u8 = 0x01;
pub const BROADCAST_STAGE: u8 = 0x03;
pub const BROADCAST_SERVER: u8 = 0x06;
pub const BROADCAST_WORLD: u8 = 0x0a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayScope {
    Stage,
    Server,
    World,
}

impl RelayScope {
    pub fn from_broadcast_type(broadcast_type: u8) -> Option<Self> {
        match broadcast_type {
            BROADCAST_STAGE => Some(Self::Stage),
            BROADCAST_SERVER => Some(Self::Server),
            BROADCAST_WORLD => Some(Self::World),
            _ => None,
        }
    }
}

/// One relayed chat line
#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    pub channel_id: u16,
    pub char_id: CharId,
    pub scope: RelayScope,
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Chat envelope carried in a chat-type cast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinChat {
    pub unk0: u8,
    pub chat_type: u8,
    pub flags: u16,
    pub message: String,
    pub sender: String,
}

impl BinChat {
    pub fn server_notice(message: &str, sender: &str) -> Self {
        Self {
            unk0: 0,
            chat_type: CHAT_TYPE_SERVER,
            flags: SERVER_NOTICE_FLAGS,
            message: message.to_string(),
            sender: sender.to_string(),
        }
    }

    /// `unk0 u8, type u8, flags u16, sender_len u16, message_len u16,
    /// message NUL, sender NUL`; lengths include the terminator
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.message.len() + self.sender.len() + 2);
        buf.put_u8(self.unk0);
        buf.put_u8(self.chat_type);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.sender.len() as u16 + 1);
        buf.put_u16_le(self.message.len() as u16 + 1);
        buf.put_slice(self.message.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.sender.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 8 {
            return Err(ChannelError::protocol("chat envelope shorter than its header"));
        }
        let unk0 = data.get_u8();
        let chat_type = data.get_u8();
        let flags = data.get_u16_le();
        let sender_len = data.get_u16_le() as usize;
        let message_len = data.get_u16_le() as usize;
        if data.remaining() < sender_len + message_len {
            return Err(ChannelError::protocol(format!(
                "chat envelope truncated: need {} bytes, have {}",
                sender_len + message_len,
                data.remaining()
            )));
        }
        let message = crate::network::frame::trim_nul(&data[..message_len]);
        let sender = crate::network::frame::trim_nul(&data[message_len..message_len + sender_len]);
        Ok(Self {
            unk0,
            chat_type,
            flags,
            message,
            sender,
        })
    }
}
