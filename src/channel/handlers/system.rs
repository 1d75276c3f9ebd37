//! Login, keep-alive, clock, terminal log and cast binary

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use crate::channel::handlers::ack;
use crate::channel::relay::{
    BinChat, RelayEvent, RelayScope, BROADCAST_SERVER, BROADCAST_STAGE, BROADCAST_TARGETED,
    BROADCAST_WORLD, CHAT_MESSAGE_TYPE,
};
use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::channel::CharId;
use crate::error::Result;
use crate::network::frame::FrameReader;
use crate::network::packet::Packet;

/// Reply to a terminal log upload
const TERMINAL_LOG_ACK: u32 = 0x98bd51a9;

fn now() -> u32 {
    Utc::now().timestamp() as u32
}

pub fn login(server: &ChannelServer, session: &Session, ack_handle: u32, char_id: CharId) -> Result<()> {
    server.login(session, char_id);
    ack::simple_ok_u32(session, ack_handle, now());
    Ok(())
}

pub fn ping(session: &Session, ack_handle: u32) -> Result<()> {
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

pub fn time(session: &Session) -> Result<()> {
    session.queue_send_packet(&Packet::Time {
        get_remote_time: false,
        timestamp: now(),
    });
    Ok(())
}

pub fn terminal_log(session: &Session, ack_handle: u32, log_id: u32, entries: &[[u32; 9]]) -> Result<()> {
    for entry in entries {
        tracing::debug!("[{}] terminal log {}: {:?}", session.peer, log_id, entry);
    }
    ack::simple_ok_u32(session, ack_handle, TERMINAL_LOG_ACK);
    Ok(())
}

/// Re-emit a client cast as `CastedBinary` to the scope it names
pub fn cast_binary(
    server: &Arc<ChannelServer>,
    session: &Session,
    broadcast_type: u8,
    message_type: u8,
    payload: Bytes,
) -> Result<()> {
    let char_id = session.char_id();

    if broadcast_type == BROADCAST_TARGETED {
        let (targets, body) = split_targets(&payload)?;
        let casted = Packet::CastedBinary {
            char_id,
            broadcast_type,
            message_type,
            payload: body,
        };
        for target in targets {
            if let Some(peer) = server.find_session_by_char_id(target) {
                peer.queue_send_packet(&casted);
            }
        }
        return Ok(());
    }

    if message_type == CHAT_MESSAGE_TYPE {
        publish_chat(server, char_id, broadcast_type, &payload);
    }

    let casted = Packet::CastedBinary {
        char_id,
        broadcast_type,
        message_type,
        payload,
    };

    match broadcast_type {
        BROADCAST_WORLD => server.worldcast(&casted, Some(session)),
        BROADCAST_SERVER if message_type == CHAT_MESSAGE_TYPE => {
            // Server chat goes to the world-event group, or nowhere
            if !server.broadcast_world_event(&casted, Some(session.id)) {
                tracing::debug!("[{}] server chat dropped, no world event running", session.peer);
            }
        }
        BROADCAST_SERVER => server.broadcast(&casted, Some(session.id)),
        BROADCAST_STAGE => cast_to_stage(server, session, &casted),
        other => {
            tracing::debug!("[{}] unknown broadcast type 0x{:02x}, casting to stage", session.peer, other);
            cast_to_stage(server, session, &casted);
        }
    }
    Ok(())
}

fn cast_to_stage(server: &ChannelServer, session: &Session, casted: &Packet) {
    if let Some(stage_id) = session.stage_id() {
        server.broadcast_stage(&stage_id, casted, Some(session.id));
    }
}

/// `u16 count, count × u32 char IDs`, then the payload to forward
fn split_targets(payload: &[u8]) -> Result<(Vec<CharId>, Bytes)> {
    let mut r = FrameReader::new(payload);
    let count = r.u16()?;
    let mut targets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        targets.push(r.u32()?);
    }
    Ok((targets, Bytes::copy_from_slice(r.rest())))
}

fn publish_chat(server: &ChannelServer, char_id: CharId, broadcast_type: u8, payload: &[u8]) {
    let Some(scope) = RelayScope::from_broadcast_type(broadcast_type) else {
        return;
    };
    match BinChat::decode(payload) {
        Ok(chat) => server.publish_relay(RelayEvent {
            channel_id: server.id(),
            char_id,
            scope,
            sender: chat.sender,
            message: chat.message,
            timestamp: Utc::now(),
        }),
        Err(e) => tracing::debug!("Chat cast from char {} not relayed: {}", char_id, e),
    }
}
