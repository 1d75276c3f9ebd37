//! Ack helpers shared by every handler

use bytes::Bytes;

use crate::channel::session::Session;
use crate::error::ACK_SUCCESS;
use crate::network::packet::Ack;

pub fn simple_ok(session: &Session, ack_handle: u32, data: &[u8]) {
    session.queue_ack(Ack::simple(ack_handle, ACK_SUCCESS, data));
}

/// Simple success ack whose payload is a big-endian `u32`
pub fn simple_ok_u32(session: &Session, ack_handle: u32, value: u32) {
    simple_ok(session, ack_handle, &value.to_be_bytes());
}

pub fn buffer_ok(session: &Session, ack_handle: u32, data: impl Into<Bytes>) {
    session.queue_ack(Ack::buffer(ack_handle, ACK_SUCCESS, data));
}

/// Failure ack shaped the way the request expects
pub fn failure(session: &Session, ack_handle: u32, buffer: bool, code: u8) {
    let ack = if buffer {
        Ack::buffer(ack_handle, code, Bytes::new())
    } else {
        Ack::simple(ack_handle, code, &[0; 4])
    };
    session.queue_ack(ack);
}
