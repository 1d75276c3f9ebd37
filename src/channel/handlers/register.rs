//! World-event register requests

use crate::channel::handlers::ack;
use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::error::Result;

/// Apply the ops, reply with before/after values, then notify listeners
pub fn operate_register(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    register_id: u32,
    payload: &[u8],
) -> Result<()> {
    let reply = server.operate_register(session, register_id, payload)?;
    ack::buffer_ok(session, ack_handle, reply);
    server.notify_registers(session);
    Ok(())
}

pub fn load_register(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    register_id: u32,
    values: u8,
) -> Result<()> {
    let data = server.load_register(register_id, values)?;
    ack::buffer_ok(session, ack_handle, data);
    Ok(())
}
