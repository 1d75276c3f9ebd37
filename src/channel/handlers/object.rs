//! Stage object requests

use crate::channel::handlers::ack;
use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::error::Result;

/// Acks the new object's ID
pub fn create_object(server: &ChannelServer, session: &Session, ack_handle: u32, x: f32, y: f32, z: f32) -> Result<()> {
    let object = server.create_object(session, x, y, z)?;
    ack::simple_ok_u32(session, ack_handle, object.id);
    Ok(())
}

pub fn position_object(
    server: &ChannelServer,
    session: &Session,
    object_id: u32,
    x: f32,
    y: f32,
    z: f32,
) -> Result<()> {
    server.position_object(session, object_id, x, y, z)
}
