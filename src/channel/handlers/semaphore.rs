//! Semaphore requests

use crate::channel::handlers::ack;
use crate::channel::server::ChannelServer;
use crate::channel::session::Session;
use crate::error::Result;

/// Fixed reply to the legacy create request, which allocates nothing
const LEGACY_CREATE_REPLY: [u8; 4] = [0x00, 0x03, 0x00, 0x0d];

pub fn create_semaphore(session: &Session, ack_handle: u32) -> Result<()> {
    ack::simple_ok(session, ack_handle, &LEGACY_CREATE_REPLY);
    Ok(())
}

/// Acks the semaphore ID, or 0 when the group is full
pub fn create_acquire_semaphore(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    player_count: u8,
    name: &str,
) -> Result<()> {
    let id = server.create_acquire_semaphore(session, name, player_count)?;
    ack::simple_ok_u32(session, ack_handle, id);
    Ok(())
}

pub fn acquire_semaphore(server: &ChannelServer, session: &Session, ack_handle: u32, name: &str) -> Result<()> {
    let id = server.acquire_semaphore(session, name)?;
    ack::simple_ok_u32(session, ack_handle, id);
    Ok(())
}

pub fn release_semaphore(server: &ChannelServer, session: &Session, ack_handle: u32) -> Result<()> {
    server.release_semaphore(session);
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

pub fn delete_semaphore(server: &ChannelServer, session: &Session, ack_handle: u32, semaphore_id: u32) -> Result<()> {
    server.delete_semaphore(session, semaphore_id);
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

pub fn check_semaphore(server: &ChannelServer, session: &Session, ack_handle: u32, name: &str) -> Result<()> {
    let exists = server.check_semaphore(name) as u32;
    ack::simple_ok_u32(session, ack_handle, exists);
    Ok(())
}
