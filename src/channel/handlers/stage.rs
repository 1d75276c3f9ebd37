//! Stage requests

use bytes::Bytes;

use crate::channel::handlers::ack;
use crate::channel::server::{ChannelServer, Transfer};
use crate::channel::session::Session;
use crate::channel::stage::StageBinaryKey;
use crate::error::Result;

/// Blob the client polls for while loading a quest; always answered
/// with this fixed buffer
const QUEST_LOAD_KEY: StageBinaryKey = StageBinaryKey { type0: 1, type1: 12 };
const QUEST_LOAD_REPLY: [u8; 8] = [4, 0, 0, 0, 0, 0, 0, 0];

pub fn create_stage(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    player_count: u8,
    stage_id: &str,
) -> Result<()> {
    server.create_stage(stage_id, player_count as u16, Some(session.id))?;
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

/// Ack the transfer, then replay users and objects for the new stage
fn finish_transfer(server: &ChannelServer, session: &Session, ack_handle: u32, transfer: Transfer) {
    ack::simple_ok(session, ack_handle, &[0; 4]);
    server.send_stage_replay(session, &transfer);
}

pub fn enter_stage(server: &ChannelServer, session: &Session, ack_handle: u32, stage_id: &str) -> Result<()> {
    let transfer = server.enter_stage(session, stage_id)?;
    finish_transfer(server, session, ack_handle, transfer);
    Ok(())
}

pub fn move_stage(server: &ChannelServer, session: &Session, ack_handle: u32, stage_id: &str) -> Result<()> {
    let transfer = server.move_stage(session, stage_id)?;
    finish_transfer(server, session, ack_handle, transfer);
    Ok(())
}

pub fn back_stage(server: &ChannelServer, session: &Session, ack_handle: u32) -> Result<()> {
    let transfer = server.back_stage(session)?;
    finish_transfer(server, session, ack_handle, transfer);
    Ok(())
}

pub fn leave_stage(server: &ChannelServer, session: &Session) -> Result<()> {
    server.leave_stage(session);
    Ok(())
}

pub fn lock_stage(server: &ChannelServer, session: &Session, ack_handle: u32, stage_id: &str) -> Result<()> {
    server.lock_stage(stage_id)?;
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

pub fn unlock_stage(server: &ChannelServer, session: &Session) -> Result<()> {
    server.unlock_stage(session);
    Ok(())
}

pub fn reserve_stage(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    ready: u8,
    stage_id: &str,
) -> Result<()> {
    server.reserve_stage(session, stage_id, ready)?;
    ack::simple_ok(session, ack_handle, &[0; 4]);
    Ok(())
}

pub fn unreserve_stage(server: &ChannelServer, session: &Session) -> Result<()> {
    server.unreserve_stage(session);
    Ok(())
}

pub fn set_stage_pass(server: &ChannelServer, session: &Session, password: &str) -> Result<()> {
    server.set_stage_pass(session, password);
    Ok(())
}

pub async fn wait_stage_binary(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    binary_type0: u8,
    binary_type1: u8,
    stage_id: &str,
) -> Result<()> {
    let key = StageBinaryKey::new(binary_type0, binary_type1);
    if key == QUEST_LOAD_KEY {
        ack::buffer_ok(session, ack_handle, Bytes::from_static(&QUEST_LOAD_REPLY));
        return Ok(());
    }
    let data = server.wait_stage_binary(stage_id, key).await?;
    ack::buffer_ok(session, ack_handle, data);
    Ok(())
}

pub fn set_stage_binary(
    server: &ChannelServer,
    binary_type0: u8,
    binary_type1: u8,
    stage_id: &str,
    payload: Bytes,
) -> Result<()> {
    server.set_stage_binary(stage_id, StageBinaryKey::new(binary_type0, binary_type1), payload)
}

/// Unpublished blobs are answered with an empty buffer
pub fn get_stage_binary(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    binary_type0: u8,
    binary_type1: u8,
    stage_id: &str,
) -> Result<()> {
    let key = StageBinaryKey::new(binary_type0, binary_type1);
    let data = server.get_stage_binary(stage_id, key)?.unwrap_or_default();
    ack::buffer_ok(session, ack_handle, data);
    Ok(())
}

pub fn enumerate_client(
    server: &ChannelServer,
    session: &Session,
    ack_handle: u32,
    get_type: u8,
    stage_id: &str,
) -> Result<()> {
    let data = server.enumerate_clients(stage_id, get_type)?;
    ack::buffer_ok(session, ack_handle, data);
    Ok(())
}

pub fn enumerate_stage(server: &ChannelServer, session: &Session, ack_handle: u32, prefix: &str) -> Result<()> {
    ack::buffer_ok(session, ack_handle, server.enumerate_stages(prefix));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ChannelConfig;
    use crate::error::{ChannelError, ACK_SUCCESS};
    use crate::network::packet::{parse_all, Ack, Packet};

    fn setup() -> (Arc<ChannelServer>, Arc<Session>) {
        let server = ChannelServer::new(ChannelConfig::default());
        let session = server.register_session("test");
        server.login(&session, 10);
        (server, session)
    }

    fn packets(session: &Session) -> Vec<Packet> {
        session
            .queue()
            .drain()
            .iter()
            .flat_map(|d| parse_all(d).unwrap())
            .collect()
    }

    fn only_ack(session: &Session) -> Ack {
        let mut acks: Vec<Ack> = packets(session)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Ack(ack) => Some(ack),
                _ => None,
            })
            .collect();
        assert_eq!(acks.len(), 1);
        acks.remove(0)
    }

    #[test]
    fn test_enter_stage_cleanup_then_ack() {
        let (server, session) = setup();
        enter_stage(&server, &session, 4, "sl1Ns200p0a0u0").unwrap();

        let got = packets(&session);
        assert_eq!(got[0], Packet::CleanupObject);
        assert!(matches!(&got[1], Packet::Ack(a) if a.ack_handle == 4 && a.error_code == ACK_SUCCESS));
    }

    #[test]
    fn test_replay_lists_other_users_on_first_entry() {
        let (server, a) = setup();
        let b = server.register_session("b");
        server.login(&b, 20);
        server.enter_stage(&b, "room").unwrap();
        b.queue().drain();

        enter_stage(&server, &a, 1, "room").unwrap();
        let got = packets(&a);
        assert!(got.contains(&Packet::InsertUser { char_id: 20 }));
        assert!(got.contains(&Packet::NotifyUserBinary { char_id: 20, binary_type: 3 }));

        // b learns about a once
        assert!(packets(&b).contains(&Packet::InsertUser { char_id: 10 }));

        move_stage(&server, &a, 2, "room2").unwrap();
        assert!(!packets(&a).contains(&Packet::InsertUser { char_id: 20 }));
    }

    #[test]
    fn test_create_existing_stage_fails() {
        let (server, session) = setup();
        create_stage(&server, &session, 1, 4, "party").unwrap();
        only_ack(&session);
        let err = create_stage(&server, &session, 2, 4, "party").unwrap_err();
        assert!(matches!(err, ChannelError::State { .. }));
    }

    #[tokio::test]
    async fn test_quest_load_binary_answered_immediately() {
        let (server, session) = setup();
        wait_stage_binary(&server, &session, 9, 1, 12, "nowhere").await.unwrap();
        let ack = only_ack(&session);
        assert!(ack.is_buffer);
        assert_eq!(&ack.data[..], &QUEST_LOAD_REPLY);
    }

    #[tokio::test]
    async fn test_wait_stage_binary_sees_published_blob() {
        let (server, session) = setup();
        server.create_stage("quest", 4, None).unwrap();

        let waiter = {
            let server = server.clone();
            let session = session.clone();
            tokio::spawn(async move { wait_stage_binary(&server, &session, 5, 1, 1, "quest").await })
        };
        tokio::task::yield_now().await;
        set_stage_binary(&server, 1, 1, "quest", Bytes::from_static(b"blob")).unwrap();
        waiter.await.unwrap().unwrap();

        let ack = only_ack(&session);
        assert_eq!(&ack.data[..], b"blob");
    }

    #[test]
    fn test_get_unpublished_binary_is_empty() {
        let (server, session) = setup();
        server.create_stage("quest", 4, None).unwrap();
        get_stage_binary(&server, &session, 3, 2, 0, "quest").unwrap();
        let ack = only_ack(&session);
        assert!(ack.is_buffer);
        assert!(ack.data.is_empty());
    }

    #[test]
    fn test_reserve_then_enumerate_ready_holders() {
        let (server, session) = setup();
        server.create_stage("party", 4, None).unwrap();
        reserve_stage(&server, &session, 1, 0x01, "party").unwrap();
        only_ack(&session);
        enumerate_client(&server, &session, 2, 1, "party").unwrap();
        assert_eq!(&only_ack(&session).data[..], &[0, 1, 0, 0, 0, 10]);

        // A second reservation only flips the ready flag
        reserve_stage(&server, &session, 1, 0x11, "party").unwrap();
        only_ack(&session);

        enumerate_client(&server, &session, 2, 2, "party").unwrap();
        let ack = only_ack(&session);
        assert_eq!(&ack.data[..], &[0, 1, 0, 0, 0, 10]);

        enumerate_client(&server, &session, 3, 1, "party").unwrap();
        assert_eq!(&only_ack(&session).data[..], &[0, 0]);
    }
}
