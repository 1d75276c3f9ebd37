//! Stage lifecycle over the wire: capacity, history, broadcast scopes

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{eventually, test_server, TestClient};
use mhf_channel::network::packet::Packet;

const ROOM: &str = "room1";

#[tokio::test]
async fn test_capacity_scenario() {
    let server = test_server();
    let mut s1 = TestClient::login(&server, 1).await;
    let mut s2 = TestClient::login(&server, 2).await;
    let mut s3 = TestClient::login(&server, 3).await;

    let ack = s1
        .request(|ack_handle| Packet::CreateStage {
            ack_handle,
            unk: 0,
            player_count: 2,
            stage_id: ROOM.into(),
        })
        .await;
    assert_eq!(ack.error_code, 0);

    assert_eq!(s1.enter_stage(ROOM).await.error_code, 0);
    assert_eq!(s2.enter_stage(ROOM).await.error_code, 0);

    let ack = s3.enter_stage(ROOM).await;
    assert_eq!(ack.error_code, 1);
    assert_eq!(s3.session.stage_id(), None);
    {
        let stage = server.stage(ROOM).unwrap();
        let stage = stage.read();
        assert_eq!(stage.clients.len(), 2);
        assert!(!stage.has_reservation(3));
    }

    s1.send(&[Packet::LeaveStage]).await;
    let room = server.stage(ROOM).unwrap();
    assert!(eventually(|| room.read().clients.len() == 1).await);

    assert_eq!(s3.enter_stage(ROOM).await.error_code, 0);
    assert_eq!(s3.session.stage_id().as_deref(), Some(ROOM));
}

#[tokio::test]
async fn test_move_then_back_is_lifo() {
    let server = test_server();
    let mut c = TestClient::login(&server, 1).await;

    c.enter_stage("stA").await;
    c.move_stage("stB").await;
    c.move_stage("stC").await;

    assert_eq!(c.back_stage().await.error_code, 0);
    assert_eq!(c.session.stage_id().as_deref(), Some("stB"));
    assert_eq!(c.back_stage().await.error_code, 0);
    assert_eq!(c.session.stage_id().as_deref(), Some("stA"));
}

#[tokio::test]
async fn test_failed_back_keeps_history() {
    let server = test_server();
    server.create_stage("full", 1, None).unwrap();
    let mut x = TestClient::login(&server, 1).await;
    let mut y = TestClient::login(&server, 2).await;

    x.enter_stage("full").await;
    x.move_stage("next").await;
    assert_eq!(y.enter_stage("full").await.error_code, 0);

    assert_eq!(x.back_stage().await.error_code, 1);
    assert_eq!(x.session.stage_id().as_deref(), Some("next"));

    server.leave_stage(&y.session);
    assert_eq!(x.back_stage().await.error_code, 0);
    assert_eq!(x.session.stage_id().as_deref(), Some("full"));
}

#[tokio::test]
async fn test_stage_cast_excludes_sender_and_other_stages() {
    let server = test_server();
    let mut a = TestClient::login(&server, 1).await;
    let mut b = TestClient::login(&server, 2).await;
    let mut c = TestClient::login(&server, 3).await;
    let mut d = TestClient::login(&server, 4).await;
    for client in [&mut a, &mut b, &mut c] {
        client.enter_stage("room").await;
    }
    d.enter_stage("other").await;

    let window = Duration::from_millis(200);
    for client in [&mut a, &mut b, &mut c, &mut d] {
        client.drain(window).await;
    }

    a.send(&[Packet::CastBinary {
        unk: 0,
        broadcast_type: 0x03,
        message_type: 2,
        payload: Bytes::from_static(b"hi"),
    }])
    .await;

    let expected = Packet::CastedBinary {
        char_id: 1,
        broadcast_type: 0x03,
        message_type: 2,
        payload: Bytes::from_static(b"hi"),
    };
    assert_eq!(b.recv_until(|p| matches!(p, Packet::CastedBinary { .. })).await, expected);
    assert_eq!(c.recv_until(|p| matches!(p, Packet::CastedBinary { .. })).await, expected);

    let is_cast = |p: &Packet| matches!(p, Packet::CastedBinary { .. });
    assert!(!a.drain(window).await.iter().any(is_cast));
    assert!(!d.drain(window).await.iter().any(is_cast));
}

#[tokio::test]
async fn test_entrant_sees_existing_objects() {
    let server = test_server();
    let mut a = TestClient::login(&server, 1).await;
    a.enter_stage("room").await;
    let ack = a
        .request(|ack_handle| Packet::CreateObject { ack_handle, x: 1.0, y: 2.0, z: 3.0, unk: 0 })
        .await;
    let object_id = ack.simple_u32();

    let mut b = TestClient::login(&server, 2).await;
    assert_eq!(b.enter_stage("room").await.error_code, 0);
    let dup = b
        .recv_until(|p| matches!(p, Packet::DuplicateObject { .. }))
        .await;
    assert_eq!(
        dup,
        Packet::DuplicateObject { object_id, x: 1.0, y: 2.0, z: 3.0, unk: 0, owner_char_id: 1 }
    );
}

#[tokio::test]
async fn test_quest_stage_removed_when_emptied() {
    let server = test_server();
    let mut c = TestClient::login(&server, 1).await;
    let quest = "sl1Qs001p0a0u0";

    c.enter_stage(quest).await;
    assert!(server.stage(quest).is_some());
    c.move_stage("stA").await;
    assert!(server.stage(quest).is_none());
}

#[tokio::test]
async fn test_remove_empty_stage_twice_is_noop() {
    let server = test_server();
    server.create_stage("room", 4, None).unwrap();
    let before = server.stage_count();

    assert!(server.remove_stage_if_empty("room"));
    assert!(!server.remove_stage_if_empty("room"));
    assert_eq!(server.stage_count(), before - 1);
}

#[tokio::test]
async fn test_wait_stage_binary_wakes_on_publish() {
    let server = test_server();
    server.create_stage("quest", 4, None).unwrap();
    let mut host = TestClient::login(&server, 1).await;
    let mut guest = TestClient::login(&server, 2).await;

    let handle = guest.handle();
    guest
        .send(&[Packet::WaitStageBinary {
            ack_handle: handle,
            binary_type0: 1,
            binary_type1: 1,
            unk: 0,
            stage_id: "quest".into(),
        }])
        .await;

    host.send(&[Packet::SetStageBinary {
        binary_type0: 1,
        binary_type1: 1,
        stage_id: "quest".into(),
        payload: Bytes::from_static(b"party"),
    }])
    .await;

    let ack = guest.ack(handle).await;
    assert_eq!(ack.error_code, 0);
    assert_eq!(&ack.data[..], b"party");
}

#[tokio::test]
async fn test_wait_stage_binary_times_out_with_failure() {
    let server = test_server();
    server.create_stage("quest", 4, None).unwrap();
    let mut guest = TestClient::login(&server, 1).await;

    let ack = guest
        .request(|ack_handle| Packet::WaitStageBinary {
            ack_handle,
            binary_type0: 2,
            binary_type1: 0,
            unk: 0,
            stage_id: "quest".into(),
        })
        .await;
    assert_eq!(ack.error_code, 1);
    assert!(ack.is_buffer);
}
