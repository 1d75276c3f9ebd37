//! Common test utilities for mhf-channel integration tests
//!
//! This module provides:
//! - `TestClient`, a scripted client speaking the framed protocol over an
//!   in-memory duplex stream attached to a real `ChannelServer`
//! - Server constructors with test-friendly timeouts

#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use mhf_channel::network::packet::{parse_all, Ack, Packet};
use mhf_channel::network::{CryptReader, CryptWriter, FrameWriter, PlainCipher};
use mhf_channel::{ChannelConfig, ChannelServer, Session};

/// How long a test waits for an expected packet
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Config with fast pacing and short waits
pub fn test_config() -> ChannelConfig {
    ChannelConfig {
        send_pacing_ms: 1,
        wait_stage_binary_timeout_secs: 1,
        ..ChannelConfig::default()
    }
}

pub fn test_server() -> Arc<ChannelServer> {
    ChannelServer::new(test_config())
}

/// Scripted client connected through the crypt layer
pub struct TestClient {
    pub session: Arc<Session>,
    writer: CryptWriter<WriteHalf<DuplexStream>>,
    reader: CryptReader<ReadHalf<DuplexStream>>,
    inbox: VecDeque<Packet>,
    next_handle: u32,
}

impl TestClient {
    pub fn connect(server: &Arc<ChannelServer>, name: &str) -> Self {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let session = server.accept_stream(server_side, name);
        let (read_half, write_half) = tokio::io::split(client_side);
        Self {
            session,
            writer: CryptWriter::new(write_half, Arc::new(PlainCipher)),
            reader: CryptReader::new(read_half, Arc::new(PlainCipher)),
            inbox: VecDeque::new(),
            next_handle: 0,
        }
    }

    /// Connect and log in as `char_id`, consuming the login ack
    pub async fn login(server: &Arc<ChannelServer>, char_id: u32) -> Self {
        let mut client = Self::connect(server, &format!("char-{}", char_id));
        let handle = client.handle();
        client
            .send(&[Packet::Login {
                ack_handle: handle,
                char_id,
                login_token_number: 0,
                request_version: 0,
                token: String::new(),
            }])
            .await;
        let ack = client.ack(handle).await;
        assert_eq!(ack.error_code, 0, "login failed");
        client
    }

    /// Fresh ack handle
    pub fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Send `packets` as one group
    pub async fn send(&mut self, packets: &[Packet]) {
        let mut w = FrameWriter::new();
        for p in packets {
            p.write_to(&mut w);
        }
        Packet::End.write_to(&mut w);
        self.writer.send_packet(&w.freeze()).await.unwrap();
    }

    /// Next packet from the server, or None on timeout or closed stream
    pub async fn try_recv(&mut self, timeout: Duration) -> Option<Packet> {
        if let Some(packet) = self.inbox.pop_front() {
            return Some(packet);
        }
        loop {
            let group = match tokio::time::timeout(timeout, self.reader.read_packet()).await {
                Ok(Ok(group)) => group,
                _ => return None,
            };
            self.inbox.extend(parse_all(&group).unwrap());
            if let Some(packet) = self.inbox.pop_front() {
                return Some(packet);
            }
        }
    }

    pub async fn recv(&mut self) -> Packet {
        self.try_recv(RECV_TIMEOUT).await.expect("no packet from server")
    }

    /// Skip packets until one matches `pred`
    pub async fn recv_until<F>(&mut self, mut pred: F) -> Packet
    where
        F: FnMut(&Packet) -> bool,
    {
        loop {
            let packet = self.recv().await;
            if pred(&packet) {
                return packet;
            }
        }
    }

    /// Skip packets until the ack for `handle`
    pub async fn ack(&mut self, handle: u32) -> Ack {
        match self
            .recv_until(|p| matches!(p, Packet::Ack(a) if a.ack_handle == handle))
            .await
        {
            Packet::Ack(ack) => ack,
            _ => unreachable!(),
        }
    }

    /// Send one request and wait for its ack
    pub async fn request<F>(&mut self, build: F) -> Ack
    where
        F: FnOnce(u32) -> Packet,
    {
        let handle = self.handle();
        self.send(&[build(handle)]).await;
        self.ack(handle).await
    }

    /// Collect everything that arrives within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<Packet> {
        let mut out: Vec<Packet> = self.inbox.drain(..).collect();
        while let Some(packet) = self.try_recv(window).await {
            out.push(packet);
        }
        out
    }

    pub async fn enter_stage(&mut self, stage_id: &str) -> Ack {
        let stage_id = stage_id.to_string();
        self.request(|ack_handle| Packet::EnterStage { ack_handle, unk: 0, stage_id })
            .await
    }

    pub async fn move_stage(&mut self, stage_id: &str) -> Ack {
        let stage_id = stage_id.to_string();
        self.request(|ack_handle| Packet::MoveStage { ack_handle, unk: 0, stage_id })
            .await
    }

    pub async fn back_stage(&mut self) -> Ack {
        self.request(|ack_handle| Packet::BackStage { ack_handle }).await
    }

    pub async fn create_acquire(&mut self, name: &str, player_count: u8) -> Ack {
        let semaphore_id = name.to_string();
        self.request(|ack_handle| Packet::CreateAcquireSemaphore {
            ack_handle,
            unk: 0,
            player_count,
            semaphore_id,
        })
        .await
    }

    pub async fn logout(&mut self) {
        self.send(&[Packet::Logout { logout_type: 1 }]).await;
    }
}

/// Poll `cond` until it holds or `RECV_TIMEOUT` passes
pub async fn eventually<F>(mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
