//! Per-connection session: send queue, receive loop, send loop
//!
//! Each accepted connection gets two tasks:
//!
//! ```text
//!   socket ──► CryptReader ──► recv loop ──► handlers::handle_packet_group
//!                                                   │
//!                                                   ▼ queue_send*
//!   socket ◄── CryptWriter ◄── send loop ◄──── SendQueue (bounded)
//! ```
//!
//! The recv loop owns teardown: whatever ends it (EOF, socket error, idle
//! timeout, logout, handler panic) runs [`ChannelServer::logout`] exactly once.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

use crate::channel::handlers;
use crate::channel::server::ChannelServer;
use crate::channel::{CharId, SessionId};
use crate::config::DebugOptions;
use crate::error::{ChannelError, Result};
use crate::network::crypt::{CryptReader, CryptWriter};
use crate::network::opcode::Opcode;
use crate::network::packet::{Ack, Packet};

/// Group terminator appended to every outbound buffer
const END_MARKER: [u8; 2] = [0x00, 0x10];

// ============================================================================
// Send queue
// ============================================================================

struct Queued {
    data: Bytes,
    non_blocking: bool,
}

/// Bounded outbound queue shared by handlers and the send loop
pub struct SendQueue {
    entries: Mutex<VecDeque<Queued>>,
    capacity: usize,
    ready: Notify,
    closed: AtomicBool,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a reply the client is waiting for.
    ///
    /// When full, queued broadcast traffic is dropped first. If the queue is
    /// still full the entry is appended anyway: the caller is the receive
    /// task and must not block on its own peer.
    pub fn push(&self, data: Bytes) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            let before = entries.len();
            entries.retain(|q| !q.non_blocking);
            tracing::warn!(
                "Send queue full, flushed {} non-blocking packets",
                before - entries.len()
            );
        }
        entries.push_back(Queued { data, non_blocking: false });
        drop(entries);
        self.ready.notify_one();
    }

    /// Enqueue broadcast traffic. Dropped when the queue is full.
    pub fn push_non_blocking(&self, data: Bytes) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            tracing::warn!("Send queue full, dropping non-blocking packet");
            return false;
        }
        entries.push_back(Queued { data, non_blocking: true });
        drop(entries);
        self.ready.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take everything queued, oldest first
    pub fn drain(&self) -> Vec<Bytes> {
        self.entries.lock().drain(..).map(|q| q.data).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Mutable per-session fields, guarded by `Session::state`
#[derive(Debug, Default)]
pub struct SessionState {
    pub char_id: CharId,
    /// Stage the session is currently a member of
    pub stage_id: Option<String>,
    /// Stage the session last reserved a slot in
    pub reservation_stage: Option<String>,
    /// Password staged for the next reservation
    pub stage_pass: String,
    /// Previously visited stages, most recent last
    pub move_history: Vec<String>,
    /// Set on the first stage entry; gates the user replay
    pub has_entered_stage: bool,
    /// World-event generation recorded when joining a world-event semaphore
    pub world_event_generation: Option<u32>,
}

/// One connected client
pub struct Session {
    pub id: SessionId,
    /// Channel this session belongs to
    pub channel_id: u16,
    /// Remote address or test label
    pub peer: String,
    queue: SendQueue,
    state: Mutex<SessionState>,
    /// Logout requested; the recv loop stops after the current group
    closing: AtomicBool,
    /// Wakes a recv loop parked on a read when a close is requested
    close_signal: Notify,
    /// Registry teardown already ran
    torn_down: AtomicBool,
    debug: DebugOptions,
}

impl Session {
    pub fn new(
        id: SessionId,
        channel_id: u16,
        peer: impl Into<String>,
        queue_capacity: usize,
        debug: DebugOptions,
    ) -> Self {
        Self {
            id,
            channel_id,
            peer: peer.into(),
            queue: SendQueue::new(queue_capacity),
            state: Mutex::new(SessionState::default()),
            closing: AtomicBool::new(false),
            close_signal: Notify::new(),
            torn_down: AtomicBool::new(false),
            debug,
        }
    }

    pub fn char_id(&self) -> CharId {
        self.state.lock().char_id
    }

    pub fn stage_id(&self) -> Option<String> {
        self.state.lock().stage_id.clone()
    }

    /// Run `f` with the session state locked
    pub fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        f(&mut self.state.lock())
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Queue raw packet bytes (opcode included) for delivery
    pub fn queue_send(&self, data: Bytes) {
        self.trace_outbound(&data);
        self.queue.push(data);
    }

    /// Queue broadcast bytes, dropping them if this session is backed up
    pub fn queue_send_non_blocking(&self, data: Bytes) -> bool {
        self.trace_outbound(&data);
        self.queue.push_non_blocking(data)
    }

    pub fn queue_send_packet(&self, packet: &Packet) {
        self.queue_send(packet.to_bytes());
    }

    /// Queue an ack for `ack_handle`
    pub fn queue_ack(&self, ack: Ack) {
        self.queue_send_packet(&Packet::Ack(ack));
    }

    /// Ask the recv loop to stop after the current group, or right away
    /// if it is waiting on the socket
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close_signal.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mark teardown as done. Returns false if it already ran.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    /// Stop the send loop once the queue drains
    pub(crate) fn close_queue(&self) {
        self.queue.close();
    }

    pub fn trace_inbound(&self, opcode: Opcode, data: &[u8]) {
        if self.debug.log_inbound_messages && !opcode.is_noisy() {
            self.trace("recv", opcode, data);
        }
    }

    fn trace_outbound(&self, data: &[u8]) {
        if !self.debug.log_outbound_messages || data.len() < 2 {
            return;
        }
        if let Ok(opcode) = Opcode::try_from(u16::from_be_bytes([data[0], data[1]])) {
            if !opcode.is_noisy() {
                self.trace("send", opcode, data);
            }
        }
    }

    fn trace(&self, direction: &str, opcode: Opcode, data: &[u8]) {
        if self.debug.log_message_data {
            if data.len() <= self.debug.max_hexdump_length {
                tracing::debug!(
                    "[{}] {} {} ({} bytes): {}",
                    self.peer,
                    direction,
                    opcode,
                    data.len(),
                    hex(data)
                );
            } else {
                tracing::debug!(
                    "[{}] {} {} ({} bytes, dump skipped)",
                    self.peer,
                    direction,
                    opcode,
                    data.len()
                );
            }
        } else {
            tracing::debug!("[{}] {} {}", self.peer, direction, opcode);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("peer", &self.peer)
            .finish()
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Loops
// ============================================================================

/// Read packet groups until the connection ends, then tear the session down
pub async fn recv_loop<R>(server: Arc<ChannelServer>, session: Arc<Session>, reader: CryptReader<R>)
where
    R: AsyncRead + Unpin,
{
    run_recv_loop(server, session, reader, |server, session, group| async move {
        handlers::handle_packet_group(&server, &session, group).await
    })
    .await
}

async fn run_recv_loop<R, H, Fut>(
    server: Arc<ChannelServer>,
    session: Arc<Session>,
    mut reader: CryptReader<R>,
    handle: H,
) where
    R: AsyncRead + Unpin,
    H: Fn(Arc<ChannelServer>, Arc<Session>, Bytes) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let idle_timeout = server.config.idle_timeout();

    loop {
        if session.is_closing() {
            tracing::info!("[{}] closing", session.peer);
            break;
        }

        let read = tokio::select! {
            read = tokio::time::timeout(idle_timeout, reader.read_packet()) => read,
            _ = session.close_signal.notified() => continue,
        };

        let group = match read {
            Err(_) => {
                tracing::info!("[{}] idle for {:?}, disconnecting", session.peer, idle_timeout);
                break;
            }
            Ok(Err(ChannelError::Connection(e)))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                tracing::info!("[{}] disconnected", session.peer);
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!("[{}] read failed: {}", session.peer, e);
                break;
            }
            Ok(Ok(group)) => group,
        };

        let outcome = std::panic::AssertUnwindSafe(handle(server.clone(), session.clone(), group))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("[{}] {}", session.peer, e);
                break;
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("[{}] {}", session.peer, ChannelError::Panic { message });
                break;
            }
        }
    }

    server.logout(&session);
}

/// Drain the send queue onto the socket until the session is torn down
pub async fn send_loop<W>(server: Arc<ChannelServer>, session: Arc<Session>, mut writer: CryptWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    let pacing = server.config.send_pacing();

    'outer: loop {
        for data in session.queue.drain() {
            let mut buf = BytesMut::with_capacity(data.len() + END_MARKER.len());
            buf.extend_from_slice(&data);
            buf.extend_from_slice(&END_MARKER);
            if let Err(e) = writer.send_packet(&buf).await {
                tracing::warn!("[{}] send failed: {}", session.peer, e);
                session.request_close();
                break 'outer;
            }
        }

        if session.queue.is_closed() && session.queue.is_empty() {
            break;
        }

        session.queue.ready.notified().await;
        tokio::time::sleep(pacing).await;
    }

    let _ = writer.shutdown().await;
    tracing::debug!("[{}] send loop exited", session.peer);
}
