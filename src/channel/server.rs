//! Channel server: registries, stage and semaphore operations, broadcast scopes
//!
//! `ChannelServer` is the aggregate every handler works through. It owns the
//! session, stage and semaphore maps plus the world-event counters, and it
//! runs the accept and session-management tasks for one listening port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::relay::{BinChat, RelayEvent, CHAT_MESSAGE_TYPE};
use crate::channel::semaphore::{JoinOutcome, Semaphore};
use crate::channel::session::{self, Session};
use crate::channel::stage::{Stage, StageBinaryKey, StageObject, DEFAULT_LOBBY, PRESEEDED_LOBBIES};
use crate::channel::world::World;
use crate::channel::world_state::{RegisterKind, RegisterOp, RegisterUpdate, WorldEventState};
use crate::channel::{CharId, SessionId};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::network::crypt::{CryptReader, CryptWriter, PacketCipher, PlainCipher};
use crate::network::frame::FrameWriter;
use crate::network::packet::Packet;

/// First numeric ID handed to an ordinary semaphore
const FIRST_SEMAPHORE_ID: u32 = 7;

/// Outcome of a successful stage transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub stage_id: String,
    /// Stage the session left, if any
    pub previous: Option<String>,
    /// First stage entry of this session
    pub first_entry: bool,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub channel_id: u16,
    pub sessions: usize,
    pub stages: usize,
    pub active_stages: usize,
    pub semaphores: usize,
    pub world_event_generation: u32,
}

pub struct ChannelServer {
    pub config: ChannelConfig,
    cipher: Arc<dyn PacketCipher>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    stages: RwLock<HashMap<String, Arc<RwLock<Stage>>>>,
    semaphores: RwLock<HashMap<String, Arc<Mutex<Semaphore>>>>,
    world_event: Mutex<WorldEventState>,
    world: RwLock<Weak<World>>,
    relay_tx: broadcast::Sender<RelayEvent>,
    next_session_id: AtomicU64,
    next_semaphore_id: AtomicU32,
}

impl ChannelServer {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        Self::with_cipher(config, Arc::new(PlainCipher))
    }

    pub fn with_cipher(config: ChannelConfig, cipher: Arc<dyn PacketCipher>) -> Arc<Self> {
        let mut stages = HashMap::new();
        for id in PRESEEDED_LOBBIES {
            stages.insert(
                id.to_string(),
                Arc::new(RwLock::new(Stage::new(*id, config.lobby_capacity))),
            );
        }

        // Relay events are best-effort; lagging subscribers skip ahead
        let (relay_tx, _) = broadcast::channel(100);

        Arc::new(Self {
            world_event: Mutex::new(WorldEventState::new(config.world_event.counters)),
            config,
            cipher,
            sessions: RwLock::new(HashMap::new()),
            stages: RwLock::new(stages),
            semaphores: RwLock::new(HashMap::new()),
            world: RwLock::new(Weak::new()),
            relay_tx,
            next_session_id: AtomicU64::new(0),
            next_semaphore_id: AtomicU32::new(FIRST_SEMAPHORE_ID),
        })
    }

    pub fn id(&self) -> u16 {
        self.config.id
    }

    pub(crate) fn attach_world(&self, world: &Arc<World>) {
        *self.world.write() = Arc::downgrade(world);
    }

    pub fn world(&self) -> Option<Arc<World>> {
        self.world.read().upgrade()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the accept and session-management tasks on `listener`
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let (conn_tx, mut conn_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(64);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if conn_tx.send((stream, addr)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed on {}: {}", local_addr, e);
                        }
                    }
                }
            }
            tracing::info!("Stopped accepting on {}", local_addr);
        });

        let server = self.clone();
        let manager_task = tokio::spawn(async move {
            while let Some((stream, addr)) = conn_rx.recv().await {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                }
                server.accept_stream(stream, addr.to_string());
            }
            tracing::info!("Session manager for channel {} exiting", server.id());
        });

        tracing::info!("Channel {} listening on {}", self.id(), local_addr);

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            accept_task,
            manager_task,
        })
    }

    /// Register a session over `stream` and spawn its recv and send loops
    pub fn accept_stream<S>(self: &Arc<Self>, stream: S, peer: impl Into<String>) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self.register_session(peer);
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = CryptReader::new(read_half, self.cipher.clone());
        let writer = CryptWriter::new(write_half, self.cipher.clone());

        tokio::spawn(session::send_loop(self.clone(), session.clone(), writer));
        tokio::spawn(session::recv_loop(self.clone(), session.clone(), reader));

        tracing::info!("[{}] new session {} on channel {}", session.peer, session.id, self.id());
        session
    }

    /// Add a session to the registry without attaching a socket
    pub fn register_session(&self, peer: impl Into<String>) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(Session::new(
            id,
            self.config.id,
            peer,
            self.config.send_queue_capacity,
            self.config.debug.clone(),
        ));
        self.sessions.write().insert(id, session.clone());
        session
    }

    /// Teardown cascade. Safe to call more than once.
    ///
    /// Stage members are told the character left, the session leaves its
    /// stage (deleting its objects), drops its reservation and leaves every
    /// semaphore. Empty stages and semaphores are collected on the way.
    pub fn logout(&self, session: &Session) {
        if !session.begin_teardown() {
            return;
        }

        let (char_id, stage_id) = session.with_state(|st| (st.char_id, st.stage_id.take()));

        if let Some(stage_id) = stage_id {
            self.broadcast_stage(&stage_id, &Packet::DeleteUser { char_id }, Some(session.id));
            self.depart_stage(session, &stage_id, char_id);
        }
        self.unreserve_stage(session);
        self.leave_all_semaphores(session);

        self.sessions.write().remove(&session.id);
        session.close_queue();

        tracing::info!("[{}] session {} (char {}) torn down", session.peer, session.id, char_id);
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Find a session by character, on this channel only
    pub fn local_session_by_char_id(&self, char_id: CharId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.char_id() == char_id)
            .cloned()
    }

    /// Find a session by character across the world, or this channel when standalone
    pub fn find_session_by_char_id(&self, char_id: CharId) -> Option<Arc<Session>> {
        match self.world() {
            Some(world) => world.find_session_by_char_id(char_id),
            None => self.local_session_by_char_id(char_id),
        }
    }

    /// Record the character identity of a freshly logged-in session
    pub fn login(&self, session: &Session, char_id: CharId) {
        session.with_state(|st| st.char_id = char_id);
        tracing::info!("[{}] logged in as char {}", session.peer, char_id);
    }

    // ========================================================================
    // Broadcast scopes
    // ========================================================================

    fn send_to(&self, targets: &[SessionId], data: Bytes) {
        if targets.is_empty() {
            return;
        }
        let sessions = self.sessions.read();
        for id in targets {
            if let Some(s) = sessions.get(id) {
                s.queue_send_non_blocking(data.clone());
            }
        }
    }

    /// Send to every member of a stage except `excluded`
    pub fn broadcast_stage(&self, stage_id: &str, packet: &Packet, excluded: Option<SessionId>) {
        let Some(stage) = self.stage(stage_id) else {
            return;
        };
        let members = stage.read().members_except(excluded);
        self.send_to(&members, packet.to_bytes());
    }

    /// Send to every member of a semaphore except `excluded`
    pub fn broadcast_semaphore(&self, name: &str, packet: &Packet, excluded: Option<SessionId>) {
        let Some(sema) = self.semaphore(name) else {
            return;
        };
        let members = sema.lock().members_except(excluded);
        self.send_to(&members, packet.to_bytes());
    }

    /// Send to every session on this channel except `excluded`
    pub fn broadcast(&self, packet: &Packet, excluded: Option<SessionId>) {
        self.broadcast_bytes(packet.to_bytes(), excluded);
    }

    pub(crate) fn broadcast_bytes(&self, data: Bytes, excluded: Option<SessionId>) {
        for s in self.sessions.read().values() {
            if Some(s.id) != excluded {
                s.queue_send_non_blocking(data.clone());
            }
        }
    }

    /// Send to every session of every channel in the world except `excluded`
    pub fn worldcast(&self, packet: &Packet, excluded: Option<&Session>) {
        match self.world() {
            Some(world) => world.worldcast(packet, excluded, None),
            None => self.broadcast(packet, excluded.map(|s| s.id)),
        }
    }

    // ========================================================================
    // Stages
    // ========================================================================

    pub fn stage(&self, stage_id: &str) -> Option<Arc<RwLock<Stage>>> {
        self.stages.read().get(stage_id).cloned()
    }

    fn existing_stage(&self, stage_id: &str) -> Result<Arc<RwLock<Stage>>> {
        self.stage(stage_id)
            .ok_or_else(|| ChannelError::state(format!("stage {} does not exist", stage_id)))
    }

    pub fn stage_count(&self) -> usize {
        self.stages.read().len()
    }

    /// Create a stage; fails if the ID is taken
    pub fn create_stage(&self, stage_id: &str, max_players: u16, host: Option<SessionId>) -> Result<()> {
        let mut stages = self.stages.write();
        if stages.contains_key(stage_id) {
            return Err(ChannelError::state(format!("stage {} already exists", stage_id)));
        }
        let mut stage = Stage::new(stage_id, max_players);
        stage.host = host;
        stages.insert(stage_id.to_string(), Arc::new(RwLock::new(stage)));
        tracing::debug!("Created stage {} ({} players)", stage_id, max_players);
        Ok(())
    }

    /// Admit into `stage_id`, creating the stage if it is unknown. The map
    /// guard is held across the admit so an empty ephemeral stage cannot be
    /// swept between creation and entry.
    fn admit_or_create(&self, session: &Session, stage_id: &str, char_id: CharId) -> Result<()> {
        let mut stages = self.stages.write();
        let stage = stages.entry(stage_id.to_string()).or_insert_with(|| {
            tracing::debug!("Creating stage {} on entry", stage_id);
            Arc::new(RwLock::new(Stage::new(stage_id, self.config.default_stage_capacity)))
        });
        let mut stage = stage.write();
        stage.admit(session.id, char_id)
    }

    /// Move `session` into `stage_id`, creating the stage if it is unknown.
    ///
    /// Membership changes only after the capacity check passes; on failure
    /// the session stays where it was. Queues `CleanupObject` on success.
    fn transfer(&self, session: &Session, stage_id: &str) -> Result<Transfer> {
        let char_id = session.char_id();
        let previous = session.stage_id();

        if let Err(e) = self.admit_or_create(session, stage_id, char_id) {
            self.destruct_empty_stages();
            return Err(e);
        }

        if let Some(prev) = previous.as_deref() {
            if prev != stage_id {
                self.depart_stage(session, prev, char_id);
            }
        }

        let first_entry = session.with_state(|st| {
            st.stage_id = Some(stage_id.to_string());
            if st.reservation_stage.as_deref() == Some(stage_id) {
                st.reservation_stage = None;
            }
            !std::mem::replace(&mut st.has_entered_stage, true)
        });

        self.destruct_empty_stages();
        session.queue_send_packet(&Packet::CleanupObject);

        tracing::debug!("[{}] entered stage {}", session.peer, stage_id);
        Ok(Transfer {
            stage_id: stage_id.to_string(),
            previous,
            first_entry,
        })
    }

    /// Enter a stage, pushing the previous one onto the move history
    pub fn enter_stage(&self, session: &Session, stage_id: &str) -> Result<Transfer> {
        let transfer = self.transfer(session, stage_id)?;
        if let Some(prev) = &transfer.previous {
            if prev != stage_id {
                session.with_state(|st| st.move_history.push(prev.clone()));
            }
        }
        Ok(transfer)
    }

    /// Same history rules as [`enter_stage`](Self::enter_stage)
    pub fn move_stage(&self, session: &Session, stage_id: &str) -> Result<Transfer> {
        self.enter_stage(session, stage_id)
    }

    /// Return to the most recent stage in the move history, or the default lobby.
    /// A failed attempt leaves the history unchanged.
    pub fn back_stage(&self, session: &Session) -> Result<Transfer> {
        let popped = session.with_state(|st| st.move_history.pop());
        let target = popped.clone().unwrap_or_else(|| DEFAULT_LOBBY.to_string());

        match self.transfer(session, &target) {
            Ok(transfer) => Ok(transfer),
            Err(e) => {
                if let Some(id) = popped {
                    session.with_state(|st| st.move_history.push(id));
                }
                Err(e)
            }
        }
    }

    /// Leave the current stage without entering another
    pub fn leave_stage(&self, session: &Session) {
        let (char_id, stage_id) = session.with_state(|st| (st.char_id, st.stage_id.take()));
        if let Some(stage_id) = stage_id {
            self.depart_stage(session, &stage_id, char_id);
            self.destruct_empty_stages();
        }
    }

    fn depart_stage(&self, session: &Session, stage_id: &str, char_id: CharId) {
        let Some(stage) = self.stage(stage_id) else {
            return;
        };
        let departure = stage.write().depart(session.id, char_id);
        for object_id in departure.deleted_objects {
            self.send_to(&departure.remaining, Packet::DeleteObject { object_id }.to_bytes());
        }
    }

    /// Batch sent after a successful transfer: on first entry every other
    /// user on the channel, then the stage's objects not owned by the entrant.
    pub fn send_stage_replay(&self, session: &Session, transfer: &Transfer) {
        let char_id = session.char_id();
        let mut w = FrameWriter::new();

        if transfer.first_entry {
            let others: Vec<CharId> = self
                .sessions
                .read()
                .values()
                .filter(|s| s.id != session.id)
                .map(|s| s.char_id())
                .collect();
            for other in others {
                Packet::InsertUser { char_id: other }.write_to(&mut w);
                for binary_type in 1..=3 {
                    Packet::NotifyUserBinary { char_id: other, binary_type }.write_to(&mut w);
                }
            }
        }

        if let Some(stage) = self.stage(&transfer.stage_id) {
            for object in stage.read().objects_except(char_id) {
                duplicate_object(&object).write_to(&mut w);
            }
        }

        if !w.is_empty() {
            Packet::End.write_to(&mut w);
            session.queue_send(w.freeze());
        }

        if transfer.first_entry {
            self.broadcast(&Packet::InsertUser { char_id }, Some(session.id));
        }
    }

    /// Hold a slot in an existing stage using the session's staged password
    pub fn reserve_stage(&self, session: &Session, stage_id: &str, ready: u8) -> Result<()> {
        let stage = self.existing_stage(stage_id)?;
        let (char_id, password) = session.with_state(|st| (st.char_id, st.stage_pass.clone()));
        stage.write().reserve(char_id, ready, &password)?;
        session.with_state(|st| st.reservation_stage = Some(stage_id.to_string()));
        Ok(())
    }

    /// Drop the session's reservation, if any
    pub fn unreserve_stage(&self, session: &Session) {
        let (char_id, reservation) =
            session.with_state(|st| (st.char_id, st.reservation_stage.take()));
        if let Some(stage) = reservation.and_then(|id| self.stage(&id)) {
            stage.write().unreserve(char_id);
        }
        self.destruct_empty_stages();
    }

    /// Set the password of the reserved stage if the caller holds a slot
    /// there, otherwise stage it for the next reservation
    pub fn set_stage_pass(&self, session: &Session, password: &str) {
        let (char_id, reservation) =
            session.with_state(|st| (st.char_id, st.reservation_stage.clone()));
        if let Some(stage) = reservation.and_then(|id| self.stage(&id)) {
            let mut stage = stage.write();
            if stage.has_reservation(char_id) {
                stage.password = password.to_string();
                return;
            }
        }
        session.with_state(|st| st.stage_pass = password.to_string());
    }

    pub fn lock_stage(&self, stage_id: &str) -> Result<()> {
        self.existing_stage(stage_id)?.write().locked = true;
        Ok(())
    }

    /// Destroy the caller's reserved stage, telling every holder
    pub fn unlock_stage(&self, session: &Session) {
        let Some(stage_id) = session.with_state(|st| st.reservation_stage.take()) else {
            return;
        };
        let removed = self.stages.write().remove(&stage_id);
        let Some(stage) = removed else {
            return;
        };

        let holders: Vec<CharId> = stage.read().reserved_client_slots.keys().copied().collect();
        let destruct = Packet::StageDestruct.to_bytes();
        for char_id in holders {
            if let Some(holder) = self.find_session_by_char_id(char_id) {
                holder.queue_send(destruct.clone());
            }
        }
        tracing::info!("[{}] destructed stage {}", session.peer, stage_id);
    }

    pub fn set_stage_binary(&self, stage_id: &str, key: StageBinaryKey, data: Bytes) -> Result<()> {
        self.existing_stage(stage_id)?.write().set_binary(key, data);
        Ok(())
    }

    pub fn get_stage_binary(&self, stage_id: &str, key: StageBinaryKey) -> Result<Option<Bytes>> {
        Ok(self.existing_stage(stage_id)?.read().binary(key))
    }

    /// Wait until the blob `key` is published in `stage_id`
    pub async fn wait_stage_binary(&self, stage_id: &str, key: StageBinaryKey) -> Result<Bytes> {
        let stage = self.existing_stage(stage_id)?;
        let notify = stage.read().binary_notify();

        let wait = async {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let published = stage.read().binary(key);
                if let Some(data) = published {
                    return data;
                }
                notified.await;
            }
        };

        let timeout = self.config.wait_stage_binary_timeout();
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ChannelError::state(format!(
                "binary {}:{} of stage {} not published within {:?}",
                key.type0, key.type1, stage_id, timeout
            ))
        })
    }

    /// `u16 count` then one entry per non-empty stage whose ID contains `prefix`
    pub fn enumerate_stages(&self, prefix: &str) -> Bytes {
        let mut stages: Vec<(String, Arc<RwLock<Stage>>)> = self
            .stages
            .read()
            .iter()
            .filter(|(id, _)| id.contains(prefix))
            .map(|(id, stage)| (id.clone(), stage.clone()))
            .collect();
        stages.sort_by(|a, b| a.0.cmp(&b.0));

        let mut w = FrameWriter::new();
        w.u16(0);
        let mut count: u16 = 0;
        for (_, stage) in stages {
            let stage = stage.read();
            if stage.is_empty() {
                continue;
            }
            let flags = if stage.locked || !stage.password.is_empty() { 2 } else { 0 };
            w.u16(stage.reserved_client_slots.len() as u16)
                .u16(0)
                .u16(if stage.clients.is_empty() { 0 } else { 1 })
                .u16(stage.max_players)
                .u8(flags)
                .pascal_u8(&stage.id);
            count += 1;
        }
        w.patch_u16(0, count);
        w.freeze()
    }

    /// `u16 count` then character IDs of the stage.
    ///
    /// `get_type` 0 lists members and slot holders, 1 holders not yet ready,
    /// 2 holders that are ready.
    pub fn enumerate_clients(&self, stage_id: &str, get_type: u8) -> Result<Bytes> {
        let stage = self.existing_stage(stage_id)?;
        let char_ids: Vec<CharId> = {
            let stage = stage.read();
            match get_type {
                0 => stage.char_ids(),
                1 | 2 => stage
                    .reserved_client_slots
                    .iter()
                    .filter(|(_, ready)| **ready == (get_type == 2))
                    .map(|(id, _)| *id)
                    .collect(),
                _ => Vec::new(),
            }
        };
        let mut w = FrameWriter::new();
        w.u16(char_ids.len() as u16);
        for id in char_ids {
            w.u32(id);
        }
        Ok(w.freeze())
    }

    /// Remove every empty stage of an ephemeral class
    pub fn destruct_empty_stages(&self) -> usize {
        let mut stages = self.stages.write();
        let before = stages.len();
        stages.retain(|id, stage| {
            let stage = stage.read();
            let keep = !(stage.is_ephemeral() && stage.is_empty());
            if !keep {
                tracing::debug!("Destructing empty stage {}", id);
            }
            keep
        });
        before - stages.len()
    }

    /// Remove `stage_id` if it has no members and no reservations.
    /// Returns false if it was missing or still in use.
    pub fn remove_stage_if_empty(&self, stage_id: &str) -> bool {
        let mut stages = self.stages.write();
        let empty = stages.get(stage_id).map(|s| s.read().is_empty()).unwrap_or(false);
        if empty {
            stages.remove(stage_id);
        }
        empty
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn current_stage(&self, session: &Session) -> Result<(String, Arc<RwLock<Stage>>)> {
        let stage_id = session
            .stage_id()
            .ok_or_else(|| ChannelError::state(format!("session {} is not in a stage", session.id)))?;
        let stage = self.existing_stage(&stage_id)?;
        Ok((stage_id, stage))
    }

    /// Create the caller's object in its stage and show it to the other members
    pub fn create_object(&self, session: &Session, x: f32, y: f32, z: f32) -> Result<StageObject> {
        let (_, stage) = self.current_stage(session)?;
        let char_id = session.char_id();
        let (object, members) = {
            let mut stage = stage.write();
            let object = stage.create_object(char_id, x, y, z)?;
            (object, stage.members_except(Some(session.id)))
        };
        self.send_to(&members, duplicate_object(&object).to_bytes());
        Ok(object)
    }

    /// Move the caller's object and relay the new position to the other members
    pub fn position_object(&self, session: &Session, object_id: u32, x: f32, y: f32, z: f32) -> Result<()> {
        let (stage_id, stage) = self.current_stage(session)?;
        let char_id = session.char_id();
        let members = {
            let mut stage = stage.write();
            if !stage.position_object(char_id, x, y, z) {
                return Err(ChannelError::state(format!(
                    "char {} owns no object in stage {}",
                    char_id, stage_id
                )));
            }
            stage.members_except(Some(session.id))
        };
        self.send_to(&members, Packet::PositionObject { object_id, x, y, z }.to_bytes());
        Ok(())
    }

    // ========================================================================
    // Semaphores
    // ========================================================================

    pub fn semaphore(&self, name: &str) -> Option<Arc<Mutex<Semaphore>>> {
        self.semaphores.read().get(name).cloned()
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.read().len()
    }

    pub fn is_world_event_semaphore(&self, name: &str) -> bool {
        name.starts_with(&self.config.world_event.semaphore_prefix)
    }

    fn is_main_world_event_semaphore(&self, name: &str) -> bool {
        self.is_world_event_semaphore(name)
            && name.ends_with(&self.config.world_event.main_semaphore_suffix)
    }

    /// Join `name`, creating it if needed.
    ///
    /// Returns the semaphore ID, or 0 when it is full. Joining twice returns
    /// the same ID without a second membership.
    pub fn create_acquire_semaphore(&self, session: &Session, name: &str, player_count: u8) -> Result<u32> {
        let world_event = self.is_world_event_semaphore(name);
        let char_id = session.char_id();

        // Join under the map guard so a concurrent sweep cannot drop the
        // semaphore before it has a member
        let (outcome, id) = {
            let mut semas = self.semaphores.write();
            let sema = semas.entry(name.to_string()).or_insert_with(|| {
                let (id, max_players) = if world_event {
                    (world_event_semaphore_id(name), self.config.world_event.max_players)
                } else {
                    (
                        self.next_semaphore_id.fetch_add(1, Ordering::SeqCst),
                        player_count.max(1) as u16,
                    )
                };
                tracing::debug!("Created semaphore {} (id {}, {} players)", name, id, max_players);
                Arc::new(Mutex::new(Semaphore::new(name, id, max_players)))
            });
            let mut sema = sema.lock();
            (sema.join(session.id, char_id), sema.id)
        };

        match outcome {
            JoinOutcome::Full => {
                tracing::debug!("[{}] semaphore {} is full", session.peer, name);
                Ok(0)
            }
            JoinOutcome::AlreadyMember => Ok(id),
            JoinOutcome::Joined => {
                if world_event {
                    let generation = self.world_event.lock().generation();
                    session.with_state(|st| st.world_event_generation = Some(generation));
                }
                Ok(id)
            }
        }
    }

    /// Elect the caller as host of `name`
    pub fn acquire_semaphore(&self, session: &Session, name: &str) -> Result<u32> {
        let sema = self
            .semaphore(name)
            .ok_or_else(|| ChannelError::state(format!("semaphore {} does not exist", name)))?;
        let mut sema = sema.lock();
        sema.set_host(session.id);
        Ok(sema.id)
    }

    /// Drop the host role everywhere the caller holds it
    pub fn release_semaphore(&self, session: &Session) {
        let semas: Vec<_> = self.semaphores.read().values().cloned().collect();
        for sema in semas {
            sema.lock().release_host(session.id);
        }
    }

    pub fn check_semaphore(&self, name: &str) -> bool {
        self.semaphores.read().contains_key(name)
    }

    /// Leave `name`. Empty semaphores are removed.
    pub fn leave_semaphore(&self, session: &Session, name: &str) -> bool {
        let mut left = false;
        if let Some(sema) = self.semaphore(name) {
            left = sema.lock().leave(session.id);
        }
        self.destruct_empty_semaphores();
        left
    }

    /// Delete by numeric ID. World-event semaphores only lose the caller;
    /// other semaphores are removed outright.
    pub fn delete_semaphore(&self, session: &Session, semaphore_id: u32) {
        let found = self
            .semaphores
            .read()
            .iter()
            .find(|(_, s)| s.lock().id == semaphore_id)
            .map(|(name, sema)| (name.clone(), sema.clone()));
        let Some((name, sema)) = found else {
            return;
        };

        if self.is_world_event_semaphore(&name) {
            sema.lock().leave(session.id);
        } else {
            self.semaphores.write().remove(&name);
            tracing::debug!("[{}] deleted semaphore {}", session.peer, name);
        }
        self.destruct_empty_semaphores();
    }

    fn leave_all_semaphores(&self, session: &Session) {
        let semas: Vec<_> = self.semaphores.read().values().cloned().collect();
        for sema in semas {
            sema.lock().leave(session.id);
        }
        self.destruct_empty_semaphores();
    }

    /// Remove every empty semaphore. Resets the world event when the last
    /// world-event semaphore goes away.
    pub fn destruct_empty_semaphores(&self) -> usize {
        let removed: Vec<String> = {
            let mut semas = self.semaphores.write();
            let empty: Vec<String> = semas
                .iter()
                .filter(|(_, s)| s.lock().is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &empty {
                semas.remove(name);
            }
            empty
        };

        for name in &removed {
            tracing::debug!("Destructed empty semaphore {}", name);
        }

        if removed.iter().any(|n| self.is_world_event_semaphore(n)) {
            let any_left = self
                .semaphores
                .read()
                .keys()
                .any(|n| self.is_world_event_semaphore(n));
            if !any_left {
                self.reset_world_event();
            }
        }
        removed.len()
    }

    // ========================================================================
    // World event
    // ========================================================================

    pub fn world_event_generation(&self) -> u32 {
        self.world_event.lock().generation()
    }

    /// Copy of the current counters
    pub fn world_event_snapshot(&self) -> WorldEventState {
        self.world_event.lock().clone()
    }

    pub fn reset_world_event(&self) {
        let mut state = self.world_event.lock();
        state.reset();
        tracing::info!("World event reset, generation {}", state.generation());
    }

    fn main_world_event_semaphore(&self) -> Option<(String, Arc<Mutex<Semaphore>>)> {
        self.semaphores
            .read()
            .iter()
            .find(|(name, _)| self.is_main_world_event_semaphore(name))
            .map(|(name, sema)| (name.clone(), sema.clone()))
    }

    /// Send `packet` to the main world-event semaphore. Returns false when
    /// there is none.
    pub fn broadcast_world_event(&self, packet: &Packet, excluded: Option<SessionId>) -> bool {
        let Some((_, sema)) = self.main_world_event_semaphore() else {
            return false;
        };
        let members = sema.lock().members_except(excluded);
        self.send_to(&members, packet.to_bytes());
        true
    }

    /// Apply an `OperateRegister` payload. Returns the reply buffer.
    pub fn operate_register(&self, session: &Session, register_id: u32, payload: &[u8]) -> Result<Bytes> {
        let kind = RegisterKind::from_id(register_id)
            .ok_or_else(|| ChannelError::protocol(format!("unknown register 0x{:X}", register_id)))?;
        let ops = RegisterOp::parse_all(payload)?;

        let headcount = self
            .main_world_event_semaphore()
            .map(|(_, sema)| sema.lock().len())
            .unwrap_or(0);
        let seen = session.with_state(|st| st.world_event_generation);

        let updates = {
            let mut state = self.world_event.lock();
            if let Some(seen) = seen {
                state.check_generation(seen)?;
            }
            state.apply(kind, &ops, headcount, &self.config.world_event.scaling)?
        };

        Ok(Bytes::from(RegisterUpdate::encode_all(&updates)))
    }

    /// `0 u8, values u8, values × u32` from the addressed register
    pub fn load_register(&self, register_id: u32, values: u8) -> Result<Bytes> {
        let kind = RegisterKind::from_id(register_id)
            .ok_or_else(|| ChannelError::protocol(format!("unknown register 0x{:X}", register_id)))?;
        let counters = self.world_event.lock().load(kind, values);
        let mut w = FrameWriter::new();
        w.u8(0).u8(values);
        for value in counters {
            w.u32(value);
        }
        Ok(w.freeze())
    }

    /// Tell clients the registers changed: every member of the main
    /// world-event semaphore in low-latency mode, otherwise just the caller.
    pub fn notify_registers(&self, session: &Session) {
        let mut w = FrameWriter::new();
        for kind in RegisterKind::ALL {
            Packet::NotifyRegister { register_id: kind.notify_id() }.write_to(&mut w);
        }
        Packet::End.write_to(&mut w);
        let data = w.freeze();

        if self.config.world_event.low_latency {
            if let Some((_, sema)) = self.main_world_event_semaphore() {
                let members = sema.lock().members_except(None);
                self.send_to(&members, data);
                return;
            }
        }
        session.queue_send(data);
    }

    // ========================================================================
    // Chat relay
    // ========================================================================

    /// Receive chat relayed through this channel
    pub fn subscribe_relay(&self) -> broadcast::Receiver<RelayEvent> {
        self.relay_tx.subscribe()
    }

    pub(crate) fn publish_relay(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.relay_tx.send(event);
    }

    /// Send a server-originated chat line to every session on this channel
    pub fn broadcast_chat_message(&self, message: &str) {
        let chat = BinChat::server_notice(message, &self.config.name);
        let packet = Packet::CastedBinary {
            char_id: 0,
            broadcast_type: 0,
            message_type: CHAT_MESSAGE_TYPE,
            payload: chat.encode(),
        };
        self.broadcast(&packet, None);
    }

    pub fn stats(&self) -> ServerStats {
        let (stages, active_stages) = {
            let stages = self.stages.read();
            let active = stages.values().filter(|s| !s.read().clients.is_empty()).count();
            (stages.len(), active)
        };
        ServerStats {
            channel_id: self.id(),
            sessions: self.session_count(),
            stages,
            active_stages,
            semaphores: self.semaphore_count(),
            world_event_generation: self.world_event_generation(),
        }
    }
}

fn duplicate_object(object: &StageObject) -> Packet {
    Packet::DuplicateObject {
        object_id: object.id,
        x: object.x,
        y: object.y,
        z: object.z,
        unk: 0,
        owner_char_id: object.owner_char_id,
    }
}

/// World-event semaphores take their ID from the trailing digit of the name
fn world_event_semaphore_id(name: &str) -> u32 {
    name.chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|d| d + 1)
        .unwrap_or(1)
}

/// Handle to a running accept loop
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    manager_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting. The session manager exits once the forwarding channel drains.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn join(self) {
        if let Err(e) = self.accept_task.await {
            tracing::warn!("Accept task failed: {}", e);
        }
        if let Err(e) = self.manager_task.await {
            tracing::warn!("Session manager failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<ChannelServer> {
        ChannelServer::new(ChannelConfig::default())
    }

    fn login(server: &ChannelServer, char_id: CharId) -> Arc<Session> {
        let session = server.register_session(format!("char-{}", char_id));
        server.login(&session, char_id);
        session
    }

    #[test]
    fn test_lobbies_are_preseeded() {
        let server = server();
        for id in PRESEEDED_LOBBIES {
            assert!(server.stage(id).is_some());
        }
        assert_eq!(server.destruct_empty_stages(), 0);
    }

    #[test]
    fn test_create_stage_rejects_duplicates() {
        let server = server();
        server.create_stage("room1", 2, None).unwrap();
        let err = server.create_stage("room1", 2, None).unwrap_err();
        assert!(matches!(err, ChannelError::State { .. }));
    }

    #[test]
    fn test_transfer_moves_membership() {
        let server = server();
        let s = login(&server, 10);
        server.enter_stage(&s, "sl1Qs1p0a0u0").unwrap();
        server.enter_stage(&s, DEFAULT_LOBBY).unwrap();

        // The quest room emptied and was collected
        assert!(server.stage("sl1Qs1p0a0u0").is_none());
        let lobby = server.stage(DEFAULT_LOBBY).unwrap();
        assert!(lobby.read().clients.contains_key(&s.id));
    }

    #[test]
    fn test_failed_entry_keeps_previous_stage() {
        let server = server();
        server.create_stage("room1", 1, None).unwrap();
        let a = login(&server, 1);
        let b = login(&server, 2);
        server.enter_stage(&a, "room1").unwrap();
        server.enter_stage(&b, DEFAULT_LOBBY).unwrap();

        assert!(server.enter_stage(&b, "room1").is_err());
        assert_eq!(b.stage_id().as_deref(), Some(DEFAULT_LOBBY));
    }

    #[test]
    fn test_back_stage_defaults_to_lobby() {
        let server = server();
        let s = login(&server, 1);
        let transfer = server.back_stage(&s).unwrap();
        assert_eq!(transfer.stage_id, DEFAULT_LOBBY);
    }

    #[test]
    fn test_remove_stage_if_empty_is_idempotent() {
        let server = server();
        server.create_stage("room9", 4, None).unwrap();
        assert!(server.remove_stage_if_empty("room9"));
        assert!(!server.remove_stage_if_empty("room9"));
    }

    #[test]
    fn test_remove_stage_if_empty_keeps_reserved_stage() {
        let server = server();
        server.create_stage("room9", 4, None).unwrap();
        let s = login(&server, 1);
        server.reserve_stage(&s, "room9", 0).unwrap();
        assert!(!server.remove_stage_if_empty("room9"));
        server.unreserve_stage(&s);
        assert!(server.remove_stage_if_empty("room9"));
    }

    #[test]
    fn test_reserve_unknown_stage_is_state_error() {
        let server = server();
        let s = login(&server, 1);
        let err = server.reserve_stage(&s, "nope", 0).unwrap_err();
        assert!(matches!(err, ChannelError::State { .. }));
    }

    #[test]
    fn test_stage_pass_staged_then_applied() {
        let server = server();
        server.create_stage("sl1Qs5", 4, None).unwrap();
        let host = login(&server, 1);
        let guest = login(&server, 2);

        server.reserve_stage(&host, "sl1Qs5", 0).unwrap();
        server.set_stage_pass(&host, "pw");
        assert_eq!(server.stage("sl1Qs5").unwrap().read().password, "pw");

        assert!(server.reserve_stage(&guest, "sl1Qs5", 0).is_err());
        server.set_stage_pass(&guest, "pw");
        server.reserve_stage(&guest, "sl1Qs5", 0).unwrap();
    }

    #[test]
    fn test_unlock_stage_notifies_holders() {
        let server = server();
        server.create_stage("sl1Qs5", 4, None).unwrap();
        let host = login(&server, 1);
        let guest = login(&server, 2);
        server.reserve_stage(&host, "sl1Qs5", 0).unwrap();
        server.reserve_stage(&guest, "sl1Qs5", 0).unwrap();

        server.unlock_stage(&host);
        assert!(server.stage("sl1Qs5").is_none());
        assert_eq!(guest.queue().len(), 1);
    }

    #[test]
    fn test_enumerate_stages_skips_empty() {
        let server = server();
        let s = login(&server, 1);
        server.enter_stage(&s, "sl1Ns211p0a0u0").unwrap();

        let data = server.enumerate_stages("sl1Ns");
        assert_eq!(u16::from_be_bytes([data[0], data[1]]), 1);
        assert!(data.ends_with(b"sl1Ns211p0a0u0\0"));
    }

    #[test]
    fn test_enumerate_clients_includes_reservations() {
        let server = server();
        server.create_stage("room1", 4, None).unwrap();
        let a = login(&server, 1);
        let b = login(&server, 2);
        server.enter_stage(&a, "room1").unwrap();
        server.reserve_stage(&b, "room1", 0).unwrap();

        let data = server.enumerate_clients("room1", 0).unwrap();
        assert_eq!(&data[..2], &[0, 2]);
        assert_eq!(data.len(), 2 + 8);

        let not_ready = server.enumerate_clients("room1", 1).unwrap();
        assert_eq!(&not_ready[..], &[0, 1, 0, 0, 0, 2]);
        let ready = server.enumerate_clients("room1", 2).unwrap();
        assert_eq!(&ready[..], &[0, 0]);
    }

    #[test]
    fn test_semaphore_ids_start_at_seven() {
        let server = server();
        let s = login(&server, 1);
        assert_eq!(server.create_acquire_semaphore(&s, "a", 4).unwrap(), 7);
        assert_eq!(server.create_acquire_semaphore(&s, "b", 4).unwrap(), 8);
        assert_eq!(server.create_acquire_semaphore(&s, "a", 4).unwrap(), 7);
    }

    #[test]
    fn test_world_event_semaphore_id_from_suffix() {
        assert_eq!(world_event_semaphore_id("hs_l0u3B53"), 4);
        assert_eq!(world_event_semaphore_id("hs_l0u3B5x"), 1);
    }

    #[test]
    fn test_acquire_missing_semaphore_fails() {
        let server = server();
        let s = login(&server, 1);
        assert!(server.acquire_semaphore(&s, "missing").is_err());
        server.create_acquire_semaphore(&s, "boss1", 4).unwrap();
        server.acquire_semaphore(&s, "boss1").unwrap();
        assert_eq!(server.semaphore("boss1").unwrap().lock().host, Some(s.id));
        server.release_semaphore(&s);
        assert_eq!(server.semaphore("boss1").unwrap().lock().host, None);
    }

    #[test]
    fn test_delete_semaphore_by_id() {
        let server = server();
        let s = login(&server, 1);
        let id = server.create_acquire_semaphore(&s, "boss1", 4).unwrap();
        server.delete_semaphore(&s, id);
        assert!(!server.check_semaphore("boss1"));
    }

    #[test]
    fn test_last_world_event_semaphore_resets_counters() {
        let server = server();
        let s = login(&server, 1);
        server.create_acquire_semaphore(&s, "hs_l0u3B51", 0).unwrap();
        server.create_acquire_semaphore(&s, "hs_l0u3B53", 0).unwrap();
        let ops = [RegisterOp::SET, 0, 0, 0, 0, 5];
        server.operate_register(&s, 0x60000, &ops).unwrap();

        assert!(server.leave_semaphore(&s, "hs_l0u3B51"));
        assert_eq!(server.world_event_generation(), 1);
        assert!(server.leave_semaphore(&s, "hs_l0u3B53"));
        assert_eq!(server.world_event_generation(), 2);
        assert_eq!(server.world_event_snapshot().array(RegisterKind::Register)[0], 0);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let server = server();
        let s = login(&server, 1);
        server.create_acquire_semaphore(&s, "hs_l0u3B53", 0).unwrap();
        server.reset_world_event();

        let ops = [RegisterOp::INCREMENT, 0, 0, 0, 0, 1];
        let err = server.operate_register(&s, 0x40000, &ops).unwrap_err();
        assert!(matches!(err, ChannelError::State { .. }));
    }

    #[test]
    fn test_load_register_layout() {
        let server = server();
        let data = server.load_register(0x50000, 2).unwrap();
        assert_eq!(&data[..], &[0, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(server.load_register(0x99, 1).is_err());
    }

    #[test]
    fn test_logout_cascade() {
        let server = server();
        server.create_stage("room1", 4, None).unwrap();
        let a = login(&server, 1);
        let b = login(&server, 2);
        server.enter_stage(&a, "room1").unwrap();
        server.enter_stage(&b, "room1").unwrap();
        server.create_object(&a, 1.0, 2.0, 3.0).unwrap();
        server.create_acquire_semaphore(&a, "boss1", 4).unwrap();
        let queued = b.queue().len();

        server.logout(&a);
        server.logout(&a);

        // DeleteUser and DeleteObject, once each
        assert_eq!(b.queue().len(), queued + 2);

        assert!(server.session(a.id).is_none());
        assert!(!server.stage("room1").unwrap().read().clients.contains_key(&a.id));
        assert!(server.stage("room1").unwrap().read().objects.is_empty());
        assert!(!server.check_semaphore("boss1"));
    }

    fn queued_packets(session: &Session) -> Vec<Packet> {
        session
            .queue()
            .drain()
            .iter()
            .flat_map(|data| crate::network::packet::parse_all(data).unwrap())
            .collect()
    }

    #[test]
    fn test_create_acquire_survives_concurrent_sweep() {
        let server = server();
        let s = login(&server, 1);
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    server.destruct_empty_semaphores();
                }
            });

            for i in 0..5_000 {
                let name = format!("boss{}", i);
                let id = server.create_acquire_semaphore(&s, &name, 4).unwrap();
                assert_ne!(id, 0);
                let sema = server.semaphore(&name).expect("joined semaphore was swept");
                assert!(sema.lock().contains(s.id));
                server.leave_semaphore(&s, &name);
            }
            stop.store(true, Ordering::Relaxed);
        });
    }

    #[test]
    fn test_enter_quest_stage_survives_concurrent_sweep() {
        let server = server();
        let s = login(&server, 1);
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    server.destruct_empty_stages();
                }
            });

            for i in 0..5_000 {
                let stage_id = format!("sl1Qs{}p0a0u0", i);
                server.enter_stage(&s, &stage_id).unwrap();
                let stage = server.stage(&stage_id).expect("entered stage was swept");
                assert!(stage.read().clients.contains_key(&s.id));
            }
            stop.store(true, Ordering::Relaxed);
        });
    }

    #[test]
    fn test_rejected_register_batch_leaves_counters() {
        let server = server();
        let s = login(&server, 1);
        server.create_acquire_semaphore(&s, "hs_l0u3B53", 0).unwrap();

        let ops = [RegisterOp::SET, 0, 0, 0, 0, 5, RegisterOp::SET, 99, 0, 0, 0, 1];
        assert!(server.operate_register(&s, 0x40000, &ops).is_err());
        assert_eq!(server.world_event_snapshot().array(RegisterKind::State)[0], 0);
    }

    #[test]
    fn test_broadcast_semaphore_excludes_sender_and_outsiders() {
        let server = server();
        let a = login(&server, 1);
        let b = login(&server, 2);
        let outsider = login(&server, 3);
        server.create_acquire_semaphore(&a, "boss1", 4).unwrap();
        server.create_acquire_semaphore(&b, "boss1", 4).unwrap();
        for s in [&a, &b, &outsider] {
            s.queue().drain();
        }

        server.broadcast_semaphore("boss1", &Packet::DeleteUser { char_id: 9 }, Some(a.id));

        assert_eq!(queued_packets(&b), vec![Packet::DeleteUser { char_id: 9 }]);
        assert!(queued_packets(&a).is_empty());
        assert!(queued_packets(&outsider).is_empty());

        // Unknown semaphore is a no-op
        server.broadcast_semaphore("missing", &Packet::DeleteUser { char_id: 9 }, None);
        assert!(b.queue().is_empty());
    }

    #[test]
    fn test_broadcast_chat_message_reaches_everyone() {
        let server = server();
        let a = login(&server, 1);
        let b = login(&server, 2);
        for s in [&a, &b] {
            s.queue().drain();
        }

        server.broadcast_chat_message("maintenance soon");

        for s in [&a, &b] {
            match &queued_packets(s)[..] {
                [Packet::CastedBinary { char_id: 0, message_type, payload, .. }] => {
                    assert_eq!(*message_type, CHAT_MESSAGE_TYPE);
                    let chat = BinChat::decode(payload).unwrap();
                    assert_eq!(chat.message, "maintenance soon");
                    assert_eq!(chat.sender, server.config.name);
                }
                other => panic!("unexpected packets {:?}", other),
            }
        }
    }

    #[test]
    fn test_stats() {
        let server = server();
        let s = login(&server, 1);
        server.enter_stage(&s, DEFAULT_LOBBY).unwrap();
        let stats = server.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.stages, PRESEEDED_LOBBIES.len());
        assert_eq!(stats.active_stages, 1);
        assert_eq!(stats.world_event_generation, 1);
    }
}
