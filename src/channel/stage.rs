//! Stages: named rooms with members, reservations, objects and binary blobs
//!
//! A stage moves through three observable states:
//!
//! ```text
//!            reserve                 enter
//!   Empty ───────────► Reserved ───────────► Active
//!     ▲                   │                    │
//!     └───────────────────┴────────────────────┘
//!          last reservation / member removed
//! ```
//!
//! Stages are plain data. Locking and registry membership live in
//! [`ChannelServer`](super::server::ChannelServer); this module only enforces
//! the per-stage rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::channel::{CharId, SessionId};
use crate::error::{ChannelError, Result};

/// Stage ID of the default lobby, used when the move history is empty
pub const DEFAULT_LOBBY: &str = "sl1Ns200p0a0u0";

/// Lobbies created at startup. They persist while empty.
pub const PRESEEDED_LOBBIES: &[&str] = &[
    DEFAULT_LOBBY,
    "sl1Ns211p0a0u0",
    "sl1Ns260p0a0u0",
    "sl1Ns262p0a0u0",
    "sl1Ns263p0a0u0",
    "sl2Ns379p0a0u0",
    "sl1Ns462p0a0u0",
];

/// Stage classes removed from the registry as soon as they empty:
/// quests, my-series rooms, guild rooms and league rooms.
const EPHEMERAL_CLASSES: &[&str] = &["Qs", "Ms", "Gs", "Ls"];

/// Ready flag values carried by a repeated `ReserveStage`
pub const RESERVE_NOT_READY: u8 = 0x01;
pub const RESERVE_READY: u8 = 0x11;

/// Whether the stage ID belongs to a class destroyed on emptiness
pub fn is_ephemeral(stage_id: &str) -> bool {
    stage_id
        .get(3..5)
        .map(|class| EPHEMERAL_CLASSES.contains(&class))
        .unwrap_or(false)
}

/// Observable lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Empty,
    Reserved,
    Active,
}

/// Key of an opaque stage binary blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageBinaryKey {
    pub type0: u8,
    pub type1: u8,
}

impl StageBinaryKey {
    pub fn new(type0: u8, type1: u8) -> Self {
        Self { type0, type1 }
    }
}

/// A positioned entity owned by one character
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageObject {
    pub id: u32,
    pub owner_char_id: CharId,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Hands out object IDs from a small namespace, skipping IDs still in use.
///
/// IDs are `0x7F << 16 | index` with `index` cycling through `1..=126`;
/// index 0 and 127 do not replicate position updates on the client.
#[derive(Debug, Default)]
pub struct ObjectIdAllocator {
    cursor: u16,
    in_use: HashSet<u16>,
}

impl ObjectIdAllocator {
    const PREFIX: u32 = 0x7F << 16;
    const MAX_INDEX: u16 = 126;

    pub fn allocate(&mut self) -> Option<u32> {
        for _ in 0..Self::MAX_INDEX {
            self.cursor = if self.cursor >= Self::MAX_INDEX { 1 } else { self.cursor + 1 };
            if self.in_use.insert(self.cursor) {
                return Some(Self::PREFIX | self.cursor as u32);
            }
        }
        None
    }

    pub fn release(&mut self, id: u32) {
        self.in_use.remove(&((id & 0xFFFF) as u16));
    }

    pub fn live(&self) -> usize {
        self.in_use.len()
    }
}

/// Result of removing a member from a stage
#[derive(Debug, Default)]
pub struct Departure {
    /// IDs of objects the departing character owned
    pub deleted_objects: Vec<u32>,
    /// Remaining members, for the delete-object broadcast
    pub remaining: Vec<SessionId>,
}

/// A named room
#[derive(Debug)]
pub struct Stage {
    pub id: String,
    /// Members currently present, with their character IDs
    pub clients: HashMap<SessionId, CharId>,
    /// Slots held before entry, keyed by character, with a ready flag
    pub reserved_client_slots: HashMap<CharId, bool>,
    /// At most one object per owning character
    pub objects: HashMap<CharId, StageObject>,
    object_ids: ObjectIdAllocator,
    raw_binary_data: HashMap<StageBinaryKey, Bytes>,
    binary_published: Arc<Notify>,
    pub host: Option<SessionId>,
    pub max_players: u16,
    pub password: String,
    pub locked: bool,
}

impl Stage {
    pub fn new(id: impl Into<String>, max_players: u16) -> Self {
        Self {
            id: id.into(),
            clients: HashMap::new(),
            reserved_client_slots: HashMap::new(),
            objects: HashMap::new(),
            object_ids: ObjectIdAllocator::default(),
            raw_binary_data: HashMap::new(),
            binary_published: Arc::new(Notify::new()),
            host: None,
            max_players,
            password: String::new(),
            locked: false,
        }
    }

    pub fn state(&self) -> StageState {
        if !self.clients.is_empty() {
            StageState::Active
        } else if !self.reserved_client_slots.is_empty() {
            StageState::Reserved
        } else {
            StageState::Empty
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state() == StageState::Empty
    }

    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral(&self.id)
    }

    pub fn has_reservation(&self, char_id: CharId) -> bool {
        self.reserved_client_slots.contains_key(&char_id)
    }

    /// Check whether `session` may become a member.
    ///
    /// Reservation holders always may. Everyone else needs
    /// `reserved + clients < max_players`, not counting the session itself.
    pub fn check_entry(&self, session: SessionId, char_id: CharId) -> Result<()> {
        if self.has_reservation(char_id) || self.clients.contains_key(&session) {
            return Ok(());
        }
        let occupied = self.reserved_client_slots.len() + self.clients.len();
        if occupied >= self.max_players as usize {
            return Err(ChannelError::capacity(format!("stage {}", self.id), self.max_players));
        }
        Ok(())
    }

    /// Make `session` a member, consuming its reservation here if it holds one
    pub fn admit(&mut self, session: SessionId, char_id: CharId) -> Result<()> {
        self.check_entry(session, char_id)?;
        self.reserved_client_slots.remove(&char_id);
        self.clients.insert(session, char_id);
        if self.host.is_none() {
            self.host = Some(session);
        }
        Ok(())
    }

    /// Remove a member and every object its character owns
    pub fn depart(&mut self, session: SessionId, char_id: CharId) -> Departure {
        self.clients.remove(&session);
        if self.host == Some(session) {
            self.host = self.clients.keys().next().copied();
        }

        let mut deleted_objects = Vec::new();
        if let Some(object) = self.objects.remove(&char_id) {
            self.object_ids.release(object.id);
            deleted_objects.push(object.id);
        }

        Departure {
            deleted_objects,
            remaining: self.clients.keys().copied().collect(),
        }
    }

    /// Hold a slot for `char_id`.
    ///
    /// A repeated reservation only updates the ready flag. New reservations
    /// respect the lock flag, the password and the slot count.
    pub fn reserve(&mut self, char_id: CharId, ready: u8, staged_password: &str) -> Result<()> {
        if let Some(flag) = self.reserved_client_slots.get_mut(&char_id) {
            match ready {
                RESERVE_NOT_READY => *flag = false,
                RESERVE_READY => *flag = true,
                _ => {}
            }
            return Ok(());
        }
        if self.locked {
            return Err(ChannelError::state(format!("stage {} is locked", self.id)));
        }
        if !self.password.is_empty() && self.password != staged_password {
            return Err(ChannelError::state(format!("wrong password for stage {}", self.id)));
        }
        if self.reserved_client_slots.len() >= self.max_players as usize {
            return Err(ChannelError::capacity(format!("stage {}", self.id), self.max_players));
        }
        self.reserved_client_slots.insert(char_id, false);
        Ok(())
    }

    /// Drop a reservation. Returns false if none was held.
    pub fn unreserve(&mut self, char_id: CharId) -> bool {
        self.reserved_client_slots.remove(&char_id).is_some()
    }

    /// Create (or replace) the object owned by `owner`
    pub fn create_object(&mut self, owner: CharId, x: f32, y: f32, z: f32) -> Result<StageObject> {
        if let Some(previous) = self.objects.remove(&owner) {
            self.object_ids.release(previous.id);
        }
        let id = self
            .object_ids
            .allocate()
            .ok_or_else(|| ChannelError::capacity(format!("objects in stage {}", self.id), 126))?;
        let object = StageObject { id, owner_char_id: owner, x, y, z };
        self.objects.insert(owner, object);
        Ok(object)
    }

    /// Move the object owned by `owner`. Returns false if it has none.
    pub fn position_object(&mut self, owner: CharId, x: f32, y: f32, z: f32) -> bool {
        match self.objects.get_mut(&owner) {
            Some(object) => {
                object.x = x;
                object.y = y;
                object.z = z;
                true
            }
            None => false,
        }
    }

    /// Objects a newcomer has to be told about
    pub fn objects_except(&self, char_id: CharId) -> Vec<StageObject> {
        self.objects
            .values()
            .filter(|o| o.owner_char_id != char_id)
            .copied()
            .collect()
    }

    pub fn set_binary(&mut self, key: StageBinaryKey, data: Bytes) {
        self.raw_binary_data.insert(key, data);
        self.binary_published.notify_waiters();
    }

    pub fn binary(&self, key: StageBinaryKey) -> Option<Bytes> {
        self.raw_binary_data.get(&key).cloned()
    }

    /// Signal fired on every blob publish
    pub fn binary_notify(&self) -> Arc<Notify> {
        self.binary_published.clone()
    }

    /// Character IDs present or holding a slot, without duplicates
    pub fn char_ids(&self) -> Vec<CharId> {
        let mut ids: Vec<CharId> = self.clients.values().copied().collect();
        for id in self.reserved_client_slots.keys() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Members except `excluded`
    pub fn members_except(&self, excluded: Option<SessionId>) -> Vec<SessionId> {
        self.clients
            .keys()
            .copied()
            .filter(|s| Some(*s) != excluded)
            .collect()
    }
}
