//! Capacity-bounded membership sets gating a shared activity
//!
//! Not an OS semaphore: members are sessions, "acquiring" means joining the
//! set, and one member may additionally be elected host.

use std::collections::HashMap;

use crate::channel::{CharId, SessionId};

/// Outcome of a join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Full,
}

#[derive(Debug)]
pub struct Semaphore {
    pub name: String,
    /// Numeric ID returned to clients
    pub id: u32,
    pub clients: HashMap<SessionId, CharId>,
    pub max_players: u16,
    pub host: Option<SessionId>,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, id: u32, max_players: u16) -> Self {
        Self {
            name: name.into(),
            id,
            clients: HashMap::new(),
            max_players,
            host: None,
        }
    }

    /// Add `session` if there is room. Joining twice is a no-op.
    pub fn join(&mut self, session: SessionId, char_id: CharId) -> JoinOutcome {
        if self.clients.contains_key(&session) {
            return JoinOutcome::AlreadyMember;
        }
        if self.clients.len() >= self.max_players as usize {
            return JoinOutcome::Full;
        }
        self.clients.insert(session, char_id);
        JoinOutcome::Joined
    }

    /// Remove `session`. Returns false if it was not a member.
    pub fn leave(&mut self, session: SessionId) -> bool {
        if self.host == Some(session) {
            self.host = None;
        }
        self.clients.remove(&session).is_some()
    }

    pub fn set_host(&mut self, session: SessionId) {
        self.host = Some(session);
    }

    /// Drop the host role if `session` holds it
    pub fn release_host(&mut self, session: SessionId) -> bool {
        if self.host == Some(session) {
            self.host = None;
            return true;
        }
        false
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.clients.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn members_except(&self, excluded: Option<SessionId>) -> Vec<SessionId> {
        self.clients
            .keys()
            .copied()
            .filter(|s| Some(*s) != excluded)
            .collect()
    }
}
