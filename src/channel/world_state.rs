//! Shared world-event counters
//!
//! Three parallel arrays (`register`, `state`, `support`) hold the live
//! counters of a cooperative world event. All mutation happens under the
//! server's single world-event lock. When the last semaphore of the event's
//! naming convention empties, the arrays are zeroed and the generation
//! advances; operations stamped with an older generation are rejected so a
//! finished event cannot be resurrected.
//!
//! Increments to `state` are scaled by a headcount multiplier described by
//! [`ScalingPolicy`]. The policy is configuration, not code, because the exact
//! formula is tuned against captured traffic.

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::network::frame::{FrameReader, FrameWriter};

/// Which counter array a register ID addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    State,
    Support,
    Register,
}

impl RegisterKind {
    /// Accepts both the short (`4`) and semaphore-style (`0x40000`) forms
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0x40000 | 4 => Some(Self::State),
            0x50000 | 5 => Some(Self::Support),
            0x60000 | 6 => Some(Self::Register),
            _ => None,
        }
    }

    /// Short register ID, as carried by `NotifyRegister`
    pub fn notify_id(self) -> u32 {
        match self {
            Self::State => 4,
            Self::Support => 5,
            Self::Register => 6,
        }
    }

    pub const ALL: [RegisterKind; 3] = [Self::State, Self::Support, Self::Register];
}

/// Rounding applied to a scaled increment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    Nearest,
    Floor,
}

impl Rounding {
    fn apply(self, value: f64) -> u32 {
        let rounded = match self {
            Self::Nearest => value.round(),
            Self::Floor => value.floor(),
        };
        rounded.clamp(0.0, u32::MAX as f64) as u32
    }
}

/// Headcount scaling of `state` increments.
///
/// `min = large_group_min` when `register[large_group_register_index]`
/// exceeds `large_group_threshold`, otherwise `small_group_min`. Groups at or
/// above `min` get a multiplier of 1; smaller groups get `min / headcount`.
/// Indices in `exempt_state_indices` are never scaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub small_group_min: u32,
    pub large_group_min: u32,
    pub large_group_register_index: usize,
    pub large_group_threshold: u32,
    pub exempt_state_indices: Vec<usize>,
    pub rounding: Rounding,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            small_group_min: 4,
            large_group_min: 24,
            large_group_register_index: 9,
            large_group_threshold: 8,
            // resurrection and poison counters
            exempt_state_indices: vec![17, 28],
            rounding: Rounding::Nearest,
        }
    }
}

impl ScalingPolicy {
    pub fn min_players(&self, register: &[u32]) -> u32 {
        let large = register
            .get(self.large_group_register_index)
            .map(|&v| v > self.large_group_threshold)
            .unwrap_or(false);
        if large {
            self.large_group_min
        } else {
            self.small_group_min
        }
    }

    pub fn multiplier(&self, headcount: usize, register: &[u32]) -> f64 {
        let min = self.min_players(register) as usize;
        if headcount == 0 || headcount >= min {
            return 1.0;
        }
        min as f64 / headcount as f64
    }

    pub fn is_exempt(&self, index: usize) -> bool {
        self.exempt_state_indices.contains(&index)
    }

    pub fn scale(&self, delta: u32, multiplier: f64) -> u32 {
        self.rounding.apply(delta as f64 * multiplier)
    }
}

/// One operation in an `OperateRegister` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOp {
    pub op: u8,
    pub dest: u8,
    pub data: u32,
}

impl RegisterOp {
    pub const INCREMENT: u8 = 2;
    pub const SET: u8 = 13;
    pub const SET_ALT: u8 = 14;

    /// Split a payload into 6-byte operations; a trailing partial op is ignored
    pub fn parse_all(payload: &[u8]) -> Result<Vec<Self>> {
        let mut r = FrameReader::new(payload);
        let mut ops = Vec::with_capacity(payload.len() / 6);
        while r.remaining() >= 6 {
            ops.push(Self {
                op: r.u8()?,
                dest: r.u8()?,
                data: r.u32()?,
            });
        }
        Ok(ops)
    }
}

/// Before/after value of one applied operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterUpdate {
    pub dest: u8,
    pub old: u32,
    pub new: u32,
}

impl RegisterUpdate {
    /// Reply layout: `1 u8, dest u8, old u32, new u32` per op
    pub fn encode_all(updates: &[RegisterUpdate]) -> Vec<u8> {
        let mut w = FrameWriter::new();
        for u in updates {
            w.u8(1).u8(u.dest).u32(u.old).u32(u.new);
        }
        w.freeze().to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct WorldEventState {
    generation: u32,
    register: Vec<u32>,
    state: Vec<u32>,
    support: Vec<u32>,
}

impl WorldEventState {
    pub fn new(counters: usize) -> Self {
        Self {
            generation: 1,
            register: vec![0; counters],
            state: vec![0; counters],
            support: vec![0; counters],
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Zero every counter and advance the generation
    pub fn reset(&mut self) {
        let counters = self.register.len();
        self.register = vec![0; counters];
        self.state = vec![0; counters];
        self.support = vec![0; counters];
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn check_generation(&self, seen: u32) -> Result<()> {
        if seen != self.generation {
            return Err(ChannelError::state(format!(
                "world event generation {} has ended (live generation {})",
                seen, self.generation
            )));
        }
        Ok(())
    }

    pub fn array(&self, kind: RegisterKind) -> &[u32] {
        match kind {
            RegisterKind::State => &self.state,
            RegisterKind::Support => &self.support,
            RegisterKind::Register => &self.register,
        }
    }

    fn slot(&mut self, kind: RegisterKind, index: usize) -> Result<&mut u32> {
        let array = match kind {
            RegisterKind::State => &mut self.state,
            RegisterKind::Support => &mut self.support,
            RegisterKind::Register => &mut self.register,
        };
        let len = array.len();
        array.get_mut(index).ok_or_else(|| {
            ChannelError::protocol(format!("counter index {} out of range ({})", index, len))
        })
    }

    /// Overwrite a counter. Returns `(old, new)`.
    pub fn set(&mut self, kind: RegisterKind, index: usize, value: u32) -> Result<(u32, u32)> {
        let slot = self.slot(kind, index)?;
        let old = *slot;
        *slot = value;
        Ok((old, value))
    }

    /// Add to a counter, scaling `state` deltas unless the index is exempt.
    /// Returns `(old, new)`.
    pub fn increment(
        &mut self,
        kind: RegisterKind,
        index: usize,
        delta: u32,
        multiplier: f64,
        policy: &ScalingPolicy,
    ) -> Result<(u32, u32)> {
        let applied = if kind == RegisterKind::State && !policy.is_exempt(index) {
            policy.scale(delta, multiplier)
        } else {
            delta
        };
        let slot = self.slot(kind, index)?;
        let old = *slot;
        *slot = old.wrapping_add(applied);
        Ok((old, *slot))
    }

    /// Apply a batch of operations against one register.
    ///
    /// Unknown op codes leave the counter untouched and report it unchanged.
    /// Every index is checked before anything is written, so a rejected
    /// batch leaves the counters as they were.
    pub fn apply(
        &mut self,
        kind: RegisterKind,
        ops: &[RegisterOp],
        headcount: usize,
        policy: &ScalingPolicy,
    ) -> Result<Vec<RegisterUpdate>> {
        let len = self.array(kind).len();
        if let Some(op) = ops.iter().find(|op| op.dest as usize >= len) {
            return Err(ChannelError::protocol(format!(
                "counter index {} out of range ({})",
                op.dest, len
            )));
        }

        let multiplier = policy.multiplier(headcount, &self.register);
        let mut updates = Vec::with_capacity(ops.len());
        for op in ops {
            let index = op.dest as usize;
            let (old, new) = match op.op {
                RegisterOp::INCREMENT => self.increment(kind, index, op.data, multiplier, policy)?,
                RegisterOp::SET | RegisterOp::SET_ALT => self.set(kind, index, op.data)?,
                other => {
                    tracing::debug!("Ignoring register op {} on index {}", other, index);
                    let current = *self.slot(kind, index)?;
                    (current, current)
                }
            };
            updates.push(RegisterUpdate { dest: op.dest, old, new });
        }
        Ok(updates)
    }

    /// First `values` counters of a register, zero-padded past the end
    pub fn load(&self, kind: RegisterKind, values: u8) -> Vec<u32> {
        let array = self.array(kind);
        (0..values as usize)
            .map(|i| array.get(i).copied().unwrap_or(0))
            .collect()
    }
}
