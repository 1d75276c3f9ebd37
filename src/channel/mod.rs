//! Channel server core
//!
//! Real-time synchronization layer shared by every connected client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         World (sibling channels)                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                ChannelServer (Arc, one per port)                  │  │
//! │  │                                                                   │  │
//! │  │  sessions   : SessionId ──► Arc<Session>                          │  │
//! │  │  stages     : stage id  ──► Arc<RwLock<Stage>>                    │  │
//! │  │  semaphores : name      ──► Arc<Mutex<Semaphore>>                 │  │
//! │  │  world_event: Mutex<WorldEventState>                              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  accept task ──mpsc──► session manager ──spawn──► recv loop + send loop │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entities never point at each other. Stages and semaphores hold session
//! IDs and character IDs; every cross-entity access goes back through the
//! owning registry.
//!
//! # LOCKING ORDER
//!
//! When more than one lock is needed, take them in this order:
//!
//! 1. `ChannelServer::sessions`
//! 2. `ChannelServer::stages`, then a single `Stage`
//! 3. `ChannelServer::semaphores`, then a single `Semaphore`
//! 4. `Session::state`
//! 5. `ChannelServer::world_event`
//!
//! Most operations copy IDs out of one lock and drop it before taking the
//! next. No lock is ever held across an `.await`.
//!
//! # Broadcast scopes
//!
//! Stage → Semaphore → Server → World. Every scope serializes the packet once
//! and enqueues it with [`Session::queue_send_non_blocking`], so a slow peer
//! drops packets instead of stalling the sender.

pub mod handlers;
pub mod relay;
pub mod semaphore;
pub mod server;
pub mod session;
pub mod stage;
pub mod world;
pub mod world_state;

/// Identifier of one connection, unique within a channel
pub type SessionId = u64;

/// Character identifier assigned by login
pub type CharId = u32;

pub use relay::{BinChat, RelayEvent};
pub use semaphore::{JoinOutcome, Semaphore};
pub use server::{ChannelServer, ServerHandle, ServerStats};
pub use session::{SendQueue, Session};
pub use stage::{Stage, StageBinaryKey, StageObject, StageState, DEFAULT_LOBBY};
pub use world::World;
pub use world_state::{RegisterKind, Rounding, ScalingPolicy, WorldEventState};
