//! MHF channel server core
//!
//! Runs the session protocol for one or more game channels: encrypted packet
//! framing, opcode dispatch, the stage (room) lifecycle, semaphores used as
//! party groups, and broadcasts scoped to a stage, a semaphore, a channel or
//! the whole world of sibling channels.
//!
//! # Example
//!
//! ```ignore
//! use mhf_channel::{ChannelConfig, ChannelServer, World};
//!
//! let world = World::new();
//! let server = ChannelServer::new(ChannelConfig::default());
//! world.add_channel(server.clone());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:54001").await?;
//! let handle = server.start(listener)?;
//! handle.join().await;
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod network;

// Re-export commonly used types
pub use channel::{
    BinChat, ChannelServer, RelayEvent, Semaphore, ServerHandle, ServerStats, Session, Stage,
    StageState, World, WorldEventState,
};
pub use config::{ChannelConfig, DebugOptions, WorldEventConfig};
pub use error::{ChannelError, Result};
pub use network::{Ack, Opcode, Packet};
