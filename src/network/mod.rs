//! Wire layer: encrypted framing, opcodes and packet codecs
//!
//! ```text
//! TCP ──► CryptReader ──► packet group ──► Packet::parse ──► handlers
//! handlers ──► Packet::write_to ──► SendQueue ──► CryptWriter ──► TCP
//! ```

pub mod crypt;
pub mod frame;
pub mod opcode;
pub mod packet;

pub use crypt::{CryptReader, CryptWriter, PacketCipher, PlainCipher};
pub use frame::{FrameReader, FrameWriter};
pub use opcode::Opcode;
pub use packet::{parse_all, parse_one, Ack, Packet};
