//! Encrypted packet framing
//!
//! Every packet on the wire is a 14-byte big-endian header followed by
//! `data_size` bytes of ciphertext:
//!
//! ```text
//! ┌──────┬──────────────┬────────────┬───────────┬──────────────────────┬────────┬────────┬────────┐
//! │ pf0  │ key_rot_delta│ packet_num │ data_size │ prev_combined_check  │ check0 │ check1 │ check2 │
//! │ u8   │ u8           │ u16        │ u16       │ u16                  │ u16    │ u16    │ u16    │
//! └──────┴──────────────┴────────────┴───────────┴──────────────────────┴────────┴────────┴────────┘
//! ```
//!
//! Both directions start from the same key and rotate it with
//! `key = delta * (key + 1)` whenever the header carries a non-zero delta.
//! The keystream itself sits behind [`PacketCipher`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChannelError, Result};

pub const CRYPT_HEADER_LEN: usize = 14;
/// Key both peers hold before the first packet
pub const INITIAL_KEY_ROT: u32 = 995_117;
/// Rotation delta the server stamps on every outbound packet
pub const SEND_KEY_ROT_DELTA: u8 = 3;

/// Parsed encrypted packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CryptPacketHeader {
    pub pf0: u8,
    pub key_rot_delta: u8,
    pub packet_num: u16,
    pub data_size: u16,
    pub prev_packet_combined_check: u16,
    pub check0: u16,
    pub check1: u16,
    pub check2: u16,
}

impl CryptPacketHeader {
    pub fn decode(raw: &[u8; CRYPT_HEADER_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
        Self {
            pf0: raw[0],
            key_rot_delta: raw[1],
            packet_num: u16_at(2),
            data_size: u16_at(4),
            prev_packet_combined_check: u16_at(6),
            check0: u16_at(8),
            check1: u16_at(10),
            check2: u16_at(12),
        }
    }

    pub fn encode(&self) -> [u8; CRYPT_HEADER_LEN] {
        let mut out = [0u8; CRYPT_HEADER_LEN];
        out[0] = self.pf0;
        out[1] = self.key_rot_delta;
        for (i, v) in [
            self.packet_num,
            self.data_size,
            self.prev_packet_combined_check,
            self.check0,
            self.check1,
            self.check2,
        ]
        .into_iter()
        .enumerate()
        {
            out[2 + i * 2..4 + i * 2].copy_from_slice(&v.to_be_bytes());
        }
        out
    }
}

/// `pf0` byte for an outbound body of `len` bytes
pub fn pf0_for_len(len: usize) -> u8 {
    (((len >> 12) & 0xF3) | 3) as u8
}

/// Next key after applying a header's rotation delta
pub fn rotate_key(key: u32, delta: u8) -> u32 {
    if delta == 0 {
        return key;
    }
    (delta as u32).wrapping_mul(key.wrapping_add(1))
}

/// Output of one cipher pass: transformed bytes plus the header checksums
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherOutput {
    pub data: Vec<u8>,
    pub combined_check: u16,
    pub check0: u16,
    pub check1: u16,
    pub check2: u16,
}

/// Keystream transform applied to packet bodies
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8], key: u32) -> CipherOutput;
    fn decrypt(&self, cipher: &[u8], key: u32) -> CipherOutput;
}

/// Identity transform with additive checksums over the plaintext.
///
/// Used for local clients, proxies that terminate the real cipher, and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl PlainCipher {
    fn checks(plain: &[u8]) -> CipherOutput {
        let mut check0 = 0u16;
        let mut check1 = 0u16;
        let mut check2 = 0u16;
        for (i, &b) in plain.iter().enumerate() {
            check0 = check0.wrapping_add(b as u16);
            check1 ^= (b as u16) << ((i % 2) * 8);
            check2 = check2.rotate_left(1).wrapping_add(b as u16);
        }
        CipherOutput {
            data: plain.to_vec(),
            combined_check: check0.wrapping_add(check1).wrapping_add(check2),
            check0,
            check1,
            check2,
        }
    }
}

impl PacketCipher for PlainCipher {
    fn encrypt(&self, plain: &[u8], _key: u32) -> CipherOutput {
        Self::checks(plain)
    }

    fn decrypt(&self, cipher: &[u8], _key: u32) -> CipherOutput {
        Self::checks(cipher)
    }
}

/// Read half of an encrypted connection
pub struct CryptReader<R> {
    inner: R,
    cipher: Arc<dyn PacketCipher>,
    key_rot: u32,
    prev_combined_check: u16,
}

impl<R: AsyncRead + Unpin> CryptReader<R> {
    pub fn new(inner: R, cipher: Arc<dyn PacketCipher>) -> Self {
        Self {
            inner,
            cipher,
            key_rot: INITIAL_KEY_ROT,
            prev_combined_check: 0,
        }
    }

    /// Read and decrypt one packet group.
    ///
    /// EOF and checksum mismatches are both connection errors.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut raw = [0u8; CRYPT_HEADER_LEN];
        self.inner.read_exact(&mut raw).await?;
        let header = CryptPacketHeader::decode(&raw);

        let mut body = vec![0u8; header.data_size as usize];
        self.inner.read_exact(&mut body).await?;

        self.key_rot = rotate_key(self.key_rot, header.key_rot_delta);
        let out = self.cipher.decrypt(&body, self.key_rot);
        if (out.check0, out.check1, out.check2) != (header.check0, header.check1, header.check2) {
            tracing::warn!(
                "Packet checksum mismatch: got ({:04X}, {:04X}, {:04X}), header ({:04X}, {:04X}, {:04X})",
                out.check0,
                out.check1,
                out.check2,
                header.check0,
                header.check1,
                header.check2
            );
            return Err(ChannelError::Connection(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "decrypted data checksum doesn't match header",
            )));
        }

        self.prev_combined_check = out.combined_check;
        Ok(Bytes::from(out.data))
    }
}

/// Write half of an encrypted connection
pub struct CryptWriter<W> {
    inner: W,
    cipher: Arc<dyn PacketCipher>,
    key_rot: u32,
    sent_packets: u16,
    prev_combined_check: u16,
}

impl<W: AsyncWrite + Unpin> CryptWriter<W> {
    pub fn new(inner: W, cipher: Arc<dyn PacketCipher>) -> Self {
        Self {
            inner,
            cipher,
            key_rot: INITIAL_KEY_ROT,
            sent_packets: 0,
            prev_combined_check: 0,
        }
    }

    /// Encrypt and send one packet group
    pub async fn send_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(ChannelError::protocol(format!(
                "outbound packet of {} bytes exceeds frame limit",
                data.len()
            )));
        }

        self.key_rot = rotate_key(self.key_rot, SEND_KEY_ROT_DELTA);
        let out = self.cipher.encrypt(data, self.key_rot);

        let header = CryptPacketHeader {
            pf0: pf0_for_len(out.data.len()),
            key_rot_delta: SEND_KEY_ROT_DELTA,
            packet_num: self.sent_packets,
            data_size: out.data.len() as u16,
            prev_packet_combined_check: self.prev_combined_check,
            check0: out.check0,
            check1: out.check1,
            check2: out.check2,
        };

        self.inner.write_all(&header.encode()).await?;
        self.inner.write_all(&out.data).await?;
        self.inner.flush().await?;

        self.sent_packets = self.sent_packets.wrapping_add(1);
        self.prev_combined_check = out.combined_check;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = CryptPacketHeader {
            pf0: 0x03,
            key_rot_delta: 3,
            packet_num: 0x0102,
            data_size: 0x0010,
            prev_packet_combined_check: 0xAAAA,
            check0: 1,
            check1: 2,
            check2: 3,
        };
        let raw = header.encode();
        assert_eq!(
            raw,
            [0x03, 0x03, 0x01, 0x02, 0x00, 0x10, 0xAA, 0xAA, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]
        );
        assert_eq!(CryptPacketHeader::decode(&raw), header);
    }

    #[test]
    fn test_key_rotation() {
        assert_eq!(rotate_key(INITIAL_KEY_ROT, 0), INITIAL_KEY_ROT);
        assert_eq!(rotate_key(INITIAL_KEY_ROT, 3), 3 * (INITIAL_KEY_ROT + 1));
        // Wraps instead of overflowing
        assert_eq!(rotate_key(u32::MAX, 2), 0);
    }

    #[test]
    fn test_pf0() {
        assert_eq!(pf0_for_len(0x10), 0x03);
        assert_eq!(pf0_for_len(0x1000), 0x03);
        assert_eq!(pf0_for_len(0x8000), 0x0B);
    }

    #[tokio::test]
    async fn test_writer_and_reader_stay_in_sync() {
        let (client, server) = tokio::io::duplex(4096);
        let cipher: Arc<dyn PacketCipher> = Arc::new(PlainCipher);
        let mut writer = CryptWriter::new(client, cipher.clone());
        let mut reader = CryptReader::new(server, cipher);

        writer.send_packet(&[0x00, 0x11, 0x00, 0x10]).await.unwrap();
        writer.send_packet(&[0x00, 0x17, 0, 0, 0, 9]).await.unwrap();

        assert_eq!(&reader.read_packet().await.unwrap()[..], &[0x00, 0x11, 0x00, 0x10]);
        assert_eq!(&reader.read_packet().await.unwrap()[..], &[0x00, 0x17, 0, 0, 0, 9]);
        assert_eq!(reader.key_rot, writer.key_rot);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_connection_error() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = CryptReader::new(server, Arc::new(PlainCipher));

        let header = CryptPacketHeader {
            data_size: 2,
            check0: 0xFFFF,
            ..Default::default()
        };
        client.write_all(&header.encode()).await.unwrap();
        client.write_all(&[0x00, 0x11]).await.unwrap();

        let err = reader.read_packet().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = CryptReader::new(server, Arc::new(PlainCipher));
        assert!(matches!(reader.read_packet().await, Err(ChannelError::Connection(_))));
    }
}
