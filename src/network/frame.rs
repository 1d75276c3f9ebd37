//! Big-endian frame reader and writer
//!
//! Every read is bounds-checked and fails with a protocol error instead of
//! panicking, so a truncated packet only aborts its own group.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChannelError, Result};
use crate::network::opcode::Opcode;

/// Cursor over one decrypted packet group
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Unread tail of the group
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ChannelError::protocol(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.need(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "byte run")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Fixed-length string with trailing NULs removed
    pub fn string(&mut self, n: usize) -> Result<String> {
        Ok(trim_nul(self.bytes(n)?))
    }

    /// `u8` length followed by that many bytes
    pub fn string_u8(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        self.string(len)
    }
}

/// Decode an ID field, dropping everything from the first NUL
pub fn trim_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Growable big-endian output buffer
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(64) }
    }

    pub fn opcode(&mut self, op: Opcode) -> &mut Self {
        self.u16(op.into())
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// `u8` length (including terminator), bytes, NUL
    pub fn pascal_u8(&mut self, s: &str) -> &mut Self {
        let raw = s.as_bytes();
        let len = raw.len().min(u8::MAX as usize - 1);
        self.u8(len as u8 + 1).bytes(&raw[..len]).u8(0)
    }

    /// Overwrite a `u16` already written at `offset`
    pub fn patch_u16(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let data = [0x00, 0x22, 0xDE, 0xAD, 0xBE, 0xEF, 0x07];
        let mut r = FrameReader::new(&data);
        assert_eq!(r.u16().unwrap(), 0x0022);
        assert_eq!(r.u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_is_protocol_error() {
        let data = [0x00, 0x01];
        let mut r = FrameReader::new(&data);
        let err = r.u32().unwrap_err();
        assert!(matches!(err, ChannelError::Protocol { .. }));
        // Cursor does not move on failure
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn test_string_u8_trims_nul() {
        let data = [5, b'r', b'o', b'o', b'm', 0, 0xFF];
        let mut r = FrameReader::new(&data);
        assert_eq!(r.string_u8().unwrap(), "room");
        assert_eq!(r.rest(), &[0xFF]);
    }

    #[test]
    fn test_pascal_u8_layout() {
        let mut w = FrameWriter::new();
        w.pascal_u8("ab");
        assert_eq!(&w.freeze()[..], &[3, b'a', b'b', 0]);
    }

    #[test]
    fn test_patch_u16() {
        let mut w = FrameWriter::new();
        w.u16(0).u8(9);
        w.patch_u16(0, 0x0102);
        assert_eq!(&w.freeze()[..], &[1, 2, 9]);
    }
}
