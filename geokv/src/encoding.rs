//! Wire encoding primitives shared by the framed message format, the
//! configuration record, and the durable key layout: unsigned varints,
//! big-endian fixed-width integers, and varint-length-prefixed byte slices.

use std::io::{Cursor, Read};

use byteorder::ReadBytesExt;
use bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};

/// Maximum encoded size of a varint u64.
pub const VARINT_64_MAX_SIZE: usize = 10;

/// An append-only encoder over a growable buffer.
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Packer { buf: BytesMut::with_capacity(64) }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Packer { buf: BytesMut::with_capacity(cap) }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    /// Little-endian-group varint, 7 bits per byte, high bit = continuation.
    pub fn varint(&mut self, mut v: u64) -> &mut Self {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.put_u8(b);
                return self;
            }
            self.buf.put_u8(b | 0x80);
        }
    }

    /// A varint length prefix followed by the raw bytes.
    pub fn slice(&mut self, v: &[u8]) -> &mut Self {
        self.varint(v.len() as u64);
        self.buf.put_slice(v);
        self
    }

    /// Raw bytes with no length prefix.
    pub fn raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf).to_vec()
    }
}

/// A cursor-based decoder mirroring [`Packer`].
pub struct Unpacker<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Unpacker<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Unpacker { cur: Cursor::new(bytes) }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cur.get_ref().len() as u64;
        (len - self.cur.position().min(len)) as usize
    }

    pub fn u8(&mut self) -> CResult<u8> {
        self.cur.read_u8().map_err(|_| truncated())
    }

    pub fn u16(&mut self) -> CResult<u16> {
        self.cur.read_u16::<byteorder::BigEndian>().map_err(|_| truncated())
    }

    pub fn u64(&mut self) -> CResult<u64> {
        self.cur.read_u64::<byteorder::BigEndian>().map_err(|_| truncated())
    }

    pub fn varint(&mut self) -> CResult<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            if shift >= 64 {
                return Err(Error::Parse("varint overflows u64".to_owned()));
            }
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    pub fn slice(&mut self) -> CResult<Vec<u8>> {
        let len = self.varint()? as usize;
        if len > self.remaining() {
            return Err(truncated());
        }
        let mut bytes = vec![0; len];
        self.cur.read_exact(&mut bytes).map_err(|_| truncated())?;
        Ok(bytes)
    }

    /// Skips `n` bytes, e.g. the transport header.
    pub fn skip(&mut self, n: usize) -> CResult<()> {
        if n > self.remaining() {
            return Err(truncated());
        }
        self.cur.set_position(self.cur.position() + n as u64);
        Ok(())
    }
}

fn truncated() -> Error {
    Error::Parse("truncated buffer".to_owned())
}

/// Renders a byte string with non-printable bytes escaped, for log lines.
pub fn strescape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() -> CResult<()> {
        for v in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut p = Packer::new();
            p.varint(v);
            let buf = p.take();
            assert!(buf.len() <= VARINT_64_MAX_SIZE);
            let mut u = Unpacker::new(&buf);
            assert_eq!(u.varint()?, v);
            assert_eq!(u.remaining(), 0);
        }
        Ok(())
    }

    #[test]
    fn varint_single_byte_for_small_values() -> CResult<()> {
        let mut p = Packer::new();
        p.varint(0x7f);
        assert_eq!(p.take(), vec![0x7f]);
        let mut p = Packer::new();
        p.varint(0x80);
        assert_eq!(p.take(), vec![0x80, 0x01]);
        Ok(())
    }

    #[test]
    fn slice_round_trip() -> CResult<()> {
        let mut p = Packer::new();
        p.slice(b"table").slice(b"").slice(&[0xff; 300]);
        let buf = p.take();
        let mut u = Unpacker::new(&buf);
        assert_eq!(u.slice()?, b"table".to_vec());
        assert_eq!(u.slice()?, Vec::<u8>::new());
        assert_eq!(u.slice()?, vec![0xff; 300]);
        Ok(())
    }

    #[test]
    fn truncated_slice_is_a_parse_error() {
        let mut p = Packer::new();
        p.slice(b"0123456789");
        let buf = p.take();
        let mut u = Unpacker::new(&buf[..4]);
        assert!(u.slice().is_err());
    }

    #[test]
    fn fixed_width_round_trip() -> CResult<()> {
        let mut p = Packer::new();
        p.u8(0xab).u16(0xcdef).u64(0x0102030405060708);
        let buf = p.take();
        // Big-endian on the wire.
        assert_eq!(hex::encode(&buf), "abcdef0102030405060708");
        let mut u = Unpacker::new(&buf);
        assert_eq!(u.u8()?, 0xab);
        assert_eq!(u.u16()?, 0xcdef);
        assert_eq!(u.u64()?, 0x0102030405060708);
        Ok(())
    }

    #[test]
    fn strescape_escapes_non_printable() {
        assert_eq!(strescape(b"key"), "key");
        assert_eq!(strescape(b"\x00\xff"), "\\x00\\xff");
        assert_eq!(strescape(b"a\"b\\c"), "a\\\"b\\\\c");
    }
}
