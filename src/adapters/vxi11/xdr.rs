//! XDR (RFC 4506) primitives used by the ONC RPC messages.

use crate::utils::error::{Result, ScopeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u32(u32::from(value))
    }

    /// Variable-length opaque: length, bytes, zero padding to a 4-byte boundary.
    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_opaque(value.as_bytes())
    }

    pub fn put_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ScopeError::rpc(format!(
                "truncated XDR data: need {} bytes, {} left",
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u32()? != 0)
    }

    pub fn get_opaque(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        let pad = padding(len);
        self.ensure(len + pad)?;
        let data = self.buf.split_to(len);
        self.buf.advance(pad);
        Ok(data)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let data = self.get_opaque()?;
        String::from_utf8(data.to_vec()).map_err(|_| ScopeError::rpc("XDR string is not valid UTF-8"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
