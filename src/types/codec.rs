//! Little-endian positional codec shared by the journal, wallet and storage
//! layers. Every byte-string field is preceded by its length as an `i32`;
//! a length of zero means the field is absent and no bytes follow.

use crate::errors::{ChainError, ChainResult};

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_i32(buf, data.len() as i32);
    buf.extend_from_slice(data);
}

pub(crate) fn write_opt_bytes(buf: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(bytes) if !bytes.is_empty() => write_bytes(buf, bytes),
        _ => write_i32(buf, 0),
    }
}

pub(crate) fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Cursor over an immutable byte buffer with bounds-checked reads.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn rewind(&mut self, count: usize) {
        self.pos = self.pos.saturating_sub(count);
    }

    fn take(&mut self, count: usize) -> ChainResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(ChainError::Codec(format!(
                "unexpected end of buffer: wanted {count} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> ChainResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_bool(&mut self) -> ChainResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub(crate) fn read_i32(&mut self) -> ChainResult<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("4 byte slice");
        Ok(i32::from_le_bytes(bytes))
    }

    pub(crate) fn read_u64(&mut self) -> ChainResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("8 byte slice");
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn read_exact(&mut self, count: usize) -> ChainResult<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub(crate) fn read_bytes(&mut self) -> ChainResult<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ChainError::Codec(format!("negative field length {len}")));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub(crate) fn read_opt_bytes(&mut self) -> ChainResult<Option<Vec<u8>>> {
        let bytes = self.read_bytes()?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }
}
