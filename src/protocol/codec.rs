//! Stream-to-cell codec
//!
//! [`CellReader`] turns the raw byte stream delivered by TLS into framed
//! cells, accumulating up to one TLS record at a time. [`WriteBatcher`]
//! goes the other way, concatenating queued cells so small writes share a
//! TLS record.

use super::cell::{is_variable_command, Cell, LinkVersion};
use super::cellbuf::{CellBuf, MAX_CELL_SIZE};
use crate::error::{Result, TorError};

/// One TLS record; the reader accumulator and write batch size.
pub const SSL_RECORD_SIZE: usize = 16384;

/// Incremental cell deframer.
pub struct CellReader {
    version: LinkVersion,
    buf: Box<[u8]>,
    read_pos: usize,
    decode_pos: usize,
}

impl CellReader {
    pub fn new(version: LinkVersion) -> CellReader {
        CellReader {
            version,
            buf: vec![0u8; SSL_RECORD_SIZE].into_boxed_slice(),
            read_pos: 0,
            decode_pos: 0,
        }
    }

    /// Free space for the next network read.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_pos..]
    }

    /// Record that `n` bytes were read into [`CellReader::space`].
    pub fn advance(&mut self, n: usize) {
        self.read_pos += n;
        debug_assert!(self.read_pos <= self.buf.len());
    }

    /// Decode the next complete cell, if any. `Ok(None)` means more bytes
    /// are needed; the accumulator is compacted so [`CellReader::space`]
    /// never shrinks to nothing while a partial cell is pending.
    pub fn next_cell(&mut self) -> Result<Option<Cell>> {
        let circ_len = self.version.circ_id_len();
        let avail = self.read_pos - self.decode_pos;

        // Need the header plus length field to know the cell size.
        if avail < circ_len + 3 {
            self.compact();
            return Ok(None);
        }

        let cmd = self.buf[self.decode_pos + circ_len];
        let total = if is_variable_command(cmd) {
            let len_off = self.decode_pos + circ_len + 1;
            let declared =
                u16::from_be_bytes([self.buf[len_off], self.buf[len_off + 1]]) as usize;
            let total = declared + circ_len + 3;
            if total >= SSL_RECORD_SIZE {
                return Err(TorError::MalformedCell(
                    "variable-length cell larger than a TLS record".into(),
                ));
            }
            total
        } else {
            self.version.fixed_cell_len()
        };

        if avail < total {
            self.compact();
            return Ok(None);
        }

        let cell_bytes = &self.buf[self.decode_pos..self.decode_pos + total];
        let buf = CellBuf::copy_from(cell_bytes);
        self.decode_pos += total;
        Ok(Some(Cell::from_buf(self.version, buf)))
    }

    fn compact(&mut self) {
        if self.decode_pos == self.read_pos {
            self.decode_pos = 0;
            self.read_pos = 0;
        } else if self.decode_pos != 0 {
            self.buf.copy_within(self.decode_pos..self.read_pos, 0);
            self.read_pos -= self.decode_pos;
            self.decode_pos = 0;
        }
    }
}

/// Outbound write coalescing.
pub struct WriteBatcher {
    buf: Box<[u8]>,
    len: usize,
}

impl WriteBatcher {
    pub fn new() -> WriteBatcher {
        WriteBatcher {
            buf: vec![0u8; SSL_RECORD_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    /// Append `data`; returns `false` (leaving the batch untouched) when it
    /// would not fit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.len + data.len() > self.buf.len() {
            return false;
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        true
    }

    /// Whether another maximum-size cell still fits.
    pub fn has_room_for_cell(&self) -> bool {
        self.len + MAX_CELL_SIZE <= self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for WriteBatcher {
    fn default() -> Self {
        WriteBatcher::new()
    }
}
