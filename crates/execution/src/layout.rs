//! Packed key layout and the batched expression-values cache.

use std::sync::Arc;

use riffle_common::{MemTracker, Result};

use crate::value::DataType;

/// Bytes reserved in the fixed region for a variable-length key: an
/// `{offset, len}` header pointing into the cache's payload arena.
pub const VAR_LEN_HEADER_BYTES: usize = 16;

/// Upper bound on the packed-values array of one cache, limiting how many
/// rows are evaluated per batch.
pub const MAX_CACHE_BYTES: usize = 256 * 1024;

/// Packed fixed-length layout for an ordered list of key expressions.
///
/// Fixed-width keys occupy their natural byte size contiguously;
/// variable-length keys occupy a header in the fixed region with the payload
/// kept outside. [`KeyLayout::var_tail_offset`] marks the first header, which
/// lets the hash path cover the whole fixed region in one call when no
/// variable-length keys exist.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    types: Vec<DataType>,
    offsets: Vec<usize>,
    fixed_size: usize,
    var_tail_offset: Option<usize>,
}

impl KeyLayout {
    /// Compute the layout for `types`, in key declaration order.
    pub fn compute(types: &[DataType]) -> Self {
        let mut offsets = vec![0usize; types.len()];
        let mut pos = 0usize;
        for (i, t) in types.iter().enumerate() {
            if !t.is_var_len() {
                offsets[i] = pos;
                pos += t.slot_bytes();
            }
        }
        let var_tail_offset = if types.iter().any(|t| t.is_var_len()) {
            Some(pos)
        } else {
            None
        };
        for (i, t) in types.iter().enumerate() {
            if t.is_var_len() {
                offsets[i] = pos;
                pos += t.slot_bytes();
            }
        }
        Self {
            types: types.to_vec(),
            offsets,
            fixed_size: pos,
            var_tail_offset,
        }
    }

    /// Number of key expressions.
    pub fn num_keys(&self) -> usize {
        self.types.len()
    }

    /// Type of key `i`.
    pub fn key_type(&self, i: usize) -> DataType {
        self.types[i]
    }

    /// Bytes of the packed fixed region per row.
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    /// Byte offset of key `i` within the fixed region.
    pub fn offset(&self, i: usize) -> usize {
        self.offsets[i]
    }

    /// Offset of the first variable-length header, `None` when every key is
    /// fixed-width.
    pub fn var_tail_offset(&self) -> Option<usize> {
        self.var_tail_offset
    }
}

/// Scratch buffers for a batch of evaluated key rows: packed values, null
/// flags, row-level skip flags, and precomputed hashes, walked by a shared
/// write-then-read cursor.
#[derive(Debug)]
pub struct ExprValuesCache {
    layout: KeyLayout,
    capacity: usize,
    values: Vec<u8>,
    nulls: Vec<bool>,
    row_skip: Vec<bool>,
    hashes: Vec<u32>,
    var_data: Vec<u8>,
    cur: usize,
    end: usize,
    tracked_bytes: usize,
    tracker: Arc<MemTracker>,
    closed: bool,
}

impl ExprValuesCache {
    /// Allocate a cache sized for `batch_size` rows, bounded by
    /// [`MAX_CACHE_BYTES`]. The fixed arrays are reserved through `tracker`.
    pub fn new(layout: KeyLayout, batch_size: usize, tracker: Arc<MemTracker>) -> Result<Self> {
        let fixed = layout.fixed_size().max(1);
        let capacity = batch_size.min(MAX_CACHE_BYTES / fixed).max(1);
        let num_keys = layout.num_keys();
        let tracked_bytes =
            capacity * fixed + capacity * num_keys + capacity + capacity * std::mem::size_of::<u32>();
        if !tracker.try_consume(tracked_bytes) {
            return Err(tracker.mem_limit_exceeded("expr values cache"));
        }
        Ok(Self {
            values: vec![0; capacity * layout.fixed_size()],
            nulls: vec![false; capacity * num_keys],
            row_skip: vec![false; capacity],
            hashes: vec![0; capacity],
            var_data: Vec::new(),
            layout,
            capacity,
            cur: 0,
            end: 0,
            tracked_bytes,
            tracker,
            closed: false,
        })
    }

    /// Rows the cache holds per batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The layout this cache was built for.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Rewind for a fresh write pass and drop the payload arena.
    pub fn reset(&mut self) {
        self.cur = 0;
        self.end = 0;
        self.var_data.clear();
        self.row_skip.iter_mut().for_each(|f| *f = false);
    }

    /// Record the write endpoint as the read endpoint, then rewind.
    pub fn reset_for_read(&mut self) {
        self.end = self.cur;
        self.cur = 0;
    }

    /// Advance the cursor one row.
    pub fn advance(&mut self) {
        self.cur += 1;
    }

    /// Whether the write cursor hit capacity.
    pub fn at_capacity(&self) -> bool {
        self.cur >= self.capacity
    }

    /// Whether the read cursor passed the recorded endpoint.
    pub fn at_end(&self) -> bool {
        self.cur >= self.end
    }

    /// Packed fixed region of the current row.
    pub fn cur_fixed(&self) -> &[u8] {
        let fixed = self.layout.fixed_size();
        &self.values[self.cur * fixed..(self.cur + 1) * fixed]
    }

    /// Value slot of key `i` in the current row.
    pub fn value_slot(&self, i: usize) -> &[u8] {
        let fixed = self.layout.fixed_size();
        let start = self.cur * fixed + self.layout.offset(i);
        &self.values[start..start + self.layout.key_type(i).slot_bytes()]
    }

    /// Mutable value slot of key `i` in the current row.
    pub fn value_slot_mut(&mut self, i: usize) -> &mut [u8] {
        let fixed = self.layout.fixed_size();
        let start = self.cur * fixed + self.layout.offset(i);
        let width = self.layout.key_type(i).slot_bytes();
        &mut self.values[start..start + width]
    }

    /// Null flag of key `i` in the current row.
    pub fn is_null(&self, i: usize) -> bool {
        self.nulls[self.cur * self.layout.num_keys() + i]
    }

    /// Set the null flag of key `i` in the current row.
    pub fn set_null(&mut self, i: usize, null: bool) {
        let idx = self.cur * self.layout.num_keys() + i;
        self.nulls[idx] = null;
    }

    /// Row-level skip flag (evaluation found a NULL the table cannot store).
    pub fn row_skipped(&self) -> bool {
        self.row_skip[self.cur]
    }

    /// Mark the current row as skipped.
    pub fn set_row_skipped(&mut self, skip: bool) {
        self.row_skip[self.cur] = skip;
    }

    /// Precomputed hash of the current row.
    pub fn cur_hash(&self) -> u32 {
        self.hashes[self.cur]
    }

    /// Store the hash of the current row.
    pub fn set_cur_hash(&mut self, hash: u32) {
        self.hashes[self.cur] = hash;
    }

    /// Copy a variable-length payload into the arena, returning its offset.
    pub fn push_var(&mut self, payload: &[u8]) -> u64 {
        let offset = self.var_data.len() as u64;
        self.var_data.extend_from_slice(payload);
        offset
    }

    /// Payload bytes at `(offset, len)` in the arena.
    pub fn var_slice(&self, offset: u64, len: u64) -> &[u8] {
        &self.var_data[offset as usize..(offset + len) as usize]
    }

    /// Write the `{offset, len}` header of variable-length key `i`.
    pub fn write_var_header(&mut self, i: usize, offset: u64, len: u64) {
        let slot = self.value_slot_mut(i);
        slot[..8].copy_from_slice(&offset.to_le_bytes());
        slot[8..16].copy_from_slice(&len.to_le_bytes());
    }

    /// Read the `{offset, len}` header of variable-length key `i`.
    pub fn read_var_header(&self, i: usize) -> (u64, u64) {
        let slot = self.value_slot(i);
        let offset = u64::from_le_bytes(slot[..8].try_into().expect("header"));
        let len = u64::from_le_bytes(slot[8..16].try_into().expect("header"));
        (offset, len)
    }

    /// Release the tracked reservation. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tracker.release(self.tracked_bytes);
        }
    }
}

impl Drop for ExprValuesCache {
    fn drop(&mut self) {
        self.close();
    }
}
