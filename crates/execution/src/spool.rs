//! Block-addressed append-only row storage with pin/unpin and spill.
//!
//! A [`RowSpool`] owns a sequence of blocks. Rows append into the current
//! write block; sealed blocks stay resident while the spool is pinned and
//! move to disk when it is unpinned. Every block's bytes are reserved through
//! the operator [`MemTracker`], so a denied reservation surfaces as a
//! recoverable [`RiffleError::MemoryBudget`] and drives the caller's spill
//! path.
//!
//! The first two blocks of a spool are small to keep the footprint of small
//! queries down; after that, blocks are IO-sized.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use riffle_common::{MemTracker, Result, RiffleError};

use crate::value::{TupleRow, row_estimate_bytes};

/// Byte budgets of the initial small blocks.
pub const SMALL_BLOCK_BYTES: [usize; 2] = [64 * 1024, 512 * 1024];

static SPOOL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stable address of a row within a spool: `(block id, row within block)`.
///
/// Slots stay valid across pin/unpin cycles; resolving one requires the
/// containing block to be resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleSlot {
    /// Block id (sealed blocks first, write block last).
    pub block: u32,
    /// Row index within the block.
    pub row: u32,
}

/// A row type storable in a spool.
pub trait SpoolRow: Clone + Send + Serialize + DeserializeOwned {
    /// Rough in-memory footprint, used for block accounting.
    fn estimate_bytes(&self) -> usize;
}

impl SpoolRow for TupleRow {
    fn estimate_bytes(&self) -> usize {
        row_estimate_bytes(self)
    }
}

#[derive(Debug)]
enum Block<R> {
    Resident { rows: Vec<R>, budget: usize },
    Spilled { path: PathBuf, rows: usize, budget: usize },
}

impl<R> Block<R> {
    fn num_rows(&self) -> usize {
        match self {
            Block::Resident { rows, .. } => rows.len(),
            Block::Spilled { rows, .. } => *rows,
        }
    }
}

/// Append-only, block-addressed row sequence with spill support.
#[derive(Debug)]
pub struct RowSpool<R> {
    label: String,
    seq: u64,
    spill_dir: PathBuf,
    io_block_bytes: usize,
    tracker: Arc<MemTracker>,
    blocks: Vec<Block<R>>,
    write_block: Vec<R>,
    write_bytes: usize,
    write_budget: usize,
    unpinned: bool,
    num_rows: u64,
    total_row_bytes: usize,
    closed: bool,
}

impl<R: SpoolRow> RowSpool<R> {
    /// Create a spool and reserve its first write block.
    pub fn new(
        label: impl Into<String>,
        tracker: Arc<MemTracker>,
        spill_dir: impl Into<PathBuf>,
        io_block_bytes: usize,
    ) -> Result<Self> {
        let label = label.into();
        let first = Self::block_budget_for(0, io_block_bytes);
        if !tracker.try_consume(first) {
            return Err(tracker.mem_limit_exceeded(format!("spool {label}: initial block")));
        }
        Ok(Self {
            label,
            seq: SPOOL_SEQ.fetch_add(1, Ordering::Relaxed),
            spill_dir: spill_dir.into(),
            io_block_bytes: io_block_bytes.max(SMALL_BLOCK_BYTES[0]),
            tracker,
            blocks: Vec::new(),
            write_block: Vec::new(),
            write_bytes: 0,
            write_budget: first,
            unpinned: false,
            num_rows: 0,
            total_row_bytes: 0,
            closed: false,
        })
    }

    fn block_budget_for(block_idx: usize, io_block_bytes: usize) -> usize {
        if block_idx < SMALL_BLOCK_BYTES.len() {
            SMALL_BLOCK_BYTES[block_idx].min(io_block_bytes.max(SMALL_BLOCK_BYTES[0]))
        } else {
            io_block_bytes.max(SMALL_BLOCK_BYTES[0])
        }
    }

    /// Append a row, returning its stable slot.
    ///
    /// Fails with a recoverable [`RiffleError::MemoryBudget`] when a new block
    /// reservation is denied; the row is untouched and the call can be retried
    /// after the caller frees memory.
    pub fn add_row(&mut self, row: R) -> Result<TupleSlot> {
        debug_assert!(!self.closed);
        if self.write_budget == 0 {
            // Write block was flushed by unpin(true); reserve a fresh one.
            let budget = Self::block_budget_for(self.blocks.len(), self.io_block_bytes);
            if !self.tracker.try_consume(budget) {
                return Err(self
                    .tracker
                    .mem_limit_exceeded(format!("spool {}: write block", self.label)));
            }
            self.write_budget = budget;
        }
        let est = row.estimate_bytes();
        if !self.write_block.is_empty() && self.write_bytes + est > self.write_budget {
            let next = Self::block_budget_for(self.blocks.len() + 1, self.io_block_bytes);
            if !self.tracker.try_consume(next) {
                return Err(self
                    .tracker
                    .mem_limit_exceeded(format!("spool {}: next block", self.label)));
            }
            if let Err(e) = self.seal_write_block() {
                self.tracker.release(next);
                return Err(e);
            }
            self.write_budget = next;
            self.write_bytes = 0;
        }
        self.write_block.push(row);
        self.write_bytes += est;
        self.total_row_bytes += est;
        self.num_rows += 1;
        Ok(TupleSlot {
            block: self.blocks.len() as u32,
            row: (self.write_block.len() - 1) as u32,
        })
    }

    fn seal_write_block(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.write_block);
        let budget = self.write_budget;
        self.write_budget = 0;
        if self.unpinned {
            let path = self.flush_rows(self.blocks.len(), &rows)?;
            self.tracker.release(budget);
            self.blocks.push(Block::Spilled {
                path,
                rows: rows.len(),
                budget,
            });
        } else {
            self.blocks.push(Block::Resident { rows, budget });
        }
        Ok(())
    }

    fn flush_rows(&self, block_idx: usize, rows: &[R]) -> Result<PathBuf> {
        fs::create_dir_all(&self.spill_dir)?;
        let path = self.spill_dir.join(format!(
            "{}-{}-{}-block{}.jsonl",
            self.label,
            std::process::id(),
            self.seq,
            block_idx
        ));
        let mut writer = BufWriter::new(File::create(&path)?);
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| RiffleError::Execution(format!("spill encode failed: {e}")))?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(path)
    }

    fn load_block(path: &PathBuf) -> Result<Vec<R>> {
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(
                serde_json::from_str(&line)
                    .map_err(|e| RiffleError::Execution(format!("spill decode failed: {e}")))?,
            );
        }
        Ok(rows)
    }

    /// Move sealed resident blocks to disk and release their reservations.
    /// With `flush_write` the partially-filled write block is flushed too,
    /// dropping the spool's footprint to zero.
    pub fn unpin(&mut self, flush_write: bool) -> Result<()> {
        self.unpinned = true;
        for idx in 0..self.blocks.len() {
            if let Block::Resident { rows, budget } = &self.blocks[idx] {
                let budget = *budget;
                let path = self.flush_rows(idx, rows)?;
                let rows = rows.len();
                self.tracker.release(budget);
                self.blocks[idx] = Block::Spilled { path, rows, budget };
            }
        }
        if flush_write {
            if !self.write_block.is_empty() {
                self.seal_write_block()?;
            } else if self.write_budget > 0 {
                self.tracker.release(self.write_budget);
                self.write_budget = 0;
            }
        }
        Ok(())
    }

    /// Bring every spilled block back into memory. Returns `false` without
    /// side effects when the reservation is denied.
    pub fn pin_all(&mut self) -> Result<bool> {
        let needed: usize = self
            .blocks
            .iter()
            .map(|b| match b {
                Block::Spilled { budget, .. } => *budget,
                Block::Resident { .. } => 0,
            })
            .sum();
        if needed > 0 && !self.tracker.try_consume(needed) {
            return Ok(false);
        }
        for idx in 0..self.blocks.len() {
            if let Block::Spilled { path, budget, .. } = &self.blocks[idx] {
                let budget = *budget;
                let rows = Self::load_block(path)?;
                let _ = fs::remove_file(path);
                self.blocks[idx] = Block::Resident { rows, budget };
            }
        }
        self.unpinned = false;
        Ok(true)
    }

    /// Resolve a slot to its row. The containing block must be resident.
    pub fn row(&self, slot: TupleSlot) -> Result<&R> {
        let block = slot.block as usize;
        if block == self.blocks.len() {
            return self
                .write_block
                .get(slot.row as usize)
                .ok_or_else(|| self.bad_slot(slot));
        }
        match self.blocks.get(block) {
            Some(Block::Resident { rows, .. }) => {
                rows.get(slot.row as usize).ok_or_else(|| self.bad_slot(slot))
            }
            _ => Err(self.bad_slot(slot)),
        }
    }

    /// Resolve a slot mutably. The containing block must be resident.
    pub fn row_mut(&mut self, slot: TupleSlot) -> Result<&mut R> {
        let block = slot.block as usize;
        let bad = self.bad_slot(slot);
        if block == self.blocks.len() {
            return self.write_block.get_mut(slot.row as usize).ok_or(bad);
        }
        match self.blocks.get_mut(block) {
            Some(Block::Resident { rows, .. }) => rows.get_mut(slot.row as usize).ok_or(bad),
            _ => Err(bad),
        }
    }

    fn bad_slot(&self, slot: TupleSlot) -> RiffleError {
        RiffleError::Execution(format!(
            "spool {}: slot {:?} is not resident",
            self.label, slot
        ))
    }

    /// Start a sequential read over all rows. Reserves one IO-sized read
    /// buffer when any block is on disk; the reservation is released when the
    /// reader drops.
    pub fn read(&self) -> Result<SpoolReader<'_, R>> {
        let mut read_budget = 0;
        if self.blocks.iter().any(|b| matches!(b, Block::Spilled { .. })) {
            read_budget = self.io_block_bytes;
            if !self.tracker.try_consume(read_budget) {
                return Err(self
                    .tracker
                    .mem_limit_exceeded(format!("spool {}: read buffer", self.label)));
            }
        }
        Ok(SpoolReader {
            spool: self,
            block_idx: 0,
            row_idx: 0,
            loaded: None,
            read_budget,
        })
    }

    /// Total rows appended.
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Estimated bytes of every appended row, resident or spilled.
    pub fn byte_size(&self) -> usize {
        self.total_row_bytes
    }

    /// Iterate `(slot, row)` pairs over resident blocks in append order.
    /// Spilled blocks are skipped; callers pin the spool first.
    pub fn pinned_rows(&self) -> impl Iterator<Item = (TupleSlot, &R)> + '_ {
        let sealed = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(b, block)| match block {
                Block::Resident { rows, .. } => Some((b, rows)),
                Block::Spilled { .. } => None,
            })
            .flat_map(|(b, rows)| {
                rows.iter().enumerate().map(move |(r, row)| {
                    (
                        TupleSlot {
                            block: b as u32,
                            row: r as u32,
                        },
                        row,
                    )
                })
            });
        let write_block_id = self.blocks.len() as u32;
        let tail = self.write_block.iter().enumerate().map(move |(r, row)| {
            (
                TupleSlot {
                    block: write_block_id,
                    row: r as u32,
                },
                row,
            )
        });
        sealed.chain(tail)
    }

    /// Bytes currently reserved for resident blocks and the write block.
    pub fn bytes_in_mem(&self) -> usize {
        let sealed: usize = self
            .blocks
            .iter()
            .map(|b| match b {
                Block::Resident { budget, .. } => *budget,
                Block::Spilled { .. } => 0,
            })
            .sum();
        sealed + self.write_budget
    }

    /// Delete spill files and release every reservation. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for block in self.blocks.drain(..) {
            match block {
                Block::Resident { budget, .. } => self.tracker.release(budget),
                Block::Spilled { path, .. } => {
                    let _ = fs::remove_file(path);
                }
            }
        }
        self.write_block.clear();
        self.tracker.release(self.write_budget);
        self.write_budget = 0;
    }
}

impl<R> Drop for RowSpool<R> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for block in self.blocks.drain(..) {
            match block {
                Block::Resident { budget, .. } => self.tracker.release(budget),
                Block::Spilled { path, .. } => {
                    let _ = fs::remove_file(path);
                }
            }
        }
        self.write_block.clear();
        self.tracker.release(self.write_budget);
        self.write_budget = 0;
    }
}

/// Sequential batch reader over a spool, including the write block.
#[derive(Debug)]
pub struct SpoolReader<'a, R> {
    spool: &'a RowSpool<R>,
    block_idx: usize,
    row_idx: usize,
    loaded: Option<Vec<R>>,
    read_budget: usize,
}

impl<R: SpoolRow> SpoolReader<'_, R> {
    /// Fill `batch` with up to `max_rows` rows. Returns `true` at end.
    pub fn next_batch(&mut self, max_rows: usize, batch: &mut Vec<R>) -> Result<bool> {
        batch.clear();
        let max_rows = max_rows.max(1);
        while batch.len() < max_rows {
            if self.block_idx > self.spool.blocks.len() {
                break;
            }
            if self.block_idx == self.spool.blocks.len() {
                // Write block.
                let rows = &self.spool.write_block;
                if self.row_idx >= rows.len() {
                    self.block_idx += 1;
                    self.row_idx = 0;
                    break;
                }
                let take = (max_rows - batch.len()).min(rows.len() - self.row_idx);
                batch.extend(rows[self.row_idx..self.row_idx + take].iter().cloned());
                self.row_idx += take;
                continue;
            }
            match &self.spool.blocks[self.block_idx] {
                Block::Resident { rows, .. } => {
                    if self.row_idx >= rows.len() {
                        self.block_idx += 1;
                        self.row_idx = 0;
                        continue;
                    }
                    let take = (max_rows - batch.len()).min(rows.len() - self.row_idx);
                    batch.extend(rows[self.row_idx..self.row_idx + take].iter().cloned());
                    self.row_idx += take;
                }
                Block::Spilled { path, .. } => {
                    if self.loaded.is_none() {
                        self.loaded = Some(RowSpool::load_block(path)?);
                    }
                    let rows = self.loaded.as_ref().expect("loaded block");
                    if self.row_idx >= rows.len() {
                        self.loaded = None;
                        self.block_idx += 1;
                        self.row_idx = 0;
                        continue;
                    }
                    let take = (max_rows - batch.len()).min(rows.len() - self.row_idx);
                    batch.extend(rows[self.row_idx..self.row_idx + take].iter().cloned());
                    self.row_idx += take;
                }
            }
        }
        Ok(self.at_end())
    }

    fn at_end(&self) -> bool {
        if self.block_idx > self.spool.blocks.len() {
            return true;
        }
        if self.block_idx == self.spool.blocks.len() {
            return self.row_idx >= self.spool.write_block.len();
        }
        false
    }
}

impl<R> Drop for SpoolReader<'_, R> {
    fn drop(&mut self) {
        self.spool.tracker.release(self.read_budget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "riffle_spool_test_{}_{}",
            std::process::id(),
            tag
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn int_row(i: i64) -> TupleRow {
        vec![ScalarValue::Int64(i), ScalarValue::Utf8(format!("v{i}"))]
    }

    #[test]
    fn rows_round_trip_through_unpin_and_read() {
        let tracker = MemTracker::new("test", usize::MAX);
        let dir = temp_dir("roundtrip");
        let mut spool: RowSpool<TupleRow> =
            RowSpool::new("t", tracker, &dir, 64 * 1024).unwrap();
        let n = 5_000_i64;
        for i in 0..n {
            spool.add_row(int_row(i)).unwrap();
        }
        spool.unpin(false).unwrap();
        for i in n..n + 10 {
            spool.add_row(int_row(i)).unwrap();
        }
        assert_eq!(spool.num_rows(), (n + 10) as u64);

        let mut reader = spool.read().unwrap();
        let mut batch = Vec::new();
        let mut seen = Vec::new();
        loop {
            let eos = reader.next_batch(1024, &mut batch).unwrap();
            seen.extend(batch.iter().cloned());
            if eos {
                break;
            }
        }
        drop(reader);
        assert_eq!(seen.len(), (n + 10) as usize);
        assert_eq!(seen[0], int_row(0));
        assert_eq!(seen[seen.len() - 1], int_row(n + 9));
        spool.close();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn slots_stay_valid_while_pinned() {
        let tracker = MemTracker::new("test", usize::MAX);
        let dir = temp_dir("slots");
        let mut spool: RowSpool<TupleRow> =
            RowSpool::new("t", tracker, &dir, 64 * 1024).unwrap();
        let mut slots = Vec::new();
        for i in 0..2_000_i64 {
            slots.push(spool.add_row(int_row(i)).unwrap());
        }
        assert_eq!(spool.row(slots[0]).unwrap(), &int_row(0));
        assert_eq!(spool.row(slots[1999]).unwrap(), &int_row(1999));
        if let ScalarValue::Int64(v) = &mut spool.row_mut(slots[7]).unwrap()[0] {
            *v = -7;
        }
        assert_eq!(spool.row(slots[7]).unwrap()[0], ScalarValue::Int64(-7));
        spool.close();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn budget_denial_is_recoverable_and_released_on_close() {
        let tracker = MemTracker::new("test", 80 * 1024);
        let dir = temp_dir("budget");
        let mut spool: RowSpool<TupleRow> =
            RowSpool::new("t", Arc::clone(&tracker), &dir, 1024 * 1024).unwrap();
        let mut failed = false;
        for i in 0..10_000_i64 {
            match spool.add_row(int_row(i)) {
                Ok(_) => {}
                Err(e) => {
                    assert!(e.is_recoverable_oom());
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "an 80KiB budget must deny the second block");
        // Unpinning frees the sealed blocks and lets appends continue.
        spool.unpin(false).unwrap();
        for i in 0..100_i64 {
            spool.add_row(int_row(i)).unwrap();
        }
        spool.close();
        assert_eq!(tracker.consumption(), 0);
        spool.close(); // idempotent
        assert_eq!(tracker.consumption(), 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn pin_all_restores_slot_resolution() {
        let tracker = MemTracker::new("test", usize::MAX);
        let dir = temp_dir("pin");
        let mut spool: RowSpool<TupleRow> =
            RowSpool::new("t", tracker, &dir, 64 * 1024).unwrap();
        let mut slots = Vec::new();
        for i in 0..4_000_i64 {
            slots.push(spool.add_row(int_row(i)).unwrap());
        }
        spool.unpin(true).unwrap();
        assert!(spool.row(slots[0]).is_err());
        assert!(spool.pin_all().unwrap());
        assert_eq!(spool.row(slots[0]).unwrap(), &int_row(0));
        assert_eq!(spool.row(slots[3999]).unwrap(), &int_row(3999));
        spool.close();
        let _ = fs::remove_dir_all(dir);
    }
}
