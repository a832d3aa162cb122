//! Open-addressed hash table over row-spool slots.
//!
//! Buckets cache the 32-bit hash so resizes reinsert without re-evaluating
//! keys and probes reject on hash before touching row data. Key equality is
//! supplied by the caller as a closure that resolves a [`TupleSlot`] and
//! compares it through the operator's `HashContext`; the table itself never
//! dereferences rows.
//!
//! Duplicate entries (join build sides) chain through nodes allocated from
//! data pages. The first two pages are small to bound the footprint of small
//! queries; pages are released together at close, never individually.

use std::sync::Arc;

use riffle_common::{MemTracker, Result, RiffleError};

use crate::spool::TupleSlot;

/// Maximum bucket fill ratio; inserts beyond it require a resize.
pub const MAX_FILL_FACTOR: f64 = 0.75;

/// Byte sizes of the first duplicate-node data pages.
const INITIAL_DATA_PAGE_SIZES: [usize; 2] = [64 * 1024, 512 * 1024];

const NO_NODE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
enum BucketData {
    Slot(TupleSlot),
    Chain(u32),
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    filled: bool,
    matched: bool,
    has_duplicates: bool,
    hash: u32,
    data: BucketData,
}

const EMPTY_BUCKET: Bucket = Bucket {
    filled: false,
    matched: false,
    has_duplicates: false,
    hash: 0,
    data: BucketData::Slot(TupleSlot { block: 0, row: 0 }),
};

#[derive(Debug, Clone, Copy)]
struct DuplicateNode {
    next: u32,
    matched: bool,
    slot: TupleSlot,
}

/// Observable hash-table statistics, folded into the operator counter set on
/// close.
#[derive(Debug, Default, Clone)]
pub struct HashTableStats {
    /// Probe calls.
    pub num_probes: u64,
    /// Probes that found nothing.
    pub num_failed_probes: u64,
    /// Buckets stepped past across all probes.
    pub travel_length: u64,
    /// Same-hash different-key rejections.
    pub num_hash_collisions: u64,
    /// Bucket-array resizes.
    pub num_resizes: u64,
}

/// Cursor into the table: a bucket plus an optional duplicate node.
///
/// Cursors return stable [`TupleSlot`]s; the client resolves them against the
/// owning row spool. A cursor is invalidated by insert or resize.
#[derive(Debug, Clone, Copy)]
pub struct HtIter {
    bucket_idx: usize,
    node: u32,
}

/// Outcome of a find-or-insert lookup.
#[derive(Debug)]
pub enum FindOutcome {
    /// Key present; cursor at its bucket (and chain head, if any).
    Found(HtIter),
    /// Key absent; an empty bucket is reserved for [`HashTable::fill_bucket`].
    Empty(EmptyBucket),
    /// No slot available within the fill bound; resize or spill.
    Full,
}

/// Token for an empty bucket located by a failed lookup.
#[derive(Debug)]
pub struct EmptyBucket(usize);

/// Outcome of a duplicate-storing insert.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The slot was stored.
    Inserted,
    /// No bucket available within the fill bound; resize and retry.
    NeedsResize,
}

/// Open-addressed table with linear or quadratic probing.
#[derive(Debug)]
pub struct HashTable {
    quadratic_probing: bool,
    stores_duplicates: bool,
    max_num_buckets: usize,
    io_page_bytes: usize,
    tracker: Arc<MemTracker>,
    buckets: Vec<Bucket>,
    num_filled_buckets: usize,
    num_buckets_with_duplicates: usize,
    nodes: Vec<DuplicateNode>,
    node_capacity: usize,
    num_data_pages: usize,
    total_data_page_bytes: usize,
    bucket_bytes: usize,
    has_matches: bool,
    stats: HashTableStats,
    closed: bool,
}

impl HashTable {
    /// Allocate a table with at least `initial_num_buckets` buckets (rounded
    /// to a power of two). Fails with a recoverable budget error when the
    /// bucket array cannot be reserved; the caller spills instead.
    pub fn try_new(
        tracker: Arc<MemTracker>,
        quadratic_probing: bool,
        stores_duplicates: bool,
        max_num_buckets: usize,
        initial_num_buckets: usize,
        io_page_bytes: usize,
    ) -> Result<Self> {
        let num_buckets = initial_num_buckets
            .max(4)
            .next_power_of_two()
            .min(max_num_buckets.next_power_of_two());
        let bucket_bytes = num_buckets * std::mem::size_of::<Bucket>();
        if !tracker.try_consume(bucket_bytes) {
            return Err(tracker.mem_limit_exceeded(format!(
                "hash table bucket array of {num_buckets} buckets"
            )));
        }
        Ok(Self {
            quadratic_probing,
            stores_duplicates,
            max_num_buckets: max_num_buckets.next_power_of_two(),
            io_page_bytes: io_page_bytes.max(INITIAL_DATA_PAGE_SIZES[0]),
            tracker,
            buckets: vec![EMPTY_BUCKET; num_buckets],
            num_filled_buckets: 0,
            num_buckets_with_duplicates: 0,
            nodes: Vec::new(),
            node_capacity: 0,
            num_data_pages: 0,
            total_data_page_bytes: 0,
            bucket_bytes,
            has_matches: false,
            stats: HashTableStats::default(),
            closed: false,
        })
    }

    /// Buckets needed for `rows` distinct entries within the fill bound.
    pub fn estimate_num_buckets(rows: u64) -> usize {
        let needed = (rows as usize).saturating_mul(4) / 3;
        needed.max(4).next_power_of_two()
    }

    /// Estimated bucket-array bytes for `rows` entries.
    pub fn estimate_byte_size(rows: u64) -> usize {
        Self::estimate_num_buckets(rows) * std::mem::size_of::<Bucket>()
    }

    fn probe_buckets(
        buckets: &[Bucket],
        nodes: &[DuplicateNode],
        quadratic: bool,
        hash: u32,
        mut eq: Option<&mut dyn FnMut(TupleSlot) -> Result<bool>>,
        stats: &mut HashTableStats,
    ) -> Result<(Option<usize>, bool)> {
        let num_buckets = buckets.len();
        let mask = num_buckets - 1;
        let mut idx = (hash as usize) & mask;
        stats.num_probes += 1;
        let mut step = 0usize;
        loop {
            let bucket = &buckets[idx];
            if !bucket.filled {
                return Ok((Some(idx), false));
            }
            if bucket.hash == hash {
                if let Some(eq) = eq.as_deref_mut() {
                    let slot = match bucket.data {
                        BucketData::Chain(head) => nodes[head as usize].slot,
                        BucketData::Slot(slot) => slot,
                    };
                    if eq(slot)? {
                        return Ok((Some(idx), true));
                    }
                    stats.num_hash_collisions += 1;
                }
            }
            step += 1;
            stats.travel_length += 1;
            if step >= num_buckets {
                // The whole probe sequence is exhausted; with quadratic
                // probing this can happen before the table is full.
                return Ok((None, false));
            }
            idx = (idx + if quadratic { step } else { 1 }) & mask;
        }
    }

    /// Look up `hash` for insertion: the existing entry, a reserved empty
    /// bucket, or `Full` when the fill bound or probe sequence is exhausted.
    pub fn find_or_empty(
        &mut self,
        hash: u32,
        mut eq: impl FnMut(TupleSlot) -> Result<bool>,
    ) -> Result<FindOutcome> {
        let (idx, found) = Self::probe_buckets(
            &self.buckets,
            &self.nodes,
            self.quadratic_probing,
            hash,
            Some(&mut eq),
            &mut self.stats,
        )?;
        match idx {
            Some(idx) if found => Ok(FindOutcome::Found(self.iter_at(idx))),
            Some(idx) if self.has_space() => Ok(FindOutcome::Empty(EmptyBucket(idx))),
            _ => Ok(FindOutcome::Full),
        }
    }

    /// Occupy an empty bucket located by [`Self::find_or_empty`].
    pub fn fill_bucket(&mut self, spot: EmptyBucket, hash: u32, slot: TupleSlot) {
        let bucket = &mut self.buckets[spot.0];
        debug_assert!(!bucket.filled);
        *bucket = Bucket {
            filled: true,
            matched: false,
            has_duplicates: false,
            hash,
            data: BucketData::Slot(slot),
        };
        self.num_filled_buckets += 1;
    }

    /// Insert `slot`, chaining duplicates when the key already exists.
    ///
    /// Returns `NeedsResize` when no bucket is reachable within the fill
    /// bound. A denied data-page reservation surfaces as a recoverable
    /// budget error; the caller spills the partition.
    pub fn insert(
        &mut self,
        hash: u32,
        slot: TupleSlot,
        eq: impl FnMut(TupleSlot) -> Result<bool>,
    ) -> Result<InsertOutcome> {
        debug_assert!(self.stores_duplicates);
        match self.find_or_empty(hash, eq)? {
            FindOutcome::Found(it) => {
                self.append_duplicate(it.bucket_idx, slot)?;
                Ok(InsertOutcome::Inserted)
            }
            FindOutcome::Empty(spot) => {
                self.fill_bucket(spot, hash, slot);
                Ok(InsertOutcome::Inserted)
            }
            FindOutcome::Full => Ok(InsertOutcome::NeedsResize),
        }
    }

    fn append_duplicate(&mut self, bucket_idx: usize, slot: TupleSlot) -> Result<()> {
        let needed = if self.buckets[bucket_idx].has_duplicates {
            1
        } else {
            2
        };
        self.ensure_node_capacity(needed)?;
        let bucket = &mut self.buckets[bucket_idx];
        if !bucket.has_duplicates {
            let existing = match bucket.data {
                BucketData::Slot(existing) => existing,
                BucketData::Chain(_) => unreachable!("chain without has_duplicates"),
            };
            self.nodes.push(DuplicateNode {
                next: NO_NODE,
                matched: bucket.matched,
                slot: existing,
            });
            bucket.has_duplicates = true;
            bucket.matched = false;
            bucket.data = BucketData::Chain((self.nodes.len() - 1) as u32);
            self.num_buckets_with_duplicates += 1;
        }
        let head = match self.buckets[bucket_idx].data {
            BucketData::Chain(head) => head,
            BucketData::Slot(_) => unreachable!("duplicate append on slot bucket"),
        };
        self.nodes.push(DuplicateNode {
            next: head,
            matched: false,
            slot,
        });
        self.buckets[bucket_idx].data = BucketData::Chain((self.nodes.len() - 1) as u32);
        Ok(())
    }

    fn ensure_node_capacity(&mut self, additional: usize) -> Result<()> {
        while self.nodes.len() + additional > self.node_capacity {
            let page_bytes = if self.num_data_pages < INITIAL_DATA_PAGE_SIZES.len() {
                INITIAL_DATA_PAGE_SIZES[self.num_data_pages].min(self.io_page_bytes)
            } else {
                self.io_page_bytes
            };
            if !self.tracker.try_consume(page_bytes) {
                return Err(self
                    .tracker
                    .mem_limit_exceeded(format!("hash table data page of {page_bytes} bytes")));
            }
            self.num_data_pages += 1;
            self.total_data_page_bytes += page_bytes;
            self.node_capacity += page_bytes / std::mem::size_of::<DuplicateNode>();
            self.nodes.reserve(self.node_capacity - self.nodes.len());
        }
        Ok(())
    }

    /// Probe for `hash`; a hit returns a cursor at the bucket (and chain
    /// head, if duplicates exist).
    pub fn probe(
        &mut self,
        hash: u32,
        mut eq: impl FnMut(TupleSlot) -> Result<bool>,
    ) -> Result<Option<HtIter>> {
        let (idx, found) = Self::probe_buckets(
            &self.buckets,
            &self.nodes,
            self.quadratic_probing,
            hash,
            Some(&mut eq),
            &mut self.stats,
        )?;
        match idx {
            Some(idx) if found => Ok(Some(self.iter_at(idx))),
            _ => {
                self.stats.num_failed_probes += 1;
                Ok(None)
            }
        }
    }

    /// Grow to the smallest doubling that fits `additional` more entries
    /// within the fill bound. Returns `false` when the caller maximum or the
    /// memory budget blocks the resize; the table is unchanged.
    pub fn check_and_resize(&mut self, additional: usize) -> Result<bool> {
        let mut shift = 0u32;
        while (self.num_filled_buckets + additional) as f64
            > ((self.buckets.len() << shift) as f64) * MAX_FILL_FACTOR
        {
            shift += 1;
        }
        if shift == 0 {
            return Ok(true);
        }
        self.resize_buckets(self.buckets.len() << shift)
    }

    fn resize_buckets(&mut self, new_num_buckets: usize) -> Result<bool> {
        debug_assert!(new_num_buckets.is_power_of_two());
        if new_num_buckets > self.max_num_buckets {
            return Ok(false);
        }
        let new_bytes = new_num_buckets * std::mem::size_of::<Bucket>();
        if !self.tracker.try_consume(new_bytes) {
            return Ok(false);
        }
        self.stats.num_resizes += 1;
        let mut new_buckets = vec![EMPTY_BUCKET; new_num_buckets];
        // Reinsert using the cached hashes; duplicate chains move by head
        // pointer, their nodes are untouched.
        for bucket in self.buckets.iter().filter(|b| b.filled) {
            let (idx, found) = Self::probe_buckets(
                &new_buckets,
                &self.nodes,
                self.quadratic_probing,
                bucket.hash,
                None,
                &mut self.stats,
            )?;
            debug_assert!(!found);
            let idx = idx.ok_or_else(|| {
                RiffleError::Execution(
                    "hash table resize failed to place a bucket despite free space".to_string(),
                )
            })?;
            new_buckets[idx] = *bucket;
        }
        self.buckets = new_buckets;
        self.tracker.release(self.bucket_bytes);
        self.bucket_bytes = new_bytes;
        Ok(true)
    }

    fn has_space(&self) -> bool {
        self.num_filled_buckets < (self.buckets.len() as f64 * MAX_FILL_FACTOR) as usize
    }

    /// Entries that can still be inserted before a resize is required.
    pub fn num_inserts_before_resize(&self) -> usize {
        ((self.buckets.len() as f64 * MAX_FILL_FACTOR) as usize)
            .saturating_sub(self.num_filled_buckets)
    }

    /// Distinct entries stored (duplicate nodes included).
    pub fn size(&self) -> u64 {
        (self.num_filled_buckets - self.num_buckets_with_duplicates + self.nodes.len()) as u64
    }

    /// Current bucket count.
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Filled bucket count.
    pub fn num_filled_buckets(&self) -> usize {
        self.num_filled_buckets
    }

    /// Bytes reserved for buckets and data pages.
    pub fn byte_size(&self) -> usize {
        self.bucket_bytes + self.total_data_page_bytes
    }

    /// Whether any probe has matched an entry since the last reset.
    pub fn has_matches(&self) -> bool {
        self.has_matches
    }

    /// Observable statistics.
    pub fn stats(&self) -> &HashTableStats {
        &self.stats
    }

    /// One-line statistics summary for close-time logging.
    pub fn stats_string(&self) -> String {
        let fill = self.num_filled_buckets as f64 / self.buckets.len() as f64;
        format!(
            "buckets={} filled={} fill={:.3} dup_buckets={} dup_nodes={} probes={} failed={} travel={} collisions={} resizes={}",
            self.buckets.len(),
            self.num_filled_buckets,
            fill,
            self.num_buckets_with_duplicates,
            self.nodes.len(),
            self.stats.num_probes,
            self.stats.num_failed_probes,
            self.stats.travel_length,
            self.stats.num_hash_collisions,
            self.stats.num_resizes,
        )
    }

    fn iter_at(&self, bucket_idx: usize) -> HtIter {
        let node = if self.buckets[bucket_idx].has_duplicates {
            match self.buckets[bucket_idx].data {
                BucketData::Chain(head) => head,
                BucketData::Slot(_) => unreachable!("chain without has_duplicates"),
            }
        } else {
            NO_NODE
        };
        HtIter { bucket_idx, node }
    }

    /// Cursor at the first filled bucket.
    pub fn begin(&self) -> HtIter {
        let mut it = HtIter {
            bucket_idx: usize::MAX,
            node: NO_NODE,
        };
        self.next_filled_from(0, &mut it);
        it
    }

    fn next_filled_from(&self, start: usize, it: &mut HtIter) {
        for idx in start..self.buckets.len() {
            if self.buckets[idx].filled {
                *it = self.iter_at(idx);
                return;
            }
        }
        it.bucket_idx = self.buckets.len();
        it.node = NO_NODE;
    }

    /// Whether the cursor points at an entry.
    pub fn iter_valid(&self, it: &HtIter) -> bool {
        it.bucket_idx < self.buckets.len()
    }

    /// Stable slot under the cursor.
    pub fn iter_slot(&self, it: &HtIter) -> TupleSlot {
        if it.node != NO_NODE {
            self.nodes[it.node as usize].slot
        } else {
            match self.buckets[it.bucket_idx].data {
                BucketData::Slot(slot) => slot,
                BucketData::Chain(_) => unreachable!("cursor lost its chain position"),
            }
        }
    }

    /// Advance in full iteration order (chain first, then next bucket).
    pub fn iter_next(&self, it: &mut HtIter) {
        if it.node != NO_NODE {
            let next = self.nodes[it.node as usize].next;
            if next != NO_NODE {
                it.node = next;
                return;
            }
        }
        self.next_filled_from(it.bucket_idx + 1, it);
    }

    /// Advance within the current duplicate chain only. Returns `false` when
    /// the chain (or a single-entry bucket) is exhausted.
    pub fn iter_next_duplicate(&self, it: &mut HtIter) -> bool {
        if it.node == NO_NODE {
            return false;
        }
        let next = self.nodes[it.node as usize].next;
        if next == NO_NODE {
            return false;
        }
        it.node = next;
        true
    }

    /// Cursor at the first unmatched entry.
    pub fn first_unmatched(&self) -> HtIter {
        let mut it = self.begin();
        while self.iter_valid(&it) && self.iter_is_matched(&it) {
            self.iter_next(&mut it);
        }
        it
    }

    /// Advance to the next unmatched entry.
    pub fn iter_next_unmatched(&self, it: &mut HtIter) {
        loop {
            self.iter_next(it);
            if !self.iter_valid(it) || !self.iter_is_matched(it) {
                return;
            }
        }
    }

    /// Matched bit of the entry under the cursor.
    pub fn iter_is_matched(&self, it: &HtIter) -> bool {
        if it.node != NO_NODE {
            self.nodes[it.node as usize].matched
        } else {
            self.buckets[it.bucket_idx].matched
        }
    }

    /// Set the matched bit of the entry under the cursor. Monotone within a
    /// probe phase; cleared only by whole-table close.
    pub fn iter_set_matched(&mut self, it: &HtIter) {
        if it.node != NO_NODE {
            self.nodes[it.node as usize].matched = true;
        } else {
            self.buckets[it.bucket_idx].matched = true;
        }
        self.has_matches = true;
    }

    /// Release bucket and data-page memory. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buckets = Vec::new();
        self.nodes = Vec::new();
        self.tracker.release(self.bucket_bytes + self.total_data_page_bytes);
        self.bucket_bytes = 0;
        self.total_data_page_bytes = 0;
        self.node_capacity = 0;
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(i: u32) -> TupleSlot {
        TupleSlot { block: 0, row: i }
    }

    fn table(quadratic: bool, dups: bool, buckets: usize) -> HashTable {
        HashTable::try_new(
            MemTracker::new("t", usize::MAX),
            quadratic,
            dups,
            1 << 28,
            buckets,
            1024 * 1024,
        )
        .unwrap()
    }

    /// Equality oracle: slot row id encodes the key, hash = key.
    fn eq_for(keys: &[u32], key: u32) -> impl FnMut(TupleSlot) -> Result<bool> + '_ {
        move |s| Ok(keys[s.row as usize] == key)
    }

    #[test]
    fn find_or_insert_then_probe_roundtrips() {
        for quadratic in [false, true] {
            let mut ht = table(quadratic, false, 16);
            let keys: Vec<u32> = (0..100).collect();
            for k in 0..100u32 {
                if ht.num_inserts_before_resize() == 0 {
                    assert!(ht.check_and_resize(1).unwrap());
                }
                match ht.find_or_empty(k, eq_for(&keys, k)).unwrap() {
                    FindOutcome::Empty(spot) => ht.fill_bucket(spot, k, slot(k)),
                    other => panic!("expected empty, got {other:?}"),
                }
                assert!(
                    ht.num_filled_buckets() as f64 <= ht.num_buckets() as f64 * MAX_FILL_FACTOR,
                    "fill bound violated after insert {k}"
                );
            }
            for k in 0..100u32 {
                let it = ht.probe(k, eq_for(&keys, k)).unwrap().expect("present");
                assert_eq!(ht.iter_slot(&it), slot(k));
            }
            assert!(ht.probe(100, eq_for(&keys, 100)).unwrap().is_none());
            assert_eq!(ht.size(), 100);
        }
    }

    #[test]
    fn resize_preserves_entries_via_cached_hashes() {
        let mut ht = table(true, false, 4);
        let keys: Vec<u32> = (0..500).collect();
        for k in 0..500u32 {
            loop {
                match ht.find_or_empty(k.wrapping_mul(2654435761), eq_for(&keys, k)).unwrap() {
                    FindOutcome::Empty(spot) => {
                        ht.fill_bucket(spot, k.wrapping_mul(2654435761), slot(k));
                        break;
                    }
                    FindOutcome::Full => assert!(ht.check_and_resize(1).unwrap()),
                    FindOutcome::Found(_) => panic!("keys are distinct"),
                }
            }
        }
        assert!(ht.stats().num_resizes >= 1);
        for k in 0..500u32 {
            let it = ht
                .probe(k.wrapping_mul(2654435761), eq_for(&keys, k))
                .unwrap()
                .expect("survived resize");
            assert_eq!(ht.iter_slot(&it), slot(k));
        }
    }

    #[test]
    fn duplicate_chains_hold_all_build_rows() {
        let mut ht = table(false, true, 16);
        // Three rows with key 1, one with key 2. Row id is the insertion id.
        let keys = vec![1u32, 1, 1, 2];
        for (row, key) in keys.iter().enumerate() {
            assert_eq!(
                ht.insert(*key, slot(row as u32), eq_for(&keys, *key)).unwrap(),
                InsertOutcome::Inserted
            );
        }
        assert_eq!(ht.size(), 4);
        assert_eq!(ht.num_filled_buckets(), 2);

        let mut it = ht.probe(1, eq_for(&keys, 1)).unwrap().expect("key 1");
        let mut rows = vec![ht.iter_slot(&it).row];
        while ht.iter_next_duplicate(&mut it) {
            rows.push(ht.iter_slot(&it).row);
        }
        rows.sort_unstable();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[test]
    fn matched_bits_drive_unmatched_iteration() {
        let mut ht = table(false, true, 16);
        let keys = vec![1u32, 1, 2, 3];
        for (row, key) in keys.iter().enumerate() {
            ht.insert(*key, slot(row as u32), eq_for(&keys, *key)).unwrap();
        }
        let it = ht.probe(2, eq_for(&keys, 2)).unwrap().expect("key 2");
        ht.iter_set_matched(&it);
        let mut it = ht.probe(1, eq_for(&keys, 1)).unwrap().expect("key 1");
        ht.iter_set_matched(&it);
        assert!(ht.iter_next_duplicate(&mut it));
        ht.iter_set_matched(&it);
        assert!(ht.has_matches());

        let mut unmatched = Vec::new();
        let mut cur = ht.first_unmatched();
        while ht.iter_valid(&cur) {
            unmatched.push(keys[ht.iter_slot(&cur).row as usize]);
            ht.iter_next_unmatched(&mut cur);
        }
        assert_eq!(unmatched, vec![3]);
    }

    #[test]
    fn full_iteration_visits_every_entry_once() {
        let mut ht = table(true, true, 16);
        let keys = vec![7u32, 7, 8, 9, 9, 9];
        for (row, key) in keys.iter().enumerate() {
            ht.insert(*key, slot(row as u32), eq_for(&keys, *key)).unwrap();
        }
        let mut seen = Vec::new();
        let mut it = ht.begin();
        while ht.iter_valid(&it) {
            seen.push(ht.iter_slot(&it).row);
            ht.iter_next(&mut it);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn bucket_memory_is_released_on_close() {
        let tracker = MemTracker::new("t", usize::MAX);
        let mut ht = HashTable::try_new(Arc::clone(&tracker), false, true, 1 << 20, 1024, 1 << 20)
            .unwrap();
        let keys = vec![5u32; 3];
        for row in 0..3u32 {
            ht.insert(5, slot(row), eq_for(&keys, 5)).unwrap();
        }
        assert!(tracker.consumption() > 0);
        ht.close();
        assert_eq!(tracker.consumption(), 0);
        ht.close();
        assert_eq!(tracker.consumption(), 0);
    }

    #[test]
    fn denied_bucket_reservation_is_recoverable() {
        let tracker = MemTracker::new("t", 64);
        let err = HashTable::try_new(tracker, false, false, 1 << 20, 1024, 1 << 20).unwrap_err();
        assert!(err.is_recoverable_oom());
    }

    #[test]
    fn resize_respects_caller_maximum() {
        let mut ht = HashTable::try_new(
            MemTracker::new("t", usize::MAX),
            false,
            false,
            16,
            16,
            1 << 20,
        )
        .unwrap();
        assert!(!ht.check_and_resize(1000).unwrap());
    }
}
