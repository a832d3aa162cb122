//! Expression evaluation, hashing, and key comparison for hash tables.
//!
//! A [`HashContext`] owns the packed [`ExprValuesCache`] for the current
//! batch. Operators evaluate a batch of rows into the cache, hash them, then
//! re-walk the cache while probing; `equals` compares the cache's current row
//! against a candidate stored row by re-evaluating the build-side
//! expressions.

use std::sync::Arc;

use riffle_common::{MemTracker, Result, RiffleError};

use crate::expressions::ScalarExpr;
use crate::hash::{compute_seeds, fill_null_sentinel, hash_bytes};
use crate::layout::{ExprValuesCache, KeyLayout};
use crate::value::{DataType, ScalarValue, TupleRow};

/// Which side's key expressions to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    /// Build/insert side.
    Build,
    /// Probe side.
    Probe,
}

/// Hashing and comparison side-car shared by every hash table of one
/// operator instance.
#[derive(Debug)]
pub struct HashContext {
    build_exprs: Vec<Arc<dyn ScalarExpr>>,
    probe_exprs: Vec<Arc<dyn ScalarExpr>>,
    stores_nulls: bool,
    finds_nulls: Vec<bool>,
    finds_some_nulls: bool,
    seeds: Vec<u32>,
    level: usize,
    cache: ExprValuesCache,
}

impl HashContext {
    /// Create a context for matching build/probe key expression lists.
    ///
    /// `finds_nulls[i]` selects whether NULL matches NULL for key `i` on the
    /// probe side; it requires `stores_nulls`. `initial_seed` must be
    /// non-zero and `max_levels` bounds the repartitioning depth.
    pub fn new(
        build_exprs: Vec<Arc<dyn ScalarExpr>>,
        probe_exprs: Vec<Arc<dyn ScalarExpr>>,
        stores_nulls: bool,
        finds_nulls: Vec<bool>,
        initial_seed: u32,
        max_levels: usize,
        batch_size: usize,
        tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        if build_exprs.is_empty()
            || build_exprs.len() != probe_exprs.len()
            || build_exprs.len() != finds_nulls.len()
        {
            return Err(RiffleError::Execution(
                "hash context requires matching non-empty key expression lists".to_string(),
            ));
        }
        let finds_some_nulls = finds_nulls.iter().any(|f| *f);
        if finds_some_nulls && !stores_nulls {
            return Err(RiffleError::Execution(
                "finds_nulls requires stores_nulls".to_string(),
            ));
        }
        let types: Vec<DataType> = build_exprs.iter().map(|e| e.data_type()).collect();
        let layout = KeyLayout::compute(&types);
        let cache = ExprValuesCache::new(layout, batch_size, tracker)?;
        Ok(Self {
            build_exprs,
            probe_exprs,
            stores_nulls,
            finds_nulls,
            finds_some_nulls,
            seeds: compute_seeds(initial_seed, max_levels)?,
            level: 0,
            cache,
        })
    }

    /// Current repartitioning level.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Switch the seed to `level`.
    pub fn set_level(&mut self, level: usize) -> Result<()> {
        if level >= self.seeds.len() {
            return Err(RiffleError::Execution(format!(
                "hash level {level} out of range (max {})",
                self.seeds.len() - 1
            )));
        }
        self.level = level;
        Ok(())
    }

    /// Whether NULL keys occupy slots in the table.
    pub fn stores_nulls(&self) -> bool {
        self.stores_nulls
    }

    /// Whether any key column matches NULL against NULL.
    pub fn finds_some_nulls(&self) -> bool {
        self.finds_some_nulls
    }

    /// The batch cache.
    pub fn cache(&self) -> &ExprValuesCache {
        &self.cache
    }

    /// The batch cache, mutably.
    pub fn cache_mut(&mut self) -> &mut ExprValuesCache {
        &mut self.cache
    }

    /// Evaluate every key expression of `side` on `row` into the cache's
    /// current row, returning whether any key evaluated to NULL.
    ///
    /// The row-skip flag is set when the row can never occupy a slot or match:
    /// any NULL when the table does not store NULLs, or (probe side) a NULL
    /// in a key position whose `finds_nulls` is off.
    pub fn eval_row(&mut self, row: &[ScalarValue], side: KeySide) -> Result<bool> {
        let exprs = match side {
            KeySide::Build => &self.build_exprs,
            KeySide::Probe => &self.probe_exprs,
        };
        eval_row_into(
            exprs,
            self.stores_nulls,
            &self.finds_nulls,
            side,
            &mut self.cache,
            row,
        )
    }

    /// Hash the cache's current row with the level seed.
    ///
    /// NULLs are covered implicitly: their slots hold the sentinel pattern.
    /// With no variable-length keys the whole fixed region hashes in one
    /// call; otherwise the fixed prefix is hashed, then each payload (or the
    /// sentinel header when NULL).
    pub fn hash_current_row(&self) -> u32 {
        let seed = self.seeds[self.level];
        let layout = self.cache.layout();
        match layout.var_tail_offset() {
            None => hash_bytes(self.level, self.cache.cur_fixed(), seed),
            Some(tail) => {
                let mut hash = seed;
                if tail > 0 {
                    hash = hash_bytes(self.level, &self.cache.cur_fixed()[..tail], hash);
                }
                for i in 0..layout.num_keys() {
                    if !layout.key_type(i).is_var_len() {
                        continue;
                    }
                    if self.cache.is_null(i) {
                        hash = hash_bytes(self.level, self.cache.value_slot(i), hash);
                    } else {
                        let (offset, len) = self.cache.read_var_header(i);
                        hash = hash_bytes(self.level, self.cache.var_slice(offset, len), hash);
                    }
                }
                hash
            }
        }
    }

    /// Compare the cache's current row against a candidate stored row by
    /// evaluating the build expressions on it.
    ///
    /// `force_null_equality` makes NULL equal NULL for every key; it is used
    /// when inserting build rows that must collide with each other.
    pub fn equals(&self, row: &[ScalarValue], force_null_equality: bool) -> Result<bool> {
        let layout = self.cache.layout();
        for i in 0..self.build_exprs.len() {
            let val = self.build_exprs[i].eval(row)?;
            if val.is_null() {
                if !(force_null_equality || self.finds_nulls[i]) {
                    return Ok(false);
                }
                if !self.cache.is_null(i) {
                    return Ok(false);
                }
                continue;
            }
            if self.cache.is_null(i) {
                return Ok(false);
            }
            let equal = match (layout.key_type(i), &val) {
                (DataType::Int64, ScalarValue::Int64(v)) => {
                    self.cache.value_slot(i) == v.to_le_bytes()
                }
                (DataType::Float64, ScalarValue::Float64Bits(bits)) => {
                    self.cache.value_slot(i) == bits.to_le_bytes()
                }
                (DataType::Boolean, ScalarValue::Boolean(b)) => {
                    self.cache.value_slot(i)[0] == *b as u8
                }
                (DataType::Utf8, ScalarValue::Utf8(s)) => {
                    let (offset, len) = self.cache.read_var_header(i);
                    len as usize == s.len() && self.cache.var_slice(offset, len) == s.as_bytes()
                }
                (expected, got) => {
                    return Err(RiffleError::Execution(format!(
                        "key {i} type mismatch: layout {expected:?}, value {got:?}"
                    )))
                }
            };
            if !equal {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decode the cache's current row back into scalar values (NULL where
    /// flagged). Used to copy grouping keys into a new intermediate tuple.
    pub fn materialize_cur_row(&self) -> TupleRow {
        let layout = self.cache.layout();
        let mut out = Vec::with_capacity(layout.num_keys());
        for i in 0..layout.num_keys() {
            if self.cache.is_null(i) {
                out.push(ScalarValue::Null);
                continue;
            }
            let value = match layout.key_type(i) {
                DataType::Int64 => ScalarValue::Int64(i64::from_le_bytes(
                    self.cache.value_slot(i).try_into().expect("int64 slot"),
                )),
                DataType::Float64 => ScalarValue::Float64Bits(u64::from_le_bytes(
                    self.cache.value_slot(i).try_into().expect("float64 slot"),
                )),
                DataType::Boolean => ScalarValue::Boolean(self.cache.value_slot(i)[0] != 0),
                DataType::Utf8 => {
                    let (offset, len) = self.cache.read_var_header(i);
                    ScalarValue::Utf8(
                        String::from_utf8_lossy(self.cache.var_slice(offset, len)).into_owned(),
                    )
                }
            };
            out.push(value);
        }
        out
    }

    /// Release the cache reservation. Idempotent.
    pub fn close(&mut self) {
        self.cache.close();
    }
}

fn eval_row_into(
    exprs: &[Arc<dyn ScalarExpr>],
    stores_nulls: bool,
    finds_nulls: &[bool],
    side: KeySide,
    cache: &mut ExprValuesCache,
    row: &[ScalarValue],
) -> Result<bool> {
    let mut has_null = false;
    let mut cannot_match = false;
    for (i, expr) in exprs.iter().enumerate() {
        let val = expr.eval(row)?;
        if val.is_null() {
            // If the table doesn't store nulls, no reason to keep evaluating.
            if !stores_nulls {
                cache.set_row_skipped(true);
                return Ok(true);
            }
            cache.set_null(i, true);
            fill_null_sentinel(cache.value_slot_mut(i));
            has_null = true;
            if side == KeySide::Probe && !finds_nulls[i] {
                cannot_match = true;
            }
            continue;
        }
        cache.set_null(i, false);
        match &val {
            ScalarValue::Int64(v) => cache.value_slot_mut(i).copy_from_slice(&v.to_le_bytes()),
            ScalarValue::Float64Bits(bits) => {
                cache.value_slot_mut(i).copy_from_slice(&bits.to_le_bytes())
            }
            ScalarValue::Boolean(b) => cache.value_slot_mut(i)[0] = *b as u8,
            ScalarValue::Utf8(s) => {
                let offset = cache.push_var(s.as_bytes());
                cache.write_var_header(i, offset, s.len() as u64);
            }
            ScalarValue::Null => unreachable!("null handled above"),
        }
    }
    if cannot_match {
        cache.set_row_skipped(true);
    }
    Ok(has_null)
}
