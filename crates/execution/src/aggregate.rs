//! Partitioned hash aggregation.
//!
//! Input rows hash-partition into a fixed fanout; each resident partition
//! owns a hash table over its aggregated row spool. Memory pressure spills
//! the largest partition, whose rows are re-read and repartitioned at a
//! deeper level with an independent hash seed. A streaming pre-aggregation
//! mode never spills: when the observed reduction factor is too low to
//! justify growing the hash tables, rows pass straight through as singleton
//! groups.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use riffle_common::metrics::OperatorMetrics;
use riffle_common::{MemTracker, MetricsRegistry, OperatorId, Result, RiffleError};

use crate::context::RuntimeState;
use crate::exec_node::RowSource;
use crate::expressions::{ScalarExpr, col};
use crate::hash_context::{HashContext, KeySide};
use crate::hash_table::{FindOutcome, HashTable};
use crate::spool::RowSpool;
use crate::value::{DataType, ScalarValue, TupleRow, scalar_gt, scalar_lt};

/// An aggregate function over one input expression.
#[derive(Debug, Clone)]
pub enum AggExpr {
    /// Count of non-NULL inputs.
    Count(Arc<dyn ScalarExpr>),
    /// Sum of non-NULL inputs.
    Sum(Arc<dyn ScalarExpr>),
    /// Minimum non-NULL input.
    Min(Arc<dyn ScalarExpr>),
    /// Maximum non-NULL input.
    Max(Arc<dyn ScalarExpr>),
    /// Average of non-NULL inputs; its intermediate is a `{sum, count}` pair.
    Avg(Arc<dyn ScalarExpr>),
}

impl AggExpr {
    fn input(&self) -> &Arc<dyn ScalarExpr> {
        match self {
            AggExpr::Count(e)
            | AggExpr::Sum(e)
            | AggExpr::Min(e)
            | AggExpr::Max(e)
            | AggExpr::Avg(e) => e,
        }
    }

    /// Whether the intermediate needs more than one serialized value.
    pub fn supports_serialize(&self) -> bool {
        matches!(self, AggExpr::Avg(_))
    }
}

/// One aggregate output column.
#[derive(Debug, Clone)]
pub struct AggSpec {
    /// The aggregate function.
    pub expr: AggExpr,
    /// Output column name, for diagnostics.
    pub name: String,
}

/// Per-group aggregate function state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AggState {
    /// COUNT accumulator.
    Count(i64),
    /// Integer SUM accumulator.
    SumInt(i64),
    /// Float SUM accumulator.
    SumFloat(f64),
    /// MIN accumulator.
    Min(Option<ScalarValue>),
    /// MAX accumulator.
    Max(Option<ScalarValue>),
    /// AVG accumulator.
    Avg {
        /// Running sum.
        sum: f64,
        /// Non-NULL input count.
        count: i64,
    },
}

/// Initial states for a spec list.
pub fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs
        .iter()
        .map(|s| match &s.expr {
            AggExpr::Count(_) => AggState::Count(0),
            AggExpr::Sum(e) => match e.data_type() {
                DataType::Int64 => AggState::SumInt(0),
                _ => AggState::SumFloat(0.0),
            },
            AggExpr::Min(_) => AggState::Min(None),
            AggExpr::Max(_) => AggState::Max(None),
            AggExpr::Avg(_) => AggState::Avg { sum: 0.0, count: 0 },
        })
        .collect()
}

/// Fold one input row into the states.
pub fn update_states(states: &mut [AggState], specs: &[AggSpec], row: &[ScalarValue]) -> Result<()> {
    for (state, spec) in states.iter_mut().zip(specs) {
        let value = spec.expr.input().eval(row)?;
        match state {
            AggState::Count(acc) => {
                if !value.is_null() {
                    *acc = acc
                        .checked_add(1)
                        .ok_or_else(|| RiffleError::Execution("count overflow".to_string()))?;
                }
            }
            AggState::SumInt(acc) => {
                if let ScalarValue::Int64(v) = value {
                    *acc = acc.wrapping_add(v);
                }
            }
            AggState::SumFloat(acc) => {
                if let Some(v) = value.as_f64() {
                    *acc += v;
                }
            }
            AggState::Min(cur) => {
                if !value.is_null() {
                    match cur {
                        None => *cur = Some(value),
                        Some(existing) => {
                            if scalar_lt(&value, existing)? {
                                *cur = Some(value);
                            }
                        }
                    }
                }
            }
            AggState::Max(cur) => {
                if !value.is_null() {
                    match cur {
                        None => *cur = Some(value),
                        Some(existing) => {
                            if scalar_gt(&value, existing)? {
                                *cur = Some(value);
                            }
                        }
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
        }
    }
    Ok(())
}

/// Merge spilled intermediate states into resident ones.
pub fn merge_states(target: &mut [AggState], other: &[AggState]) -> Result<()> {
    if target.len() != other.len() {
        return Err(RiffleError::Execution(
            "aggregate state shape mismatch".to_string(),
        ));
    }
    for (t, o) in target.iter_mut().zip(other) {
        match (t, o) {
            (AggState::Count(a), AggState::Count(b)) => *a += *b,
            (AggState::SumInt(a), AggState::SumInt(b)) => *a = a.wrapping_add(*b),
            (AggState::SumFloat(a), AggState::SumFloat(b)) => *a += *b,
            (AggState::Min(a), AggState::Min(b)) => {
                if let Some(bv) = b {
                    if a.as_ref().map(|av| scalar_lt(bv, av)).transpose()?.unwrap_or(true) {
                        *a = Some(bv.clone());
                    }
                }
            }
            (AggState::Max(a), AggState::Max(b)) => {
                if let Some(bv) = b {
                    if a.as_ref().map(|av| scalar_gt(bv, av)).transpose()?.unwrap_or(true) {
                        *a = Some(bv.clone());
                    }
                }
            }
            (
                AggState::Avg { sum: asum, count: acount },
                AggState::Avg { sum: bsum, count: bcount },
            ) => {
                *asum += *bsum;
                *acount += *bcount;
            }
            _ => {
                return Err(RiffleError::Execution(
                    "aggregate state type mismatch".to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn finalize_state(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => ScalarValue::Int64(*v),
        AggState::SumFloat(v) => ScalarValue::float64(*v),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { sum, count } => {
            if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::float64(*sum / *count as f64)
            }
        }
    }
}

fn serialize_state(state: &AggState, out: &mut TupleRow) {
    match state {
        AggState::Avg { sum, count } => {
            out.push(ScalarValue::float64(*sum));
            out.push(ScalarValue::Int64(*count));
        }
        other => out.push(finalize_state(other)),
    }
}

/// An intermediate tuple: grouping key values plus aggregate states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRow {
    /// Grouping key values.
    pub keys: TupleRow,
    /// One state per aggregate spec.
    pub states: Vec<AggState>,
}

impl crate::spool::SpoolRow for GroupRow {
    fn estimate_bytes(&self) -> usize {
        let states: usize = self
            .states
            .iter()
            .map(|s| match s {
                AggState::Min(Some(v)) | AggState::Max(Some(v)) => 16 + v.estimate_bytes(),
                AggState::Avg { .. } => 16,
                _ => 8,
            })
            .sum();
        crate::value::row_estimate_bytes(&self.keys) + 32 + states
    }
}

/// Minimum reduction factors gating streaming hash-table expansion, by total
/// bucket-directory bytes. The thresholds track cache-level working sets:
/// expand freely inside L2, into L3 only with some reduction, into main
/// memory only with significant reduction.
const STREAMING_HT_MIN_REDUCTION: [(usize, f64); 3] =
    [(0, 0.0), (256 * 1024, 1.1), (2 * 1024 * 1024, 2.0)];

/// Immutable configuration of one aggregator instance.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Operator id for diagnostics and metric labels.
    pub operator_id: OperatorId,
    /// Grouping key expressions over the input row; empty means a single
    /// global group.
    pub group_exprs: Vec<Arc<dyn ScalarExpr>>,
    /// Aggregate output columns.
    pub aggregates: Vec<AggSpec>,
    /// Whether NULL grouping keys form their own groups. When off, rows with
    /// NULL keys are skipped.
    pub stores_null_keys: bool,
    /// Streaming pre-aggregation mode: level 0 only, never spills, passes
    /// rows through under pressure.
    pub streaming_preagg: bool,
    /// Emit finalized values; otherwise serialized intermediates.
    pub needs_finalize: bool,
    /// Whether any aggregate carries a multi-value intermediate.
    pub needs_serialize: bool,
    /// Non-zero seed for level-0 hashing.
    pub initial_seed: u32,
    /// Partition-selecting bits; fanout is `1 << num_partitioning_bits`.
    pub num_partitioning_bits: u32,
    /// Maximum repartitioning depth.
    pub max_partition_depth: usize,
    /// Quadratic (vs linear) probing for the hash tables.
    pub quadratic_probing: bool,
    /// Initial hash-table bucket count per partition.
    pub initial_ht_buckets: usize,
    /// Planner cardinality estimate for the streaming reduction formula;
    /// zero when unknown.
    pub estimated_input_cardinality: u64,
}

impl AggregatorConfig {
    /// Config with the standard tunables for the given keys and aggregates.
    pub fn new(
        operator_id: OperatorId,
        group_exprs: Vec<Arc<dyn ScalarExpr>>,
        aggregates: Vec<AggSpec>,
    ) -> Self {
        let needs_serialize = aggregates.iter().any(|s| s.expr.supports_serialize());
        Self {
            operator_id,
            group_exprs,
            aggregates,
            stores_null_keys: true,
            streaming_preagg: false,
            needs_finalize: true,
            needs_serialize,
            initial_seed: 1,
            num_partitioning_bits: 4,
            max_partition_depth: crate::hash::MAX_PARTITION_DEPTH,
            quadratic_probing: true,
            initial_ht_buckets: 1024,
            estimated_input_cardinality: 0,
        }
    }
}

struct AggPartition {
    level: usize,
    hash_tbl: Option<HashTable>,
    agg_spool: RowSpool<GroupRow>,
    unagg_spool: Option<RowSpool<TupleRow>>,
    is_spilled: bool,
    is_closed: bool,
}

impl AggPartition {
    fn num_rows(&self) -> u64 {
        self.agg_spool.num_rows()
            + self.unagg_spool.as_ref().map_or(0, |s| s.num_rows())
    }

    fn bytes_in_mem(&self) -> usize {
        self.agg_spool.bytes_in_mem()
            + self.unagg_spool.as_ref().map_or(0, |s| s.bytes_in_mem())
            + self.hash_tbl.as_ref().map_or(0, |h| h.byte_size())
    }
}

enum RowRef<'a> {
    Input(&'a TupleRow),
    Aggregated(&'a GroupRow),
}

enum UpsertAction {
    Done,
    NeedsResize,
    NeedsMemory,
}

fn partition_index(hash: u32, bits: u32) -> usize {
    ((hash >> (32 - bits)) & ((1u32 << bits) - 1)) as usize
}

/// Hash-partitioned grouping aggregator.
pub struct GroupAggregator {
    cfg: AggregatorConfig,
    state: Arc<RuntimeState>,
    tracker: Arc<MemTracker>,
    metrics: OperatorMetrics,
    ctx: Option<HashContext>,
    hash_partitions: Vec<AggPartition>,
    spilled_partitions: VecDeque<AggPartition>,
    output_partitions: VecDeque<AggPartition>,
    rows_input: u64,
    rows_passed_through: u64,
    closed: bool,
}

impl GroupAggregator {
    /// Construct an aggregator. The hash context and expression cache are
    /// allocated here; partitions are created when `run` starts.
    pub fn new(
        cfg: AggregatorConfig,
        state: Arc<RuntimeState>,
        tracker: Arc<MemTracker>,
        registry: &MetricsRegistry,
    ) -> Result<Self> {
        if cfg.num_partitioning_bits == 0 || cfg.num_partitioning_bits > 16 {
            return Err(RiffleError::Execution(format!(
                "aggregator {}: num_partitioning_bits must be in 1..=16",
                cfg.operator_id
            )));
        }
        if cfg.max_partition_depth > crate::hash::MAX_PARTITION_DEPTH {
            return Err(RiffleError::Execution(format!(
                "aggregator {}: max_partition_depth exceeds seed table",
                cfg.operator_id
            )));
        }
        let metrics = registry.operator(&format!("agg-{}", cfg.operator_id));
        let ctx = if cfg.group_exprs.is_empty() {
            None
        } else {
            // Build exprs are slot references into the intermediate tuple's
            // key region; probe exprs are the grouping exprs on input rows.
            let build: Vec<Arc<dyn ScalarExpr>> = cfg
                .group_exprs
                .iter()
                .enumerate()
                .map(|(i, e)| col(i, e.data_type()))
                .collect();
            Some(HashContext::new(
                build,
                cfg.group_exprs.clone(),
                cfg.stores_null_keys,
                // NULL keys match each other exactly when they are stored.
                vec![cfg.stores_null_keys; cfg.group_exprs.len()],
                cfg.initial_seed,
                cfg.max_partition_depth,
                state.batch_size(),
                Arc::clone(&tracker),
            )?)
        };
        Ok(Self {
            cfg,
            state,
            tracker,
            metrics,
            ctx,
            hash_partitions: Vec::new(),
            spilled_partitions: VecDeque::new(),
            output_partitions: VecDeque::new(),
            rows_input: 0,
            rows_passed_through: 0,
            closed: false,
        })
    }

    /// Operator metric handles (readable after close).
    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    /// Consume the child to end of stream and return the aggregated output.
    pub fn run(&mut self, child: &mut dyn RowSource) -> Result<Vec<TupleRow>> {
        let _span = tracing::info_span!(
            "group_aggregator",
            operator_id = %self.cfg.operator_id,
            streaming = self.cfg.streaming_preagg
        )
        .entered();
        let result = if self.cfg.group_exprs.is_empty() {
            self.run_ungrouped(child)
        } else if self.cfg.streaming_preagg {
            self.run_streaming(child)
        } else {
            self.run_partitioned(child)
        };
        self.close();
        result
    }

    fn fanout(&self) -> usize {
        1usize << self.cfg.num_partitioning_bits
    }

    fn output_row(cfg: &AggregatorConfig, group: &GroupRow) -> TupleRow {
        let mut row = group.keys.clone();
        if cfg.needs_finalize {
            for state in &group.states {
                row.push(finalize_state(state));
            }
        } else {
            for state in &group.states {
                serialize_state(state, &mut row);
            }
        }
        row
    }

    // ---- ungrouped -----------------------------------------------------

    fn run_ungrouped(&mut self, child: &mut dyn RowSource) -> Result<Vec<TupleRow>> {
        let mut states = init_states(&self.cfg.aggregates);
        let batch_size = self.state.batch_size();
        let mut batch = Vec::new();
        loop {
            self.state.check_cancelled()?;
            let eos = child.get_next(batch_size, &mut batch)?;
            for row in &batch {
                update_states(&mut states, &self.cfg.aggregates, row)?;
            }
            self.rows_input += batch.len() as u64;
            if eos {
                break;
            }
        }
        // One output row even for empty input.
        let group = GroupRow { keys: Vec::new(), states };
        Ok(vec![Self::output_row(&self.cfg, &group)])
    }

    // ---- partitioned ---------------------------------------------------

    fn run_partitioned(&mut self, child: &mut dyn RowSource) -> Result<Vec<TupleRow>> {
        self.create_hash_partitions(0)?;
        let batch_size = self.state.batch_size();
        let mut batch = Vec::new();
        loop {
            self.state.check_cancelled()?;
            let eos = child.get_next(batch_size, &mut batch)?;
            self.rows_input += batch.len() as u64;
            self.process_input_batch(&batch)?;
            if eos {
                break;
            }
        }
        self.move_hash_partitions(self.rows_input)?;
        let mut out = Vec::new();
        self.drain_outputs(&mut out)?;
        Ok(out)
    }

    fn create_hash_partitions(&mut self, level: usize) -> Result<()> {
        if level >= self.cfg.max_partition_depth {
            return Err(RiffleError::MaxPartitionDepth(format!(
                "aggregator {}: partition depth {} reached",
                self.cfg.operator_id, level
            )));
        }
        debug_assert!(self.hash_partitions.is_empty());
        self.ctx.as_mut().expect("grouping context").set_level(level)?;

        let spill_dir = self.state.config.spill_dir.clone();
        let io_block = self.state.config.io_block_bytes;
        for i in 0..self.fanout() {
            let label = format!("agg{}-l{level}-p{i}", self.cfg.operator_id);
            let agg_spool: RowSpool<GroupRow> = match RowSpool::new(
                format!("{label}-agg"),
                Arc::clone(&self.tracker),
                &spill_dir,
                io_block,
            ) {
                Ok(s) => s,
                Err(e) if e.is_recoverable_oom() => {
                    return Err(self.mem_limit_too_low("partition stream reservation", e))
                }
                Err(e) => return Err(e),
            };
            let unagg_spool: Option<RowSpool<TupleRow>> = if self.cfg.streaming_preagg {
                None
            } else {
                match RowSpool::new(
                    format!("{label}-rows"),
                    Arc::clone(&self.tracker),
                    &spill_dir,
                    io_block,
                ) {
                    Ok(s) => Some(s),
                    Err(e) if e.is_recoverable_oom() => {
                        return Err(self.mem_limit_too_low("partition stream reservation", e))
                    }
                    Err(e) => return Err(e),
                }
            };
            self.hash_partitions.push(AggPartition {
                level,
                hash_tbl: None,
                agg_spool,
                unagg_spool,
                is_spilled: false,
                is_closed: false,
            });
        }

        for i in 0..self.fanout() {
            let table = HashTable::try_new(
                Arc::clone(&self.tracker),
                self.cfg.quadratic_probing,
                false,
                1usize << (32 - self.cfg.num_partitioning_bits),
                self.cfg.initial_ht_buckets,
                self.state.config.io_block_bytes,
            );
            match table {
                Ok(ht) => self.hash_partitions[i].hash_tbl = Some(ht),
                Err(e) if e.is_recoverable_oom() => {
                    if self.cfg.streaming_preagg {
                        // Pre-aggregation does not spill; this budget cannot
                        // host even the initial tables.
                        return Err(self.mem_limit_too_low("streaming hash table", e));
                    }
                    self.spill_partition_at(i)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.metrics.partitions_created.inc_by(self.fanout() as u64);
        OperatorMetrics::set_highwater(&self.metrics.max_partition_level, level as i64);
        Ok(())
    }

    fn mem_limit_too_low(&self, what: &str, cause: RiffleError) -> RiffleError {
        RiffleError::MemoryLimitTooLow(format!(
            "aggregator {}: {what} failed and no partition can be spilled ({cause})",
            self.cfg.operator_id
        ))
    }

    fn process_input_batch(&mut self, rows: &[TupleRow]) -> Result<()> {
        let cap = self.ctx.as_ref().expect("grouping context").cache().capacity();
        for chunk in rows.chunks(cap) {
            self.eval_input_chunk(chunk)?;
            if !self.cfg.streaming_preagg {
                self.check_and_resize_all(chunk.len())?;
            }
            for row in chunk {
                let (skip, hash) = {
                    let cache = self.ctx.as_ref().expect("ctx").cache();
                    (cache.row_skipped(), cache.cur_hash())
                };
                if !skip {
                    let p = partition_index(hash, self.cfg.num_partitioning_bits);
                    self.upsert_row(p, hash, RowRef::Input(row))?;
                }
                self.ctx.as_mut().expect("ctx").cache_mut().advance();
            }
        }
        Ok(())
    }

    fn eval_input_chunk(&mut self, chunk: &[TupleRow]) -> Result<()> {
        let ctx = self.ctx.as_mut().expect("grouping context");
        ctx.cache_mut().reset();
        for row in chunk {
            ctx.eval_row(row, KeySide::Probe)?;
            if !ctx.cache().row_skipped() {
                let hash = ctx.hash_current_row();
                ctx.cache_mut().set_cur_hash(hash);
            }
            ctx.cache_mut().advance();
        }
        ctx.cache_mut().reset_for_read();
        Ok(())
    }

    fn process_aggregated_batch(&mut self, rows: &[GroupRow]) -> Result<()> {
        let cap = self.ctx.as_ref().expect("grouping context").cache().capacity();
        for chunk in rows.chunks(cap) {
            {
                let ctx = self.ctx.as_mut().expect("ctx");
                ctx.cache_mut().reset();
                for group in chunk {
                    ctx.eval_row(&group.keys, KeySide::Build)?;
                    let hash = ctx.hash_current_row();
                    ctx.cache_mut().set_cur_hash(hash);
                    ctx.cache_mut().advance();
                }
                ctx.cache_mut().reset_for_read();
            }
            self.check_and_resize_all(chunk.len())?;
            for group in chunk {
                let hash = self.ctx.as_ref().expect("ctx").cache().cur_hash();
                let p = partition_index(hash, self.cfg.num_partitioning_bits);
                self.upsert_row(p, hash, RowRef::Aggregated(group))?;
                self.ctx.as_mut().expect("ctx").cache_mut().advance();
            }
        }
        Ok(())
    }

    /// Find-or-insert the cache's current row into partition `p`, spilling
    /// and retrying on memory pressure. Rows routed to a spilled partition
    /// are appended as-is for reprocessing at a deeper level.
    fn upsert_row(&mut self, p: usize, hash: u32, row: RowRef<'_>) -> Result<()> {
        loop {
            if self.hash_partitions[p].is_spilled {
                let appended = match &row {
                    RowRef::Input(r) => self.hash_partitions[p]
                        .unagg_spool
                        .as_mut()
                        .expect("non-streaming partition")
                        .add_row((*r).clone())
                        .map(|_| ()),
                    RowRef::Aggregated(g) => self.hash_partitions[p]
                        .agg_spool
                        .add_row((*g).clone())
                        .map(|_| ()),
                };
                match appended {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_recoverable_oom() => {
                        self.spill_largest_partition()?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let action = {
                let ctx = self.ctx.as_ref().expect("grouping context");
                let specs = &self.cfg.aggregates;
                let part = &mut self.hash_partitions[p];
                let ht = part.hash_tbl.as_mut().expect("resident partition");
                let spool = &mut part.agg_spool;
                let outcome = {
                    let spool_ref = &*spool;
                    // Build rows must collide with each other even on NULL
                    // keys, so equality is forced over null status.
                    ht.find_or_empty(hash, |slot| {
                        ctx.equals(&spool_ref.row(slot)?.keys, true)
                    })?
                };
                match outcome {
                    FindOutcome::Found(it) => {
                        let slot = ht.iter_slot(&it);
                        let group = spool.row_mut(slot)?;
                        match &row {
                            RowRef::Input(r) => update_states(&mut group.states, specs, r)?,
                            RowRef::Aggregated(g) => merge_states(&mut group.states, &g.states)?,
                        }
                        UpsertAction::Done
                    }
                    FindOutcome::Empty(spot) => {
                        let new_group = match &row {
                            RowRef::Input(r) => {
                                let mut states = init_states(specs);
                                update_states(&mut states, specs, r)?;
                                GroupRow {
                                    keys: ctx.materialize_cur_row(),
                                    states,
                                }
                            }
                            RowRef::Aggregated(g) => (*g).clone(),
                        };
                        match spool.add_row(new_group) {
                            Ok(slot) => {
                                ht.fill_bucket(spot, hash, slot);
                                UpsertAction::Done
                            }
                            Err(e) if e.is_recoverable_oom() => UpsertAction::NeedsMemory,
                            Err(e) => return Err(e),
                        }
                    }
                    FindOutcome::Full => UpsertAction::NeedsResize,
                }
            };

            match action {
                UpsertAction::Done => return Ok(()),
                UpsertAction::NeedsResize => {
                    let resized = self.hash_partitions[p]
                        .hash_tbl
                        .as_mut()
                        .expect("resident partition")
                        .check_and_resize(1)?;
                    if !resized {
                        self.spill_largest_partition()?;
                    }
                }
                UpsertAction::NeedsMemory => self.spill_largest_partition()?,
            }
        }
    }

    fn check_and_resize_all(&mut self, num_rows: usize) -> Result<()> {
        for p in 0..self.hash_partitions.len() {
            loop {
                if self.hash_partitions[p].is_spilled || self.hash_partitions[p].is_closed {
                    break;
                }
                let resized = self.hash_partitions[p]
                    .hash_tbl
                    .as_mut()
                    .expect("resident partition")
                    .check_and_resize(num_rows)?;
                if resized {
                    break;
                }
                self.spill_largest_partition()?;
            }
        }
        Ok(())
    }

    fn spill_largest_partition(&mut self) -> Result<()> {
        let mut victim = None;
        let mut max_mem = 0usize;
        for (i, part) in self.hash_partitions.iter().enumerate() {
            if part.is_closed || part.is_spilled {
                continue;
            }
            let mem = part.bytes_in_mem();
            if mem > max_mem || victim.is_none() {
                max_mem = mem;
                victim = Some(i);
            }
        }
        let Some(idx) = victim else {
            return Err(RiffleError::MemoryLimitTooLow(format!(
                "aggregator {}: no resident partition left to spill",
                self.cfg.operator_id
            )));
        };
        self.spill_partition_at(idx)
    }

    fn spill_partition_at(&mut self, idx: usize) -> Result<()> {
        let metrics = self.metrics.clone();
        let part = &mut self.hash_partitions[idx];
        debug!(
            partition = idx,
            level = part.level,
            rows = part.num_rows(),
            "spilling aggregation partition"
        );
        if let Some(mut ht) = part.hash_tbl.take() {
            fold_hash_table_stats(&metrics, &ht);
            ht.close();
        }
        part.agg_spool.unpin(false)?;
        if let Some(unagg) = part.unagg_spool.as_mut() {
            unagg.unpin(false)?;
        }
        part.is_spilled = true;
        metrics.spilled_partitions.inc();
        Ok(())
    }

    fn move_hash_partitions(&mut self, num_input_rows: u64) -> Result<()> {
        let parts = std::mem::take(&mut self.hash_partitions);
        for (i, mut part) in parts.into_iter().enumerate() {
            let rows = part.num_rows();
            if num_input_rows > 0 {
                let percent = (rows * 100 / num_input_rows) as i64;
                OperatorMetrics::set_highwater(&self.metrics.largest_partition_percent, percent);
            }
            debug!(
                partition = i,
                level = part.level,
                spilled = part.is_spilled,
                aggregated_rows = part.agg_spool.num_rows(),
                unaggregated_rows = part.unagg_spool.as_ref().map_or(0, |s| s.num_rows()),
                "partitioned input"
            );
            if rows == 0 {
                self.close_partition(&mut part);
            } else if part.is_spilled {
                part.agg_spool.unpin(true)?;
                if let Some(unagg) = part.unagg_spool.as_mut() {
                    unagg.unpin(true)?;
                }
                // Depth first: finer-partitioned data is processed first so
                // spill blocks are released earlier.
                self.spilled_partitions.push_front(part);
            } else {
                self.output_partitions.push_back(part);
            }
        }
        Ok(())
    }

    fn drain_outputs(&mut self, out: &mut Vec<TupleRow>) -> Result<()> {
        loop {
            self.state.check_cancelled()?;
            if let Some(mut part) = self.output_partitions.pop_front() {
                self.output_partition(&mut part, out)?;
                self.close_partition(&mut part);
                continue;
            }
            if let Some(spilled) = self.spilled_partitions.pop_front() {
                self.repartition(spilled)?;
                continue;
            }
            return Ok(());
        }
    }

    fn output_partition(&mut self, part: &mut AggPartition, out: &mut Vec<TupleRow>) -> Result<()> {
        let ht = part.hash_tbl.as_ref().expect("resident output partition");
        self.metrics.hash_buckets.inc_by(ht.num_buckets() as u64);
        let mut it = ht.begin();
        while ht.iter_valid(&it) {
            let group = part.agg_spool.row(ht.iter_slot(&it))?;
            out.push(Self::output_row(&self.cfg, group));
            ht.iter_next(&mut it);
        }
        Ok(())
    }

    fn repartition(&mut self, mut input: AggPartition) -> Result<()> {
        let next_level = input.level + 1;
        let num_input_rows = input.num_rows();
        debug!(
            level = next_level,
            rows = num_input_rows,
            "repartitioning spilled aggregation partition"
        );
        self.create_hash_partitions(next_level)?;
        self.metrics.num_repartitions.inc();

        // Aggregated intermediates first (merge path) so later unaggregated
        // rows find their groups without an extra miss.
        {
            let reader = loop {
                match input.agg_spool.read() {
                    Ok(r) => break r,
                    Err(e) if e.is_recoverable_oom() => self.spill_largest_partition()?,
                    Err(e) => return Err(e),
                }
            };
            let mut reader = reader;
            let mut batch: Vec<GroupRow> = Vec::new();
            loop {
                self.state.check_cancelled()?;
                let eos = reader.next_batch(self.state.batch_size(), &mut batch)?;
                self.process_aggregated_batch(&batch)?;
                if eos {
                    break;
                }
            }
        }
        {
            let unagg = input.unagg_spool.as_ref().expect("non-streaming partition");
            let reader = loop {
                match unagg.read() {
                    Ok(r) => break r,
                    Err(e) if e.is_recoverable_oom() => self.spill_largest_partition()?,
                    Err(e) => return Err(e),
                }
            };
            let mut reader = reader;
            let mut batch: Vec<TupleRow> = Vec::new();
            loop {
                self.state.check_cancelled()?;
                let eos = reader.next_batch(self.state.batch_size(), &mut batch)?;
                self.process_input_batch(&batch)?;
                if eos {
                    break;
                }
            }
        }
        self.close_partition(&mut input);

        let largest_child = self
            .hash_partitions
            .iter()
            .filter(|p| p.is_spilled && !p.is_closed)
            .map(AggPartition::num_rows)
            .max()
            .unwrap_or(0);
        if largest_child >= num_input_rows {
            return Err(RiffleError::RepartitionIneffective(format!(
                "aggregator {}: repartitioning to level {next_level} did not shrink a spilled \
                 partition of {num_input_rows} rows",
                self.cfg.operator_id
            )));
        }
        self.move_hash_partitions(num_input_rows)
    }

    // ---- streaming pre-aggregation ------------------------------------

    fn run_streaming(&mut self, child: &mut dyn RowSource) -> Result<Vec<TupleRow>> {
        self.create_hash_partitions(0)?;
        let batch_size = self.state.batch_size();
        let fanout = self.fanout();
        let mut out = Vec::new();
        let mut batch = Vec::new();
        loop {
            self.state.check_cancelled()?;
            let eos = child.get_next(batch_size, &mut batch)?;
            self.rows_input += batch.len() as u64;

            let mut remaining: Vec<usize> = (0..fanout)
                .map(|i| {
                    self.hash_partitions[i]
                        .hash_tbl
                        .as_ref()
                        .expect("streaming partition")
                        .num_inserts_before_resize()
                })
                .collect();
            let needs_expansion = remaining.iter().any(|r| *r < batch.len());
            if needs_expansion && self.should_expand_preagg_tables()? {
                for (i, slot) in remaining.iter_mut().enumerate() {
                    if *slot < batch.len() {
                        let ht = self.hash_partitions[i]
                            .hash_tbl
                            .as_mut()
                            .expect("streaming partition");
                        // A failed resize is fine; the remaining table space
                        // is still used before falling back to pass-through.
                        if ht.check_and_resize(batch.len())? {
                            *slot = ht.num_inserts_before_resize();
                        }
                    }
                }
            }

            self.process_streaming_batch(&batch, &mut remaining, &mut out)?;
            if eos {
                break;
            }
        }

        self.move_hash_partitions(self.rows_input)?;
        debug_assert!(self.spilled_partitions.is_empty());
        self.drain_outputs(&mut out)?;
        Ok(out)
    }

    fn process_streaming_batch(
        &mut self,
        rows: &[TupleRow],
        remaining: &mut [usize],
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        let cap = self.ctx.as_ref().expect("grouping context").cache().capacity();
        for chunk in rows.chunks(cap) {
            self.eval_input_chunk(chunk)?;
            for row in chunk {
                let (skip, hash) = {
                    let cache = self.ctx.as_ref().expect("ctx").cache();
                    (cache.row_skipped(), cache.cur_hash())
                };
                if !skip {
                    let p = partition_index(hash, self.cfg.num_partitioning_bits);
                    self.upsert_streaming_row(p, hash, row, remaining, out)?;
                }
                self.ctx.as_mut().expect("ctx").cache_mut().advance();
            }
        }
        Ok(())
    }

    fn upsert_streaming_row(
        &mut self,
        p: usize,
        hash: u32,
        row: &TupleRow,
        remaining: &mut [usize],
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        enum Outcome {
            Done,
            PassThrough,
        }
        let outcome = {
            let ctx = self.ctx.as_ref().expect("grouping context");
            let specs = &self.cfg.aggregates;
            let part = &mut self.hash_partitions[p];
            let ht = part.hash_tbl.as_mut().expect("streaming partition");
            let spool = &mut part.agg_spool;
            let found = {
                let spool_ref = &*spool;
                ht.find_or_empty(hash, |slot| ctx.equals(&spool_ref.row(slot)?.keys, true))?
            };
            match found {
                FindOutcome::Found(it) => {
                    let slot = ht.iter_slot(&it);
                    update_states(&mut spool.row_mut(slot)?.states, specs, row)?;
                    Outcome::Done
                }
                FindOutcome::Empty(spot) => {
                    if remaining[p] == 0 {
                        Outcome::PassThrough
                    } else {
                        let mut states = init_states(specs);
                        update_states(&mut states, specs, row)?;
                        let group = GroupRow {
                            keys: ctx.materialize_cur_row(),
                            states,
                        };
                        match spool.add_row(group) {
                            Ok(slot) => {
                                ht.fill_bucket(spot, hash, slot);
                                remaining[p] -= 1;
                                Outcome::Done
                            }
                            // Streaming never spills: emit the row instead.
                            Err(e) if e.is_recoverable_oom() => Outcome::PassThrough,
                            Err(e) => return Err(e),
                        }
                    }
                }
                FindOutcome::Full => Outcome::PassThrough,
            }
        };
        if let Outcome::PassThrough = outcome {
            let ctx = self.ctx.as_ref().expect("grouping context");
            let mut states = init_states(&self.cfg.aggregates);
            update_states(&mut states, &self.cfg.aggregates, row)?;
            let group = GroupRow {
                keys: ctx.materialize_cur_row(),
                states,
            };
            out.push(Self::output_row(&self.cfg, &group));
            self.rows_passed_through += 1;
            self.metrics.rows_passed_through.inc();
        }
        Ok(())
    }

    /// Extrapolate the final reduction factor and compare it against the
    /// cache-size threshold for the current total hash-table footprint.
    fn should_expand_preagg_tables(&self) -> Result<bool> {
        let mut ht_mem = 0usize;
        let mut ht_rows = 0u64;
        for part in &self.hash_partitions {
            let ht = part.hash_tbl.as_ref().expect("streaming partition");
            ht_mem += ht.byte_size();
            ht_rows += ht.size();
        }
        if ht_rows == 0 {
            return Ok(true);
        }

        let mut cache_level = 0usize;
        while cache_level + 1 < STREAMING_HT_MIN_REDUCTION.len()
            && ht_mem >= STREAMING_HT_MIN_REDUCTION[cache_level + 1].0
        {
            cache_level += 1;
        }
        let min_reduction = STREAMING_HT_MIN_REDUCTION[cache_level].1;

        let aggregated_input = self.rows_input.saturating_sub(self.rows_passed_through);
        if aggregated_input == 0 {
            return Ok(true);
        }
        let current_reduction = aggregated_input as f64 / ht_rows as f64;
        let expected_input = self
            .cfg
            .estimated_input_cardinality
            .saturating_sub(self.rows_passed_through);
        // R = 1 + (N / n) * (r - 1): extrapolate the observed reduction to
        // the planner's input estimate. Without an estimate, the observed
        // reduction stands.
        let estimated_reduction = if expected_input == 0 || aggregated_input >= expected_input {
            current_reduction
        } else {
            1.0 + (expected_input as f64 / aggregated_input as f64) * (current_reduction - 1.0)
        };
        self.metrics.reduction_factor_estimate.set(estimated_reduction);
        self.metrics.reduction_factor_threshold.set(min_reduction);
        Ok(estimated_reduction > min_reduction)
    }

    // ---- teardown ------------------------------------------------------

    fn close_partition(&mut self, part: &mut AggPartition) {
        if part.is_closed {
            return;
        }
        part.is_closed = true;
        if let Some(mut ht) = part.hash_tbl.take() {
            fold_hash_table_stats(&self.metrics, &ht);
            ht.close();
        }
        part.agg_spool.close();
        if let Some(unagg) = part.unagg_spool.as_mut() {
            unagg.close();
        }
    }

    /// Release every partition and the hash context. Idempotent; statistics
    /// stay readable through [`Self::metrics`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut parts = std::mem::take(&mut self.hash_partitions);
        parts.extend(std::mem::take(&mut self.spilled_partitions));
        parts.extend(std::mem::take(&mut self.output_partitions));
        for part in &mut parts {
            self.close_partition(part);
        }
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.close();
        }
    }
}

impl Drop for GroupAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn fold_hash_table_stats(metrics: &OperatorMetrics, ht: &HashTable) {
    let stats = ht.stats();
    metrics.hash_probes.inc_by(stats.num_probes);
    metrics.hash_failed_probes.inc_by(stats.num_failed_probes);
    metrics.hash_travel_length.inc_by(stats.travel_length);
    metrics.hash_collisions.inc_by(stats.num_hash_collisions);
    metrics.hash_resizes.inc_by(stats.num_resizes);
    if stats.num_probes > 1024 * 1024 || ht.num_buckets() > 128 * 1024 {
        debug!(stats = %ht.stats_string(), "hash table closed");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn int_expr(i: usize) -> Arc<dyn ScalarExpr> {
        col(i, DataType::Int64)
    }

    #[test]
    fn states_update_and_finalize() {
        let specs = vec![
            AggSpec { expr: AggExpr::Count(int_expr(0)), name: "cnt".into() },
            AggSpec { expr: AggExpr::Sum(int_expr(0)), name: "sum".into() },
            AggSpec { expr: AggExpr::Min(int_expr(0)), name: "min".into() },
            AggSpec { expr: AggExpr::Max(int_expr(0)), name: "max".into() },
            AggSpec { expr: AggExpr::Avg(int_expr(0)), name: "avg".into() },
        ];
        let mut states = init_states(&specs);
        for v in [3i64, -1, 4] {
            update_states(&mut states, &specs, &[ScalarValue::Int64(v)]).unwrap();
        }
        update_states(&mut states, &specs, &[ScalarValue::Null]).unwrap();
        let values: Vec<ScalarValue> = states.iter().map(finalize_state).collect();
        assert_eq!(values[0], ScalarValue::Int64(3));
        assert_eq!(values[1], ScalarValue::Int64(6));
        assert_eq!(values[2], ScalarValue::Int64(-1));
        assert_eq!(values[3], ScalarValue::Int64(4));
        assert_eq!(values[4], ScalarValue::float64(2.0));
    }

    #[test]
    fn merge_combines_partial_states() {
        let specs = vec![
            AggSpec { expr: AggExpr::Sum(int_expr(0)), name: "sum".into() },
            AggSpec { expr: AggExpr::Avg(int_expr(0)), name: "avg".into() },
        ];
        let mut a = init_states(&specs);
        let mut b = init_states(&specs);
        update_states(&mut a, &specs, &[ScalarValue::Int64(10)]).unwrap();
        update_states(&mut b, &specs, &[ScalarValue::Int64(2)]).unwrap();
        update_states(&mut b, &specs, &[ScalarValue::Int64(4)]).unwrap();
        merge_states(&mut a, &b).unwrap();
        assert_eq!(finalize_state(&a[0]), ScalarValue::Int64(16));
        assert_eq!(finalize_state(&a[1]), ScalarValue::float64(16.0 / 3.0));
    }

    #[test]
    fn serialize_emits_avg_as_sum_and_count() {
        let specs = vec![AggSpec { expr: AggExpr::Avg(int_expr(0)), name: "avg".into() }];
        let mut states = init_states(&specs);
        update_states(&mut states, &specs, &[ScalarValue::Int64(5)]).unwrap();
        let mut row = TupleRow::new();
        serialize_state(&states[0], &mut row);
        assert_eq!(row, vec![ScalarValue::float64(5.0), ScalarValue::Int64(1)]);
    }

    #[test]
    fn merge_rejects_mismatched_shapes() {
        let mut a = vec![AggState::Count(1)];
        assert!(merge_states(&mut a, &[AggState::SumInt(1)]).is_err());
        assert!(merge_states(&mut a, &[]).is_err());
    }
}
