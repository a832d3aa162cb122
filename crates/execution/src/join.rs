//! Partitioned hash equi-join.
//!
//! Two phases: the build child is hash-partitioned into a fixed fanout, each
//! resident partition building a duplicate-chaining hash table over its build
//! spool; the probe child then probes resident partitions and appends rows
//! for spilled ones to their probe spools. Spilled partitions are drained
//! depth-first afterwards: a partition whose build side fits is probed
//! directly, anything else is repartitioned at the next level with an
//! independent hash seed.
//!
//! Null-aware left anti join routes NULL-keyed rows of both sides to
//! dedicated side streams and resolves them by an O(build x probe) pairwise
//! evaluation at the end.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use riffle_common::metrics::OperatorMetrics;
use riffle_common::{MemTracker, MetricsRegistry, OperatorId, Result, RiffleError};

use crate::aggregate::fold_hash_table_stats;
use crate::context::RuntimeState;
use crate::exec_node::RowSource;
use crate::expressions::{ScalarExpr, eval_conjuncts};
use crate::filter::{BloomFilter, FilterBank, FilterSpec, RuntimeFilterMode, fp_rate_too_high};
use crate::hash_context::{HashContext, KeySide};
use crate::hash_table::{HashTable, InsertOutcome};
use crate::spool::RowSpool;
use crate::value::{TupleRow, null_row};

/// The supported join operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    /// Emit matching probe x build pairs.
    Inner,
    /// Inner plus unmatched probe rows padded with NULLs.
    LeftOuter,
    /// Probe rows with at least one match, probe columns only.
    LeftSemi,
    /// Probe rows with no match, probe columns only.
    LeftAnti,
    /// Left anti with SQL `NOT IN` NULL semantics.
    NullAwareLeftAnti,
    /// Inner plus unmatched build rows padded with NULLs.
    RightOuter,
    /// Build rows with at least one match, build columns only.
    RightSemi,
    /// Build rows with no match, build columns only.
    RightAnti,
    /// Inner plus unmatched rows of both sides.
    FullOuter,
}

impl JoinOp {
    /// Whether build-side match bits must be tracked.
    pub fn needs_build_match_bits(self) -> bool {
        matches!(
            self,
            JoinOp::RightOuter | JoinOp::RightSemi | JoinOp::RightAnti | JoinOp::FullOuter
        )
    }

    /// Whether unmatched build rows are emitted at end of partition.
    pub fn emits_unmatched_build(self) -> bool {
        matches!(self, JoinOp::RightOuter | JoinOp::RightAnti | JoinOp::FullOuter)
    }

    /// Whether output rows carry probe columns only.
    pub fn probe_side_only(self) -> bool {
        matches!(
            self,
            JoinOp::LeftSemi | JoinOp::LeftAnti | JoinOp::NullAwareLeftAnti
        )
    }

    /// Whether output rows carry build columns only.
    pub fn build_side_only(self) -> bool {
        matches!(self, JoinOp::RightSemi | JoinOp::RightAnti)
    }

    fn stores_nulls(self, finds_nulls: &[bool]) -> bool {
        self.needs_build_match_bits() || finds_nulls.iter().any(|f| *f)
    }
}

/// Immutable configuration of one join instance.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Operator id for diagnostics and metric labels.
    pub operator_id: OperatorId,
    /// The join operator.
    pub join_op: JoinOp,
    /// Key expressions over build rows.
    pub build_key_exprs: Vec<Arc<dyn ScalarExpr>>,
    /// Key expressions over probe rows.
    pub probe_key_exprs: Vec<Arc<dyn ScalarExpr>>,
    /// Per key: whether NULL matches NULL on the probe side (`IS NOT
    /// DISTINCT FROM` semantics).
    pub finds_nulls: Vec<bool>,
    /// Residual conjuncts over the combined `probe ++ build` row.
    pub other_conjuncts: Vec<Arc<dyn ScalarExpr>>,
    /// Column count of probe rows, for NULL padding.
    pub probe_row_width: usize,
    /// Column count of build rows, for NULL padding.
    pub build_row_width: usize,
    /// Non-zero seed for level-0 hashing.
    pub initial_seed: u32,
    /// Partition-selecting bits; fanout is `1 << num_partitioning_bits`.
    pub num_partitioning_bits: u32,
    /// Maximum repartitioning depth.
    pub max_partition_depth: usize,
    /// Quadratic (vs linear) probing for the hash tables.
    pub quadratic_probing: bool,
    /// Runtime filters to build from the level-0 build side.
    pub filters: Vec<FilterSpec>,
}

impl JoinConfig {
    /// Config with the standard tunables.
    pub fn new(
        operator_id: OperatorId,
        join_op: JoinOp,
        build_key_exprs: Vec<Arc<dyn ScalarExpr>>,
        probe_key_exprs: Vec<Arc<dyn ScalarExpr>>,
        probe_row_width: usize,
        build_row_width: usize,
    ) -> Self {
        let num_keys = build_key_exprs.len();
        Self {
            operator_id,
            join_op,
            build_key_exprs,
            probe_key_exprs,
            finds_nulls: vec![false; num_keys],
            other_conjuncts: Vec::new(),
            probe_row_width,
            build_row_width,
            initial_seed: 1,
            num_partitioning_bits: 4,
            max_partition_depth: crate::hash::MAX_PARTITION_DEPTH,
            quadratic_probing: true,
            filters: Vec::new(),
        }
    }
}

struct JoinPartition {
    level: usize,
    hash_tbl: Option<HashTable>,
    build_spool: RowSpool<TupleRow>,
    probe_spool: RowSpool<TupleRow>,
    is_spilled: bool,
    is_closed: bool,
}

impl JoinPartition {
    fn estimated_in_mem_size(&self) -> usize {
        self.build_spool.byte_size() + HashTable::estimate_byte_size(self.build_spool.num_rows())
    }
}

enum BuildTableResult {
    Built,
    OutOfMemory,
}

fn partition_index(hash: u32, bits: u32) -> usize {
    ((hash >> (32 - bits)) & ((1u32 << bits) - 1)) as usize
}

fn combine(probe: &TupleRow, build: &TupleRow) -> TupleRow {
    probe.iter().chain(build.iter()).cloned().collect()
}

/// Hash-partitioned equi-join operator.
pub struct EquiJoin {
    cfg: JoinConfig,
    state: Arc<RuntimeState>,
    tracker: Arc<MemTracker>,
    metrics: OperatorMetrics,
    ctx: HashContext,
    hash_partitions: Vec<JoinPartition>,
    spilled_partitions: VecDeque<JoinPartition>,
    null_aware_partition: Option<JoinPartition>,
    null_probe_spool: Option<RowSpool<TupleRow>>,
    matched_null_probe: Vec<bool>,
    filter_bank: Option<Arc<FilterBank>>,
    local_filters: Vec<BloomFilter>,
    closed: bool,
}

impl EquiJoin {
    /// Construct a join. Partitions are created when `run` starts.
    pub fn new(
        cfg: JoinConfig,
        state: Arc<RuntimeState>,
        tracker: Arc<MemTracker>,
        registry: &MetricsRegistry,
        filter_bank: Option<Arc<FilterBank>>,
    ) -> Result<Self> {
        if cfg.num_partitioning_bits == 0 || cfg.num_partitioning_bits > 16 {
            return Err(RiffleError::Execution(format!(
                "join {}: num_partitioning_bits must be in 1..=16",
                cfg.operator_id
            )));
        }
        if cfg.join_op == JoinOp::NullAwareLeftAnti && cfg.build_key_exprs.len() != 1 {
            return Err(RiffleError::Unsupported(format!(
                "join {}: null-aware anti join requires exactly one key",
                cfg.operator_id
            )));
        }
        if cfg.join_op == JoinOp::NullAwareLeftAnti && !cfg.filters.is_empty() {
            return Err(RiffleError::Unsupported(format!(
                "join {}: runtime filters are not supported with null-aware anti join",
                cfg.operator_id
            )));
        }
        let metrics = registry.operator(&format!("join-{}", cfg.operator_id));
        let stores_nulls = cfg.join_op.stores_nulls(&cfg.finds_nulls);
        let ctx = HashContext::new(
            cfg.build_key_exprs.clone(),
            cfg.probe_key_exprs.clone(),
            stores_nulls,
            if stores_nulls {
                cfg.finds_nulls.clone()
            } else {
                vec![false; cfg.finds_nulls.len()]
            },
            cfg.initial_seed,
            cfg.max_partition_depth,
            state.batch_size(),
            Arc::clone(&tracker),
        )?;
        Ok(Self {
            cfg,
            state,
            tracker,
            metrics,
            ctx,
            hash_partitions: Vec::new(),
            spilled_partitions: VecDeque::new(),
            null_aware_partition: None,
            null_probe_spool: None,
            matched_null_probe: Vec::new(),
            filter_bank,
            local_filters: Vec::new(),
            closed: false,
        })
    }

    /// Operator metric handles (readable after close).
    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn fanout(&self) -> usize {
        1usize << self.cfg.num_partitioning_bits
    }

    /// Drive the build child to end of stream, then the probe child, and
    /// return the joined output.
    pub fn run(
        &mut self,
        build_child: &mut dyn RowSource,
        probe_child: &mut dyn RowSource,
    ) -> Result<Vec<TupleRow>> {
        let _span = tracing::info_span!(
            "equi_join",
            operator_id = %self.cfg.operator_id,
            join_op = ?self.cfg.join_op
        )
        .entered();
        let result = self.run_inner(build_child, probe_child);
        self.close();
        result
    }

    fn run_inner(
        &mut self,
        build_child: &mut dyn RowSource,
        probe_child: &mut dyn RowSource,
    ) -> Result<Vec<TupleRow>> {
        if self.cfg.join_op == JoinOp::NullAwareLeftAnti {
            self.null_aware_partition = Some(self.new_partition(0, "na")?);
            self.null_probe_spool = Some(self.new_spool(0, "na-nullprobe")?);
        }

        // PartitioningBuild.
        self.process_build_source(BuildSource::Child(build_child), 0)?;

        // ProcessingProbe.
        let mut out = Vec::new();
        let batch_size = self.state.batch_size();
        let mut batch = Vec::new();
        loop {
            self.state.check_cancelled()?;
            let eos = probe_child.get_next(batch_size, &mut batch)?;
            self.process_probe_batch(&batch, &mut out)?;
            if eos {
                break;
            }
        }
        self.clean_up_hash_partitions(&mut out)?;

        // ProbingSpilled / Repartitioning.
        while let Some(part) = self.spilled_partitions.pop_front() {
            self.state.check_cancelled()?;
            self.process_spilled_partition(part, &mut out)?;
        }

        if self.cfg.join_op == JoinOp::NullAwareLeftAnti {
            self.output_null_aware(&mut out)?;
        }
        Ok(out)
    }

    // ---- partition plumbing -------------------------------------------

    fn new_spool(&self, level: usize, suffix: &str) -> Result<RowSpool<TupleRow>> {
        RowSpool::new(
            format!("join{}-l{level}-{suffix}", self.cfg.operator_id),
            Arc::clone(&self.tracker),
            &self.state.config.spill_dir,
            self.state.config.io_block_bytes,
        )
        .map_err(|e| {
            if e.is_recoverable_oom() {
                RiffleError::MemoryLimitTooLow(format!(
                    "join {}: partition stream reservation failed ({e})",
                    self.cfg.operator_id
                ))
            } else {
                e
            }
        })
    }

    fn new_partition(&self, level: usize, tag: &str) -> Result<JoinPartition> {
        Ok(JoinPartition {
            level,
            hash_tbl: None,
            build_spool: self.new_spool(level, &format!("{tag}-build"))?,
            probe_spool: self.new_spool(level, &format!("{tag}-probe"))?,
            is_spilled: false,
            is_closed: false,
        })
    }

    fn create_join_partitions(&mut self, level: usize) -> Result<()> {
        if level >= self.cfg.max_partition_depth {
            return Err(RiffleError::MaxPartitionDepth(format!(
                "join {}: partition depth {} reached",
                self.cfg.operator_id, level
            )));
        }
        debug_assert!(self.hash_partitions.is_empty());
        self.ctx.set_level(level)?;
        for i in 0..self.fanout() {
            let part = self.new_partition(level, &format!("p{i}"))?;
            self.hash_partitions.push(part);
        }
        self.metrics.partitions_created.inc_by(self.fanout() as u64);
        OperatorMetrics::set_highwater(&self.metrics.max_partition_level, level as i64);
        Ok(())
    }

    fn spill_join_partition(&mut self) -> Result<()> {
        let mut victim = None;
        let mut max_mem = 0usize;
        for (i, part) in self.hash_partitions.iter().enumerate() {
            if part.is_closed || part.is_spilled {
                continue;
            }
            // A table that already recorded probe matches cannot be evicted
            // without losing the match bits.
            if part.hash_tbl.as_ref().is_some_and(HashTable::has_matches) {
                continue;
            }
            let mem = part.build_spool.bytes_in_mem()
                + part.probe_spool.bytes_in_mem()
                + part.hash_tbl.as_ref().map_or(0, HashTable::byte_size);
            if mem > max_mem || victim.is_none() {
                max_mem = mem;
                victim = Some(i);
            }
        }
        let Some(idx) = victim else {
            return Err(RiffleError::MemoryLimitTooLow(format!(
                "join {}: no resident partition left to spill",
                self.cfg.operator_id
            )));
        };
        let metrics = self.metrics.clone();
        let part = &mut self.hash_partitions[idx];
        debug!(
            partition = idx,
            level = part.level,
            build_rows = part.build_spool.num_rows(),
            "spilling join partition"
        );
        if let Some(mut ht) = part.hash_tbl.take() {
            fold_hash_table_stats(&metrics, &ht);
            ht.close();
        }
        part.build_spool.unpin(false)?;
        part.probe_spool.unpin(false)?;
        part.is_spilled = true;
        metrics.spilled_partitions.inc();
        Ok(())
    }

    fn close_partition_with(metrics: &OperatorMetrics, part: &mut JoinPartition) {
        if part.is_closed {
            return;
        }
        part.is_closed = true;
        if let Some(mut ht) = part.hash_tbl.take() {
            fold_hash_table_stats(metrics, &ht);
            ht.close();
        }
        part.build_spool.close();
        part.probe_spool.close();
    }

    fn close_partition(&mut self, part: &mut JoinPartition) {
        Self::close_partition_with(&self.metrics, part);
    }

    // ---- build phase ---------------------------------------------------

    fn process_build_source(&mut self, source: BuildSource<'_, '_>, level: usize) -> Result<()> {
        self.create_join_partitions(level)?;
        if level == 0 {
            self.allocate_runtime_filters();
        }

        let batch_size = self.state.batch_size();
        let mut total_rows = 0u64;
        let mut batch = Vec::new();
        match source {
            BuildSource::Child(child) => loop {
                self.state.check_cancelled()?;
                let eos = child.get_next(batch_size, &mut batch)?;
                total_rows += batch.len() as u64;
                self.partition_build_batch(&batch, level)?;
                if eos {
                    break;
                }
            },
            BuildSource::Spilled(spool) => {
                let mut reader = spool.read().map_err(|e| self.no_read_buffer(e))?;
                loop {
                    self.state.check_cancelled()?;
                    let eos = reader.next_batch(batch_size, &mut batch)?;
                    total_rows += batch.len() as u64;
                    self.partition_build_batch(&batch, level)?;
                    if eos {
                        break;
                    }
                }
            }
        }

        self.metrics.build_rows_partitioned.inc_by(total_rows);
        for (i, part) in self.hash_partitions.iter().enumerate() {
            if total_rows > 0 {
                let percent = (part.build_spool.num_rows() * 100 / total_rows) as i64;
                OperatorMetrics::set_highwater(&self.metrics.largest_partition_percent, percent);
            }
            debug!(
                partition = i,
                level,
                spilled = part.is_spilled,
                build_rows = part.build_spool.num_rows(),
                "partitioned build input"
            );
        }
        if level == 0 {
            self.publish_runtime_filters(total_rows);
        }
        self.build_hash_tables()
    }

    fn no_read_buffer(&self, e: RiffleError) -> RiffleError {
        if e.is_recoverable_oom() {
            RiffleError::MemoryLimitTooLow(format!(
                "join {}: failed to acquire a read buffer for a spilled stream ({e})",
                self.cfg.operator_id
            ))
        } else {
            e
        }
    }

    fn partition_build_batch(&mut self, rows: &[TupleRow], level: usize) -> Result<()> {
        let cap = self.ctx.cache().capacity();
        for chunk in rows.chunks(cap) {
            {
                let ctx = &mut self.ctx;
                ctx.cache_mut().reset();
                for row in chunk {
                    ctx.eval_row(row, KeySide::Build)?;
                    if !ctx.cache().row_skipped() {
                        let hash = ctx.hash_current_row();
                        ctx.cache_mut().set_cur_hash(hash);
                    }
                    ctx.cache_mut().advance();
                }
                ctx.cache_mut().reset_for_read();
            }
            for row in chunk {
                let (skip, hash) = {
                    let cache = self.ctx.cache();
                    (cache.row_skipped(), cache.cur_hash())
                };
                if skip {
                    // NULL key the table cannot store: a null-aware anti join
                    // must still compare it against every probe row.
                    if self.cfg.join_op == JoinOp::NullAwareLeftAnti {
                        self.append_null_aware_build_row(row)?;
                    }
                } else {
                    if level == 0 {
                        for filter in &mut self.local_filters {
                            filter.insert(hash);
                        }
                    }
                    let p = partition_index(hash, self.cfg.num_partitioning_bits);
                    loop {
                        match self.hash_partitions[p].build_spool.add_row(row.clone()) {
                            Ok(_) => break,
                            Err(e) if e.is_recoverable_oom() => self.spill_join_partition()?,
                            Err(e) => return Err(e),
                        }
                    }
                }
                self.ctx.cache_mut().advance();
            }
        }
        Ok(())
    }

    fn append_null_aware_build_row(&mut self, row: &TupleRow) -> Result<()> {
        loop {
            let res = self
                .null_aware_partition
                .as_mut()
                .expect("null-aware partition")
                .build_spool
                .add_row(row.clone());
            match res {
                Ok(_) => return Ok(()),
                Err(e) if e.is_recoverable_oom() => {
                    self.spill_join_partition().map_err(|e| self.naaj_overflow("build", e))?
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn naaj_overflow(&self, side: &str, cause: RiffleError) -> RiffleError {
        match cause {
            RiffleError::MemoryLimitTooLow(_) => RiffleError::Unsupported(format!(
                "join {}: too many NULL keys on the {side} side for null-aware anti join",
                self.cfg.operator_id
            )),
            other => other,
        }
    }

    /// Build hash tables over every partition that survived partitioning
    /// resident. Partitions whose table cannot be built spill.
    fn build_hash_tables(&mut self) -> Result<()> {
        for p in 0..self.hash_partitions.len() {
            if self.hash_partitions[p].is_closed {
                continue;
            }
            if self.hash_partitions[p].build_spool.num_rows() == 0 {
                // Empty build side: probe rows routed here can never match.
                Self::close_partition_with(&self.metrics, &mut self.hash_partitions[p]);
                continue;
            }
            if self.hash_partitions[p].is_spilled {
                continue;
            }
            match self.build_table_for_partition_at(p)? {
                BuildTableResult::Built => {}
                BuildTableResult::OutOfMemory => self.spill_partition_index(p)?,
            }
        }
        Ok(())
    }

    fn spill_partition_index(&mut self, idx: usize) -> Result<()> {
        let metrics = self.metrics.clone();
        let part = &mut self.hash_partitions[idx];
        if let Some(mut ht) = part.hash_tbl.take() {
            fold_hash_table_stats(&metrics, &ht);
            ht.close();
        }
        part.build_spool.unpin(false)?;
        part.probe_spool.unpin(false)?;
        part.is_spilled = true;
        metrics.spilled_partitions.inc();
        Ok(())
    }

    fn build_table_for_partition_at(&mut self, p: usize) -> Result<BuildTableResult> {
        let ctx = &mut self.ctx;
        let cfg = &self.cfg;
        let tracker = &self.tracker;
        let io_block = self.state.config.io_block_bytes;
        let part = &mut self.hash_partitions[p];
        Self::build_table_for(ctx, cfg, tracker, io_block, &self.metrics, part)
    }

    /// Insert every build row of `part` into a fresh hash table. Returns
    /// `OutOfMemory` (leaving the partition table-less) when any reservation
    /// is denied or the table cannot grow further.
    fn build_table_for(
        ctx: &mut HashContext,
        cfg: &JoinConfig,
        tracker: &Arc<MemTracker>,
        io_block_bytes: usize,
        metrics: &OperatorMetrics,
        part: &mut JoinPartition,
    ) -> Result<BuildTableResult> {
        debug_assert!(part.hash_tbl.is_none());
        let num_rows = part.build_spool.num_rows();
        let mut ht = match HashTable::try_new(
            Arc::clone(tracker),
            cfg.quadratic_probing,
            true,
            1usize << (32 - cfg.num_partitioning_bits),
            HashTable::estimate_num_buckets(num_rows),
            io_block_bytes,
        ) {
            Ok(ht) => ht,
            Err(e) if e.is_recoverable_oom() => return Ok(BuildTableResult::OutOfMemory),
            Err(e) => return Err(e),
        };

        let build_spool = &part.build_spool;
        let entries: Vec<_> = build_spool.pinned_rows().collect();
        debug_assert_eq!(entries.len() as u64, num_rows);
        let cap = ctx.cache().capacity();
        for chunk in entries.chunks(cap) {
            ctx.cache_mut().reset();
            for (_, row) in chunk {
                ctx.eval_row(row, KeySide::Build)?;
                debug_assert!(!ctx.cache().row_skipped());
                let hash = ctx.hash_current_row();
                ctx.cache_mut().set_cur_hash(hash);
                ctx.cache_mut().advance();
            }
            ctx.cache_mut().reset_for_read();
            for (slot, _) in chunk {
                let hash = ctx.cache().cur_hash();
                loop {
                    let ctx_ref = &*ctx;
                    // Build rows with equal keys must land in one duplicate
                    // chain, NULLs included.
                    let outcome = ht.insert(hash, *slot, |s| {
                        ctx_ref.equals(build_spool.row(s)?, true)
                    });
                    match outcome {
                        Ok(InsertOutcome::Inserted) => break,
                        Ok(InsertOutcome::NeedsResize) => {
                            if !ht.check_and_resize(1)? {
                                fold_hash_table_stats(metrics, &ht);
                                ht.close();
                                return Ok(BuildTableResult::OutOfMemory);
                            }
                        }
                        Err(e) if e.is_recoverable_oom() => {
                            fold_hash_table_stats(metrics, &ht);
                            ht.close();
                            return Ok(BuildTableResult::OutOfMemory);
                        }
                        Err(e) => return Err(e),
                    }
                }
                ctx.cache_mut().advance();
            }
        }
        metrics.hash_buckets.inc_by(ht.num_buckets() as u64);
        part.hash_tbl = Some(ht);
        part.is_spilled = false;
        Ok(BuildTableResult::Built)
    }

    // ---- runtime filters ----------------------------------------------

    fn allocate_runtime_filters(&mut self) {
        self.local_filters.clear();
        if self.state.runtime_filter_mode == RuntimeFilterMode::Off {
            return;
        }
        let Some(bank) = &self.filter_bank else { return };
        for spec in &self.cfg.filters {
            self.local_filters.push(bank.allocate_scratch(*spec));
        }
    }

    fn publish_runtime_filters(&mut self, total_build_rows: u64) {
        let Some(bank) = &self.filter_bank else { return };
        for (spec, mut filter) in self.cfg.filters.iter().zip(self.local_filters.drain(..)) {
            // A filter too small for the observed build cardinality would
            // pass almost everything; publish it disabled instead.
            if fp_rate_too_high(filter.num_bits(), total_build_rows) {
                filter.set_always_true();
            }
            bank.publish(spec.filter_id, filter);
        }
    }

    // ---- probe phase ---------------------------------------------------

    fn process_probe_batch(&mut self, rows: &[TupleRow], out: &mut Vec<TupleRow>) -> Result<()> {
        let cap = self.ctx.cache().capacity();
        for chunk in rows.chunks(cap) {
            {
                let ctx = &mut self.ctx;
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
            }
            for row in chunk {
                let (skip, hash) = {
                    let cache = self.ctx.cache();
                    (cache.row_skipped(), cache.cur_hash())
                };
                if skip {
                    self.handle_unmatchable_probe_row(row, out)?;
                } else {
                    let p = partition_index(hash, self.cfg.num_partitioning_bits);
                    if self.hash_partitions[p].is_closed {
                        // Empty build partition: no match possible.
                        self.handle_no_match(row, out)?;
                    } else if self.hash_partitions[p].is_spilled {
                        loop {
                            match self.hash_partitions[p].probe_spool.add_row(row.clone()) {
                                Ok(_) => break,
                                Err(e) if e.is_recoverable_oom() => self.spill_join_partition()?,
                                Err(e) => return Err(e),
                            }
                        }
                    } else {
                        let matched = {
                            let ctx = &self.ctx;
                            let part = &mut self.hash_partitions[p];
                            Self::probe_partition_row(&self.cfg, ctx, part, hash, row, out)?
                        };
                        if !matched {
                            self.handle_no_match(row, out)?;
                        }
                    }
                }
                self.ctx.cache_mut().advance();
            }
        }
        Ok(())
    }

    /// Probe `part` with the cache's current row, emitting matches per the
    /// join op. Returns whether any match passed the residual conjuncts.
    fn probe_partition_row(
        cfg: &JoinConfig,
        ctx: &HashContext,
        part: &mut JoinPartition,
        hash: u32,
        row: &TupleRow,
        out: &mut Vec<TupleRow>,
    ) -> Result<bool> {
        let ht = part.hash_tbl.as_mut().expect("resident partition");
        let build_spool = &part.build_spool;
        let hit = ht.probe(hash, |slot| ctx.equals(build_spool.row(slot)?, false))?;
        let Some(mut it) = hit else {
            return Ok(false);
        };

        let mut matched_any = false;
        loop {
            let build = build_spool.row(ht.iter_slot(&it))?;
            let passes = if cfg.other_conjuncts.is_empty() {
                true
            } else {
                let joined = combine(row, build);
                eval_conjuncts(&cfg.other_conjuncts, &joined)?
            };
            if passes {
                matched_any = true;
                match cfg.join_op {
                    JoinOp::Inner | JoinOp::LeftOuter => out.push(combine(row, build)),
                    JoinOp::RightOuter | JoinOp::FullOuter => {
                        out.push(combine(row, build));
                        ht.iter_set_matched(&it);
                    }
                    JoinOp::LeftSemi => {
                        out.push(row.clone());
                        return Ok(true);
                    }
                    JoinOp::LeftAnti | JoinOp::NullAwareLeftAnti => {
                        // A single passing match suppresses the probe row.
                        return Ok(true);
                    }
                    JoinOp::RightSemi => {
                        if !ht.iter_is_matched(&it) {
                            out.push(build.clone());
                            ht.iter_set_matched(&it);
                        }
                    }
                    JoinOp::RightAnti => ht.iter_set_matched(&it),
                }
            }
            if !ht.iter_next_duplicate(&mut it) {
                break;
            }
        }
        Ok(matched_any)
    }

    /// A probe row that found no passing match in a resident partition.
    fn handle_no_match(&mut self, row: &TupleRow, out: &mut Vec<TupleRow>) -> Result<()> {
        match self.cfg.join_op {
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                out.push(combine(row, &null_row(self.cfg.build_row_width)))
            }
            JoinOp::LeftAnti => out.push(row.clone()),
            JoinOp::NullAwareLeftAnti => {
                // Cannot emit yet: NULL-keyed build rows may still match.
                self.append_null_aware_probe_row(row)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn append_null_aware_probe_row(&mut self, row: &TupleRow) -> Result<()> {
        loop {
            let res = self
                .null_aware_partition
                .as_mut()
                .expect("null-aware partition")
                .probe_spool
                .add_row(row.clone());
            match res {
                Ok(_) => return Ok(()),
                Err(e) if e.is_recoverable_oom() => {
                    self.spill_join_partition().map_err(|e| self.naaj_overflow("probe", e))?
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A probe row whose key contains a NULL that can never match.
    fn handle_unmatchable_probe_row(
        &mut self,
        row: &TupleRow,
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        match self.cfg.join_op {
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                out.push(combine(row, &null_row(self.cfg.build_row_width)))
            }
            JoinOp::LeftAnti => out.push(row.clone()),
            JoinOp::NullAwareLeftAnti => {
                loop {
                    let res = self
                        .null_probe_spool
                        .as_mut()
                        .expect("null probe stream")
                        .add_row(row.clone());
                    match res {
                        Ok(_) => break,
                        Err(e) if e.is_recoverable_oom() => self
                            .spill_join_partition()
                            .map_err(|e| self.naaj_overflow("probe", e))?,
                        Err(e) => return Err(e),
                    }
                }
                self.matched_null_probe.push(false);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- end of probe / spilled partitions ----------------------------

    fn clean_up_hash_partitions(&mut self, out: &mut Vec<TupleRow>) -> Result<()> {
        let parts = std::mem::take(&mut self.hash_partitions);
        for mut part in parts {
            if part.is_closed {
                continue;
            }
            if part.is_spilled {
                part.build_spool.unpin(true)?;
                part.probe_spool.unpin(true)?;
                // Depth first: finer-partitioned data is processed first so
                // spill blocks are released earlier.
                self.spilled_partitions.push_front(part);
            } else {
                self.finish_resident_partition(&mut part, out)?;
            }
        }
        Ok(())
    }

    fn finish_resident_partition(
        &mut self,
        part: &mut JoinPartition,
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        if self.cfg.join_op.emits_unmatched_build() {
            self.output_unmatched_build(part, out)?;
        }
        if self.cfg.join_op == JoinOp::NullAwareLeftAnti {
            self.evaluate_null_probe(part)?;
        }
        self.close_partition(part);
        Ok(())
    }

    fn output_unmatched_build(
        &mut self,
        part: &mut JoinPartition,
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        let Some(ht) = part.hash_tbl.as_ref() else {
            return Ok(());
        };
        let nulls = null_row(self.cfg.probe_row_width);
        let mut it = ht.first_unmatched();
        while ht.iter_valid(&it) {
            let build = part.build_spool.row(ht.iter_slot(&it))?;
            if self.cfg.join_op == JoinOp::RightAnti {
                out.push(build.clone());
            } else {
                out.push(combine(&nulls, build));
            }
            ht.iter_next_unmatched(&mut it);
        }
        Ok(())
    }

    /// Pairwise-match the collected NULL-keyed probe rows against `part`'s
    /// build rows, recording matches. O(nulls x build).
    fn evaluate_null_probe(&mut self, part: &JoinPartition) -> Result<()> {
        let Some(null_probe) = self.null_probe_spool.as_ref() else {
            return Ok(());
        };
        if null_probe.num_rows() == 0 || part.build_spool.num_rows() == 0 {
            return Ok(());
        }
        let build_rows = Self::collect_rows(&part.build_spool)
            .map_err(|e| self.naaj_overflow("build", e))?;
        let probe_rows =
            Self::collect_rows(null_probe).map_err(|e| self.naaj_overflow("probe", e))?;
        debug_assert_eq!(probe_rows.len(), self.matched_null_probe.len());
        for (i, probe) in probe_rows.iter().enumerate() {
            if self.matched_null_probe[i] {
                continue;
            }
            for build in &build_rows {
                let joined = combine(probe, build);
                if eval_conjuncts(&self.cfg.other_conjuncts, &joined)? {
                    self.matched_null_probe[i] = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn collect_rows(spool: &RowSpool<TupleRow>) -> Result<Vec<TupleRow>> {
        let mut reader = spool.read()?;
        let mut all = Vec::with_capacity(spool.num_rows() as usize);
        let mut batch = Vec::new();
        loop {
            let eos = reader.next_batch(4096, &mut batch)?;
            all.append(&mut batch);
            if eos {
                break;
            }
        }
        Ok(all)
    }

    fn process_spilled_partition(
        &mut self,
        mut part: JoinPartition,
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        self.ctx.set_level(part.level)?;
        self.metrics
            .probe_rows_partitioned
            .inc_by(part.probe_spool.num_rows());

        let mut built = false;
        if part.estimated_in_mem_size() <= self.tracker.spare_capacity()
            && part.build_spool.pin_all()?
        {
            let result = {
                let ctx = &mut self.ctx;
                Self::build_table_for(
                    ctx,
                    &self.cfg,
                    &self.tracker,
                    self.state.config.io_block_bytes,
                    &self.metrics,
                    &mut part,
                )?
            };
            match result {
                BuildTableResult::Built => built = true,
                BuildTableResult::OutOfMemory => part.build_spool.unpin(false)?,
            }
        }

        if built {
            // The partition fits: drain its probe spool against the single
            // table, then finish it like any resident partition.
            debug!(
                level = part.level,
                build_rows = part.build_spool.num_rows(),
                probe_rows = part.probe_spool.num_rows(),
                "probing spilled partition in memory"
            );
            self.probe_single_partition(&mut part, out)?;
            self.finish_resident_partition(&mut part, out)?;
            return Ok(());
        }

        // Repartitioning.
        self.metrics.num_repartitions.inc();
        let build_input_rows = part.build_spool.num_rows();
        debug!(
            level = part.level + 1,
            rows = build_input_rows,
            "repartitioning spilled join partition"
        );
        {
            let (build_spool, _probe_spool) = (&part.build_spool, &part.probe_spool);
            self.process_build_source(BuildSource::Spilled(build_spool), part.level + 1)?;
        }

        let largest_child = self
            .hash_partitions
            .iter()
            .filter(|p| p.is_spilled && !p.is_closed)
            .map(|p| p.build_spool.num_rows())
            .max()
            .unwrap_or(0);
        if largest_child >= build_input_rows {
            return Err(RiffleError::RepartitionIneffective(format!(
                "join {}: repartitioning to level {} did not shrink a spilled partition of {} \
                 build rows",
                self.cfg.operator_id,
                part.level + 1,
                build_input_rows
            )));
        }

        {
            let reader = part
                .probe_spool
                .read()
                .map_err(|e| self.no_read_buffer(e))?;
            let mut reader = reader;
            let mut batch = Vec::new();
            loop {
                self.state.check_cancelled()?;
                let eos = reader.next_batch(self.state.batch_size(), &mut batch)?;
                self.process_probe_batch(&batch, out)?;
                if eos {
                    break;
                }
            }
        }
        self.close_partition(&mut part);
        self.clean_up_hash_partitions(out)
    }

    fn probe_single_partition(
        &mut self,
        part: &mut JoinPartition,
        out: &mut Vec<TupleRow>,
    ) -> Result<()> {
        let batch_size = self.state.batch_size();
        let cap = self.ctx.cache().capacity();
        let mut batch: Vec<TupleRow> = Vec::new();
        let mut pending: Vec<TupleRow> = Vec::new();
        {
            let reader = part
                .probe_spool
                .read()
                .map_err(|e| self.no_read_buffer(e))?;
            let mut reader = reader;
            loop {
                let eos = reader.next_batch(batch_size, &mut batch)?;
                pending.extend(batch.drain(..));
                if eos {
                    break;
                }
            }
        }
        for chunk in pending.chunks(cap) {
            self.state.check_cancelled()?;
            {
                let ctx = &mut self.ctx;
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
            }
            for row in chunk {
                let (skip, hash) = {
                    let cache = self.ctx.cache();
                    (cache.row_skipped(), cache.cur_hash())
                };
                if skip {
                    self.handle_unmatchable_probe_row(row, out)?;
                } else {
                    let matched =
                        Self::probe_partition_row(&self.cfg, &self.ctx, part, hash, row, out)?;
                    if !matched {
                        self.handle_no_match(row, out)?;
                    }
                }
                self.ctx.cache_mut().advance();
            }
        }
        Ok(())
    }

    // ---- null-aware anti join final phase ------------------------------

    fn output_null_aware(&mut self, out: &mut Vec<TupleRow>) -> Result<()> {
        let Some(mut na) = self.null_aware_partition.take() else {
            return Ok(());
        };

        // Unmatched probe rows must survive a pairwise check against the
        // NULL-keyed build rows before they count as anti matches.
        let build_rows = Self::collect_rows(&na.build_spool)
            .map_err(|e| self.naaj_overflow("build", e))?;
        let probe_rows = Self::collect_rows(&na.probe_spool)
            .map_err(|e| self.naaj_overflow("probe", e))?;
        for probe in &probe_rows {
            let mut matched = false;
            for build in &build_rows {
                let joined = combine(probe, build);
                if eval_conjuncts(&self.cfg.other_conjuncts, &joined)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                out.push(probe.clone());
            }
        }

        // NULL-keyed probe rows were compared against every resident build
        // partition already; the NULL-keyed build rows are the last side.
        self.evaluate_null_probe(&na)?;
        if let Some(null_probe) = self.null_probe_spool.as_ref() {
            if null_probe.num_rows() > 0 {
                let rows =
                    Self::collect_rows(null_probe).map_err(|e| self.naaj_overflow("probe", e))?;
                for (i, row) in rows.iter().enumerate() {
                    if !self.matched_null_probe[i] {
                        out.push(row.clone());
                    }
                }
            }
        }

        self.close_partition(&mut na);
        if let Some(spool) = self.null_probe_spool.as_mut() {
            spool.close();
        }
        Ok(())
    }

    // ---- teardown ------------------------------------------------------

    /// Release every partition and the hash context. Idempotent; statistics
    /// stay readable through [`Self::metrics`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut parts = std::mem::take(&mut self.hash_partitions);
        parts.extend(std::mem::take(&mut self.spilled_partitions));
        if let Some(na) = self.null_aware_partition.take() {
            parts.push(na);
        }
        for part in &mut parts {
            self.close_partition(part);
        }
        if let Some(spool) = self.null_probe_spool.as_mut() {
            spool.close();
        }
        self.ctx.close();
    }
}

impl Drop for EquiJoin {
    fn drop(&mut self) {
        self.close();
    }
}

enum BuildSource<'a, 'b> {
    Child(&'a mut dyn RowSource),
    Spilled(&'b RowSpool<TupleRow>),
}
