#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use riffle_common::{EngineConfig, MemTracker, MetricsRegistry};
use riffle_execution::context::RuntimeState;
use riffle_execution::value::{ScalarValue, TupleRow};

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// A fresh spill directory under the system temp dir.
pub fn unique_spill_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "riffle_test_{}_{}_{}",
        tag,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Runtime state with the given batch size and spill dir; IO blocks are kept
/// small so tests exercise block sealing and spilling quickly.
pub fn runtime_state(batch_size_rows: usize, spill_dir: &std::path::Path) -> Arc<RuntimeState> {
    RuntimeState::new(EngineConfig {
        batch_size_rows,
        mem_budget_bytes: usize::MAX,
        spill_dir: spill_dir.to_string_lossy().into_owned(),
        io_block_bytes: 64 * 1024,
    })
}

/// Operator tracker with a hard byte budget.
pub fn tracker(budget_bytes: usize) -> Arc<MemTracker> {
    MemTracker::new("test-operator", budget_bytes)
}

pub fn registry() -> MetricsRegistry {
    MetricsRegistry::new()
}

pub fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(v)
}

pub fn utf8(v: &str) -> ScalarValue {
    ScalarValue::Utf8(v.to_string())
}

pub fn null() -> ScalarValue {
    ScalarValue::Null
}

/// Multiset view of a row collection.
pub fn multiset(rows: &[TupleRow]) -> HashMap<TupleRow, usize> {
    let mut counts = HashMap::new();
    for row in rows {
        *counts.entry(row.clone()).or_insert(0) += 1;
    }
    counts
}

/// Assert exact multiset equality with a readable diff on mismatch.
pub fn assert_multiset_eq(actual: &[TupleRow], expected: &[TupleRow]) {
    let actual_counts = multiset(actual);
    let expected_counts = multiset(expected);
    if actual_counts != expected_counts {
        let mut missing: Vec<_> = expected_counts
            .iter()
            .filter(|(row, n)| actual_counts.get(*row) != Some(n))
            .take(5)
            .collect();
        missing.sort_by_key(|(row, _)| format!("{row:?}"));
        let mut unexpected: Vec<_> = actual_counts
            .iter()
            .filter(|(row, n)| expected_counts.get(*row) != Some(n))
            .take(5)
            .collect();
        unexpected.sort_by_key(|(row, _)| format!("{row:?}"));
        panic!(
            "multiset mismatch: {} actual vs {} expected rows\nfirst missing: {missing:?}\nfirst unexpected: {unexpected:?}",
            actual.len(),
            expected.len(),
        );
    }
}

pub fn cleanup(dir: &std::path::Path) {
    let _ = std::fs::remove_dir_all(dir);
}
