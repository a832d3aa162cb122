use std::collections::HashMap;
use std::sync::Arc;

use riffle_common::{OperatorId, RiffleError};
use riffle_execution::aggregate::{AggExpr, AggSpec, AggregatorConfig, GroupAggregator};
use riffle_execution::exec_node::MemorySource;
use riffle_execution::expressions::col;
use riffle_execution::value::{DataType, ScalarValue, TupleRow};

#[path = "support/mod.rs"]
mod support;

fn sum_by_key_config(id: u64) -> AggregatorConfig {
    AggregatorConfig::new(
        OperatorId(id),
        vec![col(0, DataType::Int64)],
        vec![AggSpec {
            expr: AggExpr::Sum(col(1, DataType::Int64)),
            name: "sum_v".to_string(),
        }],
    )
}

fn run_aggregator(
    cfg: AggregatorConfig,
    budget_bytes: usize,
    rows: Vec<TupleRow>,
) -> (Vec<TupleRow>, GroupAggregator) {
    let spill_dir = support::unique_spill_dir("agg");
    let state = support::runtime_state(1024, &spill_dir);
    let tracker = support::tracker(budget_bytes);
    let registry = support::registry();
    let mut agg = GroupAggregator::new(cfg, state, tracker, &registry).expect("aggregator");
    let mut source = MemorySource::new(rows);
    let out = agg.run(&mut source).expect("run");
    support::cleanup(&spill_dir);
    (out, agg)
}

#[test]
fn grouped_sum_small_input_exact_multiset() {
    let rows = vec![
        vec![support::int(1), support::int(10)],
        vec![support::int(2), support::int(20)],
        vec![support::int(1), support::int(5)],
        vec![support::int(3), support::int(7)],
        vec![support::int(2), support::int(3)],
    ];
    let (out, _) = run_aggregator(sum_by_key_config(1), usize::MAX, rows);
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::int(15)],
            vec![support::int(2), support::int(23)],
            vec![support::int(3), support::int(7)],
        ],
    );
}

#[test]
fn forced_spill_output_matches_oracle() {
    // 100k distinct keys, two rows each, under a budget that holds a small
    // fraction of the groups. The output multiset must be identical to the
    // unconstrained oracle no matter how spilling was scheduled.
    let num_keys = 100_000i64;
    let mut rows = Vec::with_capacity(2 * num_keys as usize);
    let mut oracle: HashMap<i64, i64> = HashMap::new();
    for k in 0..num_keys {
        for v in [k % 97, 1] {
            rows.push(vec![support::int(k), support::int(v)]);
            *oracle.entry(k).or_insert(0) += v;
        }
    }
    let (out, agg) = run_aggregator(sum_by_key_config(2), 4 * 1024 * 1024, rows);

    assert_eq!(out.len(), num_keys as usize);
    let expected: Vec<TupleRow> = oracle
        .into_iter()
        .map(|(k, sum)| vec![support::int(k), support::int(sum)])
        .collect();
    support::assert_multiset_eq(&out, &expected);

    let metrics = agg.metrics();
    assert!(
        metrics.spilled_partitions.get() >= 1,
        "a 4MiB budget must force at least one spill"
    );
    assert!(metrics.partitions_created.get() >= 16);
}

#[test]
fn spill_and_no_spill_runs_agree() {
    let mut rows = Vec::new();
    for k in 0..40_000i64 {
        rows.push(vec![support::int(k), support::int(k % 13)]);
    }
    let (constrained, agg) = run_aggregator(sum_by_key_config(3), 3 * 1024 * 1024, rows.clone());
    let (unconstrained, _) = run_aggregator(sum_by_key_config(4), usize::MAX, rows);
    assert!(agg.metrics().spilled_partitions.get() >= 1);
    support::assert_multiset_eq(&constrained, &unconstrained);
}

#[test]
fn null_keys_form_their_own_group() {
    let rows = vec![
        vec![support::int(1), support::int(10)],
        vec![support::null(), support::int(4)],
        vec![support::null(), support::int(6)],
    ];
    let (out, _) = run_aggregator(sum_by_key_config(5), usize::MAX, rows);
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::int(10)],
            vec![support::null(), support::int(10)],
        ],
    );
}

#[test]
fn null_keys_are_skipped_when_not_stored() {
    let mut cfg = sum_by_key_config(6);
    cfg.stores_null_keys = false;
    let rows = vec![
        vec![support::int(1), support::int(10)],
        vec![support::null(), support::int(4)],
    ];
    let (out, _) = run_aggregator(cfg, usize::MAX, rows);
    support::assert_multiset_eq(&out, &[vec![support::int(1), support::int(10)]]);
}

#[test]
fn all_aggregate_functions_over_groups() {
    let cfg = AggregatorConfig::new(
        OperatorId(7),
        vec![col(0, DataType::Utf8)],
        vec![
            AggSpec { expr: AggExpr::Count(col(1, DataType::Int64)), name: "cnt".into() },
            AggSpec { expr: AggExpr::Sum(col(1, DataType::Int64)), name: "sum".into() },
            AggSpec { expr: AggExpr::Min(col(1, DataType::Int64)), name: "min".into() },
            AggSpec { expr: AggExpr::Max(col(1, DataType::Int64)), name: "max".into() },
            AggSpec { expr: AggExpr::Avg(col(1, DataType::Int64)), name: "avg".into() },
        ],
    );
    let rows = vec![
        vec![support::utf8("a"), support::int(3)],
        vec![support::utf8("a"), support::int(-1)],
        vec![support::utf8("a"), support::null()],
        vec![support::utf8("b"), support::int(8)],
    ];
    let (out, _) = run_aggregator(cfg, usize::MAX, rows);
    support::assert_multiset_eq(
        &out,
        &[
            vec![
                support::utf8("a"),
                support::int(2),
                support::int(2),
                support::int(-1),
                support::int(3),
                ScalarValue::float64(1.0),
            ],
            vec![
                support::utf8("b"),
                support::int(1),
                support::int(8),
                support::int(8),
                support::int(8),
                ScalarValue::float64(8.0),
            ],
        ],
    );
}

#[test]
fn string_keys_survive_spill() {
    let mut rows = Vec::new();
    let mut oracle: HashMap<String, i64> = HashMap::new();
    for k in 0..60_000i64 {
        let key = format!("group_key_{:06}", k % 30_000);
        rows.push(vec![support::utf8(&key), support::int(k)]);
        *oracle.entry(key).or_insert(0) += k;
    }
    let cfg = AggregatorConfig::new(
        OperatorId(8),
        vec![col(0, DataType::Utf8)],
        vec![AggSpec {
            expr: AggExpr::Sum(col(1, DataType::Int64)),
            name: "sum_v".to_string(),
        }],
    );
    let (out, agg) = run_aggregator(cfg, 3 * 1024 * 1024, rows);
    assert!(agg.metrics().spilled_partitions.get() >= 1);
    let expected: Vec<TupleRow> = oracle
        .into_iter()
        .map(|(k, sum)| vec![support::utf8(&k), support::int(sum)])
        .collect();
    support::assert_multiset_eq(&out, &expected);
}

#[test]
fn ungrouped_aggregate_emits_one_row_even_for_empty_input() {
    let cfg = AggregatorConfig::new(
        OperatorId(9),
        Vec::new(),
        vec![
            AggSpec { expr: AggExpr::Count(col(0, DataType::Int64)), name: "cnt".into() },
            AggSpec { expr: AggExpr::Sum(col(0, DataType::Int64)), name: "sum".into() },
        ],
    );
    let (out, _) = run_aggregator(cfg, usize::MAX, Vec::new());
    assert_eq!(out, vec![vec![support::int(0), support::int(0)]]);
}

#[test]
fn serialize_mode_emits_avg_as_sum_and_count() {
    let mut cfg = AggregatorConfig::new(
        OperatorId(10),
        vec![col(0, DataType::Int64)],
        vec![AggSpec {
            expr: AggExpr::Avg(col(1, DataType::Int64)),
            name: "avg".into(),
        }],
    );
    cfg.needs_finalize = false;
    assert!(cfg.needs_serialize);
    let rows = vec![
        vec![support::int(1), support::int(4)],
        vec![support::int(1), support::int(8)],
    ];
    let (out, _) = run_aggregator(cfg, usize::MAX, rows);
    support::assert_multiset_eq(
        &out,
        &[vec![
            support::int(1),
            ScalarValue::float64(12.0),
            support::int(2),
        ]],
    );
}

#[test]
fn close_twice_is_a_no_op() {
    let spill_dir = support::unique_spill_dir("agg_close");
    let state = support::runtime_state(64, &spill_dir);
    let tracker = support::tracker(usize::MAX);
    let registry = support::registry();
    let mut agg =
        GroupAggregator::new(sum_by_key_config(11), state, Arc::clone(&tracker), &registry)
            .expect("aggregator");
    let mut source = MemorySource::new(vec![vec![support::int(1), support::int(1)]]);
    agg.run(&mut source).expect("run");
    agg.close();
    agg.close();
    assert_eq!(tracker.consumption(), 0, "close must release every reservation");
    support::cleanup(&spill_dir);
}

#[test]
fn cancellation_surfaces_between_batches() {
    let spill_dir = support::unique_spill_dir("agg_cancel");
    let state = support::runtime_state(64, &spill_dir);
    let tracker = support::tracker(usize::MAX);
    let registry = support::registry();
    let mut agg =
        GroupAggregator::new(sum_by_key_config(12), Arc::clone(&state), tracker, &registry)
            .expect("aggregator");
    state.cancel();
    let mut source = MemorySource::new(vec![vec![support::int(1), support::int(1)]]);
    let err = agg.run(&mut source).unwrap_err();
    assert!(matches!(err, RiffleError::Cancelled));
    support::cleanup(&spill_dir);
}

#[test]
fn tiny_budget_fails_with_memory_limit_too_low() {
    let spill_dir = support::unique_spill_dir("agg_tiny");
    let state = support::runtime_state(64, &spill_dir);
    let tracker = support::tracker(96 * 1024);
    let registry = support::registry();
    let mut agg = GroupAggregator::new(sum_by_key_config(13), state, tracker, &registry)
        .expect("aggregator");
    let rows: Vec<TupleRow> = (0..100)
        .map(|i| vec![support::int(i), support::int(1)])
        .collect();
    let mut source = MemorySource::new(rows);
    let err = agg.run(&mut source).unwrap_err();
    assert!(matches!(err, RiffleError::MemoryLimitTooLow(_)), "got {err:?}");
    support::cleanup(&spill_dir);
}
