use std::collections::HashMap;
use std::sync::Arc;

use riffle_common::{OperatorId, RiffleError};
use riffle_execution::exec_node::MemorySource;
use riffle_execution::expressions::col;
use riffle_execution::join::{EquiJoin, JoinConfig, JoinOp};
use riffle_execution::value::{DataType, TupleRow};

#[path = "support/mod.rs"]
mod support;

fn int_key_config(id: u64, join_op: JoinOp, probe_width: usize, build_width: usize) -> JoinConfig {
    JoinConfig::new(
        OperatorId(id),
        join_op,
        vec![col(0, DataType::Int64)],
        vec![col(0, DataType::Int64)],
        probe_width,
        build_width,
    )
}

fn run_join(
    cfg: JoinConfig,
    budget_bytes: usize,
    build: Vec<TupleRow>,
    probe: Vec<TupleRow>,
) -> (Vec<TupleRow>, EquiJoin) {
    let spill_dir = support::unique_spill_dir("join");
    let state = support::runtime_state(1024, &spill_dir);
    let tracker = support::tracker(budget_bytes);
    let registry = support::registry();
    let mut join = EquiJoin::new(cfg, state, tracker, &registry, None).expect("join");
    let mut build_src = MemorySource::new(build);
    let mut probe_src = MemorySource::new(probe);
    let out = join.run(&mut build_src, &mut probe_src).expect("run");
    support::cleanup(&spill_dir);
    (out, join)
}

fn build_rows_small() -> Vec<TupleRow> {
    vec![
        vec![support::int(1), support::utf8("a")],
        vec![support::int(1), support::utf8("b")],
        vec![support::int(2), support::utf8("c")],
    ]
}

fn probe_rows_small() -> Vec<TupleRow> {
    vec![
        vec![support::int(1), support::utf8("x")],
        vec![support::int(3), support::utf8("y")],
    ]
}

#[test]
fn inner_join_emits_all_duplicate_matches() {
    let cfg = int_key_config(1, JoinOp::Inner, 2, 2);
    let (out, _) = run_join(cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("a")],
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("b")],
        ],
    );
}

#[test]
fn left_outer_join_pads_unmatched_probe_rows() {
    let cfg = int_key_config(2, JoinOp::LeftOuter, 2, 2);
    let build = vec![vec![support::int(1), support::utf8("a")]];
    let probe = vec![
        vec![support::int(1), support::utf8("x")],
        vec![support::int(2), support::utf8("y")],
    ];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("a")],
            vec![support::int(2), support::utf8("y"), support::null(), support::null()],
        ],
    );
}

#[test]
fn left_semi_and_anti_emit_probe_side_once() {
    let semi_cfg = int_key_config(3, JoinOp::LeftSemi, 2, 2);
    let (semi, _) = run_join(semi_cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(&semi, &[vec![support::int(1), support::utf8("x")]]);

    let anti_cfg = int_key_config(4, JoinOp::LeftAnti, 2, 2);
    let (anti, _) = run_join(anti_cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(&anti, &[vec![support::int(3), support::utf8("y")]]);
}

#[test]
fn right_outer_and_anti_emit_unmatched_build_rows() {
    let outer_cfg = int_key_config(5, JoinOp::RightOuter, 2, 2);
    let (outer, _) = run_join(outer_cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(
        &outer,
        &[
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("a")],
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("b")],
            vec![support::null(), support::null(), support::int(2), support::utf8("c")],
        ],
    );

    let anti_cfg = int_key_config(6, JoinOp::RightAnti, 2, 2);
    let (anti, _) = run_join(anti_cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(&anti, &[vec![support::int(2), support::utf8("c")]]);
}

#[test]
fn right_semi_emits_each_matched_build_row_once() {
    let cfg = int_key_config(7, JoinOp::RightSemi, 2, 2);
    let build = build_rows_small();
    let probe = vec![
        vec![support::int(1), support::utf8("x")],
        vec![support::int(1), support::utf8("z")],
    ];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::utf8("a")],
            vec![support::int(1), support::utf8("b")],
        ],
    );
}

#[test]
fn full_outer_join_pads_both_sides() {
    let cfg = int_key_config(8, JoinOp::FullOuter, 2, 2);
    let (out, _) = run_join(cfg, usize::MAX, build_rows_small(), probe_rows_small());
    support::assert_multiset_eq(
        &out,
        &[
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("a")],
            vec![support::int(1), support::utf8("x"), support::int(1), support::utf8("b")],
            vec![support::int(3), support::utf8("y"), support::null(), support::null()],
            vec![support::null(), support::null(), support::int(2), support::utf8("c")],
        ],
    );
}

#[test]
fn null_aware_anti_join_suppresses_null_probe_rows() {
    // Probe NULL cannot be proven a non-match against a non-empty build side.
    let cfg = int_key_config(9, JoinOp::NullAwareLeftAnti, 1, 1);
    let build = vec![vec![support::int(1)], vec![support::int(2)]];
    let probe = vec![
        vec![support::int(1)],
        vec![support::int(3)],
        vec![support::null()],
    ];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    support::assert_multiset_eq(&out, &[vec![support::int(3)]]);
}

#[test]
fn null_aware_anti_join_with_null_build_rows_suppresses_everything() {
    // x NOT IN (1, NULL) is never provably true.
    let cfg = int_key_config(10, JoinOp::NullAwareLeftAnti, 1, 1);
    let build = vec![vec![support::int(1)], vec![support::null()]];
    let probe = vec![vec![support::int(2)], vec![support::int(3)]];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    assert!(out.is_empty(), "unexpected rows: {out:?}");
}

#[test]
fn null_aware_anti_join_with_empty_build_emits_all_probe_rows() {
    let cfg = int_key_config(11, JoinOp::NullAwareLeftAnti, 1, 1);
    let probe = vec![vec![support::int(2)], vec![support::null()]];
    let (out, _) = run_join(cfg, usize::MAX, Vec::new(), probe);
    support::assert_multiset_eq(&out, &[vec![support::int(2)], vec![support::null()]]);
}

#[test]
fn null_keys_never_match_by_default() {
    let cfg = int_key_config(12, JoinOp::Inner, 2, 2);
    let build = vec![vec![support::null(), support::utf8("a")]];
    let probe = vec![vec![support::null(), support::utf8("x")]];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    assert!(out.is_empty());
}

#[test]
fn null_safe_equality_matches_null_keys() {
    let mut cfg = int_key_config(13, JoinOp::Inner, 2, 2);
    cfg.finds_nulls = vec![true];
    let build = vec![
        vec![support::null(), support::utf8("a")],
        vec![support::int(1), support::utf8("b")],
    ];
    let probe = vec![
        vec![support::null(), support::utf8("x")],
        vec![support::int(2), support::utf8("y")],
    ];
    let (out, _) = run_join(cfg, usize::MAX, build, probe);
    support::assert_multiset_eq(
        &out,
        &[vec![
            support::null(),
            support::utf8("x"),
            support::null(),
            support::utf8("a"),
        ]],
    );
}

#[test]
fn forced_spill_inner_join_matches_oracle() {
    // Two build rows per key under a budget that cannot hold the build side;
    // the output multiset must match the in-memory oracle regardless of how
    // partitions spilled.
    let num_keys = 30_000i64;
    let mut build = Vec::new();
    for k in 0..num_keys {
        build.push(vec![support::int(k), support::utf8("l")]);
        build.push(vec![support::int(k), support::utf8("r")]);
    }
    let probe: Vec<TupleRow> = (0..num_keys)
        .map(|k| vec![support::int(k), support::utf8("p")])
        .collect();

    let mut oracle_index: HashMap<i64, Vec<TupleRow>> = HashMap::new();
    for row in &build {
        if let riffle_execution::value::ScalarValue::Int64(k) = &row[0] {
            oracle_index.entry(*k).or_default().push(row.clone());
        }
    }
    let mut expected = Vec::new();
    for probe_row in &probe {
        if let riffle_execution::value::ScalarValue::Int64(k) = &probe_row[0] {
            for build_row in oracle_index.get(k).into_iter().flatten() {
                let mut joined = probe_row.clone();
                joined.extend(build_row.iter().cloned());
                expected.push(joined);
            }
        }
    }

    let cfg = int_key_config(14, JoinOp::Inner, 2, 2);
    let (out, join) = run_join(cfg, 4 * 1024 * 1024, build, probe);
    let metrics = join.metrics();
    assert!(
        metrics.spilled_partitions.get() >= 1,
        "a 4MiB budget must force at least one spill"
    );
    assert!(metrics.build_rows_partitioned.get() >= 2 * num_keys as u64);
    support::assert_multiset_eq(&out, &expected);
}

#[test]
fn forced_spill_left_outer_matches_no_spill_run() {
    let mut build = Vec::new();
    for k in 0..20_000i64 {
        if k % 3 != 0 {
            build.push(vec![support::int(k), support::utf8("b")]);
        }
    }
    let probe: Vec<TupleRow> = (0..20_000i64)
        .map(|k| vec![support::int(k), support::utf8("p")])
        .collect();

    let constrained_cfg = int_key_config(15, JoinOp::LeftOuter, 2, 2);
    let (constrained, join) = run_join(
        constrained_cfg,
        3 * 1024 * 1024,
        build.clone(),
        probe.clone(),
    );
    assert!(join.metrics().spilled_partitions.get() >= 1);

    let free_cfg = int_key_config(16, JoinOp::LeftOuter, 2, 2);
    let (unconstrained, _) = run_join(free_cfg, usize::MAX, build, probe);
    support::assert_multiset_eq(&constrained, &unconstrained);
}

#[test]
fn close_twice_is_a_no_op() {
    let spill_dir = support::unique_spill_dir("join_close");
    let state = support::runtime_state(64, &spill_dir);
    let tracker = support::tracker(usize::MAX);
    let registry = support::registry();
    let mut join = EquiJoin::new(
        int_key_config(17, JoinOp::Inner, 2, 2),
        state,
        Arc::clone(&tracker),
        &registry,
        None,
    )
    .expect("join");
    let mut build_src = MemorySource::new(build_rows_small());
    let mut probe_src = MemorySource::new(probe_rows_small());
    join.run(&mut build_src, &mut probe_src).expect("run");
    join.close();
    join.close();
    assert_eq!(tracker.consumption(), 0, "close must release every reservation");
    support::cleanup(&spill_dir);
}

#[test]
fn cancellation_surfaces_between_batches() {
    let spill_dir = support::unique_spill_dir("join_cancel");
    let state = support::runtime_state(64, &spill_dir);
    let tracker = support::tracker(usize::MAX);
    let registry = support::registry();
    let mut join = EquiJoin::new(
        int_key_config(18, JoinOp::Inner, 2, 2),
        Arc::clone(&state),
        tracker,
        &registry,
        None,
    )
    .expect("join");
    state.cancel();
    let mut build_src = MemorySource::new(build_rows_small());
    let mut probe_src = MemorySource::new(probe_rows_small());
    let err = join.run(&mut build_src, &mut probe_src).unwrap_err();
    assert!(matches!(err, RiffleError::Cancelled));
    support::cleanup(&spill_dir);
}
