//! Engine tests: chain traversal, removal, groups, deferral, ordering, throttling, failures,
//! cancellation and chained hosts.

use anyhow::{Result, bail};
use rowflow::ops::{BatchOperation, DuplicateRow, FnOperation, RemoveIf, SetColumn, TagRow};
use rowflow::pipeline::{
    DeferredOperation, IterSource, LiveSet, Operation, OperationGroup, OperationHost,
    PipelineContext, RowHost, RowQueueType, check_for_failures, rows_source,
};
use rowflow::{DeferState, HostConfig, PipelineError, Row, RowRef, RowState};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn numbered_rows(n: i64) -> Vec<RowRef> {
    (0..n).map(|i| Row::with([("n", json!(i))]).into_ref()).collect()
}

fn numbers(rows: &[RowRef]) -> Vec<i64> {
    rows.iter().map(|r| r.get_i64("n").unwrap()).collect()
}

/// Counts `apply` calls and records the `n` column of every row it sees.
fn recorder(kind: &str, seen: &Arc<Mutex<Vec<i64>>>) -> FnOperation {
    let seen = Arc::clone(seen);
    FnOperation::new(kind, move |row, _host| {
        seen.lock().unwrap().push(row.get_i64("n").unwrap_or(-1));
        Ok(())
    })
}

/// Logs prepare/apply/shutdown events; optionally fails prepare.
struct Lifecycle {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    fail_prepare: bool,
}

impl Operation for Lifecycle {
    fn kind(&self) -> &str {
        "Lifecycle"
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> Result<()> {
        if self.fail_prepare {
            bail!("{} cannot prepare", self.label);
        }
        self.events.lock().unwrap().push(format!("prepare {}", self.label));
        Ok(())
    }

    fn apply(&mut self, _row: &RowRef, _host: &RowHost) -> Result<()> {
        self.events.lock().unwrap().push(format!("apply {}", self.label));
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &PipelineContext) -> Result<()> {
        self.events.lock().unwrap().push(format!("shutdown {}", self.label));
        Ok(())
    }
}

/// Parks the first row it sees until `release_after` rows have arrived.
struct HoldFirst {
    release_after: usize,
    applied: Arc<AtomicUsize>,
    held: Option<RowRef>,
}

impl Operation for HoldFirst {
    fn kind(&self) -> &str {
        "HoldFirst"
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        let n = self.applied.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            row.request_defer();
            self.held = Some(Arc::clone(row));
        } else if n == self.release_after
            && let Some(held) = self.held.take()
        {
            held.resolve_defer();
        }
        Ok(())
    }

    fn deferred_batch_size(&self) -> Option<usize> {
        Some(self.release_after)
    }

    fn as_deferred_mut(&mut self) -> Option<&mut dyn DeferredOperation> {
        Some(self)
    }
}

impl DeferredOperation for HoldFirst {
    fn batch_size(&self) -> usize {
        self.release_after
    }

    fn pending(&self) -> usize {
        usize::from(self.held.is_some())
    }

    fn flush(&mut self, _host: &RowHost) -> Result<()> {
        if let Some(held) = self.held.take() {
            held.resolve_defer();
        }
        Ok(())
    }
}

// --- pass-through and empty chain ---

#[test]
fn test_pass_through_three_rows() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let ctx = PipelineContext::new();
    let summary = OperationHost::new(HostConfig::default())
        .operation(recorder("PassThrough", &seen))
        .with_input(IterSource::new(numbered_rows(3).into_iter()))
        .execute(&ctx);

    assert_eq!(summary.rows_active, 0);
    assert!(!summary.failed);
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(summary.counters.rows_added, 3);
    assert_eq!(summary.counters.rows_finished, 3);
    assert_eq!(summary.counters.rows_wiped, 3);
    assert_eq!(summary.counters.rows_yielded, 0);
    check_for_failures(&ctx, &summary).unwrap();
}

#[test]
fn test_row_in_flight_is_live_and_active() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let summary = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("Observe", move |_, host| {
            sink.lock().unwrap().push((host.live_rows(), host.active_rows()));
            Ok(())
        }))
        .with_input(IterSource::new(numbered_rows(4).into_iter()))
        .execute(&PipelineContext::new());

    assert!(!summary.failed);
    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 4);
    assert!(observed.iter().all(|&(live, active)| live >= 1 && active >= 1));
}

#[test]
fn test_evaluate_yields_finished_rows() {
    let ctx = PipelineContext::new();
    let mut evaluation = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("seen", true))
        .with_input(IterSource::new(numbered_rows(25).into_iter()))
        .evaluate(&ctx);
    let out: Vec<RowRef> = evaluation.by_ref().collect();

    assert_eq!(out.len(), 25);
    assert!(out.iter().all(|r| r.state() == RowState::Finished));
    assert!(out.iter().all(|r| r.get("seen") == Some(json!(true))));
    assert!(evaluation.is_done());
    let summary = evaluation.summary();
    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.rows_yielded, 25);
}

#[test]
fn test_empty_chain_finishes_rows_without_apply() {
    let ctx = PipelineContext::new();
    let rows = numbered_rows(3);
    let mut evaluation = OperationHost::new(HostConfig::default())
        .with_input(IterSource::new(rows.clone().into_iter()))
        .evaluate(&ctx);
    let out: Vec<RowRef> = evaluation.by_ref().collect();

    assert_eq!(numbers(&out), vec![0, 1, 2]);
    assert!(rows.iter().all(|r| r.state() == RowState::Finished));
    assert!(rows.iter().all(|r| r.current_operation().is_none()));
    assert_eq!(evaluation.summary().rows_active, 0);
}

#[test]
fn test_no_input_source_completes() {
    let ctx = PipelineContext::new();
    let summary = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("x", 1))
        .execute(&ctx);
    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.rows_added, 0);
}

#[test]
fn test_chain_order_within_row() {
    let ctx = PipelineContext::new();
    let out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("step", "first"))
        .operation(FnOperation::new("Check", |row, _| {
            if row.get_str("step").as_deref() != Some("first") {
                bail!("second operation ran before the first");
            }
            row.set("step", "second");
            Ok(())
        }))
        .with_input(IterSource::new(numbered_rows(10).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert_eq!(out.len(), 10);
    assert!(out.iter().all(|r| r.get_str("step").as_deref() == Some("second")));
    assert!(!ctx.has_failures());
}

// --- removal ---

#[test]
fn test_remove_every_other_row() {
    let ctx = PipelineContext::new();
    let rows = numbered_rows(4);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut evaluation = OperationHost::new(HostConfig::default())
        .operation(RemoveIf::new(|row| row.get_i64("n").unwrap() % 2 == 1))
        .operation(recorder("AfterRemove", &seen))
        .with_input(IterSource::new(rows.clone().into_iter()))
        .evaluate(&ctx);
    let mut out = numbers(&evaluation.by_ref().collect::<Vec<_>>());
    out.sort();

    assert_eq!(out, vec![0, 2]);
    assert_eq!(rows[1].state(), RowState::Removed);
    assert_eq!(rows[3].state(), RowState::Removed);
    // Removed rows never reach a later operation.
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 2]);
    let summary = evaluation.summary();
    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.rows_removed, 2);
    assert_eq!(summary.counters.rows_finished, 2);
}

#[test]
fn test_remove_other_row_while_queued() {
    // The first row removes every row still waiting behind it.
    let ctx = PipelineContext::new();
    let rows = numbered_rows(6);
    let victims = rows[1..].to_vec();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let summary = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("RemoveOthers", move |row, host| {
            if row.get_i64("n") == Some(0) {
                host.remove_rows(&victims);
            }
            Ok(())
        }))
        .operation(recorder("After", &seen))
        .with_input(IterSource::new(rows.clone().into_iter()))
        .execute(&ctx);

    assert_eq!(summary.rows_active, 0);
    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert_eq!(rows[0].state(), RowState::Finished);
    assert!(rows[1..].iter().all(|r| r.state() == RowState::Removed));
}

// --- operation groups ---

#[test]
fn test_group_tags_by_guard() {
    let ctx = PipelineContext::new();
    let group = OperationGroup::when(|row| row.get_i64("n").unwrap() % 2 == 0)
        .then(TagRow::new("A"))
        .unwrap()
        .otherwise(TagRow::new("B"))
        .unwrap();
    let mut out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(group)
        .with_input(IterSource::new(numbered_rows(4).into_iter()))
        .evaluate(&ctx)
        .collect();
    out.sort_by_key(|r| r.get_i64("n"));

    let tags: Vec<_> = out.iter().map(|r| r.tag().unwrap()).collect();
    assert_eq!(tags, vec![json!("A"), json!("B"), json!("A"), json!("B")]);
}

#[test]
fn test_group_without_else_passes_rows_through() {
    let ctx = PipelineContext::new();
    let group = OperationGroup::when(|row| row.get_i64("n") == Some(1))
        .then(SetColumn::new("hit", true))
        .unwrap();
    let out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(group)
        .with_input(IterSource::new(numbered_rows(3).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert_eq!(out.len(), 3);
    let hits: Vec<i64> = out
        .iter()
        .filter(|r| r.has("hit"))
        .map(|r| r.get_i64("n").unwrap())
        .collect();
    assert_eq!(hits, vec![1]);
}

#[test]
fn test_group_replay_stops_after_removal() {
    let ctx = PipelineContext::new();
    let inner = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::new(Mutex::new(Vec::new()));
    let group = OperationGroup::new()
        .then(RemoveIf::new(|_| true))
        .unwrap()
        .then(recorder("Inner", &inner))
        .unwrap();
    let out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(group)
        .operation(recorder("Outer", &outer))
        .with_input(IterSource::new(numbered_rows(3).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert!(out.is_empty());
    assert!(inner.lock().unwrap().is_empty());
    assert!(outer.lock().unwrap().is_empty());
}

#[test]
fn test_group_rejects_deferred_child() {
    let err = OperationGroup::new()
        .then(BatchOperation::new("Batch", 2, |_, _| Ok(())))
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::InvalidGroupChild { .. }));
}

#[test]
fn test_group_children_numbered_independently() {
    let mut host = OperationHost::new(HostConfig::default());
    host.add_operation(Box::new(SetColumn::new("a", 1)));
    let group = OperationGroup::new()
        .then(SetColumn::new("b", 2))
        .unwrap()
        .then(SetColumn::new("c", 3))
        .unwrap()
        .otherwise(SetColumn::new("d", 4))
        .unwrap();
    assert_eq!(
        group.then_chain().names(),
        vec![
            "OperationGroup/then/SetColumn#1".to_string(),
            "OperationGroup/then/SetColumn#2".to_string(),
        ]
    );
    assert_eq!(
        group.else_chain().names(),
        vec!["OperationGroup/else/SetColumn#1".to_string()]
    );
    host.add_operation(Box::new(group));

    assert_eq!(
        host.chain().names(),
        vec!["SetColumn#1".to_string(), "OperationGroup#2".to_string()]
    );
}

#[test]
fn test_group_child_failure_names_child() {
    let ctx = PipelineContext::new();
    let group = OperationGroup::new()
        .then(FnOperation::new("Explode", |_, _| bail!("boom")))
        .unwrap();
    let summary = OperationHost::new(HostConfig::default())
        .operation(group)
        .with_input(IterSource::new(numbered_rows(1).into_iter()))
        .execute(&ctx);

    assert!(summary.failed);
    let failures = ctx.take_failures();
    let PipelineError::Apply { operation, source, .. } = &failures[0] else {
        panic!("expected an apply failure, got {:?}", failures[0]);
    };
    assert_eq!(operation, "OperationGroup#1");
    assert!(format!("{source:#}").contains("OperationGroup#1/then/Explode#1"));
}

// --- deferred operations ---

#[test]
fn test_deferred_batches_two_two_one() {
    let ctx = PipelineContext::new();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::clone(&sizes);
    let after = Arc::new(Mutex::new(Vec::new()));
    let rows = numbered_rows(5);
    let summary = OperationHost::new(HostConfig::default())
        .operation(BatchOperation::new("Batch", 2, move |batch, _| {
            batches.lock().unwrap().push(batch.len());
            Ok(())
        }))
        .operation(recorder("After", &after))
        .with_input(IterSource::new(rows.clone().into_iter()))
        .execute(&ctx);

    assert_eq!(*sizes.lock().unwrap(), vec![2, 2, 1]);
    assert!(rows.iter().all(|r| r.state() == RowState::Finished));
    assert!(rows.iter().all(|r| r.defer_state() == DeferState::None));
    assert_eq!(after.lock().unwrap().len(), 5);
    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.deferred_flushes, 1);
}

#[test]
fn test_deferred_row_applied_once_per_resolution() {
    let ctx = PipelineContext::new();
    let applied = Arc::new(AtomicUsize::new(0));
    let rows = numbered_rows(5);
    let summary = OperationHost::new(HostConfig::default())
        .operation(HoldFirst {
            release_after: 5,
            applied: Arc::clone(&applied),
            held: None,
        })
        .with_input(IterSource::new(rows.clone().into_iter()))
        .execute(&ctx);

    // The parked row resumes after the operation without a second apply.
    assert_eq!(applied.load(Ordering::SeqCst), 5);
    assert!(rows.iter().all(|r| r.state() == RowState::Finished));
    assert_eq!(summary.rows_active, 0);
}

#[test]
fn test_keep_order_preserves_input_order() {
    let ctx = PipelineContext::new();
    let config = HostConfig {
        keep_order: true,
        input_buffer_size: 3,
        ..HostConfig::default()
    };
    let out: Vec<RowRef> = OperationHost::new(config)
        .operation(HoldFirst {
            release_after: 40,
            applied: Arc::new(AtomicUsize::new(0)),
            held: None,
        })
        .operation(SetColumn::new("done", true))
        .with_input(IterSource::new(numbered_rows(60).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert_eq!(numbers(&out), (0..60).collect::<Vec<_>>());
}

#[test]
fn test_keep_order_yields_finished_rows_after_failure() {
    let ctx = PipelineContext::new();
    let config = HostConfig {
        keep_order: true,
        ..HostConfig::default()
    };
    let mut evaluation = OperationHost::new(config)
        .operation(HoldFirst {
            release_after: 100,
            applied: Arc::new(AtomicUsize::new(0)),
            held: None,
        })
        .operation(FnOperation::new("FailAtFive", |row, _| {
            if row.get_i64("n") == Some(5) {
                bail!("row 5 rejected");
            }
            Ok(())
        }))
        .with_input(IterSource::new(numbered_rows(8).into_iter()))
        .evaluate(&ctx);
    let out: Vec<RowRef> = evaluation.by_ref().collect();

    // Row 0 stays parked at the front of the live set; the rows finished behind it still
    // come out, in input order.
    assert_eq!(numbers(&out), vec![1, 2, 3, 4]);
    assert!(out.iter().all(|r| r.state() == RowState::Finished));
    assert!(evaluation.summary().failed);
    assert!(evaluation.summary().rows_active > 0);
}

#[test]
fn test_starvation_guard_raises_limit() {
    let config = HostConfig {
        throttling_limit: 10,
        ..HostConfig::default()
    };
    let resolved = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resolved);
    let host = OperationHost::new(config).operation(BatchOperation::new(
        "Batch",
        5,
        move |batch, _| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        },
    ));
    assert_eq!(host.effective_throttling_limit(), 50);
    assert_eq!(host.config().throttling_limit, 10);

    let ctx = PipelineContext::new();
    let summary = host
        .with_input(IterSource::new(numbered_rows(50).into_iter()))
        .execute(&ctx);
    assert_eq!(resolved.load(Ordering::SeqCst), 50);
    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.rows_finished, 50);
}

#[test]
fn test_starvation_guard_keeps_sufficient_limit() {
    let host = OperationHost::new(HostConfig::default())
        .operation(BatchOperation::new("Batch", 5, |_, _| Ok(())));
    assert_eq!(host.effective_throttling_limit(), 10_000);
}

// --- throttling ---

#[test]
fn test_backpressure_bounds_active_rows() {
    let ctx = PipelineContext::new();
    let config = HostConfig {
        input_buffer_size: 5,
        throttling_limit: 20,
        throttling_sleep_resolution: Duration::from_millis(1),
        ..HostConfig::default()
    };
    let max_active = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&max_active);
    let summary = OperationHost::new(config)
        .operation(FnOperation::new("Slow", move |_, host| {
            observed.fetch_max(host.active_rows(), Ordering::SeqCst);
            thread::sleep(Duration::from_micros(200));
            Ok(())
        }))
        .with_input(IterSource::new(numbered_rows(300).into_iter()))
        .execute(&ctx);

    assert_eq!(summary.rows_active, 0);
    assert_eq!(summary.counters.rows_finished, 300);
    assert!(max_active.load(Ordering::SeqCst) <= 25);
}

#[test]
fn test_unbuffered_source_submits_each_row() {
    let ctx = PipelineContext::new();
    let summary = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("x", 1))
        .with_input(IterSource::unbuffered(numbered_rows(7).into_iter()))
        .execute(&ctx);
    assert_eq!(summary.counters.batches_submitted, 7);
    assert_eq!(summary.rows_active, 0);
}

// --- added rows ---

#[test]
fn test_duplicated_rows_continue_after_source_operation() {
    let ctx = PipelineContext::new();
    let dup_applies = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dup_applies);
    let out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("Count", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .operation(DuplicateRow::new(2).mark_copies("copy"))
        .operation(SetColumn::new("after", true))
        .with_input(IterSource::new(numbered_rows(3).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert_eq!(out.len(), 9);
    assert!(out.iter().all(|r| r.get("after") == Some(json!(true))));
    assert_eq!(out.iter().filter(|r| r.has("copy")).count(), 6);
    // Copies skip everything up to and including the duplicating operation.
    assert_eq!(dup_applies.load(Ordering::SeqCst), 3);
}

// --- failures ---

#[test]
fn test_prepare_failure_aborts_run() {
    let ctx = PipelineContext::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let op = |label, fail_prepare| Lifecycle {
        label,
        events: Arc::clone(&events),
        fail_prepare,
    };
    let rows = numbered_rows(3);
    let summary = OperationHost::new(HostConfig::default())
        .operation(op("one", false))
        .operation(op("two", true))
        .operation(op("three", false))
        .with_input(IterSource::new(rows.clone().into_iter()))
        .execute(&ctx);

    assert!(summary.failed);
    assert_eq!(summary.counters.rows_added, 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["prepare one".to_string(), "shutdown one".to_string()]
    );
    assert!(rows.iter().all(|r| r.state() == RowState::Normal));
    let failures = ctx.take_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], PipelineError::Prepare { operation, .. } if operation == "Lifecycle#2"));
}

#[test]
fn test_shutdown_runs_in_chain_order() {
    let ctx = PipelineContext::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let op = |label| Lifecycle {
        label,
        events: Arc::clone(&events),
        fail_prepare: false,
    };
    OperationHost::new(HostConfig::default())
        .operation(op("one"))
        .operation(op("two"))
        .with_input(IterSource::new(numbered_rows(1).into_iter()))
        .execute(&ctx);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "prepare one".to_string(),
            "prepare two".to_string(),
            "apply one".to_string(),
            "apply two".to_string(),
            "shutdown one".to_string(),
            "shutdown two".to_string(),
        ]
    );
}

#[test]
fn test_apply_failure_halts_worker() {
    let ctx = PipelineContext::new();
    let rows = numbered_rows(5);
    let events = Arc::new(Mutex::new(Vec::new()));
    let summary = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("Fail", |row, _| {
            if row.get_i64("n") == Some(2) {
                bail!("boom");
            }
            Ok(())
        }))
        .operation(Lifecycle {
            label: "after",
            events: Arc::clone(&events),
            fail_prepare: false,
        })
        .with_input(IterSource::new(rows.clone().into_iter()))
        .execute(&ctx);

    assert!(summary.failed);
    assert!(summary.rows_active >= 1);
    assert_eq!(rows[2].state(), RowState::Normal);
    assert!(rows[3..].iter().all(|r| r.state() != RowState::Finished));
    // Shutdown still runs for prepared operations.
    assert_eq!(events.lock().unwrap().last().unwrap(), "shutdown after");

    let failures = ctx.take_failures();
    assert_eq!(failures.len(), 1);
    let PipelineError::Apply {
        operation, row_id, ..
    } = &failures[0]
    else {
        panic!("expected an apply failure, got {:?}", failures[0]);
    };
    assert_eq!(operation, "Fail#1");
    assert_eq!(*row_id, rows[2].id());
}

#[test]
fn test_check_for_failures_reports_first() {
    let ctx = PipelineContext::new();
    let summary = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("Fail", |_, _| bail!("boom")))
        .with_input(IterSource::new(numbered_rows(2).into_iter()))
        .execute(&ctx);
    assert_eq!(ctx.failure_count(), 1);
    let err = check_for_failures(&ctx, &summary).unwrap_err();
    assert!(err.to_string().contains("Fail#1"));
    assert!(!ctx.has_failures());
}

#[test]
fn test_invalid_config_fails_before_prepare() {
    let ctx = PipelineContext::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = HostConfig {
        input_buffer_size: 0,
        ..HostConfig::default()
    };
    let summary = OperationHost::new(config)
        .operation(Lifecycle {
            label: "one",
            events: Arc::clone(&events),
            fail_prepare: false,
        })
        .with_input(IterSource::new(numbered_rows(2).into_iter()))
        .execute(&ctx);

    assert!(summary.failed);
    assert!(events.lock().unwrap().is_empty());
    assert!(matches!(ctx.take_failures()[0], PipelineError::Config(_)));
}

// --- cancellation ---

#[test]
fn test_cancellation_stops_endless_input() {
    let ctx = PipelineContext::new();
    let applied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&applied);
    let endless = std::iter::repeat_with(|| Row::new().into_ref());
    let summary = OperationHost::new(HostConfig::default())
        .operation(FnOperation::new("CancelAt50", move |_, host| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 50 {
                host.context().cancel.cancel();
            }
            Ok(())
        }))
        .with_input(IterSource::new(endless))
        .execute(&ctx);

    assert!(summary.cancelled);
    assert!(!summary.failed);
    assert!(applied.load(Ordering::SeqCst) >= 50);
    assert!(check_for_failures(&ctx, &summary).is_err());
}

#[test]
fn test_dropping_evaluation_early_shuts_down() {
    let ctx = PipelineContext::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut evaluation = OperationHost::new(HostConfig::default())
        .operation(Lifecycle {
            label: "one",
            events: Arc::clone(&events),
            fail_prepare: false,
        })
        .with_input(IterSource::new(numbered_rows(100).into_iter()))
        .evaluate(&ctx);
    assert!(evaluation.next().is_some());
    drop(evaluation);

    assert_eq!(events.lock().unwrap().last().unwrap(), "shutdown one");
}

// --- queue variants and chained hosts ---

#[test]
fn test_channel_queue_runs_pipeline() {
    let ctx = PipelineContext::new();
    let config = HostConfig {
        row_queue: RowQueueType::Channel,
        ..HostConfig::default()
    };
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::clone(&sizes);
    let out: Vec<RowRef> = OperationHost::new(config)
        .operation(RemoveIf::new(|row| row.get_i64("n").unwrap() % 10 == 0))
        .operation(BatchOperation::new("Batch", 4, move |batch, _| {
            batches.lock().unwrap().push(batch.len());
            Ok(())
        }))
        .with_input(IterSource::new(numbered_rows(100).into_iter()))
        .evaluate(&ctx)
        .collect();

    assert_eq!(out.len(), 90);
    assert_eq!(sizes.lock().unwrap().iter().sum::<usize>(), 90);
    assert!(!ctx.has_failures());
}

#[test]
fn test_chained_hosts() {
    let ctx = PipelineContext::new();
    let upstream = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("a", 1))
        .operation(RemoveIf::new(|row| row.get_i64("n") == Some(3)))
        .with_input(rows_source(
            (0..6).map(|i| Row::with([("n", json!(i))])).collect(),
        ));
    let mut out: Vec<RowRef> = OperationHost::new(HostConfig::default())
        .operation(SetColumn::new("b", 2))
        .with_input(upstream)
        .evaluate(&ctx)
        .collect();
    out.sort_by_key(|r| r.get_i64("n"));

    assert_eq!(numbers(&out), vec![0, 1, 2, 4, 5]);
    assert!(out.iter().all(|r| r.get_i64("a") == Some(1) && r.get_i64("b") == Some(2)));
}

// --- live row set ---

#[test]
fn test_live_set_insert_waits_for_reader() {
    let live = Arc::new(LiveSet::new(Duration::from_millis(10)));
    let holder = {
        let live = Arc::clone(&live);
        thread::spawn(move || live.hold_read_for(Duration::from_millis(100)))
    };
    thread::sleep(Duration::from_millis(20));
    // Lock timeout is shorter than the hold: the insert retries instead of being dropped.
    live.insert(Row::new().into_ref());
    holder.join().unwrap();

    assert_eq!(live.len(), 1);
}

#[test]
fn test_live_set_wipe_keeps_in_flight_rows() {
    let live = LiveSet::new(Duration::from_secs(1));
    let rows = numbered_rows(3);
    live.insert_many(&rows);
    let mut collected = std::collections::VecDeque::new();
    let stats = live.wipe(false, Some(&mut collected));

    assert_eq!(stats.wiped, 0);
    assert!(collected.is_empty());
    assert_eq!(live.ids(), rows.iter().map(|r| r.id()).collect::<Vec<_>>());
}
