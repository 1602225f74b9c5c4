//! Integration tests for columnar-to-row conversion.
//!
//! Arrow record batches go in through `RecordBatchSource`, optionally
//! uploaded to a simulated device first, and come out as canonical rows via
//! both the iterator and the compiled loop.

use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use gpu_columnar_to_row::{
    BatchRow, ColumnarToRowExec, ConversionConfig, ConversionError, LifecycleState, LoopOutcome,
    MetricsRegistry, NeverStop, Row, ScalarValue, SimpleCodegenContext, StopAfter, TaskContext,
    TaskOutcome,
};
use gpu_memory_manager::SimulatedDevice;
use gpu_row_core::{BatchSource, RecordBatchSource, ReleaseLedger};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
        Field::new("active", DataType::Boolean, false),
    ]))
}

/// Rows `start..start + n`; `name` is null every third id, `score` every fourth.
fn record_batch(start: i64, n: usize) -> RecordBatch {
    let ids: Vec<i64> = (start..start + n as i64).collect();
    let names: Vec<Option<String>> = ids
        .iter()
        .map(|i| (i % 3 != 0).then(|| format!("row-{i}")))
        .collect();
    let scores: Vec<Option<f64>> = ids
        .iter()
        .map(|i| (i % 4 != 0).then(|| *i as f64 * 1.5))
        .collect();
    let active: Vec<bool> = ids.iter().map(|i| i % 2 == 0).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids)),
        Arc::new(StringArray::from(names)),
        Arc::new(Float64Array::from(scores)),
        Arc::new(BooleanArray::from(active)),
    ];
    RecordBatch::try_new(schema(), columns).unwrap()
}

/// Consecutive batches of the given sizes.
fn batches(sizes: &[usize]) -> Vec<RecordBatch> {
    let mut start = 0;
    sizes
        .iter()
        .map(|&n| {
            let b = record_batch(start, n);
            start += n as i64;
            b
        })
        .collect()
}

fn exec() -> ColumnarToRowExec {
    ColumnarToRowExec::new(schema(), ConversionConfig::default()).unwrap()
}

fn source(sizes: &[usize], ledger: &Arc<ReleaseLedger>) -> Box<dyn BatchSource> {
    Box::new(RecordBatchSource::new(batches(sizes)).with_ledger(Arc::clone(ledger)))
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|r| r.get_i64(0)).collect()
}

/// Run the compiled loop to completion, canonicalizing every row.
fn compiled_rows(exec: &ColumnarToRowExec, sizes: &[usize]) -> (Vec<Row>, gpu_columnar_to_row::MetricsSnapshot) {
    let ledger = ReleaseLedger::new();
    let mut pipeline = exec
        .execute_compiled(
            source(sizes, &ledger),
            TaskContext::new(1, 0),
            false,
            &mut SimpleCodegenContext::new("emit_row"),
        )
        .unwrap();
    let projection = exec.projection().clone();
    let mut rows = Vec::new();
    let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
        rows.push(projection.canonicalize(row)?);
        Ok(())
    };
    let outcome = pipeline.run(&mut consumer, &mut NeverStop).unwrap();
    assert_eq!(outcome, LoopOutcome::Finished);
    assert_eq!(ledger.outstanding(), 0);
    let metrics = pipeline.metrics().snapshot();
    (rows, metrics)
}

// ---------------------------------------------------------------------------
// Iterator protocol
// ---------------------------------------------------------------------------

#[test]
fn test_iterator_three_plus_two_rows() {
    let ledger = ReleaseLedger::new();
    let rows_iter = exec().execute_iterator(source(&[3, 2], &ledger), TaskContext::new(1, 0));
    let metrics = Arc::clone(rows_iter.metrics());

    let rows: Vec<Row> = rows_iter.collect::<Result<_, _>>().unwrap();
    assert_eq!(ids(&rows), vec![0, 1, 2, 3, 4]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.batches_input, 2);
    assert_eq!(snapshot.rows_output, 5);
    assert_eq!(ledger.acquired(), 2);
    assert_eq!(ledger.released(), 2);
}

#[test]
fn test_iterator_row_count_matches_batches() {
    let ledger = ReleaseLedger::new();
    let sizes = [7, 1, 0, 12, 4];
    let rows: Vec<Row> = exec()
        .execute_iterator(source(&sizes, &ledger), TaskContext::new(1, 0))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows.len(), 24);
    assert_eq!(ids(&rows), (0..24).collect::<Vec<_>>());
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn test_iterator_exhausted_contract() {
    let ledger = ReleaseLedger::new();
    let mut it = exec().execute_iterator(source(&[1], &ledger), TaskContext::new(1, 0));
    assert!(it.has_next().unwrap());
    it.next_row().unwrap();
    assert!(!it.has_next().unwrap());
    assert!(matches!(it.next_row(), Err(ConversionError::Exhausted)));
}

#[test]
fn test_null_fields_yield_defaults() {
    let ledger = ReleaseLedger::new();
    let rows: Vec<Row> = exec()
        .execute_iterator(source(&[5], &ledger), TaskContext::new(1, 0))
        .collect::<Result<_, _>>()
        .unwrap();

    // id 0: name and score both null.
    let r0 = &rows[0];
    assert!(r0.is_null(1));
    assert!(r0.is_null(2));
    assert_eq!(r0.get_str(1), Some(""));
    assert_eq!(r0.get_f64(2), 0.0);
    assert_eq!(r0.get(1), None);

    let r1 = &rows[1];
    assert_eq!(r1.get(1), Some(ScalarValue::Utf8("row-1".into())));
    assert_eq!(r1.get(2), Some(ScalarValue::Float64(1.5)));
    assert_eq!(r1.get(3), Some(ScalarValue::Boolean(false)));
    assert!(!r1.is_null(0));
}

#[test]
fn test_projection_subset() {
    let ledger = ReleaseLedger::new();
    let exec = exec().with_projection(&[2, 0]).unwrap();
    let rows: Vec<Row> = exec
        .execute_iterator(source(&[2], &ledger), TaskContext::new(1, 0))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows[1].num_fields(), 2);
    assert_eq!(rows[1].get_f64(0), 1.5);
    assert_eq!(rows[1].get_i64(1), 1);
    assert!(exec.with_projection(&[9]).is_err());
}

// ---------------------------------------------------------------------------
// Compiled protocol
// ---------------------------------------------------------------------------

#[test]
fn test_compiled_matches_iterator() {
    let exec = exec();
    let sizes = [3, 0, 5, 2];

    let ledger = ReleaseLedger::new();
    let it = exec.execute_iterator(source(&sizes, &ledger), TaskContext::new(1, 0));
    let it_metrics = Arc::clone(it.metrics());
    let it_rows: Vec<Row> = it.collect::<Result<_, _>>().unwrap();

    let (loop_rows, loop_metrics) = compiled_rows(&exec, &sizes);

    assert_eq!(it_rows.len(), loop_rows.len());
    for (a, b) in it_rows.iter().zip(&loop_rows) {
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
    assert!(it_metrics.snapshot().same_counts(&loop_metrics));
}

#[test]
fn test_compiled_fast_path_bytes_match_slow_path() {
    let fixed = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("score", DataType::Float64, true),
        Field::new("active", DataType::Boolean, false),
    ]));
    let exec = ColumnarToRowExec::new(Arc::clone(&fixed), ConversionConfig::default()).unwrap();
    let projected = |sizes: &[usize]| -> Vec<RecordBatch> {
        batches(sizes)
            .into_iter()
            .map(|b| b.project(&[0, 2, 3]).unwrap())
            .collect()
    };

    let fast = exec.execute_iterator(
        Box::new(RecordBatchSource::new(projected(&[4, 4]))),
        TaskContext::new(1, 0),
    );
    assert!(fast.uses_fast_path());
    let fast_rows: Vec<Row> = fast.collect::<Result<_, _>>().unwrap();

    let slow_config = ConversionConfig {
        enable_fixed_width_fast_path: false,
        ..ConversionConfig::default()
    };
    let slow_exec = ColumnarToRowExec::new(fixed, slow_config).unwrap();
    let slow = slow_exec.execute_iterator(
        Box::new(RecordBatchSource::new(projected(&[4, 4]))),
        TaskContext::new(2, 0),
    );
    assert!(!slow.uses_fast_path());
    let slow_rows: Vec<Row> = slow.collect::<Result<_, _>>().unwrap();

    assert_eq!(fast_rows, slow_rows);
    assert!(fast_rows[4].is_null(1));
}

#[test]
fn test_early_stop_after_second_row() {
    let ledger = ReleaseLedger::new();
    let mut pipeline = exec()
        .execute_compiled(
            source(&[5], &ledger),
            TaskContext::new(1, 0),
            true,
            &mut SimpleCodegenContext::new("emit_row"),
        )
        .unwrap();
    assert!(pipeline.source().contains("should_stop()"));

    let mut seen = Vec::new();
    let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
        seen.push(row.row_index());
        Ok(())
    };

    let outcome = pipeline.run(&mut consumer, &mut StopAfter::new(2)).unwrap();
    assert_eq!(outcome, LoopOutcome::Suspended { row_index: 2 });
    assert_eq!(pipeline.lifecycle().cursor().row_index(), 2);
    assert_eq!(pipeline.lifecycle().state(), LifecycleState::Ready);
    assert_eq!(ledger.released(), 0);

    let outcome = pipeline.run(&mut consumer, &mut NeverStop).unwrap();
    assert_eq!(outcome, LoopOutcome::Finished);
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert_eq!(ledger.released(), 1);
    // Counted at acceptance, not per delivered row.
    assert_eq!(pipeline.metrics().snapshot().rows_output, 5);
}

#[test]
fn test_elided_stop_check_marker() {
    let ledger = ReleaseLedger::new();
    let pipeline = exec()
        .execute_compiled(
            source(&[1], &ledger),
            TaskContext::new(1, 0),
            false,
            &mut SimpleCodegenContext::new("emit_row"),
        )
        .unwrap();
    assert!(pipeline.source().contains(gpu_loop_compiler::STOP_CHECK_ELIDED));
}

// ---------------------------------------------------------------------------
// Release and termination
// ---------------------------------------------------------------------------

#[test]
fn test_mid_batch_termination_releases_batch() {
    let ledger = ReleaseLedger::new();
    let context = TaskContext::new(7, 0);
    let mut it = exec().execute_iterator(source(&[4, 4], &ledger), Arc::clone(&context));
    it.next().unwrap().unwrap();
    assert_eq!(ledger.acquired(), 1);
    assert_eq!(ledger.released(), 0);

    context.complete(TaskOutcome::Failure);
    assert_eq!(ledger.released(), ledger.acquired());
    assert!(matches!(it.next(), Some(Err(ConversionError::Closed))));
    assert!(it.next().is_none());
}

#[test]
fn test_suspended_loop_released_on_completion() {
    let ledger = ReleaseLedger::new();
    let context = TaskContext::new(8, 0);
    let mut pipeline = exec()
        .execute_compiled(
            source(&[5, 5], &ledger),
            Arc::clone(&context),
            true,
            &mut SimpleCodegenContext::new("emit_row"),
        )
        .unwrap();
    let mut consumer = |_: &BatchRow<'_>| -> anyhow::Result<()> { Ok(()) };
    pipeline.run(&mut consumer, &mut StopAfter::new(3)).unwrap();
    assert_eq!(ledger.outstanding(), 1);

    context.complete(TaskOutcome::Success);
    assert_eq!(ledger.outstanding(), 0);
    assert!(matches!(
        pipeline.run(&mut consumer, &mut NeverStop),
        Err(ConversionError::Closed)
    ));
}

#[test]
fn test_consumer_completing_its_task_mid_batch() {
    let ledger = ReleaseLedger::new();
    let context = TaskContext::new(9, 0);
    let mut pipeline = exec()
        .execute_compiled(
            source(&[3, 3], &ledger),
            Arc::clone(&context),
            false,
            &mut SimpleCodegenContext::new("emit_row"),
        )
        .unwrap();

    // A sink that fails its own task after the second row.
    let sink_context = Arc::clone(&context);
    let mut seen = 0;
    let mut consumer = |_: &BatchRow<'_>| -> anyhow::Result<()> {
        seen += 1;
        if seen == 2 {
            sink_context.complete(TaskOutcome::Failure);
            anyhow::bail!("sink write failed");
        }
        Ok(())
    };

    let err = pipeline.run(&mut consumer, &mut NeverStop).unwrap_err();
    assert!(matches!(err, ConversionError::Consumer(_)));
    assert!(context.is_completed());
    assert_eq!(ledger.acquired(), 1);
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn test_dropping_iterator_releases_batch() {
    let ledger = ReleaseLedger::new();
    let mut it = exec().execute_iterator(source(&[3], &ledger), TaskContext::new(1, 0));
    it.next().unwrap().unwrap();
    drop(it);
    assert_eq!(ledger.acquired(), 1);
    assert_eq!(ledger.released(), 1);
}

#[test]
fn test_cancellation_before_acquisition() {
    let ledger = ReleaseLedger::new();
    let context = TaskContext::new(11, 0);
    context.cancel();
    let mut it = exec().execute_iterator(source(&[2], &ledger), Arc::clone(&context));
    assert!(matches!(
        it.next(),
        Some(Err(ConversionError::Cancelled { task_id: 11 }))
    ));
    assert!(it.next().is_none());
    assert_eq!(ledger.acquired(), 0);
}

#[test]
fn test_cancellation_between_batches() {
    let ledger = ReleaseLedger::new();
    let context = TaskContext::new(12, 0);
    let mut it = exec().execute_iterator(source(&[1, 1], &ledger), Arc::clone(&context));
    it.next().unwrap().unwrap();
    context.cancel();
    assert!(matches!(it.next(), Some(Err(ConversionError::Cancelled { .. }))));
    assert_eq!(ledger.acquired(), 1);
    assert_eq!(ledger.released(), 1);
}

// ---------------------------------------------------------------------------
// Device-resident input
// ---------------------------------------------------------------------------

#[test]
fn test_device_resident_batches_are_materialized() {
    let exec = exec();
    let queue = Arc::clone(exec.materializer().queue());
    let ledger = ReleaseLedger::new();
    let src = RecordBatchSource::new(batches(&[3, 2]))
        .device_resident(Arc::clone(&queue))
        .with_ledger(Arc::clone(&ledger));

    let rows: Vec<Row> = exec
        .execute_iterator(Box::new(src), TaskContext::new(1, 0))
        .collect::<Result<_, _>>()
        .unwrap();

    let host_ledger = ReleaseLedger::new();
    let host_rows: Vec<Row> = exec
        .execute_iterator(source(&[3, 2], &host_ledger), TaskContext::new(2, 0))
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(rows, host_rows);
    assert!(queue.stats().device_to_host > 0);
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn test_materialization_failure_is_fatal() {
    let device = SimulatedDevice::new();
    let exec =
        ColumnarToRowExec::with_device(schema(), ConversionConfig::default(), device.clone())
            .unwrap();
    let ledger = ReleaseLedger::new();
    let src = RecordBatchSource::new(batches(&[2, 2]))
        .device_resident(Arc::clone(exec.materializer().queue()))
        .with_ledger(Arc::clone(&ledger));
    device.fail_downloads_after(0);

    let mut it = exec.execute_iterator(Box::new(src), TaskContext::new(1, 0));
    assert!(matches!(
        it.next(),
        Some(Err(ConversionError::Materialization { batch_id: 0, .. }))
    ));
    assert!(it.next().is_none());
    assert_eq!(ledger.acquired(), 1);
    assert_eq!(ledger.released(), 1);
    assert_eq!(it.lifecycle().state(), LifecycleState::Closed);
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_partitions_execute_concurrently() {
    let exec = exec();
    let ledger = ReleaseLedger::new();
    let registry = MetricsRegistry::new();
    let sources = vec![
        source(&[3, 2], &ledger),
        source(&[4], &ledger),
        source(&[], &ledger),
    ];
    let out = exec
        .execute_partitions(sources, Arc::clone(&registry))
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert_eq!(ids(&out[0]), vec![0, 1, 2, 3, 4]);
    assert_eq!(ids(&out[1]), vec![0, 1, 2, 3]);
    assert!(out[2].is_empty());

    let report = registry.report();
    assert_eq!(report.len(), 3);
    assert_eq!(report[0].1.rows_output, 5);
    assert_eq!(registry.total().batches_input, 3);
    assert_eq!(ledger.outstanding(), 0);
}
