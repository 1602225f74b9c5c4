//! Executable form of the emitted row loop.

use arrow_interop::FieldSpec;
use gpu_row_core::{BatchLifecycle, BatchRow, ConversionError, LifecycleState, Result};
use tracing::debug;

/// Downstream consume point. Called once per row, in order.
pub trait RowConsumer {
    fn consume(&mut self, row: &BatchRow<'_>) -> anyhow::Result<()>;
}

impl<F> RowConsumer for F
where
    F: FnMut(&BatchRow<'_>) -> anyhow::Result<()>,
{
    fn consume(&mut self, row: &BatchRow<'_>) -> anyhow::Result<()> {
        self(row)
    }
}

/// Early-stop predicate, checked after every row when the loop has one.
pub trait StopCheck {
    fn should_stop(&mut self) -> bool;
}

impl<F> StopCheck for F
where
    F: FnMut() -> bool,
{
    fn should_stop(&mut self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopCheck for NeverStop {
    fn should_stop(&mut self) -> bool {
        false
    }
}

/// Stops once `n` rows have been consumed, and stays stopped.
#[derive(Debug, Clone, Copy)]
pub struct StopAfter {
    remaining: usize,
}

impl StopAfter {
    pub fn new(n: usize) -> Self {
        Self { remaining: n }
    }
}

impl StopCheck for StopAfter {
    fn should_stop(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

/// How a call to [`CompiledLoop::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Stopped early; the batch is still held and the cursor sits at
    /// `row_index`. Calling `run` again resumes there.
    Suspended { row_index: usize },
    /// Every batch was consumed and released.
    Finished,
}

/// An emitted row loop: rendered source plus its executable form.
#[derive(Debug, Clone)]
pub struct CompiledLoop {
    source: String,
    fields: Vec<FieldSpec>,
    needs_stop_check: bool,
}

impl CompiledLoop {
    pub(crate) fn new(source: String, fields: Vec<FieldSpec>, needs_stop_check: bool) -> Self {
        Self {
            source,
            fields,
            needs_stop_check,
        }
    }

    /// The fragment handed to the host pipeline compiler.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn needs_stop_check(&self) -> bool {
        self.needs_stop_check
    }

    /// Drive `lifecycle` to completion or until `stop` fires.
    ///
    /// Without a stop check `stop` is never consulted. Any error closes the
    /// lifecycle, releasing the current batch.
    pub fn run(
        &self,
        lifecycle: &mut BatchLifecycle,
        consumer: &mut dyn RowConsumer,
        stop: &mut dyn StopCheck,
    ) -> Result<LoopOutcome> {
        let outcome = self.drive(lifecycle, consumer, stop);
        if outcome.is_err() {
            lifecycle.close();
        }
        outcome
    }

    fn drive(
        &self,
        lifecycle: &mut BatchLifecycle,
        consumer: &mut dyn RowConsumer,
        stop: &mut dyn StopCheck,
    ) -> Result<LoopOutcome> {
        loop {
            match lifecycle.state() {
                LifecycleState::Ready => {
                    if let Some(row_index) = self.consume_batch(lifecycle, consumer, stop)? {
                        debug!("compiled loop suspended at row {}", row_index);
                        return Ok(LoopOutcome::Suspended { row_index });
                    }
                }
                LifecycleState::Exhausted => lifecycle.release_current()?,
                LifecycleState::Empty => {
                    if !lifecycle.load_next()? {
                        return Ok(LoopOutcome::Finished);
                    }
                }
                LifecycleState::Closed => return Err(ConversionError::Closed),
                LifecycleState::Loading => {
                    return Err(ConversionError::LifecycleViolation(
                        "compiled loop entered while a batch is loading".into(),
                    ))
                }
            }
        }
    }

    /// Consume the current batch from its cursor. Returns the persisted
    /// cursor when stopped early.
    fn consume_batch(
        &self,
        lifecycle: &BatchLifecycle,
        consumer: &mut dyn RowConsumer,
        stop: &mut dyn StopCheck,
    ) -> Result<Option<usize>> {
        lifecycle.with_active(|active| -> Result<Option<usize>> {
            let batch = active.batch();
            let num_rows = active.num_rows();
            let mut idx = active.row_index();
            while idx < num_rows {
                let row = BatchRow::new(batch, idx, &self.fields);
                consumer.consume(&row).map_err(ConversionError::Consumer)?;
                idx += 1;
                if self.needs_stop_check && stop.should_stop() {
                    active.set_row_index(idx)?;
                    return Ok(Some(idx));
                }
            }
            active.set_row_index(num_rows)?;
            Ok(None)
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{LoopCodegen, LoopSpec, SimpleCodegenContext};
    use arrow_interop::{ColumnBatch, ColumnBuffer, GpuDataType};
    use arrow_schema::{DataType, Field, Schema};
    use gpu_row_core::{
        ConversionConfig, ConversionMetrics, HostMaterializer, ReleaseLedger, RowProjection,
        TaskContext, TaskOutcome, VecBatchSource,
    };
    use std::sync::Arc;

    fn setup(
        sizes: &[usize],
        needs_stop_check: bool,
    ) -> (CompiledLoop, BatchLifecycle, Arc<ReleaseLedger>) {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let ledger = ReleaseLedger::new();
        let mut next = 0i32;
        let batches = sizes
            .iter()
            .enumerate()
            .map(|(id, &n)| {
                let data = (next..next + n as i32).flat_map(|v| v.to_le_bytes()).collect();
                next += n as i32;
                let col = ColumnBuffer::from_bytes("v", GpuDataType::Int32, data, n, None).unwrap();
                ledger.track(ColumnBatch::try_new(id as u64, Arc::clone(&schema), vec![col]).unwrap())
            })
            .collect();
        let lifecycle = BatchLifecycle::new(
            Box::new(VecBatchSource::new(batches)),
            HostMaterializer::simulated(&ConversionConfig::default()).unwrap(),
            TaskContext::new(1, 0),
            ConversionMetrics::new(),
        );
        let projection = RowProjection::from_schema(&schema, None).unwrap();
        let compiled = LoopCodegen::new()
            .emit(
                &LoopSpec::from_projection(&projection, needs_stop_check),
                &mut SimpleCodegenContext::new("emit_row"),
            )
            .unwrap();
        (compiled, lifecycle, ledger)
    }

    fn value(row: &BatchRow<'_>) -> i32 {
        match row.field(0).unwrap().datum {
            gpu_row_core::Datum::Int32(v) => v,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runs_every_batch_in_order() {
        let (compiled, mut lc, ledger) = setup(&[3, 2], false);
        let mut seen = Vec::new();
        let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
            seen.push(value(row));
            Ok(())
        };
        let outcome = compiled.run(&mut lc, &mut consumer, &mut NeverStop).unwrap();
        assert_eq!(outcome, LoopOutcome::Finished);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(ledger.released(), 2);
        assert_eq!(lc.metrics().snapshot().rows_output, 5);
    }

    #[test]
    fn early_stop_suspends_and_resumes() {
        let (compiled, mut lc, ledger) = setup(&[5], true);
        let mut seen = Vec::new();
        let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
            seen.push(value(row));
            Ok(())
        };

        let outcome = compiled
            .run(&mut lc, &mut consumer, &mut StopAfter::new(2))
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Suspended { row_index: 2 });
        assert_eq!(lc.cursor().row_index(), 2);
        assert_eq!(ledger.released(), 0);

        let outcome = compiled.run(&mut lc, &mut consumer, &mut NeverStop).unwrap();
        assert_eq!(outcome, LoopOutcome::Finished);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(ledger.released(), 1);
    }

    #[test]
    fn stop_is_ignored_without_a_check() {
        let (compiled, mut lc, _ledger) = setup(&[4], false);
        let mut count = 0;
        let mut consumer = |_: &BatchRow<'_>| -> anyhow::Result<()> {
            count += 1;
            Ok(())
        };
        let mut always = || true;
        let outcome = compiled.run(&mut lc, &mut consumer, &mut always).unwrap();
        assert_eq!(outcome, LoopOutcome::Finished);
        assert_eq!(count, 4);
    }

    #[test]
    fn consumer_failure_releases_batch() {
        let (compiled, mut lc, ledger) = setup(&[3, 3], false);
        let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
            anyhow::ensure!(value(row) != 1, "sink rejected row");
            Ok(())
        };
        let err = compiled.run(&mut lc, &mut consumer, &mut NeverStop).unwrap_err();
        assert!(matches!(err, ConversionError::Consumer(_)));
        assert_eq!(lc.state(), LifecycleState::Closed);
        assert_eq!(ledger.acquired(), 2);
        assert_eq!(ledger.released(), 1);
        assert!(matches!(
            compiled.run(&mut lc, &mut consumer, &mut NeverStop),
            Err(ConversionError::Closed)
        ));
    }

    #[test]
    fn consumer_may_complete_its_own_task() {
        let (compiled, mut lc, ledger) = setup(&[3, 2], false);
        let ctx = Arc::clone(lc.context());
        let mut seen = Vec::new();
        let mut consumer = |row: &BatchRow<'_>| -> anyhow::Result<()> {
            seen.push(value(row));
            if seen.len() == 1 {
                ctx.complete(TaskOutcome::Failure);
            }
            Ok(())
        };

        // The checked-out batch is finished, then released; the loop stops.
        let err = compiled.run(&mut lc, &mut consumer, &mut NeverStop).unwrap_err();
        assert!(matches!(err, ConversionError::Closed));
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(lc.state(), LifecycleState::Closed);
        assert_eq!(ledger.released(), 1);
    }
}
