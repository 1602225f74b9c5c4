//! Pull-based row protocol.

use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConversionError, Result};
use crate::fixed_width::PackedRows;
use crate::lifecycle::{BatchLifecycle, LifecycleState};
use crate::metrics::ConversionMetrics;
use crate::row::{Row, RowProjection};
use crate::ConversionConfig;

/// Hands out canonical rows one at a time, batch order then row order.
///
/// Not rewindable. After end-of-data or the first error the iterator yields
/// `None` forever; [`ColumnarToRowIterator::next_row`] reports
/// [`ConversionError::Exhausted`] instead.
pub struct ColumnarToRowIterator {
    lifecycle: BatchLifecycle,
    projection: RowProjection,
    fast_path: bool,
    packed: Option<PackedRows>,
    done: bool,
}

impl ColumnarToRowIterator {
    pub fn new(lifecycle: BatchLifecycle, projection: RowProjection, config: &ConversionConfig) -> Self {
        let fast_path = config.enable_fixed_width_fast_path
            && PackedRows::supports(&projection, config.fixed_width_max_columns);
        debug!(
            "row iterator over {} fields (fixed-width block conversion: {})",
            projection.fields().len(),
            fast_path
        );
        Self {
            lifecycle,
            projection,
            fast_path,
            packed: None,
            done: false,
        }
    }

    pub fn lifecycle(&self) -> &BatchLifecycle {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<ConversionMetrics> {
        self.lifecycle.metrics()
    }

    pub fn projection(&self) -> &RowProjection {
        &self.projection
    }

    pub fn uses_fast_path(&self) -> bool {
        self.fast_path
    }

    /// Whether another row is available, loading batches as needed.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        loop {
            match self.lifecycle.state() {
                LifecycleState::Ready => return Ok(true),
                LifecycleState::Exhausted => {
                    self.packed = None;
                    self.lifecycle.release_current()?;
                }
                LifecycleState::Empty => {
                    if !self.lifecycle.load_next()? {
                        self.done = true;
                        return Ok(false);
                    }
                    if let Err(e) = self.pack_current() {
                        self.lifecycle.close();
                        return Err(e);
                    }
                }
                LifecycleState::Closed => return Err(ConversionError::Closed),
                LifecycleState::Loading => {
                    return Err(ConversionError::LifecycleViolation(
                        "row requested while a batch is loading".into(),
                    ))
                }
            }
        }
    }

    /// The next row, or [`ConversionError::Exhausted`] when none is left.
    pub fn next_row(&mut self) -> Result<Row> {
        if !self.has_next()? {
            return Err(ConversionError::Exhausted);
        }
        let projection = &self.projection;
        let packed = self.packed.as_ref();
        let row = self
            .lifecycle
            .with_active(|active| -> Result<Row> {
                let r = active.row_index();
                let row = match packed {
                    Some(p) => p.row(r)?,
                    None => projection.canonicalize(&projection.project(active.batch(), r))?,
                };
                active.advance()?;
                Ok(row)
            })
            .and_then(|row| row);
        if row.is_err() {
            self.lifecycle.close();
        }
        row
    }

    /// Release any held batch and stop.
    pub fn close(&mut self) {
        self.done = true;
        self.packed = None;
        self.lifecycle.close();
    }

    fn pack_current(&mut self) -> Result<()> {
        if !self.fast_path || self.lifecycle.state() != LifecycleState::Ready {
            return Ok(());
        }
        let projection = &self.projection;
        let metrics = self.lifecycle.metrics();
        let packed = self
            .lifecycle
            .with_active(|active| metrics.time(|| PackedRows::convert(active.batch(), projection)))??;
        self.packed = Some(packed);
        Ok(())
    }
}

impl Iterator for ColumnarToRowIterator {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.has_next() {
            Ok(false) => return None,
            Ok(true) => self.next_row(),
            Err(e) => Err(e),
        };
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

impl FusedIterator for ColumnarToRowIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::materialize::HostMaterializer;
    use crate::source::{ReleaseLedger, VecBatchSource};
    use arrow_interop::{ColumnBatch, ColumnBuffer, GpuDataType};
    use arrow_schema::{DataType, Field, Schema, SchemaRef};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Float64, true),
        ]))
    }

    fn batch(id: u64, keys: &[i64], ledger: &Arc<ReleaseLedger>) -> ColumnBatch {
        let n = keys.len();
        let k = keys.iter().flat_map(|v| v.to_le_bytes()).collect();
        let v = keys.iter().flat_map(|v| (*v as f64 / 2.0).to_le_bytes()).collect();
        let validity = keys.iter().map(|k| (k % 2 == 0) as u8).collect();
        let cols = vec![
            ColumnBuffer::from_bytes("k", GpuDataType::Int64, k, n, None).unwrap(),
            ColumnBuffer::from_bytes("v", GpuDataType::Float64, v, n, Some(validity)).unwrap(),
        ];
        ledger.track(ColumnBatch::try_new(id, schema(), cols).unwrap())
    }

    fn iter(batches: Vec<ColumnBatch>, config: &ConversionConfig) -> ColumnarToRowIterator {
        let lc = BatchLifecycle::new(
            Box::new(VecBatchSource::new(batches)),
            HostMaterializer::simulated(config).unwrap(),
            TaskContext::new(1, 0),
            ConversionMetrics::new(),
        );
        let projection = RowProjection::from_schema(&schema(), None).unwrap();
        ColumnarToRowIterator::new(lc, projection, config)
    }

    fn keys(rows: &[Row]) -> Vec<i64> {
        rows.iter().map(|r| r.get_i64(0)).collect()
    }

    #[test]
    fn yields_rows_in_order_and_releases_batches() {
        let ledger = ReleaseLedger::new();
        let it = iter(
            vec![batch(0, &[0, 1, 2], &ledger), batch(1, &[3, 4], &ledger)],
            &ConversionConfig::default(),
        );
        assert!(it.uses_fast_path());
        let metrics = Arc::clone(it.metrics());
        let rows: Vec<Row> = it.collect::<Result<_>>().unwrap();

        assert_eq!(keys(&rows), vec![0, 1, 2, 3, 4]);
        assert!(rows[1].is_null(1));
        assert_eq!(rows[2].get_f64(1), 1.0);
        assert_eq!(ledger.acquired(), 2);
        assert_eq!(ledger.released(), 2);
        assert_eq!(metrics.snapshot().rows_output, 5);
        assert_eq!(metrics.snapshot().batches_input, 2);
    }

    #[test]
    fn fast_and_slow_paths_agree() {
        let ledger = ReleaseLedger::new();
        let slow_config = ConversionConfig {
            enable_fixed_width_fast_path: false,
            ..ConversionConfig::default()
        };
        let slow = iter(vec![batch(0, &[5, 6, 7], &ledger)], &slow_config);
        assert!(!slow.uses_fast_path());
        let fast = iter(vec![batch(0, &[5, 6, 7], &ledger)], &ConversionConfig::default());

        let a: Vec<Row> = slow.collect::<Result<_>>().unwrap();
        let b: Vec<Row> = fast.collect::<Result<_>>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausted_after_end() {
        let ledger = ReleaseLedger::new();
        let mut it = iter(vec![batch(0, &[1], &ledger)], &ConversionConfig::default());
        assert!(it.has_next().unwrap());
        assert!(it.has_next().unwrap());
        it.next_row().unwrap();
        assert!(!it.has_next().unwrap());
        assert!(matches!(it.next_row(), Err(ConversionError::Exhausted)));
        assert!(it.next().is_none());
    }

    #[test]
    fn skips_empty_batches() {
        let ledger = ReleaseLedger::new();
        let it = iter(
            vec![
                batch(0, &[], &ledger),
                batch(1, &[9], &ledger),
                batch(2, &[], &ledger),
            ],
            &ConversionConfig::default(),
        );
        let rows: Vec<Row> = it.collect::<Result<_>>().unwrap();
        assert_eq!(keys(&rows), vec![9]);
        assert_eq!(ledger.released(), 3);
    }

    #[test]
    fn closed_iterator_is_fused() {
        let ledger = ReleaseLedger::new();
        let mut it = iter(vec![batch(0, &[1, 2], &ledger)], &ConversionConfig::default());
        it.next().unwrap().unwrap();
        it.close();
        assert_eq!(ledger.outstanding(), 0);
        assert!(it.next().is_none());
    }
}
