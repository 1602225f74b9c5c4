//! Whole-batch conversion for fixed-width schemas.
//!
//! When every field is fixed width the canonical row has no variable region,
//! so a batch can be transposed column by column into one contiguous buffer
//! and rows handed out as slices. Output bytes match
//! [`RowProjection::canonicalize`] exactly.

use arrow_interop::{ColumnBatch, GpuDataType};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConversionError, Result};
use crate::row::{Row, RowLayout, RowProjection};

/// A batch converted to row-major canonical rows.
#[derive(Debug)]
pub struct PackedRows {
    layout: Arc<RowLayout>,
    row_width: usize,
    num_rows: usize,
    data: Vec<u8>,
}

impl PackedRows {
    /// Whether `projection` can use block conversion.
    pub fn supports(projection: &RowProjection, max_columns: usize) -> bool {
        let layout = projection.layout();
        projection.is_identity()
            && layout.is_fixed_width()
            && layout.num_fields() <= max_columns
    }

    pub fn convert(batch: &ColumnBatch, projection: &RowProjection) -> Result<Self> {
        let layout = Arc::clone(projection.layout());
        if !layout.is_fixed_width() {
            return Err(ConversionError::SchemaMismatch(
                "block conversion needs an all fixed-width projection".into(),
            ));
        }
        let row_width = layout.fixed_width();
        let num_rows = batch.num_rows();
        let mut data = vec![0u8; row_width * num_rows];

        for (j, spec) in projection.fields().iter().enumerate() {
            let column = batch.columns().get(spec.ordinal).ok_or_else(|| {
                ConversionError::SchemaMismatch(format!(
                    "field '{}' has ordinal {} but batch {} has {} columns",
                    spec.name,
                    spec.ordinal,
                    batch.id(),
                    batch.num_columns()
                ))
            })?;
            if column.dtype != spec.dtype {
                return Err(ConversionError::SchemaMismatch(format!(
                    "field '{}' expects {:?}, column holds {:?}",
                    spec.name, spec.dtype, column.dtype
                )));
            }
            let host = column.host().ok_or_else(|| {
                ConversionError::LifecycleViolation(format!(
                    "column '{}' of batch {} packed before host materialization",
                    column.name,
                    batch.id()
                ))
            })?;
            // Checked above: every projected type is fixed width.
            let width = spec.dtype.byte_width().unwrap_or(0);
            let slot = layout.slot_offset(j);
            let check_nulls = spec.nullable && host.validity.is_some();

            for r in 0..num_rows {
                let row_start = r * row_width;
                if check_nulls && !host.is_valid(r) {
                    data[row_start + (j >> 3)] |= 1 << (j & 7);
                    continue;
                }
                let dst = row_start + slot;
                if spec.dtype == GpuDataType::Boolean {
                    data[dst] = (host.data[r] != 0) as u8;
                } else {
                    data[dst..dst + width].copy_from_slice(&host.data[r * width..(r + 1) * width]);
                }
            }
        }

        debug!(
            "batch {}: packed {} rows x {} bytes",
            batch.id(),
            num_rows,
            row_width
        );
        Ok(Self {
            layout,
            row_width,
            num_rows,
            data,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    /// Copy row `r` out as an owned [`Row`].
    pub fn row(&self, r: usize) -> Result<Row> {
        if r >= self.num_rows {
            return Err(ConversionError::RowOutOfBounds {
                row: r,
                num_rows: self.num_rows,
            });
        }
        let start = r * self.row_width;
        Ok(Row::from_fixed_bytes(
            Arc::clone(&self.layout),
            self.data[start..start + self.row_width].to_vec(),
        ))
    }
}
