//! Per-row field extraction from a host-resident batch.

use arrow_interop::{ColumnBatch, FieldSpec, GpuDataType};

use crate::error::{ConversionError, Result};

/// One decoded value, borrowing string bytes from the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datum<'a> {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    TimestampMs(i64),
    Utf8(&'a str),
}

impl Datum<'static> {
    /// The value a null field of `dtype` reads as.
    pub fn default_for(dtype: GpuDataType) -> Self {
        match dtype {
            GpuDataType::Boolean => Datum::Boolean(false),
            GpuDataType::Int32 => Datum::Int32(0),
            GpuDataType::Int64 => Datum::Int64(0),
            GpuDataType::Float32 => Datum::Float32(0.0),
            GpuDataType::Float64 => Datum::Float64(0.0),
            GpuDataType::TimestampMs => Datum::TimestampMs(0),
            GpuDataType::Utf8 => Datum::Utf8(""),
        }
    }
}

impl Datum<'_> {
    pub fn dtype(&self) -> GpuDataType {
        match self {
            Datum::Boolean(_) => GpuDataType::Boolean,
            Datum::Int32(_) => GpuDataType::Int32,
            Datum::Int64(_) => GpuDataType::Int64,
            Datum::Float32(_) => GpuDataType::Float32,
            Datum::Float64(_) => GpuDataType::Float64,
            Datum::TimestampMs(_) => GpuDataType::TimestampMs,
            Datum::Utf8(_) => GpuDataType::Utf8,
        }
    }
}

/// A field read: the value, or the type default with `is_null` set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldValue<'a> {
    pub datum: Datum<'a>,
    pub is_null: bool,
}

impl<'a> FieldValue<'a> {
    pub fn value(datum: Datum<'a>) -> Self {
        Self {
            datum,
            is_null: false,
        }
    }

    pub fn null(dtype: GpuDataType) -> Self {
        Self {
            datum: Datum::default_for(dtype),
            is_null: true,
        }
    }
}

/// Read field `spec` of row `row` from `batch`.
///
/// Nullable fields test validity first and yield the type default when null.
/// Non-nullable fields go straight to the typed accessor.
pub fn extract<'a>(batch: &'a ColumnBatch, row: usize, spec: &FieldSpec) -> Result<FieldValue<'a>> {
    let num_rows = batch.num_rows();
    if row >= num_rows {
        return Err(ConversionError::RowOutOfBounds { row, num_rows });
    }
    if spec.ordinal >= batch.num_columns() {
        return Err(ConversionError::SchemaMismatch(format!(
            "field '{}' has ordinal {} but batch {} has {} columns",
            spec.name,
            spec.ordinal,
            batch.id(),
            batch.num_columns()
        )));
    }

    let column = batch.column(spec.ordinal);
    if column.dtype != spec.dtype {
        return Err(ConversionError::SchemaMismatch(format!(
            "field '{}' expects {:?}, column holds {:?}",
            spec.name, spec.dtype, column.dtype
        )));
    }
    let host = column.host().ok_or_else(|| {
        ConversionError::LifecycleViolation(format!(
            "column '{}' of batch {} read before host materialization",
            column.name,
            batch.id()
        ))
    })?;

    if spec.nullable && !host.is_valid(row) {
        return Ok(FieldValue::null(spec.dtype));
    }

    let datum = match spec.dtype {
        GpuDataType::Boolean => Datum::Boolean(host.read_bool(row)),
        GpuDataType::Int32 => Datum::Int32(host.read_i32(row)),
        GpuDataType::Int64 => Datum::Int64(host.read_i64(row)),
        GpuDataType::Float32 => Datum::Float32(host.read_f32(row)),
        GpuDataType::Float64 => Datum::Float64(host.read_f64(row)),
        GpuDataType::TimestampMs => Datum::TimestampMs(host.read_i64(row)),
        GpuDataType::Utf8 => {
            Datum::Utf8(host.read_str(row).map_err(|source| ConversionError::Extraction {
                field: spec.name.clone(),
                row,
                source,
            })?)
        }
    };
    Ok(FieldValue::value(datum))
}

/// Borrowed view of one row index across a batch.
///
/// Only valid while the batch is alive; copy it into a [`crate::Row`] to keep it.
#[derive(Debug, Clone, Copy)]
pub struct BatchRow<'a> {
    batch: &'a ColumnBatch,
    row: usize,
    fields: &'a [FieldSpec],
}

impl<'a> BatchRow<'a> {
    pub fn new(batch: &'a ColumnBatch, row: usize, fields: &'a [FieldSpec]) -> Self {
        Self { batch, row, fields }
    }

    pub fn field(&self, i: usize) -> Result<FieldValue<'a>> {
        let spec = self.fields.get(i).ok_or_else(|| {
            ConversionError::SchemaMismatch(format!(
                "field index {} out of range for {} fields",
                i,
                self.fields.len()
            ))
        })?;
        extract(self.batch, self.row, spec)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &'a [FieldSpec] {
        self.fields
    }

    pub fn row_index(&self) -> usize {
        self.row
    }

    pub fn batch_id(&self) -> u64 {
        self.batch.id()
    }
}
