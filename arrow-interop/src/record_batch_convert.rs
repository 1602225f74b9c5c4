//! Conversion from Arrow `RecordBatch` to `ColumnBuffer`s and `ColumnBatch`.

use anyhow::{bail, Context, Result};
use arrow_array::{
    Array, BooleanArray, Date64Array, Float32Array, Float64Array, Int16Array, Int32Array,
    Int64Array, Int8Array, RecordBatch, StringArray, TimestampMillisecondArray, UInt16Array,
    UInt32Array, UInt8Array,
};
use arrow_schema::{DataType, TimeUnit};

use crate::column_batch::ColumnBatch;
use crate::column_buffer::{ColumnBuffer, GpuDataType};

/// Convert an Arrow `RecordBatch` into a `Vec<ColumnBuffer>` (one per column).
///
/// Narrow integers are widened to `i32`, `u32` to `i64`. Null slots are
/// written as zero and flagged in the validity bytes.
pub fn record_batch_to_gpu_buffers(batch: &RecordBatch) -> Result<Vec<ColumnBuffer>> {
    let n_rows = batch.num_rows();
    let mut buffers = Vec::with_capacity(batch.num_columns());

    for (field, col) in batch.schema().fields().iter().zip(batch.columns()) {
        let buf = column_to_buffer(field.name(), col.as_ref(), n_rows)
            .with_context(|| format!("Converting column '{}'", field.name()))?;
        buffers.push(buf);
    }

    Ok(buffers)
}

/// Convert an Arrow `RecordBatch` into a host-resident [`ColumnBatch`].
pub fn record_batch_to_column_batch(id: u64, batch: &RecordBatch) -> Result<ColumnBatch> {
    let buffers = record_batch_to_gpu_buffers(batch)?;
    ColumnBatch::try_new(id, batch.schema(), buffers)
}

fn downcast<'a, T: 'static>(array: &'a dyn Array) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("Array does not match its type {:?}", array.data_type()))
}

fn column_to_buffer(name: &str, array: &dyn Array, n_rows: usize) -> Result<ColumnBuffer> {
    let validity: Option<Vec<u8>> = if array.null_count() > 0 {
        Some((0..n_rows).map(|i| u8::from(array.is_valid(i))).collect())
    } else {
        None
    };

    match array.data_type() {
        DataType::Boolean => {
            let a = downcast::<BooleanArray>(array)?;
            let data = a.iter().map(|v| u8::from(v.unwrap_or(false))).collect();
            ColumnBuffer::from_bytes(name, GpuDataType::Boolean, data, n_rows, validity)
        }
        DataType::Int8 => {
            let a = downcast::<Int8Array>(array)?;
            let data = int_to_i32_bytes(a.iter().map(|v| v.map(i32::from)));
            ColumnBuffer::from_bytes(name, GpuDataType::Int32, data, n_rows, validity)
        }
        DataType::Int16 => {
            let a = downcast::<Int16Array>(array)?;
            let data = int_to_i32_bytes(a.iter().map(|v| v.map(i32::from)));
            ColumnBuffer::from_bytes(name, GpuDataType::Int32, data, n_rows, validity)
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(array)?;
            let data = int_to_i32_bytes(a.iter());
            ColumnBuffer::from_bytes(name, GpuDataType::Int32, data, n_rows, validity)
        }
        DataType::UInt8 => {
            let a = downcast::<UInt8Array>(array)?;
            let data = int_to_i32_bytes(a.iter().map(|v| v.map(i32::from)));
            ColumnBuffer::from_bytes(name, GpuDataType::Int32, data, n_rows, validity)
        }
        DataType::UInt16 => {
            let a = downcast::<UInt16Array>(array)?;
            let data = int_to_i32_bytes(a.iter().map(|v| v.map(i32::from)));
            ColumnBuffer::from_bytes(name, GpuDataType::Int32, data, n_rows, validity)
        }
        DataType::Int64 => {
            let a = downcast::<Int64Array>(array)?;
            let data = int_to_i64_bytes(a.iter());
            ColumnBuffer::from_bytes(name, GpuDataType::Int64, data, n_rows, validity)
        }
        DataType::UInt32 => {
            let a = downcast::<UInt32Array>(array)?;
            let data = int_to_i64_bytes(a.iter().map(|v| v.map(i64::from)));
            ColumnBuffer::from_bytes(name, GpuDataType::Int64, data, n_rows, validity)
        }
        DataType::Float32 => {
            let a = downcast::<Float32Array>(array)?;
            let data = a
                .iter()
                .flat_map(|v| v.unwrap_or(0.0f32).to_le_bytes())
                .collect();
            ColumnBuffer::from_bytes(name, GpuDataType::Float32, data, n_rows, validity)
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(array)?;
            let data = a
                .iter()
                .flat_map(|v| v.unwrap_or(0.0f64).to_le_bytes())
                .collect();
            ColumnBuffer::from_bytes(name, GpuDataType::Float64, data, n_rows, validity)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let a = downcast::<TimestampMillisecondArray>(array)?;
            let data = int_to_i64_bytes(a.iter());
            ColumnBuffer::from_bytes(name, GpuDataType::TimestampMs, data, n_rows, validity)
        }
        DataType::Date64 => {
            let a = downcast::<Date64Array>(array)?;
            let data = int_to_i64_bytes(a.iter());
            ColumnBuffer::from_bytes(name, GpuDataType::TimestampMs, data, n_rows, validity)
        }
        DataType::Utf8 => {
            let a = downcast::<StringArray>(array)?;
            let (values, offsets) = string_to_value_bytes(a);
            ColumnBuffer::from_utf8(name, values, offsets, validity)
        }
        other => bail!("Unsupported column type for GPU conversion: {:?}", other),
    }
}

fn int_to_i32_bytes(iter: impl Iterator<Item = Option<i32>>) -> Vec<u8> {
    iter.flat_map(|v| v.unwrap_or(0i32).to_le_bytes()).collect()
}

fn int_to_i64_bytes(iter: impl Iterator<Item = Option<i64>>) -> Vec<u8> {
    iter.flat_map(|v| v.unwrap_or(0i64).to_le_bytes()).collect()
}

/// Re-pack a (possibly sliced) `StringArray` into zero-based offsets.
fn string_to_value_bytes(array: &StringArray) -> (Vec<u8>, Vec<i32>) {
    let mut values = Vec::new();
    let mut offsets = Vec::with_capacity(array.len() + 1);
    offsets.push(0i32);
    for v in array.iter() {
        if let Some(s) = v {
            values.extend_from_slice(s.as_bytes());
        }
        offsets.push(values.len() as i32);
    }
    (values, offsets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
