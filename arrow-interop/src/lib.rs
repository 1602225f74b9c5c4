//! Arrow ↔ GPU columnar conversion utilities.
//!
//! This crate owns the column-major side of the pipeline: typed
//! [`ColumnBuffer`]s whose bytes may sit on the device, the host, or both,
//! and [`ColumnBatch`]es that group them under one Arrow schema and row count.
//!
//! # Layout contract
//!
//! Fixed-width columns are flat, little-endian, row-contiguous byte buffers:
//!
//! ```text
//! [  value[0]  |  value[1]  | ... |  value[n-1]  ]
//! ```
//!
//! Utf8 columns hold the concatenated string bytes plus `n + 1` offsets.
//! Validity is one byte per row (1 = valid); null slots hold zeroes.

pub mod column_batch;
pub mod column_buffer;
pub mod record_batch_convert;
pub mod schema_utils;

pub use column_batch::{ColumnBatch, ReleaseHook};
pub use column_buffer::{ColumnBuffer, GpuDataType, HostColumn, Residency};
pub use record_batch_convert::{record_batch_to_column_batch, record_batch_to_gpu_buffers};
pub use schema_utils::{FieldSpec, SchemaExt};
