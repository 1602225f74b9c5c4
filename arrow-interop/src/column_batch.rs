//! A batch of columns sharing one row count.

use anyhow::{bail, Result};
use arrow_schema::SchemaRef;
use gpu_memory_manager::TransferQueue;
use std::fmt;
use tracing::{debug, warn};

use crate::column_buffer::{ColumnBuffer, GpuDataType};

/// Called exactly once when a batch is released, with the batch id.
pub type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// An ordered set of [`ColumnBuffer`]s with a common row count.
///
/// A batch is released exactly once, either explicitly through
/// [`ColumnBatch::close`] or, as a backstop, when it is dropped unclosed.
pub struct ColumnBatch {
    id: u64,
    schema: SchemaRef,
    columns: Vec<ColumnBuffer>,
    n_rows: usize,
    on_release: Option<ReleaseHook>,
    released: bool,
}

impl ColumnBatch {
    pub fn try_new(id: u64, schema: SchemaRef, columns: Vec<ColumnBuffer>) -> Result<Self> {
        if columns.len() != schema.fields().len() {
            bail!(
                "Batch {} has {} columns but schema has {} fields",
                id,
                columns.len(),
                schema.fields().len()
            );
        }
        let n_rows = columns.first().map_or(0, |c| c.n_rows);
        for (col, field) in columns.iter().zip(schema.fields()) {
            if col.n_rows != n_rows {
                bail!(
                    "Column '{}' has {} rows, expected {}",
                    col.name,
                    col.n_rows,
                    n_rows
                );
            }
            let expected = GpuDataType::from_arrow(field.data_type())?;
            if col.dtype != expected {
                bail!(
                    "Column '{}' is {:?} but field '{}' maps to {:?}",
                    col.name,
                    col.dtype,
                    field.name(),
                    expected
                );
            }
        }

        Ok(Self {
            id,
            schema,
            columns,
            n_rows,
            on_release: None,
            released: false,
        })
    }

    /// Attach a hook run when the batch is released.
    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.on_release = Some(hook);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.n_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, i: usize) -> &ColumnBuffer {
        &self.columns[i]
    }

    pub fn columns(&self) -> &[ColumnBuffer] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [ColumnBuffer] {
        &mut self.columns
    }

    pub fn is_host_resident(&self) -> bool {
        self.columns.iter().all(ColumnBuffer::is_host_resident)
    }

    /// Move every column to the device; see [`ColumnBuffer::upload_to_device`].
    pub fn upload_to_device(&mut self, queue: &TransferQueue, evict_host: bool) -> Result<()> {
        for col in &mut self.columns {
            col.upload_to_device(queue, evict_host)?;
        }
        Ok(())
    }

    /// Release the batch.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Device and host buffers go with the columns.
        self.columns.clear();
        if let Some(hook) = self.on_release.take() {
            hook(self.id);
        }
        debug!("batch {} released", self.id);
    }
}

impl Drop for ColumnBatch {
    fn drop(&mut self) {
        if !self.released {
            warn!("batch {} dropped without close; releasing", self.id);
            self.release();
        }
    }
}

impl fmt::Debug for ColumnBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnBatch")
            .field("id", &self.id)
            .field("n_rows", &self.n_rows)
            .field("columns", &self.columns.len())
            .field("released", &self.released)
            .finish()
    }
}
