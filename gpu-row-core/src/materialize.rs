//! Host materialization of column batches.

use arrow_interop::ColumnBatch;
use gpu_memory_manager::{SimulatedDevice, TransferQueue};
use std::sync::Arc;
use tracing::{debug, debug_span};

use crate::error::{ConversionError, Result};
use crate::ConversionConfig;

/// What a call to [`HostMaterializer::materialize`] moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub columns_transferred: usize,
    pub bytes_transferred: usize,
}

/// Makes every column of a batch host-readable before rows are read.
#[derive(Debug, Clone)]
pub struct HostMaterializer {
    queue: Arc<TransferQueue>,
}

impl HostMaterializer {
    pub fn new(queue: Arc<TransferQueue>) -> Self {
        Self { queue }
    }

    /// Materializer over a host-backed simulated device, for pipelines whose
    /// batches already live in host memory.
    pub fn simulated(config: &ConversionConfig) -> Result<Self> {
        let queue = config.transfer_queue(SimulatedDevice::new())?;
        Ok(Self::new(queue))
    }

    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    /// Copy every device-only column of `batch` to the host.
    ///
    /// Columns already on the host are left alone. The first failing copy
    /// aborts the whole batch.
    pub fn materialize(&self, batch: &mut ColumnBatch) -> Result<MaterializeStats> {
        let batch_id = batch.id();
        let span = debug_span!("materialize", batch = batch_id);
        let _enter = span.enter();

        let mut stats = MaterializeStats::default();
        for column in batch.columns_mut() {
            let transferred = column
                .ensure_host(&self.queue)
                .map_err(|source| ConversionError::Materialization { batch_id, source })?;
            if transferred {
                stats.columns_transferred += 1;
                stats.bytes_transferred += column.byte_len();
            }
        }

        debug!(
            "batch {}: {} columns ({} bytes) copied to host",
            batch_id, stats.columns_transferred, stats.bytes_transferred
        );
        Ok(stats)
    }
}
