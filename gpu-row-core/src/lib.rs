//! Columnar-to-row conversion core.
//!
//! Column batches come from a [`BatchSource`], are made host-readable by a
//! [`HostMaterializer`] and are then read row by row. A [`BatchLifecycle`]
//! owns the current batch and guarantees it is released exactly once; the
//! pull protocol ([`ColumnarToRowIterator`]) lives here, the compiled push
//! protocol in `gpu-loop-compiler`. Both feed the same [`ConversionMetrics`].

use gpu_memory_manager::{DeviceMemory, TransferQueue};
use std::sync::Arc;

pub mod context;
pub mod error;
pub mod executor;
pub mod extract;
pub mod fixed_width;
pub mod iterator;
pub mod lifecycle;
pub mod materialize;
pub mod metrics;
pub mod row;
pub mod source;

pub use context::{CompletionListener, TaskContext, TaskOutcome};
pub use error::{ConversionError, Result};
pub use executor::{execute_partitions, run_partition};
pub use extract::{extract, BatchRow, Datum, FieldValue};
pub use fixed_width::PackedRows;
pub use iterator::ColumnarToRowIterator;
pub use lifecycle::{ActiveBatch, BatchLifecycle, ConversionCursor, LifecycleState};
pub use materialize::{HostMaterializer, MaterializeStats};
pub use metrics::{ConversionMetrics, Metric, MetricsRegistry, MetricsSnapshot};
pub use row::{Row, RowLayout, RowProjection, ScalarValue};
pub use source::{BatchSource, FnBatchSource, RecordBatchSource, ReleaseLedger, VecBatchSource};

#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Streams used for device-to-host copies
    pub num_streams: usize,
    /// Upper bound on concurrent transfers
    pub max_in_flight_transfers: usize,
    /// Convert all-fixed-width batches in one block instead of row by row
    pub enable_fixed_width_fast_path: bool,
    /// Widest schema eligible for block conversion
    pub fixed_width_max_columns: usize,
    /// Operator name used for metrics registration
    pub operator_name: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            num_streams: 8,
            max_in_flight_transfers: 32,
            enable_fixed_width_fast_path: true,
            fixed_width_max_columns: 100,
            operator_name: "GpuColumnarToRow".to_string(),
        }
    }
}

impl ConversionConfig {
    /// Transfer queue over `device` sized by this config.
    pub fn transfer_queue(&self, device: Arc<dyn DeviceMemory>) -> Result<Arc<TransferQueue>> {
        TransferQueue::new(device, self.num_streams, self.max_in_flight_transfers)
            .map(Arc::new)
            .map_err(ConversionError::Config)
    }
}
