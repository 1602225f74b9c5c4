use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{TaskContext, TaskOutcome};
use crate::error::{ConversionError, Result};
use crate::iterator::ColumnarToRowIterator;
use crate::lifecycle::BatchLifecycle;
use crate::materialize::HostMaterializer;
use crate::metrics::{ConversionMetrics, MetricsRegistry};
use crate::row::{Row, RowProjection};
use crate::source::BatchSource;
use crate::ConversionConfig;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Convert every partition concurrently, one blocking task per partition.
///
/// Each partition gets its own [`TaskContext`], lifecycle and metrics; the
/// metrics are registered as `"{operator_name}[{partition}]"`. Rows come back
/// grouped by partition, in source order. The first failing partition's error
/// is returned once all partitions have finished.
pub async fn execute_partitions(
    sources: Vec<Box<dyn BatchSource>>,
    projection: RowProjection,
    config: &ConversionConfig,
    materializer: HostMaterializer,
    registry: Arc<MetricsRegistry>,
) -> Result<Vec<Vec<Row>>> {
    info!(
        "Executing {} partitions through {}",
        sources.len(),
        config.operator_name
    );
    let mut handles = Vec::with_capacity(sources.len());
    for (partition, source) in sources.into_iter().enumerate() {
        let metrics = ConversionMetrics::new();
        registry.register(
            format!("{}[{}]", config.operator_name, partition),
            Arc::clone(&metrics),
        );
        let context = TaskContext::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed), partition);
        let projection = projection.clone();
        let materializer = materializer.clone();
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            run_partition(context, source, projection, &config, materializer, metrics)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await?);
    }
    results.into_iter().collect()
}

/// Drain one partition on the calling thread and complete its context.
pub fn run_partition(
    context: Arc<TaskContext>,
    source: Box<dyn BatchSource>,
    projection: RowProjection,
    config: &ConversionConfig,
    materializer: HostMaterializer,
    metrics: Arc<ConversionMetrics>,
) -> Result<Vec<Row>> {
    let lifecycle = BatchLifecycle::new(source, materializer, Arc::clone(&context), metrics);
    let mut rows = ColumnarToRowIterator::new(lifecycle, projection, config);
    let result: Result<Vec<Row>> = rows.by_ref().collect();

    let outcome = match &result {
        Ok(_) => TaskOutcome::Success,
        Err(ConversionError::Cancelled { .. }) => TaskOutcome::Cancelled,
        Err(_) => TaskOutcome::Failure,
    };
    context.complete(outcome);
    debug!(
        "partition {} finished: {:?}, {:?}",
        context.partition_id(),
        outcome,
        rows.metrics().snapshot()
    );
    result
}
