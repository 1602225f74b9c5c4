use anyhow::Result;
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use gpu_columnar_to_row::{
    BatchRow, ColumnarToRowExec, ConversionConfig, LoopOutcome, MetricsRegistry, NeverStop,
    SimpleCodegenContext, StopAfter, TaskContext, TaskOutcome,
};
use gpu_row_core::{BatchSource, RecordBatchSource, ReleaseLedger};
use std::sync::Arc;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("GPU columnar-to-row - Rust examples");

    // Example 1: Pull rows through the iterator
    iterator_example()?;

    // Example 2: Compiled loop with an early stop
    compiled_loop_example()?;

    // Example 3: Device-resident batches
    device_example()?;

    // Example 4: Several partitions at once
    partitions_example().await?;

    Ok(())
}

fn orders_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("customer", DataType::Utf8, true),
        Field::new("amount", DataType::Float64, true),
    ]))
}

fn orders(start: i64, n: usize) -> Result<RecordBatch> {
    let ids: Vec<i64> = (start..start + n as i64).collect();
    let customers: Vec<Option<String>> = ids
        .iter()
        .map(|i| (i % 4 != 3).then(|| format!("customer-{}", i % 10)))
        .collect();
    let amounts: Vec<Option<f64>> = ids
        .iter()
        .map(|i| (i % 5 != 0).then(|| 10.0 + *i as f64 * 2.5))
        .collect();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids)),
        Arc::new(StringArray::from(customers)),
        Arc::new(Float64Array::from(amounts)),
    ];
    Ok(RecordBatch::try_new(orders_schema(), columns)?)
}

fn orders_source(sizes: &[usize]) -> Result<RecordBatchSource> {
    let mut start = 0;
    let mut batches = Vec::with_capacity(sizes.len());
    for &n in sizes {
        batches.push(orders(start, n)?);
        start += n as i64;
    }
    Ok(RecordBatchSource::new(batches))
}

fn iterator_example() -> Result<()> {
    info!("=== Example 1: Iterator ===");

    let exec = ColumnarToRowExec::new(orders_schema(), ConversionConfig::default())?;
    let context = TaskContext::new(1, 0);
    let rows = exec.execute_iterator(Box::new(orders_source(&[3, 2])?), Arc::clone(&context));
    let metrics = Arc::clone(rows.metrics());

    for row in rows {
        let row = row?;
        info!("  {:?} ({} bytes)", row, row.as_bytes().len());
    }
    context.complete(TaskOutcome::Success);

    let snapshot = metrics.snapshot();
    info!(
        "rows_output={} batches_input={} conversion_time_ns={}",
        snapshot.rows_output, snapshot.batches_input, snapshot.conversion_time_ns
    );
    Ok(())
}

fn compiled_loop_example() -> Result<()> {
    info!("=== Example 2: Compiled loop ===");

    let exec = ColumnarToRowExec::new(orders_schema(), ConversionConfig::default())?;
    let ledger = ReleaseLedger::new();
    let source = orders_source(&[5])?.with_ledger(Arc::clone(&ledger));
    let context = TaskContext::new(2, 0);
    let mut pipeline = exec.execute_compiled(
        Box::new(source),
        Arc::clone(&context),
        true,
        &mut SimpleCodegenContext::new("emit_row"),
    )?;
    info!("Emitted loop:\n{}", pipeline.source());

    let mut consumer = |row: &BatchRow<'_>| -> Result<()> {
        info!("  consumed row {} of batch {}", row.row_index(), row.batch_id());
        Ok(())
    };

    // A downstream limit asks to stop after two rows.
    if let LoopOutcome::Suspended { row_index } = pipeline.run(&mut consumer, &mut StopAfter::new(2))? {
        info!(
            "Suspended at row {}; batches still held: {}",
            row_index,
            ledger.outstanding()
        );
    }
    let outcome = pipeline.run(&mut consumer, &mut NeverStop)?;
    info!("Resumed and {:?}; batches still held: {}", outcome, ledger.outstanding());
    context.complete(TaskOutcome::Success);
    Ok(())
}

fn device_example() -> Result<()> {
    info!("=== Example 3: Device-resident batches ===");

    let config = ConversionConfig {
        num_streams: 4,
        max_in_flight_transfers: 8,
        ..Default::default()
    };
    let exec = ColumnarToRowExec::new(orders_schema(), config)?;
    let queue = Arc::clone(exec.materializer().queue());
    let source = orders_source(&[4, 4])?.device_resident(Arc::clone(&queue));

    let count = exec
        .execute_iterator(Box::new(source), TaskContext::new(3, 0))
        .collect::<gpu_columnar_to_row::Result<Vec<_>>>()?
        .len();

    let stats = queue.stats();
    info!(
        "{} rows; {} HtoD transfers ({} bytes), {} DtoH transfers ({} bytes)",
        count, stats.host_to_device, stats.bytes_to_device, stats.device_to_host, stats.bytes_to_host
    );
    Ok(())
}

async fn partitions_example() -> Result<()> {
    info!("=== Example 4: Partitions ===");

    let exec = ColumnarToRowExec::new(orders_schema(), ConversionConfig::default())?;
    let registry = MetricsRegistry::new();
    let sources: Vec<Box<dyn BatchSource>> = vec![
        Box::new(orders_source(&[100, 50])?),
        Box::new(orders_source(&[75])?),
        Box::new(orders_source(&[10, 10, 10])?),
    ];

    let partitions = exec.execute_partitions(sources, Arc::clone(&registry)).await?;
    for (i, rows) in partitions.iter().enumerate() {
        info!("Partition {}: {} rows", i, rows.len());
    }
    for (id, snapshot) in registry.report() {
        info!("  {}: {:?}", id, snapshot);
    }
    Ok(())
}
