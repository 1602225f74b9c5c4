//! GPU columnar-to-row conversion.
//!
//! [`ColumnarToRowExec`] is the operator: it is built once per plan from the
//! input schema and a [`ConversionConfig`], then instantiated per task as
//! either a pull iterator or a compiled push loop. Both drive the same batch
//! lifecycle and report the same metrics.

use arrow_schema::SchemaRef;
use gpu_memory_manager::{DeviceMemory, SimulatedDevice};
use std::sync::Arc;
use tracing::info;

pub use arrow_interop::{ColumnBatch, ColumnBuffer, FieldSpec, GpuDataType};
pub use gpu_loop_compiler::{
    CodegenContext, CompiledLoop, LoopCodegen, LoopOutcome, LoopSpec, NeverStop, RowConsumer,
    SimpleCodegenContext, StopAfter, StopCheck,
};
pub use gpu_row_core::{
    BatchLifecycle, BatchRow, BatchSource, ColumnarToRowIterator, ConversionConfig,
    ConversionError, ConversionMetrics, HostMaterializer, LifecycleState, MetricsRegistry,
    MetricsSnapshot, Result, Row, RowProjection, ScalarValue, TaskContext, TaskOutcome,
};

/// Columnar-to-row operator.
#[derive(Debug, Clone)]
pub struct ColumnarToRowExec {
    config: ConversionConfig,
    schema: SchemaRef,
    projection: RowProjection,
    materializer: HostMaterializer,
}

impl ColumnarToRowExec {
    /// Operator over host-backed simulated device memory.
    pub fn new(schema: SchemaRef, config: ConversionConfig) -> Result<Self> {
        Self::with_device(schema, config, SimulatedDevice::new())
    }

    /// Operator whose batches live on `device`.
    pub fn with_device(
        schema: SchemaRef,
        config: ConversionConfig,
        device: Arc<dyn DeviceMemory>,
    ) -> Result<Self> {
        let projection = RowProjection::from_schema(&schema, None)?;
        let materializer = HostMaterializer::new(config.transfer_queue(device)?);
        info!(
            "{}: {} fields, device {}",
            config.operator_name,
            schema.fields().len(),
            materializer.queue().device().name()
        );
        Ok(Self {
            config,
            schema,
            projection,
            materializer,
        })
    }

    /// Emit only the fields at `ordinals`, in that order.
    pub fn with_projection(mut self, ordinals: &[usize]) -> Result<Self> {
        self.projection = RowProjection::from_schema(&self.schema, Some(ordinals))?;
        Ok(self)
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn projection(&self) -> &RowProjection {
        &self.projection
    }

    pub fn materializer(&self) -> &HostMaterializer {
        &self.materializer
    }

    fn lifecycle(&self, source: Box<dyn BatchSource>, context: Arc<TaskContext>) -> BatchLifecycle {
        BatchLifecycle::new(
            source,
            self.materializer.clone(),
            context,
            ConversionMetrics::new(),
        )
    }

    /// Pull protocol for one task.
    pub fn execute_iterator(
        &self,
        source: Box<dyn BatchSource>,
        context: Arc<TaskContext>,
    ) -> ColumnarToRowIterator {
        ColumnarToRowIterator::new(
            self.lifecycle(source, context),
            self.projection.clone(),
            &self.config,
        )
    }

    /// Push protocol for one task: emits the loop and binds it to a lifecycle.
    pub fn execute_compiled(
        &self,
        source: Box<dyn BatchSource>,
        context: Arc<TaskContext>,
        needs_stop_check: bool,
        codegen: &mut dyn CodegenContext,
    ) -> Result<CompiledPipeline> {
        let spec = LoopSpec::from_projection(&self.projection, needs_stop_check);
        let compiled = LoopCodegen::new()
            .emit(&spec, codegen)
            .map_err(ConversionError::Config)?;
        Ok(CompiledPipeline {
            compiled,
            lifecycle: self.lifecycle(source, context),
        })
    }

    /// Run every partition through the pull protocol concurrently.
    pub async fn execute_partitions(
        &self,
        sources: Vec<Box<dyn BatchSource>>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Vec<Vec<Row>>> {
        gpu_row_core::execute_partitions(
            sources,
            self.projection.clone(),
            &self.config,
            self.materializer.clone(),
            registry,
        )
        .await
    }
}

/// A compiled loop bound to the lifecycle of one task.
pub struct CompiledPipeline {
    compiled: CompiledLoop,
    lifecycle: BatchLifecycle,
}

impl CompiledPipeline {
    pub fn run(
        &mut self,
        consumer: &mut dyn RowConsumer,
        stop: &mut dyn StopCheck,
    ) -> Result<LoopOutcome> {
        self.compiled.run(&mut self.lifecycle, consumer, stop)
    }

    /// Rendered source of the loop.
    pub fn source(&self) -> &str {
        self.compiled.source()
    }

    pub fn lifecycle(&self) -> &BatchLifecycle {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<ConversionMetrics> {
        self.lifecycle.metrics()
    }

    pub fn close(&mut self) {
        self.lifecycle.close();
    }
}
