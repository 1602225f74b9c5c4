//! Conversion error types.

/// Errors raised while turning column batches into rows.
///
/// Every variant is fatal for the task that hit it; nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// A device-to-host copy failed while materializing a batch.
    #[error("host materialization of batch {batch_id} failed: {source:#}")]
    Materialization {
        batch_id: u64,
        #[source]
        source: anyhow::Error,
    },

    /// The upstream batch producer failed.
    #[error("batch source failed: {0:#}")]
    Source(#[source] anyhow::Error),

    /// The downstream row consumer failed.
    #[error("row consumer failed: {0:#}")]
    Consumer(#[source] anyhow::Error),

    /// A row was requested after the sequence ended.
    #[error("row sequence is exhausted")]
    Exhausted,

    /// The batch state machine was driven out of order.
    #[error("batch lifecycle violation: {0}")]
    LifecycleViolation(String),

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: u64 },

    /// The conversion was shut down and accepts no further operations.
    #[error("conversion is closed")]
    Closed,

    #[error("row {row} out of bounds for batch of {num_rows} rows")]
    RowOutOfBounds { row: usize, num_rows: usize },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A value could not be decoded from its column.
    #[error("reading field '{field}' at row {row} failed: {source:#}")]
    Extraction {
        field: String,
        row: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid conversion setup: {0:#}")]
    Config(#[source] anyhow::Error),

    #[error("partition task failed to join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ConversionError>;
