//! Batch producers.
//!
//! The real producer is the GPU compute layer upstream; this module defines
//! the seam ([`BatchSource`]) plus in-memory sources for Arrow input and
//! tests, and a [`ReleaseLedger`] for counting acquisitions and releases.

use anyhow::Result;
use arrow_array::RecordBatch;
use arrow_interop::{record_batch_to_column_batch, ColumnBatch};
use gpu_memory_manager::TransferQueue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Yields column batches in a fixed order. `Ok(None)` means drained.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Option<ColumnBatch>>;
}

impl<S: BatchSource + ?Sized> BatchSource for Box<S> {
    fn next_batch(&mut self) -> Result<Option<ColumnBatch>> {
        (**self).next_batch()
    }
}

/// Pre-built batches handed out in order.
#[derive(Debug, Default)]
pub struct VecBatchSource {
    batches: VecDeque<ColumnBatch>,
}

impl VecBatchSource {
    pub fn new(batches: Vec<ColumnBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl BatchSource for VecBatchSource {
    fn next_batch(&mut self) -> Result<Option<ColumnBatch>> {
        Ok(self.batches.pop_front())
    }
}

/// Source driven by a closure; handy for failure injection.
pub struct FnBatchSource<F>(pub F);

impl<F> BatchSource for FnBatchSource<F>
where
    F: FnMut() -> Result<Option<ColumnBatch>> + Send,
{
    fn next_batch(&mut self) -> Result<Option<ColumnBatch>> {
        (self.0)()
    }
}

/// Counts batches handed out and batches released.
///
/// Attach it to a source and compare [`acquired`](Self::acquired) with
/// [`released`](Self::released) once the task is done.
#[derive(Debug, Default)]
pub struct ReleaseLedger {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl ReleaseLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count `batch` as acquired and hook its release.
    pub fn track(self: &Arc<Self>, batch: ColumnBatch) -> ColumnBatch {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let ledger = Arc::clone(self);
        batch.with_release_hook(Box::new(move |_| {
            ledger.released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Batches handed out but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Serves Arrow record batches as column batches, optionally uploading them
/// to the device first so that consumers see device-resident data.
pub struct RecordBatchSource {
    batches: VecDeque<RecordBatch>,
    next_id: u64,
    device: Option<Arc<TransferQueue>>,
    ledger: Option<Arc<ReleaseLedger>>,
}

impl RecordBatchSource {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: batches.into(),
            next_id: 0,
            device: None,
            ledger: None,
        }
    }

    /// Upload every batch to the queue's device and drop the host copy.
    pub fn device_resident(mut self, queue: Arc<TransferQueue>) -> Self {
        self.device = Some(queue);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<ReleaseLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }
}

impl BatchSource for RecordBatchSource {
    fn next_batch(&mut self) -> Result<Option<ColumnBatch>> {
        let Some(record_batch) = self.batches.pop_front() else {
            return Ok(None);
        };
        let id = self.next_id;
        self.next_id += 1;

        let mut batch = record_batch_to_column_batch(id, &record_batch)?;
        if let Some(queue) = &self.device {
            batch.upload_to_device(queue, true)?;
            debug!("batch {} uploaded to {} device", id, queue.device().name());
        }
        Ok(Some(match &self.ledger {
            Some(ledger) => ledger.track(batch),
            None => batch,
        }))
    }
}
