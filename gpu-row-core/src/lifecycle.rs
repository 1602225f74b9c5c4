//! Batch lifecycle state machine.
//!
//! One [`BatchLifecycle`] per task instance owns at most one current batch and
//! moves it through
//!
//! ```text
//! Empty -> Loading -> Ready -> Exhausted -> Empty
//!   \________\__________\_________\______-> Closed
//! ```
//!
//! The current batch lives in a slot shared with a completion listener on the
//! task's [`TaskContext`], so a task that ends mid-batch (success, failure or
//! cancellation) still releases it. Both row protocols drive this type.

use arrow_interop::ColumnBatch;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, debug_span, info};

use crate::context::TaskContext;
use crate::error::{ConversionError, Result};
use crate::materialize::HostMaterializer;
use crate::metrics::ConversionMetrics;
use crate::source::BatchSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No current batch.
    Empty,
    /// Pulling and materializing the next batch.
    Loading,
    /// Current batch has unread rows.
    Ready,
    /// Every row of the current batch was read; it must be released.
    Exhausted,
    /// Shut down; every operation fails with [`ConversionError::Closed`].
    Closed,
}

/// Read position within the current batch. `row_index <= num_rows` always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionCursor {
    row_index: usize,
    num_rows: usize,
}

impl ConversionCursor {
    pub fn new(num_rows: usize) -> Self {
        Self {
            row_index: 0,
            num_rows,
        }
    }

    pub fn row_index(&self) -> usize {
        self.row_index
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn remaining(&self) -> usize {
        self.num_rows - self.row_index
    }

    pub fn is_exhausted(&self) -> bool {
        self.row_index == self.num_rows
    }
}

struct Slot {
    batch: Option<ColumnBatch>,
    cursor: ConversionCursor,
    state: LifecycleState,
}

impl Slot {
    /// Release the current batch and close. Returns `false` if already closed.
    fn shutdown(&mut self) -> bool {
        if self.state == LifecycleState::Closed {
            return false;
        }
        self.state = LifecycleState::Closed;
        self.cursor = ConversionCursor::default();
        if let Some(batch) = self.batch.take() {
            batch.close();
        }
        true
    }
}

fn unexpected(op: &str, state: LifecycleState) -> ConversionError {
    match state {
        LifecycleState::Closed => ConversionError::Closed,
        other => ConversionError::LifecycleViolation(format!("{op} in state {other:?}")),
    }
}

/// Mutable access to the current batch and its cursor, handed out by
/// [`BatchLifecycle::with_active`].
pub struct ActiveBatch<'a> {
    batch: &'a ColumnBatch,
    cursor: &'a mut ConversionCursor,
    state: &'a mut LifecycleState,
}

impl<'a> ActiveBatch<'a> {
    pub fn batch(&self) -> &'a ColumnBatch {
        self.batch
    }

    pub fn row_index(&self) -> usize {
        self.cursor.row_index
    }

    pub fn num_rows(&self) -> usize {
        self.cursor.num_rows
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Move past the current row.
    pub fn advance(&mut self) -> Result<()> {
        let next = self.cursor.row_index + 1;
        self.set_row_index(next)
    }

    /// Persist the cursor. Reaching `num_rows` marks the batch exhausted.
    pub fn set_row_index(&mut self, row_index: usize) -> Result<()> {
        if row_index > self.cursor.num_rows {
            return Err(ConversionError::RowOutOfBounds {
                row: row_index,
                num_rows: self.cursor.num_rows,
            });
        }
        self.cursor.row_index = row_index;
        if self.cursor.is_exhausted() {
            *self.state = LifecycleState::Exhausted;
        }
        Ok(())
    }
}

pub struct BatchLifecycle {
    source: Box<dyn BatchSource>,
    materializer: HostMaterializer,
    metrics: Arc<ConversionMetrics>,
    context: Arc<TaskContext>,
    slot: Arc<Mutex<Slot>>,
    drained: bool,
}

impl BatchLifecycle {
    /// Create the manager and register its release hook on `context`.
    pub fn new(
        source: Box<dyn BatchSource>,
        materializer: HostMaterializer,
        context: Arc<TaskContext>,
        metrics: Arc<ConversionMetrics>,
    ) -> Self {
        let slot = Arc::new(Mutex::new(Slot {
            batch: None,
            cursor: ConversionCursor::default(),
            state: LifecycleState::Empty,
        }));

        let hook_slot = Arc::clone(&slot);
        let task_id = context.task_id();
        context.add_completion_listener(Box::new(move |outcome| {
            if hook_slot.lock().shutdown() {
                debug!("task {} ended ({:?}); current batch released", task_id, outcome);
            }
        }));

        info!(
            "columnar-to-row conversion started: task {}, partition {}",
            context.task_id(),
            context.partition_id()
        );
        Self {
            source,
            materializer,
            metrics,
            context,
            slot,
            drained: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.slot.lock().state
    }

    pub fn cursor(&self) -> ConversionCursor {
        self.slot.lock().cursor
    }

    pub fn current_batch_id(&self) -> Option<u64> {
        self.slot.lock().batch.as_ref().map(ColumnBatch::id)
    }

    /// The source reported end-of-data.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn metrics(&self) -> &Arc<ConversionMetrics> {
        &self.metrics
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    /// Acquire and materialize the next batch.
    ///
    /// Returns `Ok(false)` once the source is drained; the manager then stays
    /// `Empty` for good. Only valid in `Empty`.
    pub fn load_next(&mut self) -> Result<bool> {
        {
            let mut slot = self.slot.lock();
            if slot.state != LifecycleState::Empty {
                return Err(unexpected("load", slot.state));
            }
            if self.drained {
                return Ok(false);
            }
            if self.context.is_cancelled() {
                slot.shutdown();
                return Err(ConversionError::Cancelled {
                    task_id: self.context.task_id(),
                });
            }
            slot.state = LifecycleState::Loading;
        }

        let span = debug_span!("acquire_batch", task = self.context.task_id());
        let _enter = span.enter();

        let mut batch = match self.source.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                let mut slot = self.slot.lock();
                if slot.state == LifecycleState::Closed {
                    return Err(ConversionError::Closed);
                }
                slot.state = LifecycleState::Empty;
                self.drained = true;
                debug!("task {}: source drained", self.context.task_id());
                return Ok(false);
            }
            Err(e) => {
                self.slot.lock().shutdown();
                return Err(ConversionError::Source(e));
            }
        };

        let materializer = &self.materializer;
        if let Err(e) = self.metrics.time(|| materializer.materialize(&mut batch)) {
            batch.close();
            self.slot.lock().shutdown();
            return Err(e);
        }

        let n = batch.num_rows();
        let mut slot = self.slot.lock();
        if slot.state == LifecycleState::Closed {
            drop(slot);
            batch.close();
            return Err(ConversionError::Closed);
        }
        self.metrics.record_batch(n);
        slot.cursor = ConversionCursor::new(n);
        slot.state = if n == 0 {
            LifecycleState::Exhausted
        } else {
            LifecycleState::Ready
        };
        debug!("batch {} ready with {} rows", batch.id(), n);
        slot.batch = Some(batch);
        Ok(true)
    }

    /// Release the drained current batch. Only valid in `Exhausted`.
    pub fn release_current(&mut self) -> Result<()> {
        let batch = {
            let mut slot = self.slot.lock();
            if slot.state != LifecycleState::Exhausted {
                return Err(unexpected("release", slot.state));
            }
            slot.state = LifecycleState::Empty;
            slot.cursor = ConversionCursor::default();
            slot.batch.take()
        };
        if let Some(batch) = batch {
            batch.close();
        }
        Ok(())
    }

    /// Run `f` against the current batch. Only valid in `Ready`.
    ///
    /// The batch is checked out of the slot while `f` runs, so `f` may
    /// complete its own task. A completion that lands meanwhile closes the
    /// lifecycle at once and the batch is released as soon as `f` returns.
    pub fn with_active<R>(&self, f: impl FnOnce(&mut ActiveBatch<'_>) -> R) -> Result<R> {
        let (batch, mut cursor) = {
            let mut slot = self.slot.lock();
            if slot.state != LifecycleState::Ready {
                return Err(unexpected("row access", slot.state));
            }
            let batch = slot.batch.take().ok_or_else(|| {
                ConversionError::LifecycleViolation("current batch is already checked out".into())
            })?;
            (batch, slot.cursor)
        };

        let mut state = LifecycleState::Ready;
        let out = f(&mut ActiveBatch {
            batch: &batch,
            cursor: &mut cursor,
            state: &mut state,
        });

        let mut slot = self.slot.lock();
        if slot.state == LifecycleState::Closed {
            drop(slot);
            debug!(
                "task {}: batch {} released on return from row access",
                self.context.task_id(),
                batch.id()
            );
            batch.close();
            return Ok(out);
        }
        slot.cursor = cursor;
        slot.state = state;
        slot.batch = Some(batch);
        Ok(out)
    }

    /// Release anything held and close. Idempotent.
    pub fn close(&mut self) {
        if self.slot.lock().shutdown() {
            info!(
                "columnar-to-row conversion closed: task {}",
                self.context.task_id()
            );
        }
    }
}

impl Drop for BatchLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BatchLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("BatchLifecycle")
            .field("state", &slot.state)
            .field("cursor", &slot.cursor)
            .field("drained", &self.drained)
            .field("task_id", &self.context.task_id())
            .finish()
    }
}
