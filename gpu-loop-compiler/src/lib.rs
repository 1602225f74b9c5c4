//! Compiled (push-based) columnar-to-row protocol.
//!
//! [`LoopCodegen`] renders the row loop for a host pipeline compiler and
//! returns a [`CompiledLoop`] that runs the same loop against a
//! [`gpu_row_core::BatchLifecycle`].

pub mod codegen;
pub mod compiled_loop;

pub use codegen::{CodegenContext, ColumnVar, LoopCodegen, LoopSpec, SimpleCodegenContext, STOP_CHECK_ELIDED};
pub use compiled_loop::{CompiledLoop, LoopOutcome, NeverStop, RowConsumer, StopAfter, StopCheck};
