//! Source emission for the compiled columnar-to-row loop.
//!
//! The host pipeline compiler stitches fragments from many operators into one
//! function. This module renders the fragment for the row loop: acquire a
//! batch, walk it from the persisted cursor, produce each field, hand the row
//! to the downstream consume code and optionally check for an early stop.
//! The returned [`CompiledLoop`] also carries the equivalent executable form.

use anyhow::{ensure, Result};
use arrow_interop::{FieldSpec, GpuDataType};
use gpu_row_core::RowProjection;
use std::fmt::Write;
use tracing::debug;

use crate::compiled_loop::CompiledLoop;

/// Marker emitted in place of an elided early-stop check.
pub const STOP_CHECK_ELIDED: &str = "// should_stop check is elided";

/// A produced field: the variables holding it and the code that fills them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnVar {
    pub value: String,
    pub is_null: String,
    pub code: String,
    pub dtype: GpuDataType,
}

/// Hooks the host pipeline compiler provides to an emitting operator.
pub trait CodegenContext {
    /// A fresh identifier starting with `prefix`.
    fn fresh_name(&mut self, prefix: &str) -> String;

    /// Downstream code consuming one row made of `row`.
    fn consume(&mut self, row: &[ColumnVar]) -> String;
}

/// Context that numbers identifiers and calls one downstream function.
#[derive(Debug, Clone)]
pub struct SimpleCodegenContext {
    consumer: String,
    counter: usize,
}

impl SimpleCodegenContext {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            counter: 0,
        }
    }
}

impl CodegenContext for SimpleCodegenContext {
    fn fresh_name(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn consume(&mut self, row: &[ColumnVar]) -> String {
        let args: Vec<String> = row
            .iter()
            .map(|v| format!("({}, {})", v.value, v.is_null))
            .collect();
        format!("{}(&[{}])?;", self.consumer, args.join(", "))
    }
}

/// What to emit a loop for.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub fields: Vec<FieldSpec>,
    /// Whether a downstream operator may ask the loop to stop early.
    pub needs_stop_check: bool,
}

impl LoopSpec {
    pub fn from_projection(projection: &RowProjection, needs_stop_check: bool) -> Self {
        Self {
            fields: projection.fields().to_vec(),
            needs_stop_check,
        }
    }
}

fn accessor(dtype: GpuDataType) -> (&'static str, &'static str) {
    match dtype {
        GpuDataType::Boolean => ("read_bool", "false"),
        GpuDataType::Int32 => ("read_i32", "0i32"),
        GpuDataType::Int64 | GpuDataType::TimestampMs => ("read_i64", "0i64"),
        GpuDataType::Float32 => ("read_f32", "0.0f32"),
        GpuDataType::Float64 => ("read_f64", "0.0f64"),
        GpuDataType::Utf8 => ("read_str", "\"\""),
    }
}

fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn indent(code: &str, depth: usize) -> String {
    let pad = "    ".repeat(depth);
    code.lines()
        .map(|l| if l.is_empty() { String::new() } else { format!("{pad}{l}") })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct LoopCodegen;

impl LoopCodegen {
    pub fn new() -> Self {
        LoopCodegen
    }

    /// Per-field "produce value" snippet. Nullable fields test validity first.
    fn produce_field(
        &self,
        field: &FieldSpec,
        batch: &str,
        idx: &str,
        ctx: &mut dyn CodegenContext,
    ) -> Result<ColumnVar> {
        let value = ctx.fresh_name("value");
        let is_null = ctx.fresh_name("is_null");
        ensure!(
            is_ident(&value) && is_ident(&is_null),
            "codegen context produced invalid identifiers '{}' / '{}'",
            value,
            is_null
        );
        let (read, default) = accessor(field.dtype);
        let column = format!("{}.column({}).host_column()?", batch, field.ordinal);
        let code = if field.nullable {
            format!(
                "let {is_null} = !{column}.is_valid({idx});\n\
                 let {value} = if {is_null} {{ {default} }} else {{ {column}.{read}({idx}) }};"
            )
        } else {
            format!(
                "let {is_null} = false;\n\
                 let {value} = {column}.{read}({idx});"
            )
        };
        Ok(ColumnVar {
            value,
            is_null,
            code,
            dtype: field.dtype,
        })
    }

    /// Render the loop for `spec`.
    pub fn emit(&self, spec: &LoopSpec, ctx: &mut dyn CodegenContext) -> Result<CompiledLoop> {
        debug!(
            "Codegen row loop: {} fields, stop check {}",
            spec.fields.len(),
            if spec.needs_stop_check { "on" } else { "elided" }
        );
        let batch = ctx.fresh_name("batch");
        let num_rows = ctx.fresh_name("num_rows");
        let idx = ctx.fresh_name("row_idx");
        for name in [&batch, &num_rows, &idx] {
            ensure!(is_ident(name), "codegen context produced invalid identifier '{}'", name);
        }

        let columns = spec
            .fields
            .iter()
            .map(|f| self.produce_field(f, &batch, &idx, ctx))
            .collect::<Result<Vec<_>>>()?;

        let mut body = String::new();
        for column in &columns {
            writeln!(body, "{}", column.code)?;
        }
        writeln!(body, "{}", ctx.consume(&columns))?;
        writeln!(body, "{idx} += 1;")?;
        if spec.needs_stop_check {
            write!(
                body,
                "if self.should_stop() {{\n    self.batch_idx = {idx};\n    return Ok(());\n}}"
            )?;
        } else {
            write!(body, "{STOP_CHECK_ELIDED}")?;
        }

        let source = format!(
            "if self.current_batch.is_none() {{\n\
             \x20   self.next_batch()?;\n\
             }}\n\
             while let Some({batch}) = self.current_batch.as_ref() {{\n\
             \x20   let {num_rows} = {batch}.num_rows();\n\
             \x20   let mut {idx} = self.batch_idx;\n\
             \x20   while {idx} < {num_rows} {{\n\
             {body}\n\
             \x20   }}\n\
             \x20   self.batch_idx = 0;\n\
             \x20   self.release_batch();\n\
             \x20   self.next_batch()?;\n\
             }}\n",
            body = indent(&body, 2),
        );

        Ok(CompiledLoop::new(source, spec.fields.clone(), spec.needs_stop_check))
    }
}

impl Default for LoopCodegen {
    fn default() -> Self {
        Self::new()
    }
}
