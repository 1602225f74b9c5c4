use anyhow::Result;
use arrow_schema::Schema;

use crate::column_buffer::GpuDataType;

/// How one output field is read out of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Column index in the batch.
    pub ordinal: usize,
    pub name: String,
    pub dtype: GpuDataType,
    pub nullable: bool,
}

pub trait SchemaExt {
    fn project_by_name(&self, names: &[&str]) -> Result<Vec<usize>>;
    fn field_specs(&self) -> Result<Vec<FieldSpec>>;
    fn is_gpu_compatible(&self) -> bool;
    fn is_fixed_width(&self) -> bool;
}

impl SchemaExt for Schema {
    /// Resolve column names to ordinals, in the order given.
    fn project_by_name(&self, names: &[&str]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|n| {
                self.index_of(n)
                    .map_err(|_| anyhow::anyhow!("Column '{}' not found", n))
            })
            .collect()
    }

    fn field_specs(&self) -> Result<Vec<FieldSpec>> {
        self.fields()
            .iter()
            .enumerate()
            .map(|(ordinal, f)| {
                Ok(FieldSpec {
                    ordinal,
                    name: f.name().clone(),
                    dtype: GpuDataType::from_arrow(f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect()
    }

    fn is_gpu_compatible(&self) -> bool {
        self.fields()
            .iter()
            .all(|f| GpuDataType::from_arrow(f.data_type()).is_ok())
    }

    fn is_fixed_width(&self) -> bool {
        self.fields().iter().all(|f| {
            GpuDataType::from_arrow(f.data_type()).map_or(false, GpuDataType::is_fixed_width)
        })
    }
}
