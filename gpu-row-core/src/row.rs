//! Canonical owned rows.
//!
//! A [`Row`] is a packed record that stays valid after its source batch has
//! been released:
//!
//! ```text
//! [ null bitset: ceil(f/64) words ][ f x 8-byte slots ][ variable region ]
//! ```
//!
//! Fixed-width values sit little-endian in the low bytes of their slot.
//! A Utf8 slot holds `(offset << 32) | len`, with `offset` counted from the
//! start of the row; each string in the variable region is padded to 8 bytes.
//! A null field has its bit set and an all-zero slot.

use arrow_interop::{ColumnBatch, FieldSpec, GpuDataType, SchemaExt};
use arrow_schema::Schema;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{ConversionError, Result};
use crate::extract::{BatchRow, Datum, FieldValue};

const SLOT: usize = 8;

/// Column types and byte geometry shared by every row of one projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    names: Vec<String>,
    dtypes: Vec<GpuDataType>,
    null_bitset_bytes: usize,
}

impl RowLayout {
    pub fn new(fields: &[FieldSpec]) -> Self {
        Self {
            names: fields.iter().map(|f| f.name.clone()).collect(),
            dtypes: fields.iter().map(|f| f.dtype).collect(),
            null_bitset_bytes: fields.len().div_ceil(64) * 8,
        }
    }

    pub fn num_fields(&self) -> usize {
        self.dtypes.len()
    }

    pub fn dtypes(&self) -> &[GpuDataType] {
        &self.dtypes
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn null_bitset_bytes(&self) -> usize {
        self.null_bitset_bytes
    }

    /// Bytes before the variable region; the whole row when fixed width.
    pub fn fixed_width(&self) -> usize {
        self.null_bitset_bytes + self.dtypes.len() * SLOT
    }

    pub fn is_fixed_width(&self) -> bool {
        self.dtypes.iter().all(|d| d.is_fixed_width())
    }

    pub(crate) fn slot_offset(&self, i: usize) -> usize {
        self.null_bitset_bytes + i * SLOT
    }
}

/// An owned value, decoded from a [`Row`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    TimestampMs(i64),
    Utf8(String),
}

impl From<Datum<'_>> for ScalarValue {
    fn from(d: Datum<'_>) -> Self {
        match d {
            Datum::Boolean(v) => ScalarValue::Boolean(v),
            Datum::Int32(v) => ScalarValue::Int32(v),
            Datum::Int64(v) => ScalarValue::Int64(v),
            Datum::Float32(v) => ScalarValue::Float32(v),
            Datum::Float64(v) => ScalarValue::Float64(v),
            Datum::TimestampMs(v) => ScalarValue::TimestampMs(v),
            Datum::Utf8(v) => ScalarValue::Utf8(v.to_string()),
        }
    }
}

/// Slot bits for a fixed-width value.
fn fixed_slot(datum: &Datum<'_>) -> u64 {
    match *datum {
        Datum::Boolean(v) => v as u64,
        Datum::Int32(v) => v as u32 as u64,
        Datum::Int64(v) | Datum::TimestampMs(v) => v as u64,
        Datum::Float32(v) => v.to_bits() as u64,
        Datum::Float64(v) => v.to_bits(),
        Datum::Utf8(_) => 0,
    }
}

struct RowWriter<'l> {
    layout: &'l RowLayout,
    bytes: Vec<u8>,
}

impl<'l> RowWriter<'l> {
    fn new(layout: &'l RowLayout) -> Self {
        Self {
            layout,
            bytes: vec![0u8; layout.fixed_width()],
        }
    }

    fn write(&mut self, i: usize, value: &FieldValue<'_>) -> Result<()> {
        let expected = self.layout.dtypes[i];
        if value.datum.dtype() != expected {
            return Err(ConversionError::SchemaMismatch(format!(
                "field '{}' is {:?}, got a {:?} value",
                self.layout.names[i],
                expected,
                value.datum.dtype()
            )));
        }
        if value.is_null {
            self.bytes[i >> 3] |= 1 << (i & 7);
            return Ok(());
        }
        let slot = match value.datum {
            Datum::Utf8(s) => self.append_var(i, s.as_bytes())?,
            ref d => fixed_slot(d),
        };
        let at = self.layout.slot_offset(i);
        self.bytes[at..at + SLOT].copy_from_slice(&slot.to_le_bytes());
        Ok(())
    }

    fn append_var(&mut self, i: usize, data: &[u8]) -> Result<u64> {
        let too_large = || {
            ConversionError::SchemaMismatch(format!(
                "field '{}' does not fit a row's 32-bit offsets",
                self.layout.names[i]
            ))
        };
        let offset = u32::try_from(self.bytes.len()).map_err(|_| too_large())?;
        let len = u32::try_from(data.len()).map_err(|_| too_large())?;
        self.bytes.extend_from_slice(data);
        let padded = self.bytes.len().next_multiple_of(SLOT);
        self.bytes.resize(padded, 0);
        Ok(((offset as u64) << 32) | len as u64)
    }
}

/// A canonical, owned row.
#[derive(Clone)]
pub struct Row {
    layout: Arc<RowLayout>,
    bytes: Vec<u8>,
}

impl Row {
    /// Encode one value per layout field.
    pub fn encode<'v>(
        layout: Arc<RowLayout>,
        values: impl IntoIterator<Item = FieldValue<'v>>,
    ) -> Result<Self> {
        let mut writer = RowWriter::new(&layout);
        let mut count = 0;
        for (i, value) in values.into_iter().enumerate() {
            if i >= layout.num_fields() {
                return Err(ConversionError::SchemaMismatch(format!(
                    "more values than the {} fields of the row layout",
                    layout.num_fields()
                )));
            }
            writer.write(i, &value)?;
            count += 1;
        }
        if count != layout.num_fields() {
            return Err(ConversionError::SchemaMismatch(format!(
                "{} values for {} fields",
                count,
                layout.num_fields()
            )));
        }
        let bytes = writer.bytes;
        Ok(Self { layout, bytes })
    }

    /// Wrap bytes already laid out for `layout`. Fixed-width layouts only.
    pub(crate) fn from_fixed_bytes(layout: Arc<RowLayout>, bytes: Vec<u8>) -> Self {
        debug_assert!(layout.is_fixed_width());
        debug_assert_eq!(bytes.len(), layout.fixed_width());
        Self { layout, bytes }
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    pub fn num_fields(&self) -> usize {
        self.layout.num_fields()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.bytes[i >> 3] & (1 << (i & 7)) != 0
    }

    fn slot(&self, i: usize) -> u64 {
        let at = self.layout.slot_offset(i);
        let mut raw = [0u8; SLOT];
        raw.copy_from_slice(&self.bytes[at..at + SLOT]);
        u64::from_le_bytes(raw)
    }

    // Typed getters read the slot as-is: a null field reads as its default.

    pub fn get_bool(&self, i: usize) -> bool {
        self.slot(i) != 0
    }

    pub fn get_i32(&self, i: usize) -> i32 {
        self.slot(i) as u32 as i32
    }

    pub fn get_i64(&self, i: usize) -> i64 {
        self.slot(i) as i64
    }

    pub fn get_f32(&self, i: usize) -> f32 {
        f32::from_bits(self.slot(i) as u32)
    }

    pub fn get_f64(&self, i: usize) -> f64 {
        f64::from_bits(self.slot(i))
    }

    /// The string in Utf8 field `i`; `""` when null. `None` when the field
    /// is not Utf8 or its slot does not point into the variable region.
    pub fn get_str(&self, i: usize) -> Option<&str> {
        if !matches!(self.layout.dtypes[i], GpuDataType::Utf8) {
            return None;
        }
        let slot = self.slot(i);
        if slot == 0 {
            return Some("");
        }
        let offset = (slot >> 32) as usize;
        let end = offset.checked_add((slot & 0xffff_ffff) as usize)?;
        if offset < self.layout.fixed_width() || end > self.bytes.len() {
            return None;
        }
        std::str::from_utf8(&self.bytes[offset..end]).ok()
    }

    /// Field `i`, or `None` when it is null.
    pub fn get(&self, i: usize) -> Option<ScalarValue> {
        if self.is_null(i) {
            return None;
        }
        Some(match self.layout.dtypes[i] {
            GpuDataType::Boolean => ScalarValue::Boolean(self.get_bool(i)),
            GpuDataType::Int32 => ScalarValue::Int32(self.get_i32(i)),
            GpuDataType::Int64 => ScalarValue::Int64(self.get_i64(i)),
            GpuDataType::Float32 => ScalarValue::Float32(self.get_f32(i)),
            GpuDataType::Float64 => ScalarValue::Float64(self.get_f64(i)),
            GpuDataType::TimestampMs => ScalarValue::TimestampMs(self.get_i64(i)),
            GpuDataType::Utf8 => ScalarValue::Utf8(self.get_str(i)?.to_string()),
        })
    }

    pub fn values(&self) -> Vec<Option<ScalarValue>> {
        (0..self.num_fields()).map(|i| self.get(i)).collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Row {}

impl Hash for Row {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}

/// Which batch fields make up a canonical row, and in what order.
#[derive(Debug, Clone)]
pub struct RowProjection {
    fields: Vec<FieldSpec>,
    layout: Arc<RowLayout>,
    identity: bool,
}

impl RowProjection {
    /// Project `schema` onto `ordinals`, or onto every field when `None`.
    pub fn from_schema(schema: &Schema, ordinals: Option<&[usize]>) -> Result<Self> {
        let all = schema.field_specs().map_err(ConversionError::Config)?;
        let fields = match ordinals {
            None => all.clone(),
            Some(ords) => ords
                .iter()
                .map(|&o| {
                    all.get(o).cloned().ok_or_else(|| {
                        ConversionError::SchemaMismatch(format!(
                            "projection ordinal {} out of range for {} fields",
                            o,
                            all.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        let identity = fields.len() == all.len()
            && fields.iter().enumerate().all(|(i, f)| f.ordinal == i);
        let layout = Arc::new(RowLayout::new(&fields));
        Ok(Self {
            fields,
            layout,
            identity,
        })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    /// Every batch column, in batch order.
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Borrowed view of row `row` of `batch` under this projection.
    pub fn project<'a>(&'a self, batch: &'a ColumnBatch, row: usize) -> BatchRow<'a> {
        BatchRow::new(batch, row, &self.fields)
    }

    /// Copy a borrowed row into its canonical owned form.
    pub fn canonicalize(&self, row: &BatchRow<'_>) -> Result<Row> {
        if row.num_fields() != self.layout.num_fields() {
            return Err(ConversionError::SchemaMismatch(format!(
                "row has {} fields, projection expects {}",
                row.num_fields(),
                self.layout.num_fields()
            )));
        }
        let mut writer = RowWriter::new(&self.layout);
        for i in 0..row.num_fields() {
            writer.write(i, &row.field(i)?)?;
        }
        Ok(Row {
            layout: Arc::clone(&self.layout),
            bytes: writer.bytes,
        })
    }
}
