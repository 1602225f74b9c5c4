//! A typed column that may live on the device, the host, or both.

use anyhow::{bail, Context, Result};
use arrow_schema::{DataType, TimeUnit};
use gpu_memory_manager::{DeviceBuffer, TransferQueue};
use tracing::debug;

/// Column types the conversion path understands.
///
/// Narrow integers are widened on ingestion; strings keep their bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuDataType {
    Boolean,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Epoch milliseconds stored as Int64.
    TimestampMs,
    /// UTF-8 values with `n + 1` i32 offsets.
    Utf8,
}

impl GpuDataType {
    /// Byte width of one element, `None` for variable-width types.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            Self::Boolean => Some(1),
            Self::Int32 | Self::Float32 => Some(4),
            Self::Int64 | Self::Float64 | Self::TimestampMs => Some(8),
            Self::Utf8 => None,
        }
    }

    pub fn is_fixed_width(self) -> bool {
        self.byte_width().is_some()
    }

    /// Try to map an Arrow `DataType` to a `GpuDataType`.
    pub fn from_arrow(dt: &DataType) -> Result<Self> {
        match dt {
            DataType::Boolean => Ok(Self::Boolean),

            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::UInt8
            | DataType::UInt16 => Ok(Self::Int32),

            DataType::Int64 | DataType::UInt32 => Ok(Self::Int64),

            DataType::Float32 => Ok(Self::Float32),
            DataType::Float64 => Ok(Self::Float64),

            DataType::Timestamp(TimeUnit::Millisecond, _) | DataType::Date64 => {
                Ok(Self::TimestampMs)
            }

            DataType::Utf8 => Ok(Self::Utf8),

            other => bail!("Unsupported Arrow DataType for GPU: {:?}", other),
        }
    }
}

/// Where a column's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Device,
    HostAndDevice,
}

/// Host copy of a column.
#[derive(Debug, Clone, Default)]
pub struct HostColumn {
    /// Little-endian packed values (for Utf8: the concatenated string bytes).
    pub data: Vec<u8>,
    /// One byte per row: 1 = valid, 0 = null. `None` means no nulls.
    pub validity: Option<Vec<u8>>,
    /// Utf8 only: `n + 1` offsets into `data`.
    pub offsets: Option<Vec<i32>>,
}

impl HostColumn {
    pub fn is_valid(&self, row: usize) -> bool {
        self.validity.as_ref().map_or(true, |v| v[row] != 0)
    }

    pub fn read_bool(&self, row: usize) -> bool {
        self.data[row] != 0
    }

    pub fn read_i32(&self, row: usize) -> i32 {
        i32::from_le_bytes(self.fixed::<4>(row))
    }

    pub fn read_i64(&self, row: usize) -> i64 {
        i64::from_le_bytes(self.fixed::<8>(row))
    }

    pub fn read_f32(&self, row: usize) -> f32 {
        f32::from_le_bytes(self.fixed::<4>(row))
    }

    pub fn read_f64(&self, row: usize) -> f64 {
        f64::from_le_bytes(self.fixed::<8>(row))
    }

    pub fn read_str(&self, row: usize) -> Result<&str> {
        let offsets = self
            .offsets
            .as_ref()
            .context("Utf8 column has no offsets")?;
        let start = offsets[row] as usize;
        let end = offsets[row + 1] as usize;
        std::str::from_utf8(&self.data[start..end])
            .with_context(|| format!("Invalid UTF-8 at row {}", row))
    }

    /// Raw little-endian bytes of one fixed-width element.
    pub fn raw<const N: usize>(&self, row: usize) -> [u8; N] {
        self.fixed::<N>(row)
    }

    fn fixed<const N: usize>(&self, row: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[row * N..(row + 1) * N]);
        out
    }
}

/// Device copy of a column.
#[derive(Debug)]
pub struct DeviceColumn {
    pub data: DeviceBuffer,
    pub validity: Option<DeviceBuffer>,
    pub offsets: Option<DeviceBuffer>,
}

/// An owned column of GPU-ready data.
#[derive(Debug)]
pub struct ColumnBuffer {
    pub name: String,
    pub dtype: GpuDataType,
    /// Number of rows represented.
    pub n_rows: usize,
    host: Option<HostColumn>,
    device: Option<DeviceColumn>,
}

impl ColumnBuffer {
    /// Create an empty host buffer.
    pub fn new_empty(name: impl Into<String>, dtype: GpuDataType) -> Self {
        let offsets = (dtype == GpuDataType::Utf8).then(|| vec![0i32]);
        Self {
            name: name.into(),
            dtype,
            n_rows: 0,
            host: Some(HostColumn {
                data: Vec::new(),
                validity: None,
                offsets,
            }),
            device: None,
        }
    }

    /// Create a fixed-width host column from a pre-filled byte vec.
    pub fn from_bytes(
        name: impl Into<String>,
        dtype: GpuDataType,
        data: Vec<u8>,
        n_rows: usize,
        validity: Option<Vec<u8>>,
    ) -> Result<Self> {
        let Some(width) = dtype.byte_width() else {
            bail!("ColumnBuffer::from_bytes needs a fixed-width type, got {:?}", dtype);
        };
        let expected = n_rows * width;
        if data.len() != expected {
            bail!(
                "ColumnBuffer size mismatch: expected {} bytes for {} rows, got {}",
                expected,
                n_rows,
                data.len()
            );
        }
        check_validity(validity.as_deref(), n_rows)?;
        Ok(Self {
            name: name.into(),
            dtype,
            n_rows,
            host: Some(HostColumn {
                data,
                validity,
                offsets: None,
            }),
            device: None,
        })
    }

    /// Create a Utf8 host column from string bytes and `n_rows + 1` offsets.
    pub fn from_utf8(
        name: impl Into<String>,
        values: Vec<u8>,
        offsets: Vec<i32>,
        validity: Option<Vec<u8>>,
    ) -> Result<Self> {
        if offsets.is_empty() {
            bail!("Utf8 column needs at least one offset");
        }
        let n_rows = offsets.len() - 1;
        if offsets.windows(2).any(|w| w[0] > w[1] || w[0] < 0) {
            bail!("Utf8 offsets must be non-negative and non-decreasing");
        }
        if offsets[n_rows] as usize != values.len() {
            bail!(
                "Utf8 offsets end at {} but value buffer holds {} bytes",
                offsets[n_rows],
                values.len()
            );
        }
        check_validity(validity.as_deref(), n_rows)?;
        Ok(Self {
            name: name.into(),
            dtype: GpuDataType::Utf8,
            n_rows,
            host: Some(HostColumn {
                data: values,
                validity,
                offsets: Some(offsets),
            }),
            device: None,
        })
    }

    pub fn residency(&self) -> Residency {
        match (self.host.is_some(), self.device.is_some()) {
            (true, true) => Residency::HostAndDevice,
            (false, true) => Residency::Device,
            _ => Residency::Host,
        }
    }

    pub fn is_host_resident(&self) -> bool {
        self.host.is_some()
    }

    /// Host copy, if materialized.
    pub fn host(&self) -> Option<&HostColumn> {
        self.host.as_ref()
    }

    pub fn null_count(&self) -> Option<usize> {
        self.host.as_ref().map(|h| {
            h.validity
                .as_ref()
                .map_or(0, |v| v.iter().filter(|b| **b == 0).count())
        })
    }

    /// Return the size of the value buffer in bytes.
    pub fn byte_len(&self) -> usize {
        match (&self.host, &self.device) {
            (Some(h), _) => h.data.len(),
            (None, Some(d)) => d.data.len(),
            (None, None) => 0,
        }
    }

    /// Copy the host data to the device. With `evict_host` the host copy is
    /// dropped afterwards, leaving the column device-resident only.
    pub fn upload_to_device(&mut self, queue: &TransferQueue, evict_host: bool) -> Result<()> {
        if self.device.is_none() {
            let host = self
                .host
                .as_ref()
                .with_context(|| format!("Column '{}' has no host data to upload", self.name))?;
            let data = queue.upload(&host.data)?;
            let validity = host.validity.as_ref().map(|v| queue.upload(v)).transpose()?;
            let offsets = host
                .offsets
                .as_ref()
                .map(|o| queue.upload(&offsets_to_bytes(o)))
                .transpose()?;
            self.device = Some(DeviceColumn {
                data,
                validity,
                offsets,
            });
        }
        if evict_host {
            self.host = None;
        }
        Ok(())
    }

    /// Make the column host-readable, copying it from the device if needed.
    ///
    /// Returns `true` when a transfer happened, `false` when the column was
    /// already host resident.
    pub fn ensure_host(&mut self, queue: &TransferQueue) -> Result<bool> {
        if self.host.is_some() {
            return Ok(false);
        }
        let device = self
            .device
            .as_ref()
            .with_context(|| format!("Column '{}' has neither host nor device data", self.name))?;

        let data = queue
            .download(&device.data)
            .with_context(|| format!("Materializing column '{}'", self.name))?;
        let validity = device
            .validity
            .as_ref()
            .map(|v| queue.download(v))
            .transpose()
            .with_context(|| format!("Materializing validity of column '{}'", self.name))?;
        let offsets = device
            .offsets
            .as_ref()
            .map(|o| queue.download(o).map(|bytes| bytes_to_offsets(&bytes)))
            .transpose()
            .with_context(|| format!("Materializing offsets of column '{}'", self.name))?;

        check_validity(validity.as_deref(), self.n_rows)?;
        if let Some(width) = self.dtype.byte_width() {
            if data.len() != self.n_rows * width {
                bail!(
                    "Column '{}' came back with {} bytes, expected {}",
                    self.name,
                    data.len(),
                    self.n_rows * width
                );
            }
        }

        debug!("column '{}' materialized ({} bytes)", self.name, data.len());
        self.host = Some(HostColumn {
            data,
            validity,
            offsets,
        });
        Ok(true)
    }
}

fn check_validity(validity: Option<&[u8]>, n_rows: usize) -> Result<()> {
    if let Some(v) = validity {
        if v.len() != n_rows {
            bail!(
                "Validity length mismatch: expected {} entries, got {}",
                n_rows,
                v.len()
            );
        }
    }
    Ok(())
}

fn offsets_to_bytes(offsets: &[i32]) -> Vec<u8> {
    offsets.iter().flat_map(|o| o.to_le_bytes()).collect()
}

fn bytes_to_offsets(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
