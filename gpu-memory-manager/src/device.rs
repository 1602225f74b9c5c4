//! Device memory backends.
//!
//! Everything above this module talks to a [`DeviceMemory`] trait object so the
//! conversion pipeline runs the same way against a real CUDA device (feature
//! `cuda`) and against [`SimulatedDevice`], a host-backed arena used when no
//! GPU is present and in tests.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opaque handle to one device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// A device that can hold byte buffers and copy them to and from the host.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Human readable backend name, used in logs.
    fn name(&self) -> &str;

    /// Allocate device memory and copy `host` into it.
    fn upload(&self, host: &[u8]) -> Result<DevicePtr>;

    /// Copy the allocation behind `ptr` into `dst`. `dst.len()` must equal
    /// the allocation size.
    fn download(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Release the allocation. Unknown pointers are ignored.
    fn free(&self, ptr: DevicePtr);
}

/// An owned device allocation. Freed on drop.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    memory: Arc<dyn DeviceMemory>,
}

impl DeviceBuffer {
    pub fn new(ptr: DevicePtr, len: usize, memory: Arc<dyn DeviceMemory>) -> Self {
        Self { ptr, len, memory }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("device", &self.memory.name())
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.memory.free(self.ptr);
    }
}

// ---------------------------------------------------------------------------
// Simulated device
// ---------------------------------------------------------------------------

/// Host-backed stand-in for GPU memory.
///
/// Downloads can be made to fail after a number of successful copies, which
/// is how tests exercise the materialization failure path.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    next_ptr: AtomicU64,
    downloads: AtomicU64,
    /// `Some(n)`: the (n+1)-th and later downloads fail.
    fail_after: Mutex<Option<u64>>,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every download after the first `n` successful ones fail.
    pub fn fail_downloads_after(&self, n: u64) {
        *self.fail_after.lock() = Some(n);
    }

    /// Number of allocations currently held.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Number of successful device-to-host copies so far.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }
}

impl DeviceMemory for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn upload(&self, host: &[u8]) -> Result<DevicePtr> {
        let ptr = self.next_ptr.fetch_add(1, Ordering::Relaxed) + 1;
        self.allocations.lock().insert(ptr, host.to_vec());
        Ok(DevicePtr(ptr))
    }

    fn download(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
        if let Some(limit) = *self.fail_after.lock() {
            if self.downloads.load(Ordering::Relaxed) >= limit {
                bail!("simulated device-to-host transfer failure at {:?}", ptr);
            }
        }
        let allocations = self.allocations.lock();
        let Some(src) = allocations.get(&ptr.0) else {
            bail!("Unknown device pointer {:?}", ptr);
        };
        if src.len() != dst.len() {
            bail!(
                "Transfer size mismatch for {:?}: device holds {} bytes, destination is {}",
                ptr,
                src.len(),
                dst.len()
            );
        }
        dst.copy_from_slice(src);
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, ptr: DevicePtr) {
        if self.allocations.lock().remove(&ptr.0).is_none() {
            warn!("free of unknown simulated device pointer {:?}", ptr);
        } else {
            debug!("freed simulated allocation {:?}", ptr);
        }
    }
}

// ---------------------------------------------------------------------------
// CUDA device
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub use cuda::CudaDeviceMemory;

#[cfg(feature = "cuda")]
mod cuda {
    use super::{DeviceMemory, DevicePtr};
    use anyhow::{Context, Result};
    use cudarc::driver::{CudaDevice, CudaSlice};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tracing::info;

    /// [`DeviceMemory`] backed by a CUDA device through `cudarc`.
    pub struct CudaDeviceMemory {
        device: Arc<CudaDevice>,
        slices: Mutex<HashMap<u64, CudaSlice<u8>>>,
        next_ptr: AtomicU64,
    }

    impl CudaDeviceMemory {
        pub fn new(ordinal: usize) -> Result<Arc<Self>> {
            let device = CudaDevice::new(ordinal).context("Failed to open CUDA device")?;
            info!("CUDA device {} opened", ordinal);
            Ok(Arc::new(Self {
                device,
                slices: Mutex::new(HashMap::new()),
                next_ptr: AtomicU64::new(0),
            }))
        }
    }

    impl fmt::Debug for CudaDeviceMemory {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("CudaDeviceMemory")
                .field("allocations", &self.slices.lock().len())
                .finish()
        }
    }

    impl DeviceMemory for CudaDeviceMemory {
        fn name(&self) -> &str {
            "cuda"
        }

        fn upload(&self, host: &[u8]) -> Result<DevicePtr> {
            let slice = self
                .device
                .htod_sync_copy(host)
                .context("Host-to-device copy failed")?;
            let ptr = self.next_ptr.fetch_add(1, Ordering::Relaxed) + 1;
            self.slices.lock().insert(ptr, slice);
            Ok(DevicePtr(ptr))
        }

        fn download(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
            let slices = self.slices.lock();
            let slice = slices
                .get(&ptr.0)
                .with_context(|| format!("Unknown device pointer {:?}", ptr))?;
            self.device
                .dtoh_sync_copy_into(slice, dst)
                .context("Device-to-host copy failed")?;
            Ok(())
        }

        fn free(&self, ptr: DevicePtr) {
            // Dropping the slice releases the device memory.
            self.slices.lock().remove(&ptr.0);
        }
    }
}
