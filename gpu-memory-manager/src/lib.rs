pub mod device;
pub mod transfer_queue;

pub use device::{DeviceBuffer, DeviceMemory, DevicePtr, SimulatedDevice};
#[cfg(feature = "cuda")]
pub use device::CudaDeviceMemory;
pub use transfer_queue::{TransferDirection, TransferQueue, TransferStats};
