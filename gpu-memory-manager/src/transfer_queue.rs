use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::device::{DeviceBuffer, DeviceMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug)]
struct TransferRequest {
    direction: TransferDirection,
    size: usize,
    stream_id: usize,
}

/// Counters for completed transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
}

/// Transfer queue for copies between host memory and a [`DeviceMemory`].
///
/// Requests are spread round-robin over `num_streams` logical streams and at
/// most `max_in_flight` copies run at once; callers beyond that block until
/// a permit frees up. Several task instances share one queue.
pub struct TransferQueue {
    device: Arc<dyn DeviceMemory>,
    num_streams: usize,
    max_in_flight: usize,
    semaphore: Arc<Semaphore>,
    next_stream: AtomicUsize,
    host_to_device: AtomicU64,
    device_to_host: AtomicU64,
    bytes_to_device: AtomicU64,
    bytes_to_host: AtomicU64,
}

impl TransferQueue {
    pub fn new(
        device: Arc<dyn DeviceMemory>,
        num_streams: usize,
        max_in_flight: usize,
    ) -> Result<Self> {
        if num_streams == 0 {
            bail!("TransferQueue needs at least one stream");
        }
        if max_in_flight == 0 {
            bail!("TransferQueue needs at least one in-flight slot");
        }
        debug!(
            "TransferQueue on {} device: {} streams, {} in flight",
            device.name(),
            num_streams,
            max_in_flight
        );

        Ok(Self {
            device,
            num_streams,
            max_in_flight,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            next_stream: AtomicUsize::new(0),
            host_to_device: AtomicU64::new(0),
            device_to_host: AtomicU64::new(0),
            bytes_to_device: AtomicU64::new(0),
            bytes_to_host: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &Arc<dyn DeviceMemory> {
        &self.device
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    /// Copy `host` to a new device allocation.
    pub fn upload(&self, host: &[u8]) -> Result<DeviceBuffer> {
        let request = self.request(TransferDirection::HostToDevice, host.len());
        let _permit = self.acquire()?;
        debug!(
            "HtoD transfer: {} bytes on stream {}",
            request.size, request.stream_id
        );

        let ptr = self
            .device
            .upload(host)
            .context("Host-to-device transfer failed")?;
        self.record(&request);
        Ok(DeviceBuffer::new(ptr, host.len(), Arc::clone(&self.device)))
    }

    /// Copy a device allocation into a fresh host vector.
    pub fn download(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>> {
        let request = self.request(TransferDirection::DeviceToHost, buffer.len());
        let _permit = self.acquire()?;
        debug!(
            "DtoH transfer: {} bytes on stream {}",
            request.size, request.stream_id
        );

        let mut host = vec![0u8; buffer.len()];
        buffer
            .memory()
            .download(buffer.ptr(), &mut host)
            .with_context(|| format!("Device-to-host transfer of {:?} failed", buffer.ptr()))?;
        self.record(&request);
        Ok(host)
    }

    /// Snapshot of completed transfer counters.
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            host_to_device: self.host_to_device.load(Ordering::Relaxed),
            device_to_host: self.device_to_host.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
        }
    }

    fn request(&self, direction: TransferDirection, size: usize) -> TransferRequest {
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed) % self.num_streams;
        TransferRequest {
            direction,
            size,
            stream_id,
        }
    }

    /// Number of transfers that may start right now.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    // Blocks the calling thread while `max_in_flight` copies are running.
    fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        futures::executor::block_on(self.semaphore.acquire())
            .context("Failed to acquire transfer permit")
    }

    fn record(&self, request: &TransferRequest) {
        let bytes = request.size as u64;
        match request.direction {
            TransferDirection::HostToDevice => {
                self.host_to_device.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_device.fetch_add(bytes, Ordering::Relaxed);
            }
            TransferDirection::DeviceToHost => {
                self.device_to_host.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_host.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQueue")
            .field("device", &self.device.name())
            .field("num_streams", &self.num_streams)
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;

    #[test]
    fn test_transfer_queue() {
        let device = SimulatedDevice::new();
        let queue = TransferQueue::new(device.clone(), 4, 8).unwrap();
        assert_eq!(queue.num_streams(), 4);

        let buf = queue.upload(&[1, 2, 3, 4]).unwrap();
        let host = queue.download(&buf).unwrap();
        assert_eq!(host, vec![1, 2, 3, 4]);

        let stats = queue.stats();
        assert_eq!(stats.host_to_device, 1);
        assert_eq!(stats.device_to_host, 1);
        assert_eq!(stats.bytes_to_host, 4);
    }

    #[test]
    fn zero_streams_rejected() {
        let device = SimulatedDevice::new();
        assert!(TransferQueue::new(device, 0, 1).is_err());
    }

    #[test]
    fn failed_download_is_not_counted() {
        let device = SimulatedDevice::new();
        let queue = TransferQueue::new(device.clone(), 1, 1).unwrap();
        let buf = queue.upload(&[9u8; 8]).unwrap();
        device.fail_downloads_after(0);
        assert!(queue.download(&buf).is_err());
        assert_eq!(queue.stats().device_to_host, 0);
        assert_eq!(queue.available_permits(), 1);
        device.fail_downloads_after(u64::MAX);
        assert!(queue.download(&buf).is_ok());
    }

    #[test]
    fn concurrent_downloads_share_slots() {
        let device = SimulatedDevice::new();
        let queue = Arc::new(TransferQueue::new(device, 2, 1).unwrap());
        let buf = Arc::new(queue.upload(&[5u8; 32]).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || queue.download(&buf).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![5u8; 32]);
        }
        assert_eq!(queue.stats().device_to_host, 4);
        assert_eq!(queue.available_permits(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_transfers_from_runtime_tasks() {
        let device = SimulatedDevice::new();
        let queue = Arc::new(TransferQueue::new(device, 2, 2).unwrap());
        let buf = Arc::new(queue.upload(&[3u8; 16]).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let buf = Arc::clone(&buf);
                tokio::task::spawn_blocking(move || queue.download(&buf).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap(), vec![3u8; 16]);
        }
        assert_eq!(queue.available_permits(), 2);
    }
}
