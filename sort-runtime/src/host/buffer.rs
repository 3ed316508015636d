use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::DeviceBuffer;
use crate::error::BackendError;

/// A host-memory array standing in for a device buffer.
///
/// Contents are raw little-endian bytes, `len * element_size` long. The lock
/// serializes kernel access; the host backend never locks the same buffer
/// twice within one launch.
pub struct HostBuffer {
    label: String,
    len: usize,
    element_size: usize,
    bytes: Mutex<Vec<u8>>,
}

impl HostBuffer {
    pub(crate) fn zeroed(len: usize, element_size: usize, label: &str) -> Self {
        Self {
            label: label.to_string(),
            len,
            element_size,
            bytes: Mutex::new(vec![0u8; len * element_size]),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Overwrite the whole buffer. `data` must be exactly `byte_len()` bytes.
    pub fn upload<T: Pod>(&self, data: &[T]) -> Result<(), BackendError> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let mut bytes = self.bytes.lock();
        if src.len() != bytes.len() {
            return Err(BackendError::SizeMismatch {
                expected: bytes.len(),
                actual: src.len(),
            });
        }
        bytes.copy_from_slice(src);
        Ok(())
    }

    /// Copy the contents out as `T` values.
    pub fn download<T: Pod>(&self) -> Vec<T> {
        let bytes = self.bytes.lock();
        bytemuck::pod_collect_to_vec::<u8, T>(&bytes[..])
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock()
    }

    pub(crate) fn clear(&self) {
        self.bytes.lock().fill(0);
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn element_size(&self) -> usize {
        self.element_size
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("element_size", &self.element_size)
            .finish()
    }
}

/// Read the `index`-th little-endian u32 of a byte array.
pub(crate) fn read_u32(bytes: &[u8], index: usize) -> u32 {
    bytemuck::pod_read_unaligned(&bytes[index * 4..index * 4 + 4])
}

pub(crate) fn write_u32(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}
