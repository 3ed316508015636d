//! Common buffer trait for device-resident arrays.
//!
//! [`DeviceBuffer`] is the uniform view the scheduler needs of any backend's
//! buffer: how many elements it holds and how wide each element is. Typed
//! access stays on the concrete buffer (e.g. [`HostBuffer`](crate::HostBuffer)).

/// Uniform read-only interface over device-resident arrays of fixed-size elements.
pub trait DeviceBuffer {
    /// Number of elements in the buffer.
    fn len(&self) -> usize;

    /// Size of one element in bytes.
    fn element_size(&self) -> usize;

    /// Whether the buffer contains zero elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size in bytes.
    fn byte_len(&self) -> usize {
        self.len() * self.element_size()
    }
}
