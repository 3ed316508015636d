//! sort-runtime: the device layer under the bucket sort scheduler.
//!
//! Defines the [`DeviceBackend`] capability (kernel compilation, device limit
//! queries, buffer allocation, in-order kernel launch) and two
//! implementations: [`HostBackend`], which runs the kernels in-process and
//! records every launch, and on macOS `MetalBackend`.

pub mod backend;
pub mod buffer;
pub mod error;
pub mod host;
#[cfg(target_os = "macos")]
pub mod metal;
pub mod source;

pub use backend::{DeviceBackend, DeviceLimit, DeviceLimits, KernelArg, KernelLibrary, LaunchConfig};
pub use buffer::DeviceBuffer;
pub use error::BackendError;
pub use host::{HostBackend, HostBuffer, HostEvent, HostKernel, HostKey, HostLayout, KeyFn};
#[cfg(target_os = "macos")]
pub use metal::{MetalBackend, MetalBuffer, MetalKernel};
pub use source::{kernel_names, Substitutions};
