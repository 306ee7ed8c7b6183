// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device memory adapter
//!
//! The training framework hands us opaque buffers tagged with the device they
//! live on. Before anything reaches the transport, the device tag is mapped
//! onto a small closed set of [`MemoryKind`]s. Each kind carries a row in a
//! static capability table, so adding a kind means adding a variant and a row.
//!
//! Accelerator kinds are only recognised when the matching cargo feature
//! (`cuda`, `rocm`) is enabled. Host memory is always supported and is
//! classified by the first match arm without consulting the table.

use std::fmt;

use crate::data_types::{DataType, Element};
use crate::error::{CommError, CommResult};

/// Device type as reported by the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Hip,
    Xpu,
    Mps,
    Meta,
}

/// The device a buffer lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub device_type: DeviceType,
    pub index: i32,
}

impl Device {
    pub const fn cpu() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            index: -1,
        }
    }

    pub const fn cuda(index: i32) -> Self {
        Self {
            device_type: DeviceType::Cuda,
            index,
        }
    }

    pub const fn hip(index: i32) -> Self {
        Self {
            device_type: DeviceType::Hip,
            index,
        }
    }

    pub const fn new(device_type: DeviceType, index: i32) -> Self {
        Self { device_type, index }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index < 0 {
            write!(f, "{:?}", self.device_type)
        } else {
            write!(f, "{:?}:{}", self.device_type, self.index)
        }
    }
}

/// Memory spaces understood by transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Cuda,
    Rocm,
}

/// Static properties of a [`MemoryKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCapabilities {
    pub name: &'static str,
    /// Local CPU code (decomposition steps, loopback copies) may touch it
    pub host_accessible: bool,
    /// Support for this kind was enabled at build time
    pub compiled_in: bool,
}

const CAPABILITIES: [MemoryCapabilities; 3] = [
    MemoryCapabilities {
        name: "host",
        host_accessible: true,
        compiled_in: true,
    },
    MemoryCapabilities {
        name: "cuda",
        host_accessible: false,
        compiled_in: cfg!(feature = "cuda"),
    },
    MemoryCapabilities {
        name: "rocm",
        host_accessible: false,
        compiled_in: cfg!(feature = "rocm"),
    },
];

impl MemoryKind {
    pub const ALL: [MemoryKind; 3] = [MemoryKind::Host, MemoryKind::Cuda, MemoryKind::Rocm];

    pub fn capabilities(&self) -> &'static MemoryCapabilities {
        &CAPABILITIES[*self as usize]
    }

    pub fn is_host_accessible(&self) -> bool {
        self.capabilities().host_accessible
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.capabilities().name)
    }
}

/// Classify the memory a buffer lives in
///
/// Fails with [`CommError::UnsupportedMemoryKind`] for devices we have no
/// memory kind for, or whose support was not compiled in. Never degrades to a
/// different kind.
#[inline]
pub fn classify(buffer: &BufferDescriptor) -> CommResult<MemoryKind> {
    match buffer.device.device_type {
        DeviceType::Cpu => Ok(MemoryKind::Host),
        _ => classify_accelerator(buffer.device),
    }
}

#[cold]
fn classify_accelerator(device: Device) -> CommResult<MemoryKind> {
    let kind = match device.device_type {
        DeviceType::Cpu => return Ok(MemoryKind::Host),
        DeviceType::Cuda => MemoryKind::Cuda,
        DeviceType::Hip => MemoryKind::Rocm,
        DeviceType::Xpu | DeviceType::Mps | DeviceType::Meta => {
            return Err(CommError::UnsupportedMemoryKind(format!(
                "no memory kind for device {}",
                device
            )))
        }
    };
    if !kind.capabilities().compiled_in {
        return Err(CommError::UnsupportedMemoryKind(format!(
            "{} memory (device {}) requires the '{}' feature",
            kind,
            device,
            kind.capabilities().name
        )));
    }
    Ok(kind)
}

/// Opaque descriptor of a framework-owned buffer
///
/// A descriptor does not own memory. Whoever builds one promises that the
/// memory stays valid, and is not mutated by anyone else, until every
/// operation using it has reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    ptr: *mut u8,
    count: usize,
    data_type: DataType,
    device: Device,
    writable: bool,
}

// Descriptors are plain addresses; the validity contract is on the creator.
unsafe impl Send for BufferDescriptor {}
unsafe impl Sync for BufferDescriptor {}

impl BufferDescriptor {
    /// Describe an arbitrary memory region
    ///
    /// # Safety
    /// `ptr` must point to `count` elements of `data_type` on `device`, and
    /// stay valid until every operation using this descriptor is terminal.
    /// If `writable` is true no other code may access the region meanwhile.
    pub unsafe fn from_raw_parts(
        ptr: *mut u8,
        count: usize,
        data_type: DataType,
        device: Device,
        writable: bool,
    ) -> Self {
        Self {
            ptr,
            count,
            data_type,
            device,
            writable,
        }
    }

    /// Describe a read-only host slice
    ///
    /// # Safety
    /// `data` must outlive every operation using the descriptor.
    pub unsafe fn host<T: Element>(data: &[T]) -> Self {
        Self::from_raw_parts(
            data.as_ptr() as *mut u8,
            data.len(),
            T::DATA_TYPE,
            Device::cpu(),
            false,
        )
    }

    /// Describe a writable host slice
    ///
    /// # Safety
    /// `data` must outlive every operation using the descriptor and must not
    /// be accessed until those operations are terminal.
    pub unsafe fn host_mut<T: Element>(data: &mut [T]) -> Self {
        Self::from_raw_parts(
            data.as_mut_ptr() as *mut u8,
            data.len(),
            T::DATA_TYPE,
            Device::cpu(),
            true,
        )
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len_bytes(&self) -> usize {
        self.count * self.data_type.size_in_bytes()
    }

    /// A view of `count` elements starting at element `offset`
    pub(crate) fn slice(&self, offset: usize, count: usize) -> CommResult<BufferDescriptor> {
        if offset + count > self.count {
            return Err(CommError::invalid(format!(
                "slice [{}, {}) out of bounds for buffer of {} elements",
                offset,
                offset + count,
                self.count
            )));
        }
        let byte_offset = offset * self.data_type.size_in_bytes();
        Ok(BufferDescriptor {
            ptr: self.ptr.wrapping_add(byte_offset),
            count,
            ..*self
        })
    }

    /// # Safety
    /// The descriptor must be host accessible and honour its validity contract.
    pub(crate) unsafe fn as_bytes(&self) -> &[u8] {
        if self.count == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len_bytes())
    }

    /// # Safety
    /// As [`as_bytes`](Self::as_bytes), and the region must not be aliased
    /// by a live reference.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_bytes_mut(&self) -> &mut [u8] {
        if self.count == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr, self.len_bytes())
    }
}

/// Host scratch memory owned by a decomposed operation
pub(crate) struct ScratchBuffer {
    bytes: Vec<u8>,
    data_type: DataType,
}

impl ScratchBuffer {
    pub(crate) fn zeroed(count: usize, data_type: DataType) -> Self {
        Self {
            bytes: vec![0u8; count * data_type.size_in_bytes()],
            data_type,
        }
    }

    /// Descriptor for the whole scratch region
    ///
    /// The heap allocation does not move while the `ScratchBuffer` is alive,
    /// so the descriptor stays valid as long as its owner does.
    pub(crate) fn descriptor(&mut self) -> BufferDescriptor {
        let count = self.bytes.len() / self.data_type.size_in_bytes();
        BufferDescriptor {
            ptr: self.bytes.as_mut_ptr(),
            count,
            data_type: self.data_type,
            device: Device::cpu(),
            writable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_classification() {
        let data = [1.0f32, 2.0];
        let buf = unsafe { BufferDescriptor::host(&data) };
        assert_eq!(classify(&buf).unwrap(), MemoryKind::Host);
        assert!(!buf.is_writable());
        assert_eq!(buf.len_bytes(), 8);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let buf = unsafe {
            BufferDescriptor::from_raw_parts(
                std::ptr::null_mut(),
                0,
                DataType::Float,
                Device::new(DeviceType::Mps, 0),
                true,
            )
        };
        let err = classify(&buf).unwrap_err();
        assert!(matches!(err, CommError::UnsupportedMemoryKind(_)));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_without_feature_is_rejected() {
        let buf = unsafe {
            BufferDescriptor::from_raw_parts(
                std::ptr::null_mut(),
                4,
                DataType::Float,
                Device::cuda(0),
                true,
            )
        };
        assert!(matches!(
            classify(&buf),
            Err(CommError::UnsupportedMemoryKind(_))
        ));
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn test_cuda_with_feature() {
        let buf = unsafe {
            BufferDescriptor::from_raw_parts(
                std::ptr::null_mut(),
                4,
                DataType::Float,
                Device::cuda(1),
                true,
            )
        };
        assert_eq!(classify(&buf).unwrap(), MemoryKind::Cuda);
    }

    #[test]
    fn test_capability_table_rows() {
        for kind in MemoryKind::ALL {
            assert_eq!(kind.to_string(), kind.capabilities().name);
        }
        assert!(MemoryKind::Host.is_host_accessible());
        assert!(!MemoryKind::Rocm.is_host_accessible());
    }

    #[test]
    fn test_slice_view() {
        let mut data = [1i32, 2, 3, 4];
        let buf = unsafe { BufferDescriptor::host_mut(&mut data) };
        let tail = buf.slice(2, 2).unwrap();
        assert_eq!(tail.count(), 2);
        let mut expected = Vec::new();
        expected.extend_from_slice(&3i32.to_ne_bytes());
        expected.extend_from_slice(&4i32.to_ne_bytes());
        assert_eq!(unsafe { tail.as_bytes() }, expected.as_slice());
        assert!(buf.slice(3, 2).is_err());
    }
}
