//! Device memory allocations ([`Memory`]) and memory-type selection.
//!
//! A [`Memory`] is either the owner of a `gpu-allocator` allocation or a
//! borrowed inspection view of one. Only the owner frees; a borrowed view
//! exposes handle, offset, size and type for logging and never releases
//! anything.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use thiserror::Error;

use crate::device::{AllocateMemoryError, Device};
use crate::ownership::Ownership;

/// Describes how an allocation will be accessed by CPU and GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Highest bandwidth; not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. For staging and per-frame uploads.
    CpuToGpu,
    /// GPU-writable, CPU-readable. For readback.
    GpuToCpu,
}

/// Score a memory type for `usage`; `None` if incompatible. Higher is
/// better.
///
/// Host-accessed usages require `HOST_VISIBLE | HOST_COHERENT`, the same
/// set `gpu-allocator` demands for its CPU locations, so mapped access
/// never needs explicit flushes.
pub fn score_memory_type(
    flags: vk::MemoryPropertyFlags,
    usage: MemoryUsage,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let device_local = flags.contains(F::DEVICE_LOCAL);
    let host_visible = flags.contains(F::HOST_VISIBLE);
    let host_mappable = flags.contains(F::HOST_VISIBLE | F::HOST_COHERENT);
    let host_cached = flags.contains(F::HOST_CACHED);
    match usage {
        // Prefer pure VRAM over unified memory.
        MemoryUsage::GpuOnly => {
            device_local.then_some(if host_visible { 1 } else { 2 })
        }
        // Prefer DEVICE_LOCAL (ReBAR / unified memory).
        MemoryUsage::CpuToGpu => {
            host_mappable.then_some(if device_local { 2 } else { 1 })
        }
        // Prefer HOST_CACHED for CPU reads.
        MemoryUsage::GpuToCpu => {
            host_mappable.then_some(if host_cached { 2 } else { 1 })
        }
    }
}

/// Pick the best memory type allowed by `type_bits` for `usage`.
///
/// Among equal scores the lowest index wins, matching Vulkan's ordering
/// convention within a heap.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    usage: MemoryUsage,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize)
        .min(properties.memory_types.len());
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .filter(|(i, _)| type_bits & (1 << i) != 0)
        .filter_map(|(i, ty)| {
            score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s))
        })
        .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
        .map(|(i, _)| i)
}

#[derive(Debug, Error)]
pub enum MapMemoryError {
    #[error("Memory is not owned by this handle")]
    NotOwned,
    #[error("Memory is not host-mapped")]
    NotMapped,
    #[error(
        "Access of {len} bytes at offset {offset} exceeds allocation \
         size {size}"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },
}

enum MemoryState {
    Owned(Allocation),
    Borrowed {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    Released,
}

/// A block of device memory of one memory type.
pub struct Memory {
    parent: Arc<Device>,
    state: MemoryState,
    size: vk::DeviceSize,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("memory", &self.raw_memory())
            .field("offset", &self.offset())
            .field("size", &self.size)
            .field("memory_type_index", &self.memory_type_index)
            .field("ownership", &self.ownership())
            .finish_non_exhaustive()
    }
}

impl Memory {
    /// Allocate memory satisfying `requirements` for `usage`.
    ///
    /// `linear` marks buffer or linear-tiled image memory for the
    /// allocator's granularity handling.
    pub fn allocate(
        device: &Arc<Device>,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
        name: Option<&str>,
    ) -> Result<Self, AllocateMemoryError> {
        let (allocation, memory_type_index) = device.allocate_memory(
            name.unwrap_or("memory"),
            requirements,
            usage,
            linear,
        )?;
        let properties = allocation.memory_properties();
        let size = allocation.size();
        tracing::trace!(
            "Allocated {size} bytes of type {memory_type_index} ({properties:?}) \
             for {usage:?}"
        );
        Ok(Self {
            parent: Arc::clone(device),
            state: MemoryState::Owned(allocation),
            size,
            memory_type_index,
            properties,
        })
    }

    /// A non-owning view of the same memory. Releasing or dropping it
    /// never frees anything.
    pub fn borrowed(&self) -> Memory {
        let state = match self.raw_memory() {
            Some(memory) => MemoryState::Borrowed {
                memory,
                offset: self.offset(),
            },
            None => MemoryState::Released,
        };
        Memory {
            parent: Arc::clone(&self.parent),
            state,
            size: self.size,
            memory_type_index: self.memory_type_index,
            properties: self.properties,
        }
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// `None` once released.
    pub fn ownership(&self) -> Option<Ownership> {
        match self.state {
            MemoryState::Owned(_) => Some(Ownership::Owned),
            MemoryState::Borrowed { .. } => Some(Ownership::Borrowed),
            MemoryState::Released => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, MemoryState::Released)
    }

    pub fn raw_memory(&self) -> Option<vk::DeviceMemory> {
        match &self.state {
            // SAFETY: the allocation is live while it sits in self.state.
            MemoryState::Owned(a) => Some(unsafe { a.memory() }),
            MemoryState::Borrowed { memory, .. } => Some(*memory),
            MemoryState::Released => None,
        }
    }

    pub fn offset(&self) -> vk::DeviceSize {
        match &self.state {
            MemoryState::Owned(a) => a.offset(),
            MemoryState::Borrowed { offset, .. } => *offset,
            MemoryState::Released => 0,
        }
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Copy `bytes` into mapped memory at `offset`.
    pub fn write_bytes(
        &mut self,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), MapMemoryError> {
        let len = bytes.len() as vk::DeviceSize;
        let ptr = self.owned_mapped(offset, len)?;
        if bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: ptr maps the whole allocation and [offset, offset + len)
        // was bounds-checked above. &mut self excludes concurrent access.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr.add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of mapped memory at `offset`.
    pub fn read_bytes(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<Vec<u8>, MapMemoryError> {
        let ptr = self.owned_mapped(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: bounds checked in owned_mapped; out has len bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(out)
    }

    /// Free the allocation if owned. Idempotent; a borrowed view just
    /// becomes released.
    ///
    /// The caller must ensure no pending GPU work uses the memory and that
    /// no resource is still bound to it.
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.state, MemoryState::Released) {
            MemoryState::Owned(allocation) => {
                tracing::debug!(
                    "Freeing memory {:?} (type {})",
                    // SAFETY: allocation is live until freed below.
                    unsafe { allocation.memory() },
                    self.memory_type_index
                );
                if let Err(e) = self.parent.free_memory(allocation) {
                    tracing::error!("Failed to free GPU allocation: {e}");
                }
            }
            MemoryState::Borrowed { .. } | MemoryState::Released => {}
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::MemoryPropertyFlags as F;

    fn props(types: &[F]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn gpu_only_prefers_pure_vram() {
        let p = props(&[
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL,
        ]);
        assert_eq!(select_memory_type(&p, 0b11, MemoryUsage::GpuOnly), Some(1));
    }

    #[test]
    fn cpu_to_gpu_prefers_device_local_host_visible() {
        let p = props(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        assert_eq!(
            select_memory_type(&p, 0b111, MemoryUsage::CpuToGpu),
            Some(2)
        );
        // Masked out: falls back to the plain host-visible type.
        assert_eq!(
            select_memory_type(&p, 0b011, MemoryUsage::CpuToGpu),
            Some(0)
        );
    }

    #[test]
    fn gpu_to_cpu_prefers_coherent_cached() {
        let p = props(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_CACHED,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
        ]);
        assert_eq!(
            select_memory_type(&p, 0b111, MemoryUsage::GpuToCpu),
            Some(2)
        );
        // Cached but not coherent is never picked.
        assert_eq!(
            select_memory_type(&p, 0b011, MemoryUsage::GpuToCpu),
            Some(0)
        );
        assert_eq!(select_memory_type(&p, 0b010, MemoryUsage::GpuToCpu), None);
    }

    #[test]
    fn host_access_requires_coherent_memory() {
        // Layout of a portability adapter exposing non-coherent cached
        // and non-coherent device-local host-visible types.
        let p = props(&[
            F::DEVICE_LOCAL,
            F::DEVICE_LOCAL | F::HOST_VISIBLE,
            F::HOST_VISIBLE | F::HOST_CACHED,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        for usage in [MemoryUsage::CpuToGpu, MemoryUsage::GpuToCpu] {
            let idx = select_memory_type(&p, 0b1111, usage);
            assert_eq!(idx, Some(3), "{usage:?}");
            let flags = p.memory_types[3].property_flags;
            assert!(flags.contains(F::HOST_VISIBLE | F::HOST_COHERENT));
        }
        assert_eq!(
            score_memory_type(F::HOST_VISIBLE, MemoryUsage::CpuToGpu),
            None
        );
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let p = props(&[F::DEVICE_LOCAL, F::DEVICE_LOCAL, F::DEVICE_LOCAL]);
        assert_eq!(select_memory_type(&p, 0b110, MemoryUsage::GpuOnly), Some(1));
    }

    #[test]
    fn no_compatible_type() {
        let p = props(&[F::DEVICE_LOCAL]);
        assert_eq!(select_memory_type(&p, 0b1, MemoryUsage::CpuToGpu), None);
        assert_eq!(select_memory_type(&p, 0b0, MemoryUsage::GpuOnly), None);
    }
}
