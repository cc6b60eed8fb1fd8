//! GPU buffers ([`Buffer`]) and the [`BufferHandle`] trait.
//!
//! A buffer is created unbound, asked for its memory requirements, and
//! then bound to exactly one [`Memory`] with [`Buffer::bind_memory`]. A
//! second bind is rejected with [`BindMemoryError::AlreadyBound`].
//! [`Buffer::allocated`] does all three steps at once.
//!
//! [`Buffer::upload_via_staging`] and [`Buffer::read_back_via_staging`]
//! move bytes between the host and device-local buffers through a
//! temporary host-visible buffer, blocking until the queue is idle. They
//! are meant for startup work, not the frame loop.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::command::{CommandPool, OneTimeSubmitError};
use crate::device::{AllocateMemoryError, Device};
use crate::error::ApiError;
use crate::memory::{MapMemoryError, Memory, MemoryUsage};
use crate::ownership::{Held, Ownership};
use crate::queue::Submittable;

/// Trait for types that expose a raw `VkBuffer` handle.
///
/// Lets recording helpers accept owned buffers, borrowed views or
/// references to either.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Buffer size must be non-zero")]
    ZeroSize,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Failed to allocate buffer memory: {0}")]
    Allocate(#[from] AllocateMemoryError),
    #[error("Failed to bind buffer memory: {0}")]
    Bind(#[from] BindMemoryError),
}

#[derive(Debug, Error)]
pub enum BindMemoryError {
    #[error("Memory is already bound to this resource")]
    AlreadyBound,
    #[error("Resource has been released")]
    Released,
    #[error("A borrowed resource view cannot bind memory")]
    ResourceNotOwned,
    #[error("Only owned memory can be bound")]
    MemoryNotOwned,
    #[error(
        "Memory type {memory_type_index} is not in the allowed mask \
         {allowed:#b}"
    )]
    IncompatibleMemoryType { memory_type_index: u32, allowed: u32 },
    #[error("Memory holds {available} bytes but {required} are required")]
    TooSmall {
        required: vk::DeviceSize,
        available: vk::DeviceSize,
    },
    #[error("Memory offset {offset} is not aligned to {alignment}")]
    Misaligned {
        offset: vk::DeviceSize,
        alignment: vk::DeviceSize,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error("Buffer has no memory bound")]
    Unbound,
    #[error(
        "Access of {len} bytes at offset {offset} exceeds buffer size \
         {size}"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    #[error(transparent)]
    Map(#[from] MapMemoryError),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Nothing to transfer")]
    Empty,
    #[error("Failed to create staging or destination buffer: {0}")]
    Create(#[from] CreateBufferError),
    #[error("Failed to access staging memory: {0}")]
    Access(#[from] WriteBufferError),
    #[error("Transfer submission failed: {0}")]
    Submit(#[from] OneTimeSubmitError),
}

/// The handle a bind may target: only an owned, live resource with no
/// memory bound yet accepts memory.
pub(crate) fn bind_target<H: Copy>(
    handle: &Held<H>,
    already_bound: bool,
) -> Result<H, BindMemoryError> {
    let handle = match *handle {
        Held::Owned(h) => h,
        Held::Borrowed(_) => return Err(BindMemoryError::ResourceNotOwned),
        Held::Released => return Err(BindMemoryError::Released),
    };
    if already_bound {
        return Err(BindMemoryError::AlreadyBound);
    }
    Ok(handle)
}

/// Memory checks shared by buffer and image binds.
pub(crate) fn check_bind(
    requirements: &vk::MemoryRequirements,
    memory: &Memory,
) -> Result<(), BindMemoryError> {
    check_memory_owned(memory.ownership())?;
    check_memory_fits(
        requirements,
        memory.memory_type_index(),
        memory.size(),
        memory.offset(),
    )
}

fn check_memory_owned(
    ownership: Option<Ownership>,
) -> Result<(), BindMemoryError> {
    match ownership {
        Some(Ownership::Owned) => Ok(()),
        Some(Ownership::Borrowed) | None => Err(BindMemoryError::MemoryNotOwned),
    }
}

pub(crate) fn check_memory_fits(
    requirements: &vk::MemoryRequirements,
    memory_type_index: u32,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
) -> Result<(), BindMemoryError> {
    if requirements.memory_type_bits & (1 << memory_type_index) == 0 {
        return Err(BindMemoryError::IncompatibleMemoryType {
            memory_type_index,
            allowed: requirements.memory_type_bits,
        });
    }
    if size < requirements.size {
        return Err(BindMemoryError::TooSmall {
            required: requirements.size,
            available: size,
        });
    }
    if requirements.alignment > 0 && offset % requirements.alignment != 0 {
        return Err(BindMemoryError::Misaligned {
            offset,
            alignment: requirements.alignment,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
        }
    }
}

/// A `VkBuffer` with at most one bound [`Memory`].
pub struct Buffer {
    parent: Arc<Device>,
    handle: Held<vk::Buffer>,
    desc: BufferDesc,
    memory: Option<Memory>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.desc.size)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Create an unbound buffer.
    pub fn new(
        device: &Arc<Device>,
        desc: &BufferDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        if desc.size == 0 {
            return Err(CreateBufferError::ZeroSize);
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }?;
        // SAFETY: handle is a valid buffer created from device.
        unsafe { device.name_or_warn(handle, "buffer", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle: Held::Owned(handle),
            desc: *desc,
            memory: None,
        })
    }

    /// Create a buffer, allocate memory for `usage`, and bind it.
    pub fn allocated(
        device: &Arc<Device>,
        desc: &BufferDesc,
        usage: MemoryUsage,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let mut buffer = Self::new(device, desc, name)?;
        let requirements = buffer
            .memory_requirements()
            .ok_or(BindMemoryError::Released)?;
        let memory = Memory::allocate(device, requirements, usage, true, name)?;
        buffer.bind_memory(memory)?;
        Ok(buffer)
    }

    /// Size and allowed memory types. `None` once released.
    pub fn memory_requirements(&self) -> Option<vk::MemoryRequirements> {
        let handle = self.handle.get()?;
        // SAFETY: handle is a live buffer from parent.
        Some(unsafe { self.parent.get_raw_buffer_memory_requirements(handle) })
    }

    /// Bind `memory` to this buffer. Allowed exactly once.
    ///
    /// On error `memory` is dropped, which frees it.
    pub fn bind_memory(&mut self, memory: Memory) -> Result<(), BindMemoryError> {
        let handle = bind_target(&self.handle, self.memory.is_some())?;
        // SAFETY: handle is a live buffer from parent.
        let requirements =
            unsafe { self.parent.get_raw_buffer_memory_requirements(handle) };
        check_bind(&requirements, &memory)?;
        let raw_memory = memory.raw_memory().ok_or(BindMemoryError::MemoryNotOwned)?;
        // SAFETY: the buffer is unbound and the checks above proved the
        // memory satisfies its requirements.
        unsafe {
            self.parent
                .bind_raw_buffer_memory(handle, raw_memory, memory.offset())
        }?;
        self.memory = Some(memory);
        Ok(())
    }

    /// A non-owning view of this buffer and its memory.
    pub fn borrowed(&self) -> Buffer {
        Buffer {
            parent: Arc::clone(&self.parent),
            handle: self.handle.borrowed(),
            desc: self.desc,
            memory: self.memory.as_ref().map(Memory::borrowed),
        }
    }

    /// `None` once released.
    pub fn ownership(&self) -> Option<Ownership> {
        self.handle.ownership()
    }

    /// Destroy the buffer and free its memory if this handle owns them.
    /// Idempotent.
    ///
    /// No pending GPU work may use the buffer.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take_for_release() {
            tracing::debug!("Dropping buffer {:?}", handle);
            // SAFETY: handle is owned by this wrapper and the caller
            // guarantees no pending GPU use.
            unsafe { self.parent.destroy_raw_buffer(handle) };
        }
        if let Some(mut memory) = self.memory.take() {
            memory.release();
        }
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.memory.is_some()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    fn check_range(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<(), WriteBufferError> {
        if offset.saturating_add(len) > self.desc.size {
            return Err(WriteBufferError::OutOfBounds {
                offset,
                len,
                size: self.desc.size,
            });
        }
        Ok(())
    }

    /// Copy `data` into the buffer's mapped memory at byte `offset`.
    pub fn write_pod<T: Pod>(
        &mut self,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_range(offset, bytes.len() as vk::DeviceSize)?;
        let memory = self.memory.as_mut().ok_or(WriteBufferError::Unbound)?;
        memory.write_bytes(offset, bytes)?;
        Ok(())
    }

    /// Read `len` bytes at `offset` from the buffer's mapped memory.
    pub fn read_bytes(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<Vec<u8>, WriteBufferError> {
        self.check_range(offset, len)?;
        let memory = self.memory.as_ref().ok_or(WriteBufferError::Unbound)?;
        Ok(memory.read_bytes(offset, len)?)
    }

    /// Create a device-local buffer with `usage | TRANSFER_DST` holding
    /// `data`, copied through a host-visible staging buffer.
    ///
    /// Blocks until `queue` is idle.
    pub fn upload_via_staging<T: Pod, Q: Submittable>(
        device: &Arc<Device>,
        pool: &CommandPool,
        queue: &Q,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Buffer, StagingError> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        if size == 0 {
            return Err(StagingError::Empty);
        }
        let mut staging = Buffer::allocated(
            device,
            &BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
            MemoryUsage::CpuToGpu,
            Some("staging upload"),
        )?;
        staging.write_pod(0, data)?;

        let dst = Buffer::allocated(
            device,
            &BufferDesc {
                size,
                usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            },
            MemoryUsage::GpuOnly,
            name,
        )?;

        let region = vk::BufferCopy::default().size(size);
        pool.one_time_submit(queue, |cmd| {
            // SAFETY: both buffers outlive the call, which waits for the
            // queue to drain; usages were set above.
            unsafe { cmd.copy_buffer(&staging, &dst, &[region]) }
        })?;
        tracing::debug!("Uploaded {size} bytes to {:?}", dst.handle);
        Ok(dst)
    }

    /// Copy this buffer's contents back to the host through a `GpuToCpu`
    /// staging buffer. The buffer needs `TRANSFER_SRC` usage.
    ///
    /// Blocks until `queue` is idle.
    pub fn read_back_via_staging<Q: Submittable>(
        &self,
        pool: &CommandPool,
        queue: &Q,
    ) -> Result<Vec<u8>, StagingError> {
        let size = self.desc.size;
        let staging = Buffer::allocated(
            &self.parent,
            &BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
            },
            MemoryUsage::GpuToCpu,
            Some("staging readback"),
        )?;
        let region = vk::BufferCopy::default().size(size);
        pool.one_time_submit(queue, |cmd| {
            // SAFETY: both buffers outlive the call, which waits for the
            // queue to drain.
            unsafe { cmd.copy_buffer(self, &staging, &[region]) }
        })?;
        Ok(staging.read_bytes(0, size)?)
    }
}

impl BufferHandle for Buffer {
    /// Null once released.
    fn raw_buffer(&self) -> vk::Buffer {
        self.handle.get().unwrap_or_default()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(size: u64, alignment: u64, bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: bits,
        }
    }

    #[test]
    fn second_bind_is_rejected() {
        assert_eq!(bind_target(&Held::Owned(7u64), false).ok(), Some(7));
        assert!(matches!(
            bind_target(&Held::Owned(7u64), true),
            Err(BindMemoryError::AlreadyBound)
        ));
    }

    #[test]
    fn only_owned_live_resources_accept_memory() {
        assert!(matches!(
            bind_target(&Held::Borrowed(7u64), false),
            Err(BindMemoryError::ResourceNotOwned)
        ));
        assert!(matches!(
            bind_target(&Held::<u64>::Released, false),
            Err(BindMemoryError::Released)
        ));
    }

    #[test]
    fn borrowed_or_released_memory_is_rejected() {
        assert!(check_memory_owned(Some(Ownership::Owned)).is_ok());
        for ownership in [Some(Ownership::Borrowed), None] {
            assert!(matches!(
                check_memory_owned(ownership),
                Err(BindMemoryError::MemoryNotOwned)
            ));
        }
    }

    #[test]
    fn memory_of_allowed_type_and_size_fits() {
        assert!(check_memory_fits(&reqs(256, 64, 0b0110), 2, 256, 128).is_ok());
    }

    #[test]
    fn disallowed_memory_type_is_rejected() {
        assert!(matches!(
            check_memory_fits(&reqs(256, 64, 0b0110), 0, 256, 0),
            Err(BindMemoryError::IncompatibleMemoryType {
                memory_type_index: 0,
                ..
            })
        ));
    }

    #[test]
    fn undersized_memory_is_rejected() {
        assert!(matches!(
            check_memory_fits(&reqs(512, 64, 0b1), 0, 256, 0),
            Err(BindMemoryError::TooSmall {
                required: 512,
                available: 256
            })
        ));
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        assert!(matches!(
            check_memory_fits(&reqs(64, 256, 0b1), 0, 64, 64),
            Err(BindMemoryError::Misaligned { .. })
        ));
    }
}
