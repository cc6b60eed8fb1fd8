//! GPU image types: [`Image`], [`ImageView`] and [`Sampler`].
//!
//! [`Image`] follows the same two-phase discipline as
//! [`Buffer`](crate::buffer::Buffer): create unbound, query
//! [`memory_requirements`](Image::memory_requirements), then
//! [`bind_memory`](Image::bind_memory) exactly once. Populate a sampled
//! image with [`upload_rgba8`](Image::upload_rgba8), which stages the
//! pixels and records the layout transitions
//! `UNDEFINED → TRANSFER_DST_OPTIMAL → SHADER_READ_ONLY_OPTIMAL`.
//!
//! [`ImageView`] wraps a `VkImageView` of either an [`Image`] or a
//! swapchain image. [`Sampler`] encodes filtering and addressing state
//! independently of any particular image.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{
    BindMemoryError, Buffer, BufferDesc, CreateBufferError, WriteBufferError,
    bind_target, check_bind,
};
use crate::command::{CommandPool, OneTimeSubmitError};
use crate::device::{AllocateMemoryError, Device};
use crate::error::ApiError;
use crate::memory::{Memory, MemoryUsage};
use crate::ownership::{Held, Ownership};
use crate::queue::Submittable;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Image extent must be non-zero, got {0:?}")]
    ZeroExtent(vk::Extent2D),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Failed to allocate image memory: {0}")]
    Allocate(#[from] AllocateMemoryError),
    #[error("Failed to bind image memory: {0}")]
    Bind(#[from] BindMemoryError),
}

#[derive(Debug, Error)]
pub enum UploadImageError {
    #[error("Image has been released")]
    Released,
    #[error("Image has no memory bound")]
    Unbound,
    #[error("Expected {expected} bytes of RGBA8 pixels, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Failed to create staging buffer: {0}")]
    Staging(#[from] CreateBufferError),
    #[error("Failed to write staging buffer: {0}")]
    Write(#[from] WriteBufferError),
    #[error("Upload submission failed: {0}")]
    Submit(#[from] OneTimeSubmitError),
}

#[derive(Debug, Error)]
pub enum CreateImageViewError {
    #[error("Image has been released")]
    Released,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum CreateSamplerError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Full colour subresource of a single-mip, single-layer image.
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Access masks and stages for the two upload transitions.
///
/// Returns `None` for layout pairs the upload path never uses.
pub fn upload_transition(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Option<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Some((
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ))
        }
        (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ) => Some((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
}

impl Default for ImageDesc {
    /// A sampled RGBA8 sRGB texture; the extent must still be filled in.
    fn default() -> Self {
        Self {
            extent: vk::Extent2D::default(),
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// A 2-D, single-mip, optimal-tiling `VkImage`.
pub struct Image {
    parent: Arc<Device>,
    handle: Held<vk::Image>,
    desc: ImageDesc,
    memory: Option<Memory>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("extent", &self.desc.extent)
            .field("format", &self.desc.format)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Create an unbound image.
    pub fn new(
        device: &Arc<Device>,
        desc: &ImageDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(CreateImageError::ZeroExtent(desc.extent));
        }
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent.into())
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_image(&create_info) }?;
        // SAFETY: handle is a valid image created from device.
        unsafe { device.name_or_warn(handle, "image", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle: Held::Owned(handle),
            desc: *desc,
            memory: None,
        })
    }

    /// Create an image with freshly allocated `GpuOnly` memory bound.
    pub fn allocated(
        device: &Arc<Device>,
        desc: &ImageDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        let mut image = Self::new(device, desc, name)?;
        let requirements = image
            .memory_requirements()
            .ok_or(BindMemoryError::Released)?;
        let memory = Memory::allocate(
            device,
            requirements,
            MemoryUsage::GpuOnly,
            false,
            name,
        )?;
        image.bind_memory(memory)?;
        Ok(image)
    }

    /// `None` once released.
    pub fn memory_requirements(&self) -> Option<vk::MemoryRequirements> {
        let handle = self.handle.get()?;
        // SAFETY: handle is a live image from parent.
        Some(unsafe { self.parent.get_raw_image_memory_requirements(handle) })
    }

    /// Bind `memory` to this image. Allowed exactly once.
    pub fn bind_memory(&mut self, memory: Memory) -> Result<(), BindMemoryError> {
        let handle = bind_target(&self.handle, self.memory.is_some())?;
        // SAFETY: handle is a live image from parent.
        let requirements =
            unsafe { self.parent.get_raw_image_memory_requirements(handle) };
        check_bind(&requirements, &memory)?;
        let raw_memory = memory.raw_memory().ok_or(BindMemoryError::MemoryNotOwned)?;
        // SAFETY: the image is unbound and check_bind proved the memory
        // satisfies its requirements.
        unsafe {
            self.parent
                .bind_raw_image_memory(handle, raw_memory, memory.offset())
        }?;
        self.memory = Some(memory);
        Ok(())
    }

    pub fn borrowed(&self) -> Image {
        Image {
            parent: Arc::clone(&self.parent),
            handle: self.handle.borrowed(),
            desc: self.desc,
            memory: self.memory.as_ref().map(Memory::borrowed),
        }
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.handle.ownership()
    }

    /// Destroy the image and free its memory if owned. Idempotent.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take_for_release() {
            tracing::debug!("Dropping image {:?}", handle);
            // SAFETY: handle is owned by this wrapper; views of it are
            // destroyed before the image by their owners.
            unsafe { self.parent.destroy_raw_image(handle) };
        }
        if let Some(mut memory) = self.memory.take() {
            memory.release();
        }
    }

    /// Null once released.
    pub fn raw_image(&self) -> vk::Image {
        self.handle.get().unwrap_or_default()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.desc.samples
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Copy tightly packed RGBA8 `pixels` into the image and leave it in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// The image needs `TRANSFER_DST | SAMPLED` usage. Blocks until `queue`
    /// is idle.
    pub fn upload_rgba8<Q: Submittable>(
        &mut self,
        pool: &CommandPool,
        queue: &Q,
        pixels: &[u8],
    ) -> Result<(), UploadImageError> {
        let image = self.handle.get().ok_or(UploadImageError::Released)?;
        if self.memory.is_none() {
            return Err(UploadImageError::Unbound);
        }
        let extent = self.desc.extent;
        let expected = extent.width as usize * extent.height as usize * 4;
        if pixels.len() != expected {
            return Err(UploadImageError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        let mut staging = Buffer::allocated(
            &self.parent,
            &BufferDesc {
                size: pixels.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
            MemoryUsage::CpuToGpu,
            Some("staging texture"),
        )?;
        staging.write_pod(0, pixels)?;

        let barrier = |old, new| {
            let (src_access, dst_access, src_stage, dst_stage) =
                upload_transition(old, new).unwrap_or_default();
            (
                src_stage,
                dst_stage,
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(old)
                    .new_layout(new)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(color_subresource_range()),
            )
        };
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(extent.into());

        pool.one_time_submit(queue, |cmd| {
            let (src, dst, to_transfer) = barrier(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            // SAFETY: image and staging outlive the call, which waits for
            // the queue to drain; each barrier's old layout is the layout
            // the previous command left the image in.
            unsafe {
                cmd.pipeline_barrier(src, dst, &[to_transfer])?;
                cmd.copy_buffer_to_image(&staging, image, &[region])?;
                let (src, dst, to_shader) = barrier(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
                cmd.pipeline_barrier(src, dst, &[to_shader])
            }
        })?;
        tracing::debug!(
            "Uploaded {}x{} RGBA8 texture to {:?}",
            extent.width,
            extent.height,
            image
        );
        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// A 2-D colour `VkImageView`.
pub struct ImageView {
    parent: Arc<Device>,
    handle: Held<vk::ImageView>,
    format: vk::Format,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// Create a view covering all of `image`.
    pub fn new(
        device: &Arc<Device>,
        image: &Image,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let raw = image.handle.get().ok_or(CreateImageViewError::Released)?;
        // SAFETY: raw is a live image from device.
        unsafe { Self::from_raw_image(device, raw, image.format(), name) }
    }

    /// Create a view of an image this crate does not own, such as a
    /// swapchain image.
    ///
    /// # Safety
    /// `image` must be a live colour image from `device` with `format`,
    /// and must outlive the view.
    pub unsafe fn from_raw_image(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());
        // SAFETY: caller guarantees image validity.
        let handle = unsafe { device.create_raw_image_view(&create_info) }?;
        // SAFETY: handle is a valid image view from device.
        unsafe { device.name_or_warn(handle, "image view", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle: Held::Owned(handle),
            format,
        })
    }

    pub fn borrowed(&self) -> ImageView {
        ImageView {
            parent: Arc::clone(&self.parent),
            handle: self.handle.borrowed(),
            format: self.format,
        }
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.handle.ownership()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take_for_release() {
            tracing::debug!("Dropping image view {:?}", handle);
            // SAFETY: handle is owned by this wrapper; framebuffers using
            // it are destroyed first by their owners.
            unsafe { self.parent.destroy_raw_image_view(handle) };
        }
    }

    /// Null once released.
    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle.get().unwrap_or_default()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    /// Applied to U, V and W.
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// An owned `VkSampler`. Anisotropy and mip-mapping are disabled.
pub struct Sampler {
    parent: Arc<Device>,
    handle: Held<vk::Sampler>,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(
        device: &Arc<Device>,
        desc: &SamplerDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateSamplerError> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(false)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        // SAFETY: create_info is fully initialised with no borrowed data.
        let handle = unsafe { device.create_raw_sampler(&create_info) }?;
        // SAFETY: handle is a valid sampler from this device.
        unsafe { device.name_or_warn(handle, "sampler", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle: Held::Owned(handle),
        })
    }

    pub fn borrowed(&self) -> Sampler {
        Sampler {
            parent: Arc::clone(&self.parent),
            handle: self.handle.borrowed(),
        }
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.handle.ownership()
    }

    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take_for_release() {
            tracing::debug!("Dropping sampler {:?}", handle);
            // SAFETY: handle is owned by this wrapper and no pending GPU
            // work may reference it.
            unsafe { self.parent.destroy_raw_sampler(handle) };
        }
    }

    /// Null once released.
    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle.get().unwrap_or_default()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn bound_image_refuses_more_memory() {
        let handle = Held::Owned(vk::Image::null());
        assert!(bind_target(&handle, false).is_ok());
        assert!(matches!(
            bind_target(&handle, true),
            Err(BindMemoryError::AlreadyBound)
        ));
        assert!(matches!(
            bind_target(&handle.borrowed(), false),
            Err(BindMemoryError::ResourceNotOwned)
        ));
    }

    #[test]
    fn upload_transitions_cover_both_steps() {
        let (_, dst_access, _, dst_stage) = upload_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (src_access, dst_access, _, dst_stage) = upload_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unrelated_transition_is_unknown() {
        assert!(
            upload_transition(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR
            )
            .is_none()
        );
    }

    #[test]
    fn default_desc_is_a_sampled_texture() {
        let desc = ImageDesc::default();
        assert!(desc.usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_1);
    }
}
