//! Descriptor set layout, pool, and set wrappers.
//!
//! [`DescriptorSetLayout`] describes the binding slots within a
//! descriptor set. [`DescriptorPool`] allocates descriptor sets from a
//! fixed-size pool. [`DescriptorSet`] is a plain handle to an allocated
//! set; the pool frees every set when it is dropped.
//!
//! [`triangle_bindings`] is the layout the textured triangle draws
//! with: a uniform buffer for the vertex stage and a combined image
//! sampler for the fragment stage.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;
use crate::error::ApiError;
use crate::image::{ImageView, Sampler};

#[derive(Debug, Error)]
pub enum CreateDescriptorError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum AllocateDescriptorSetError {
    #[error(
        "Pool sized for {max_sets} sets cannot serve {requested} more \
         ({allocated} already allocated)"
    )]
    PoolExhausted {
        max_sets: u32,
        allocated: u32,
        requested: u32,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

/// Describes a single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    /// Binding slot index used by the shader.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<DescriptorBindingDesc> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

pub const UNIFORM_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;

/// Uniform buffer at binding 0 (vertex), combined image sampler at
/// binding 1 (fragment).
pub fn triangle_bindings() -> [DescriptorBindingDesc; 2] {
    [
        DescriptorBindingDesc {
            binding: UNIFORM_BINDING,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
        },
        DescriptorBindingDesc {
            binding: TEXTURE_BINDING,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
        },
    ]
}

/// Pool capacity needed to allocate `set_count` sets of a layout with
/// `bindings`. Bindings of the same type are merged into one entry.
pub fn pool_sizes_for(
    bindings: &[DescriptorBindingDesc],
    set_count: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        let needed = b.count * set_count;
        match sizes.iter_mut().find(|s| s.ty == b.descriptor_type) {
            Some(s) => s.descriptor_count += needed,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: b.descriptor_type,
                descriptor_count: needed,
            }),
        }
    }
    sizes
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
        name: Option<&str>,
    ) -> Result<Self, CreateDescriptorError> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: create_info references vk_bindings, which outlives the
        // call.
        let handle =
            unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;
        // SAFETY: handle is a valid layout from device.
        unsafe { device.name_or_warn(handle, "descriptor set layout", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
        })
    }

    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipeline layouts that
        // reference it are dropped first by their owners.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// A fixed-capacity `VkDescriptorPool`.
///
/// Sets are never freed individually; dropping the pool frees them all.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
    max_sets: u32,
    allocated: u32,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("max_sets", &self.max_sets)
            .field("allocated", &self.allocated)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// Create a pool able to hold `max_sets` sets of `layout`.
    pub fn for_layout(
        device: &Arc<Device>,
        layout: &DescriptorSetLayout,
        max_sets: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateDescriptorError> {
        let pool_sizes = pool_sizes_for(layout.bindings(), max_sets);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        // SAFETY: create_info references pool_sizes, which outlives the
        // call.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;
        // SAFETY: handle is a valid pool from device.
        unsafe { device.name_or_warn(handle, "descriptor pool", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            max_sets,
            allocated: 0,
        })
    }

    /// Allocate `count` sets of `layout`.
    pub fn allocate_sets(
        &mut self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<DescriptorSet>, AllocateDescriptorSetError> {
        if self.allocated + count > self.max_sets {
            return Err(AllocateDescriptorSetError::PoolExhausted {
                max_sets: self.max_sets,
                allocated: self.allocated,
                requested: count,
            });
        }
        let raw_layouts =
            vec![layout.raw_descriptor_set_layout(); count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&raw_layouts);
        // SAFETY: alloc_info references this pool and a live layout, both
        // from self.parent, and capacity was checked above.
        let raw_sets =
            unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }?;
        self.allocated += count;
        Ok(raw_sets
            .into_iter()
            .map(|handle| DescriptorSet { handle })
            .collect())
    }

    pub fn raw_descriptor_pool(&self) -> vk::DescriptorPool {
        self.handle
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: handle was created from parent. All GPU work that used
        // sets from this pool has completed before teardown.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A descriptor set allocated from a [`DescriptorPool`].
///
/// Does not own its memory. The caller must not use it after the pool
/// is dropped.
#[derive(Debug)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Point `binding` at the first `range` bytes of `buffer`.
    ///
    /// # Safety
    /// `buffer` must come from `device` with `UNIFORM_BUFFER` usage,
    /// `range` must not exceed its size, and it must stay alive while the
    /// set is bound in any submitted command buffer. No pending GPU work
    /// may use this set.
    pub unsafe fn write_uniform_buffer(
        &self,
        device: &Device,
        binding: u32,
        buffer: impl BufferHandle,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw_buffer())
            .offset(0)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: caller guarantees buffer and range validity.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }

    /// Point `binding` at `view` sampled through `sampler`, read in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Safety
    /// `view` and `sampler` must come from `device` and stay alive while
    /// the set is bound in any submitted command buffer. The image must be
    /// in `SHADER_READ_ONLY_OPTIMAL` when shaders read it. No pending GPU
    /// work may use this set.
    pub unsafe fn write_combined_image_sampler(
        &self,
        device: &Device,
        binding: u32,
        view: &ImageView,
        sampler: &Sampler,
    ) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view.raw_image_view())
            .sampler(sampler.raw_sampler())
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info));
        // SAFETY: caller guarantees view, sampler and layout validity.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_scale_with_set_count() {
        let sizes = pool_sizes_for(&triangle_bindings(), 3);
        assert_eq!(sizes.len(), 2);
        let ubo = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(ubo.descriptor_count, 3);
        let tex = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(tex.descriptor_count, 3);
    }

    #[test]
    fn bindings_of_same_type_are_merged() {
        let bindings = [
            DescriptorBindingDesc {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
            },
            DescriptorBindingDesc {
                binding: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 2,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
            },
        ];
        let sizes = pool_sizes_for(&bindings, 2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 6);
    }

    #[test]
    fn triangle_layout_stages() {
        let [ubo, tex] = triangle_bindings();
        assert_eq!(ubo.stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(tex.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(tex.binding, TEXTURE_BINDING);
    }
}
