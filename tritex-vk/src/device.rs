//! Logical device wrapper ([`Device`]).
//!
//! `Device` wraps a `VkDevice` opened on one [`Adapter`] and centralises
//! all per-device state: a `gpu-allocator` allocator (behind a `Mutex`),
//! the swapchain and debug-utils extension loaders, and every queue that
//! was requested at open time.
//!
//! All raw Vulkan operations on the device handle are surfaced as
//! `unsafe fn` methods (`create_raw_*`, `destroy_raw_*`, `cmd_*`). Every
//! fallible one returns [`ApiError`] naming the Vulkan entry point.
//! Higher-level wrappers in sibling modules call these rather than
//! accessing `ash::Device` directly, and hold an `Arc<Device>` so the
//! device outlives everything created through it.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::adapter::{Adapter, QueueFamily};
use crate::error::{ApiError, VkResultExt};
use crate::instance::Instance;
use crate::memory::{MemoryUsage, select_memory_type};

/// How many queues to open from one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub family: u32,
    pub count: u32,
}

/// Parameters for [`Device::new`].
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub queues: Vec<QueueRequest>,
    /// Enable `VK_KHR_swapchain`.
    pub swapchain: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            swapchain: true,
        }
    }
}

impl DeviceDesc {
    /// One queue from `family`.
    pub fn single_queue(family: u32, swapchain: bool) -> Self {
        Self {
            queues: vec![QueueRequest { family, count: 1 }],
            swapchain,
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("No queues were requested")]
    NoQueuesRequested,
    #[error("Queue family {0} does not exist on the adapter")]
    InvalidQueueFamily(u32),
    #[error(
        "Requested {requested} queues from family {family}, \
         which only has {available}"
    )]
    TooManyQueues {
        family: u32,
        requested: u32,
        available: u32,
    },
    #[error("Adapter is missing required extension {0}")]
    MissingExtension(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum AllocateMemoryError {
    #[error(
        "No memory type in mask {type_bits:#b} is compatible with {usage:?}"
    )]
    NoCompatibleMemoryType { type_bits: u32, usage: MemoryUsage },
    #[error("Allocator failed: {0}")]
    Allocator(#[from] AllocationError),
}

/// A logical Vulkan device and its associated per-device state.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: Vec<QueueFamily>,
    /// Keyed by `(family, index)`.
    queues: HashMap<(u32, u32), Arc<Mutex<vk::Queue>>>,
    swapchain_device: Option<ash::khr::swapchain::Device>,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // Allocator must go before vkDestroyDevice.
        self.allocator = None;
        // SAFETY: every object derived from this device holds an
        // Arc<Device>, so none can still be alive.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Open a logical device on `adapter` with the queues in `desc`.
    ///
    /// `VK_KHR_portability_subset` is enabled whenever the adapter
    /// advertises it, as Vulkan requires.
    pub fn new(
        instance: &Arc<Instance>,
        adapter: &Adapter,
        desc: &DeviceDesc,
    ) -> Result<Self, CreateDeviceError> {
        use CreateDeviceError as Error;

        if desc.queues.is_empty() {
            return Err(Error::NoQueuesRequested);
        }

        // Merge duplicate family requests.
        let mut family_counts: Vec<(u32, u32)> = Vec::new();
        for req in &desc.queues {
            match family_counts.iter_mut().find(|(f, _)| *f == req.family) {
                Some((_, count)) => *count += req.count,
                None => family_counts.push((req.family, req.count)),
            }
        }
        for &(family, requested) in &family_counts {
            let available = adapter
                .queue_families()
                .iter()
                .find(|f| f.index == family)
                .ok_or(Error::InvalidQueueFamily(family))?
                .queue_count;
            if requested == 0 || requested > available {
                return Err(Error::TooManyQueues {
                    family,
                    requested,
                    available,
                });
            }
        }

        let mut exts: Vec<&CStr> = Vec::new();
        if desc.swapchain {
            if !adapter.supports_extension(ash::khr::swapchain::NAME) {
                return Err(Error::MissingExtension(
                    ash::khr::swapchain::NAME.to_string_lossy().into_owned(),
                ));
            }
            exts.push(ash::khr::swapchain::NAME);
        }
        if adapter.supports_extension(ash::khr::portability_subset::NAME) {
            exts.push(ash::khr::portability_subset::NAME);
        }
        let ext_ptrs: Vec<*const std::ffi::c_char> =
            exts.iter().map(|e| e.as_ptr()).collect();

        let priorities: Vec<Vec<f32>> = family_counts
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> =
            family_counts
                .iter()
                .zip(priorities.iter())
                .map(|(&(family, _), priorities)| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(priorities)
                })
                .collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs);

        let physical_device = adapter.raw_physical_device();
        // SAFETY: the adapter was enumerated from instance; create_info and
        // the slices it points to live on this stack frame.
        let device =
            unsafe { instance.create_ash_device(physical_device, &create_info) }?;

        let mut queues = HashMap::new();
        for &(family, count) in &family_counts {
            for index in 0..count {
                // SAFETY: the device was just created with this family and
                // at least `count` queues from it.
                let queue = unsafe { device.get_device_queue(family, index) };
                queues.insert((family, index), Arc::new(Mutex::new(queue)));
            }
        }

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing was created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(Error::AllocatorCreation(e));
            }
        };

        tracing::info!(
            "Opened device on {:?} with queues {:?} and extensions {:?}",
            adapter.name(),
            family_counts,
            exts
        );

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            swapchain_device: desc
                .swapchain
                .then(|| instance.create_swapchain_loader(&device)),
            debug_utils_device: instance.create_debug_utils_device_loader(&device),
            handle: device,
            physical_device,
            properties: *adapter.properties(),
            memory_properties: *adapter.memory_properties(),
            queue_families: adapter.queue_families().to_vec(),
            queues,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_family(&self, family: u32) -> Option<&QueueFamily> {
        self.queue_families.iter().find(|f| f.index == family)
    }

    pub(crate) fn queue_slot(
        &self,
        family: u32,
        index: u32,
    ) -> Option<&Arc<Mutex<vk::Queue>>> {
        self.queues.get(&(family, index))
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    pub fn has_swapchain_support(&self) -> bool {
        self.swapchain_device.is_some()
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// Meant for coarse transitions (shutdown, suspend, swapchain
    /// rebuild), never the per-frame path.
    pub fn wait_idle(&self) -> Result<(), ApiError> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the handle is valid for the lifetime of self.
        unsafe { self.handle.device_wait_idle() }.op("vkDeviceWaitIdle")
    }
}

// Memory allocation
impl Device {
    /// Allocate memory for `requirements` from the best type for `usage`.
    ///
    /// Narrows `memory_type_bits` to the chosen type. Returns the
    /// allocation and the chosen memory type index.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<(Allocation, u32), AllocateMemoryError> {
        let idx = select_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            usage,
        )
        .ok_or(AllocateMemoryError::NoCompatibleMemoryType {
            type_bits: requirements.memory_type_bits,
            usage,
        })?;

        let requirements = vk::MemoryRequirements {
            memory_type_bits: 1 << idx,
            ..requirements
        };

        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok((allocation, idx))
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.free(allocation)
    }
}

// Debug naming functionality
impl Device {
    /// Set a Vulkan debug name for an object owned by this device.
    ///
    /// A no-op when debug utils are not enabled or `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a valid handle created from this device.
    pub unsafe fn set_object_name<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError> {
        let (Some(debug_utils), Some(name)) =
            (self.debug_utils_device.as_ref(), name)
        else {
            return Ok(());
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);
        // SAFETY: caller guarantees object provenance.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .op("vkSetDebugUtilsObjectNameEXT")?;
        Ok(())
    }

    /// # Safety
    /// Same as [`Device::set_object_name`].
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError> {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(NameObjectError::InvalidName)?;
        // SAFETY: same contract as set_object_name.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }

    /// Name `object`, logging instead of failing.
    ///
    /// # Safety
    /// Same as [`Device::set_object_name`].
    pub(crate) unsafe fn name_or_warn<H: vk::Handle + Copy + std::fmt::Debug>(
        &self,
        object: H,
        kind: &str,
        name: Option<&str>,
    ) {
        // SAFETY: forwarded to the caller.
        if let Err(e) = unsafe { self.set_object_name_str(object, name) } {
            tracing::warn!("Failed to name {kind} {:?}: {e}", object);
        }
    }
}

// Queue operations
impl Device {
    /// # Safety
    /// `queue` must be one of this device's queues. Every handle referenced
    /// by `submits` and `fence` must be valid, derived from this device, and
    /// satisfy vkQueueSubmit's state requirements.
    pub unsafe fn queue_submit(
        &self,
        queue: &Mutex<vk::Queue>,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), ApiError> {
        let queue = queue.lock().expect("queue lock poisoned");
        // SAFETY: caller guarantees handle validity; the lock provides
        // external synchronisation of the queue.
        unsafe { self.handle.queue_submit(*queue, submits, fence) }
            .op("vkQueueSubmit")
    }

    /// # Safety
    /// `queue` must be one of this device's queues.
    pub unsafe fn queue_wait_idle(
        &self,
        queue: &Mutex<vk::Queue>,
    ) -> Result<(), ApiError> {
        let queue = queue.lock().expect("queue lock poisoned");
        // SAFETY: caller guarantees provenance; lock held.
        unsafe { self.handle.queue_wait_idle(*queue) }.op("vkQueueWaitIdle")
    }

    /// Present on `queue`. Returns `Ok(true)` when suboptimal.
    ///
    /// # Safety
    /// `queue` must be one of this device's queues with present support
    /// for the target surface. All handles in `present_info` must be valid
    /// and the image must be in `PRESENT_SRC_KHR`.
    pub unsafe fn queue_present(
        &self,
        queue: &Mutex<vk::Queue>,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, ApiError> {
        let swapchain_device = self.swapchain_device.as_ref().ok_or(
            ApiError::new(
                "vkQueuePresentKHR",
                vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            ),
        )?;
        let queue = queue.lock().expect("queue lock poisoned");
        // SAFETY: caller guarantees handle validity; lock held.
        unsafe { swapchain_device.queue_present(*queue, present_info) }
            .op("vkQueuePresentKHR")
    }
}

// Swapchain functionality
impl Device {
    fn swapchain_loader(
        &self,
        operation: &'static str,
    ) -> Result<&ash::khr::swapchain::Device, ApiError> {
        self.swapchain_device.as_ref().ok_or(ApiError::new(
            operation,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT,
        ))
    }

    /// # Safety
    /// `create_info` must reference valid objects derived from this device
    /// and its parent instance. A non-null `old_swapchain` must be a live
    /// swapchain from this device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, ApiError> {
        let loader = self.swapchain_loader("vkCreateSwapchainKHR")?;
        // SAFETY: caller guarantees create_info validity.
        unsafe { loader.create_swapchain(create_info, None) }
            .op("vkCreateSwapchainKHR")
    }

    /// # Safety
    /// `swapchain` must be a live swapchain from this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, ApiError> {
        let loader = self.swapchain_loader("vkGetSwapchainImagesKHR")?;
        // SAFETY: caller guarantees swapchain validity.
        unsafe { loader.get_swapchain_images(swapchain) }
            .op("vkGetSwapchainImagesKHR")
    }

    /// # Safety
    /// `swapchain` must come from this device, every view of its images
    /// must be destroyed, and no pending GPU work may reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = self.swapchain_device.as_ref() {
            // SAFETY: caller guarantees provenance and ordering.
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    /// Returns `(image_index, suboptimal)`.
    ///
    /// # Safety
    /// `swapchain` must be a live swapchain from this device. `semaphore`
    /// and `fence`, when not null, must be unsignaled handles from this
    /// device.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), ApiError> {
        let loader = self.swapchain_loader("vkAcquireNextImageKHR")?;
        // SAFETY: caller guarantees handle validity.
        unsafe {
            loader.acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
        .op("vkAcquireNextImageKHR")
    }
}

// Buffer and image functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
            .op("vkCreateBuffer")
    }

    /// # Safety
    /// `buffer` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a live buffer from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` must be live and unbound; `memory` and `offset` must satisfy
    /// the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees binding preconditions.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
            .op("vkBindBufferMemory")
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
            .op("vkCreateImage")
    }

    /// # Safety
    /// `image` must come from this device (never a swapchain image), all
    /// views of it must be destroyed, and no pending GPU work may use it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a live image from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` must be live and unbound; `memory` and `offset` must satisfy
    /// the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees binding preconditions.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
            .op("vkBindImageMemory")
    }

    /// # Safety
    /// `create_info` must reference a live image from this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image_view(create_info, None) }
            .op("vkCreateImageView")
    }

    /// # Safety
    /// `image_view` must come from this device, every framebuffer using it
    /// must be destroyed, and no pending GPU work may reference it.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_sampler(create_info, None) }
            .op("vkCreateSampler")
    }

    /// # Safety
    /// `sampler` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }
}

// Render pass, framebuffer and pipeline functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_render_pass(create_info, None) }
            .op("vkCreateRenderPass")
    }

    /// # Safety
    /// `render_pass` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// `create_info` must reference a live render pass and image views from
    /// this device.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_framebuffer(create_info, None) }
            .op("vkCreateFramebuffer")
    }

    /// # Safety
    /// `framebuffer` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }

    /// # Safety
    /// `create_info` must contain valid SPIR-V.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
            .op("vkCreateShaderModule")
    }

    /// # Safety
    /// `shader_module` must come from this device.
    pub unsafe fn destroy_raw_shader_module(
        &self,
        shader_module: vk::ShaderModule,
    ) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    /// # Safety
    /// `create_info` must reference live descriptor set layouts from this
    /// device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
            .op("vkCreatePipelineLayout")
    }

    /// # Safety
    /// `layout` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
    ) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must reference valid shader stages, a live pipeline
    /// layout and render pass, all from this device.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        let pipelines = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            // Destroy anything created before the failure.
            for p in partial {
                if p != vk::Pipeline::null() {
                    // SAFETY: p was just created by this device.
                    unsafe { self.handle.destroy_pipeline(p, None) };
                }
            }
            ApiError::new("vkCreateGraphicsPipelines", result)
        })?;
        pipelines.into_iter().next().ok_or(ApiError::new(
            "vkCreateGraphicsPipelines",
            vk::Result::ERROR_UNKNOWN,
        ))
    }

    /// # Safety
    /// `pipeline` must come from this device and no pending GPU work may
    /// reference it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Command pool and buffer functionality
impl Device {
    /// # Safety
    /// `create_info` must name a queue family this device was opened with.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
            .op("vkCreateCommandPool")
    }

    /// # Safety
    /// `pool` must come from this device and none of its command buffers may
    /// be pending.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `alloc_info.command_pool` must be a live pool from this device.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        alloc_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, ApiError> {
        // SAFETY: caller guarantees alloc_info validity.
        unsafe { self.handle.allocate_command_buffers(alloc_info) }
            .op("vkAllocateCommandBuffers")
    }

    /// # Safety
    /// Every buffer must come from `pool` and none may be pending.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) };
    }

    /// # Safety
    /// `command_buffer` must be in the initial state and its pool must not
    /// be in use on another thread.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
            .op("vkBeginCommandBuffer")
    }

    /// # Safety
    /// `command_buffer` must be recording with no render pass active.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
            .op("vkEndCommandBuffer")
    }

    /// # Safety
    /// `command_buffer` must not be pending, and its pool must have been
    /// created with `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees command buffer state.
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }
        .op("vkResetCommandBuffer")
    }
}

// Synchronization functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
            .op("vkCreateFence")
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must be a live fence from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees fence validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
            .op("vkWaitForFences")
    }

    /// # Safety
    /// Every fence must be a live fence from this device and not pending.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), ApiError> {
        // SAFETY: caller guarantees fence validity and state.
        unsafe { self.handle.reset_fences(fences) }.op("vkResetFences")
    }

    /// # Safety
    /// `fence` must be a live fence from this device.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, ApiError> {
        // SAFETY: caller guarantees fence validity.
        unsafe { self.handle.get_fence_status(fence) }.op("vkGetFenceStatus")
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
            .op("vkCreateSemaphore")
    }

    /// # Safety
    /// `semaphore` must come from this device and no GPU work may be
    /// waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Descriptor set functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
            .op("vkCreateDescriptorSetLayout")
    }

    /// # Safety
    /// `layout` must come from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, ApiError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
            .op("vkCreateDescriptorPool")
    }

    /// # Safety
    /// `pool` must come from this device and none of its sets may be
    /// referenced by pending GPU work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `alloc_info` must reference a live pool with capacity and live
    /// layouts, all from this device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, ApiError> {
        // SAFETY: caller guarantees alloc_info validity.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
            .op("vkAllocateDescriptorSets")
    }

    /// # Safety
    /// Every handle in `writes` must be valid and from this device, and no
    /// pending GPU work may use the written sets.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        // SAFETY: caller guarantees write validity.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) }
    }
}

// Command recording
impl Device {
    /// # Safety
    /// `command_buffer` must be recording outside a render pass, and
    /// `begin_info` must reference a live render pass and a compatible
    /// framebuffer.
    pub unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        // SAFETY: caller guarantees command buffer state and handles.
        unsafe {
            self.handle.cmd_begin_render_pass(
                command_buffer,
                begin_info,
                vk::SubpassContents::INLINE,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a render pass.
    pub unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.cmd_end_render_pass(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must be recording; `pipeline` must be live.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: caller guarantees command buffer state and pipeline.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; every buffer must be live with
    /// `VERTEX_BUFFER` usage.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: caller guarantees command buffer state and buffers.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must be live with
    /// `INDEX_BUFFER` usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: caller guarantees command buffer state and buffer.
        unsafe {
            self.handle.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                index_type,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `layout` must be compatible with
    /// the bound pipeline and every set must be live.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: caller guarantees command buffer state and handles.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a render pass with a pipeline,
    /// vertex and index buffers bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees command buffer state.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; both
    /// buffers must be live with the right transfer usage, and every region
    /// must be in bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: caller guarantees command buffer state and bounds.
        unsafe { self.handle.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; `dst` must
    /// be in `TRANSFER_DST_OPTIMAL` and every region must be in bounds.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees command buffer state and bounds.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; every image barrier must name a
    /// live image whose current layout matches `old_layout`.
    pub unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: caller guarantees command buffer state and barriers.
        unsafe {
            self.handle.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            )
        }
    }
}
