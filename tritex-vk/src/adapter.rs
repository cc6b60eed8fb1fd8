//! Physical adapter discovery and selection.
//!
//! [`Adapter::enumerate`] snapshots every physical device the instance
//! exposes: properties, memory types, queue families and extension
//! names. [`select_adapter`] then picks the **first** adapter (in
//! enumeration order) that has a queue family carrying every required
//! capability and advertises every required extension. There is no
//! performance-tier scoring.
//!
//! Adapters are not owned objects. They are valid for as long as the
//! instance they were enumerated from.

use std::ffi::{CStr, CString};

use ash::vk;
use bitflags::bitflags;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::error::ApiError;
use crate::instance::{Instance, VkVersion};
use crate::surface::{Surface, SurfaceQueryError};

bitflags! {
    /// Roles a queue family can fill.
    ///
    /// `PRESENT` is not a Vulkan queue flag. It is set only when the
    /// family was checked against a surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PROTECTED = 1 << 4;
        const VIDEO_DECODE = 1 << 5;
        const VIDEO_ENCODE = 1 << 6;
        const PRESENT = 1 << 7;
    }
}

impl QueueCapabilities {
    pub fn from_queue_flags(flags: vk::QueueFlags) -> Self {
        let mut caps = Self::empty();
        let pairs = [
            (vk::QueueFlags::GRAPHICS, Self::GRAPHICS),
            (vk::QueueFlags::COMPUTE, Self::COMPUTE),
            (vk::QueueFlags::TRANSFER, Self::TRANSFER),
            (vk::QueueFlags::SPARSE_BINDING, Self::SPARSE_BINDING),
            (vk::QueueFlags::PROTECTED, Self::PROTECTED),
            (vk::QueueFlags::VIDEO_DECODE_KHR, Self::VIDEO_DECODE),
            (vk::QueueFlags::VIDEO_ENCODE_KHR, Self::VIDEO_ENCODE),
        ];
        for (flag, cap) in pairs {
            if flags.contains(flag) {
                caps |= cap;
            }
        }
        // Graphics and compute queues implicitly support transfer.
        if caps.intersects(Self::GRAPHICS | Self::COMPUTE) {
            caps |= Self::TRANSFER;
        }
        caps
    }
}

/// One queue family on an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub capabilities: QueueCapabilities,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    pub min_image_transfer_granularity: vk::Extent3D,
}

impl QueueFamily {
    pub fn from_properties(index: u32, props: &vk::QueueFamilyProperties) -> Self {
        Self {
            index,
            capabilities: QueueCapabilities::from_queue_flags(props.queue_flags),
            queue_count: props.queue_count,
            timestamp_valid_bits: props.timestamp_valid_bits,
            min_image_transfer_granularity: props
                .min_image_transfer_granularity,
        }
    }

    /// True when the family has every capability in `required` and at
    /// least one queue.
    pub fn satisfies(&self, required: QueueCapabilities) -> bool {
        self.queue_count >= 1 && self.capabilities.contains(required)
    }
}

#[derive(Debug, Error)]
pub enum EnumerateAdaptersError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Error checking surface support: {0}")]
    SurfaceSupport(#[from] SurfaceQueryError),
}

/// A snapshot of one physical device.
#[derive(Clone)]
pub struct Adapter {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: Vec<QueueFamily>,
    extensions: Vec<CString>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("handle", &self.handle)
            .field("name", &self.name())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Adapter {
    /// Assemble an adapter from already-queried data.
    pub fn from_parts(
        handle: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        queue_families: Vec<QueueFamily>,
        extensions: Vec<CString>,
    ) -> Self {
        Self {
            handle,
            properties,
            memory_properties,
            queue_families,
            extensions,
        }
    }

    /// Enumerate every adapter without checking presentation support.
    pub fn enumerate(
        instance: &Instance,
    ) -> Result<Vec<Self>, EnumerateAdaptersError> {
        Self::enumerate_with(instance, |_, _| Ok(false))
    }

    /// Enumerate every adapter, marking families that can present to
    /// `surface` with [`QueueCapabilities::PRESENT`].
    pub fn enumerate_for_surface<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Instance,
        surface: &Surface<T>,
    ) -> Result<Vec<Self>, EnumerateAdaptersError> {
        Self::enumerate_with(instance, |dev, family| {
            // SAFETY: dev was enumerated from the instance that owns the
            // surface's parent; callers pass the surface's own instance.
            unsafe { surface.supports_queue_family(dev, family) }
        })
    }

    fn enumerate_with(
        instance: &Instance,
        mut presents: impl FnMut(
            vk::PhysicalDevice,
            u32,
        ) -> Result<bool, SurfaceQueryError>,
    ) -> Result<Vec<Self>, EnumerateAdaptersError> {
        let mut adapters = Vec::new();
        for dev in instance.fetch_raw_physical_devices()? {
            // SAFETY: dev was just enumerated from instance.
            let properties =
                unsafe { instance.get_raw_physical_device_properties(dev) };
            // SAFETY: as above.
            let memory_properties = unsafe {
                instance.get_raw_physical_device_memory_properties(dev)
            };
            // SAFETY: as above.
            let extensions = unsafe {
                instance.enumerate_raw_device_extension_properties(dev)
            }?
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

            let mut queue_families = query_queue_families(instance, dev);
            for family in &mut queue_families {
                if presents(dev, family.index)? {
                    family.capabilities |= QueueCapabilities::PRESENT;
                }
            }

            let adapter = Self::from_parts(
                dev,
                properties,
                memory_properties,
                queue_families,
                extensions,
            );
            tracing::debug!(
                "Found adapter {:?} ({:?}, api {}) with {} queue families",
                adapter.name(),
                adapter.device_type(),
                adapter.api_version(),
                adapter.queue_families.len(),
            );
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    /// Re-query this adapter's queue families directly from the driver,
    /// bypassing the snapshot. `PRESENT` is never set on the result.
    pub fn query_queue_families(&self, instance: &Instance) -> Vec<QueueFamily> {
        query_queue_families(instance, self.handle)
    }

    pub fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned())
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    pub fn api_version(&self) -> VkVersion {
        VkVersion::from_raw(self.properties.api_version)
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.queue_families
    }

    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == name)
    }

    /// First family carrying every capability in `required`.
    pub fn find_queue_family(&self, required: QueueCapabilities) -> Option<u32> {
        find_queue_family(&self.queue_families, required)
    }

    /// Largest sample count usable for a color attachment, capped at
    /// `requested`.
    pub fn clamp_color_samples(
        &self,
        requested: vk::SampleCountFlags,
    ) -> vk::SampleCountFlags {
        clamp_sample_count(
            self.properties.limits.framebuffer_color_sample_counts,
            requested,
        )
    }
}

fn query_queue_families(
    instance: &Instance,
    dev: vk::PhysicalDevice,
) -> Vec<QueueFamily> {
    // SAFETY: dev is derived from instance by every caller.
    unsafe { instance.get_raw_physical_device_queue_family_properties(dev) }
        .iter()
        .enumerate()
        .map(|(i, props)| QueueFamily::from_properties(i as u32, props))
        .collect()
}

/// First family in `families` carrying every capability in `required`
/// with at least one queue.
pub fn find_queue_family(
    families: &[QueueFamily],
    required: QueueCapabilities,
) -> Option<u32> {
    families
        .iter()
        .find(|f| f.satisfies(required))
        .map(|f| f.index)
}

/// First family able to both draw and present. Only meaningful for
/// adapters from [`Adapter::enumerate_for_surface`].
pub fn find_graphics_present_family(families: &[QueueFamily]) -> Option<u32> {
    find_queue_family(
        families,
        QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT,
    )
}

pub(crate) fn clamp_sample_count(
    supported: vk::SampleCountFlags,
    requested: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&c| c.as_raw() <= requested.as_raw() && supported.contains(c))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Predicate an adapter must satisfy to be selected.
#[derive(Debug, Clone)]
pub struct AdapterRequirements {
    pub queue_capabilities: QueueCapabilities,
    pub extensions: Vec<&'static CStr>,
}

impl Default for AdapterRequirements {
    /// Graphics and presentation on one family plus `VK_KHR_swapchain`.
    fn default() -> Self {
        Self {
            queue_capabilities: QueueCapabilities::GRAPHICS
                | QueueCapabilities::PRESENT,
            extensions: vec![ash::khr::swapchain::NAME],
        }
    }
}

impl AdapterRequirements {
    /// Graphics only, no extensions. For headless work.
    pub fn headless() -> Self {
        Self {
            queue_capabilities: QueueCapabilities::GRAPHICS,
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSelection {
    pub adapter_index: usize,
    pub queue_family_index: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectAdapterError {
    #[error("No suitable device: none of {0} adapters meets the requirements")]
    NoSuitableAdapter(usize),
}

/// Pick the first adapter meeting `requirements`, and the first family on
/// it that does.
pub fn select_adapter(
    adapters: &[Adapter],
    requirements: &AdapterRequirements,
) -> Result<AdapterSelection, SelectAdapterError> {
    for (adapter_index, adapter) in adapters.iter().enumerate() {
        if let Some(missing) = requirements
            .extensions
            .iter()
            .find(|ext| !adapter.supports_extension(ext))
        {
            tracing::debug!(
                "Skipping {:?}: missing {}",
                adapter.name(),
                missing.to_string_lossy()
            );
            continue;
        }
        let Some(queue_family_index) =
            adapter.find_queue_family(requirements.queue_capabilities)
        else {
            tracing::debug!(
                "Skipping {:?}: no queue family with {:?}",
                adapter.name(),
                requirements.queue_capabilities
            );
            continue;
        };
        tracing::info!(
            "Selected adapter {:?} ({:?}), queue family {}",
            adapter.name(),
            adapter.device_type(),
            queue_family_index
        );
        return Ok(AdapterSelection {
            adapter_index,
            queue_family_index,
        });
    }
    Err(SelectAdapterError::NoSuitableAdapter(adapters.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(index: u32, caps: QueueCapabilities, count: u32) -> QueueFamily {
        QueueFamily {
            index,
            capabilities: caps,
            queue_count: count,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        }
    }

    fn fake_adapter(
        raw: u64,
        families: Vec<QueueFamily>,
        swapchain: bool,
    ) -> Adapter {
        let extensions = if swapchain {
            vec![ash::khr::swapchain::NAME.to_owned()]
        } else {
            Vec::new()
        };
        Adapter::from_parts(
            vk::PhysicalDevice::from_raw(raw),
            vk::PhysicalDeviceProperties::default(),
            vk::PhysicalDeviceMemoryProperties::default(),
            families,
            extensions,
        )
    }

    const GP: QueueCapabilities =
        QueueCapabilities::GRAPHICS.union(QueueCapabilities::PRESENT);

    #[test]
    fn queue_flags_map_to_capabilities() {
        let caps = QueueCapabilities::from_queue_flags(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::SPARSE_BINDING,
        );
        assert!(caps.contains(QueueCapabilities::GRAPHICS));
        assert!(caps.contains(QueueCapabilities::SPARSE_BINDING));
        assert!(caps.contains(QueueCapabilities::TRANSFER));
        assert!(!caps.contains(QueueCapabilities::PRESENT));
    }

    #[test]
    fn first_matching_adapter_wins() {
        let adapters = vec![
            fake_adapter(1, vec![family(0, QueueCapabilities::GRAPHICS, 1)], true),
            fake_adapter(
                2,
                vec![family(0, QueueCapabilities::COMPUTE, 1), family(1, GP, 2)],
                true,
            ),
            fake_adapter(3, vec![family(0, GP, 16)], true),
        ];

        let selection =
            select_adapter(&adapters, &AdapterRequirements::default()).unwrap();

        assert_eq!(
            selection,
            AdapterSelection {
                adapter_index: 1,
                queue_family_index: 1
            }
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let adapters = vec![
            fake_adapter(1, vec![family(0, GP, 1)], false),
            fake_adapter(2, vec![family(0, GP, 1), family(1, GP, 1)], true),
        ];
        let reqs = AdapterRequirements::default();

        let first = select_adapter(&adapters, &reqs).unwrap();
        for _ in 0..8 {
            assert_eq!(select_adapter(&adapters, &reqs).unwrap(), first);
        }
        assert_eq!(first.adapter_index, 1);
        assert_eq!(first.queue_family_index, 0);
    }

    #[test]
    fn missing_swapchain_extension_disqualifies() {
        let adapters = vec![fake_adapter(1, vec![family(0, GP, 1)], false)];
        assert_eq!(
            select_adapter(&adapters, &AdapterRequirements::default()),
            Err(SelectAdapterError::NoSuitableAdapter(1))
        );
    }

    #[test]
    fn empty_family_is_never_chosen() {
        let families = [family(0, GP, 0), family(1, GP, 1)];
        assert_eq!(find_graphics_present_family(&families), Some(1));
    }

    #[test]
    fn split_graphics_and_present_families_do_not_qualify() {
        let adapters = vec![fake_adapter(
            1,
            vec![
                family(0, QueueCapabilities::GRAPHICS, 1),
                family(1, QueueCapabilities::PRESENT, 1),
            ],
            true,
        )];
        assert!(select_adapter(&adapters, &AdapterRequirements::default()).is_err());
    }

    #[test]
    fn no_adapters_is_no_suitable_device() {
        assert_eq!(
            select_adapter(&[], &AdapterRequirements::headless()),
            Err(SelectAdapterError::NoSuitableAdapter(0))
        );
    }

    #[test]
    fn sample_count_clamps_to_supported() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(
            clamp_sample_count(supported, vk::SampleCountFlags::TYPE_8),
            vk::SampleCountFlags::TYPE_4
        );
        assert_eq!(
            clamp_sample_count(supported, vk::SampleCountFlags::TYPE_1),
            vk::SampleCountFlags::TYPE_1
        );
    }
}
