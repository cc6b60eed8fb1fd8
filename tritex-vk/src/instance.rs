//! Vulkan instance creation and physical-device queries.
//!
//! [`Instance`] owns the `ash::Entry` loader, the `ash::Instance`, an
//! optional debug messenger, and the optional surface extension loader.
//! Everything derived from it holds an `Arc<Instance>`.

use std::ffi::{CStr, CString};
use std::fmt::Debug;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use thiserror::Error;

use crate::error::{ApiError, VkResultExt};
use crate::log::{self, VulkanLogLevel};
use crate::surface::{CreateSurfaceError, SurfaceQueryError};

/// A packed Vulkan API version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Invalid app name was passed to Instance::new")]
    InvalidAppName,
}

/// Optional instance-level extensions for [`Instance::new`].
///
/// Set `surface` to request the platform surface extensions. A display
/// handle source must also be passed so the names can be resolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceExtensions {
    pub surface: bool,
}

/// The root Vulkan object.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.ver)
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, debug_utils)) = self.debug_messenger.take() {
            // SAFETY: messenger was created from this instance and this is
            // its last use.
            unsafe {
                debug_utils.destroy_debug_utils_messenger(messenger, None)
            };
        }
        // SAFETY: every derived object holds an Arc<Instance>, so none can
        // still be alive when the last reference drops.
        unsafe { self.handle.destroy_instance(None) };
    }
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

impl Instance {
    /// Create an instance able to present to windows from
    /// `display_handle_source` when `enabled_exts.surface` is set.
    ///
    /// `debug_level` enables the Khronos validation layer plus a debug
    /// messenger forwarding to `tracing` when both are available.
    ///
    /// # Safety
    /// Loads the Vulkan loader through `libloading`, which runs arbitrary
    /// initialisation code from the shared library.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        debug_level: Option<VulkanLogLevel>,
        display_handle_source: Option<&impl HasDisplayHandle>,
        enabled_exts: InstanceExtensions,
    ) -> Result<Self, InstanceCreationError> {
        let display = match display_handle_source {
            Some(source) if enabled_exts.surface => Some(
                source
                    .display_handle()
                    .map_err(InstanceCreationError::InvalidDisplayHandle)?
                    .as_raw(),
            ),
            _ => None,
        };
        // SAFETY: forwarded to the caller.
        unsafe { Self::create(app_name.as_ref(), debug_level, display) }
    }

    /// Create an instance with no surface support, for offscreen work and
    /// tests.
    ///
    /// # Safety
    /// Same as [`Instance::new`].
    pub unsafe fn new_headless(
        app_name: impl AsRef<str>,
        debug_level: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        // SAFETY: forwarded to the caller.
        unsafe { Self::create(app_name.as_ref(), debug_level, None) }
    }

    unsafe fn create(
        app_name: &str,
        debug_level: Option<VulkanLogLevel>,
        display: Option<RawDisplayHandle>,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name =
            CString::new(app_name).map_err(|_| Error::InvalidAppName)?;
        // SAFETY: the caller accepted the libloading contract. Entry is kept
        // in the Instance and dropped after the instance handle.
        let entry = unsafe { ash::Entry::load() }?;

        // SAFETY: entry is live; this query has no other preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        let mut mandatory_exts: Vec<&CStr> = Vec::new();
        if let Some(display) = display {
            let required = ash_window::enumerate_required_extensions(display)
                .op("vkEnumerateInstanceExtensionProperties")?;
            mandatory_exts.extend(required.iter().map(|ptr| {
                // SAFETY: ash_window returns static NUL-terminated names.
                unsafe { CStr::from_ptr(*ptr) }
            }));
        }

        // SAFETY: entry is live; None queries the implementation's own
        // extensions.
        let exts_avail =
            unsafe { entry.enumerate_instance_extension_properties(None) }
                .op("vkEnumerateInstanceExtensionProperties")?;
        // SAFETY: entry is live.
        let layers_avail = unsafe { entry.enumerate_instance_layer_properties() }
            .unwrap_or_default();

        let has_ext = |name: &CStr| {
            exts_avail
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(name))
        };

        let missing: Vec<String> = mandatory_exts
            .iter()
            .filter(|ext| !has_ext(ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let mut ext_ptrs: Vec<*const std::ffi::c_char> =
            mandatory_exts.iter().map(|e| e.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const std::ffi::c_char> = Vec::new();

        let mut flags = vk::InstanceCreateFlags::empty();
        if has_ext(ash::khr::portability_enumeration::NAME) {
            ext_ptrs.push(ash::khr::portability_enumeration::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let validation_available = layers_avail
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        let mut messenger_info = match debug_level {
            Some(level)
                if validation_available
                    && has_ext(ash::ext::debug_utils::NAME) =>
            {
                ext_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_ptrs.push(VALIDATION_LAYER.as_ptr());
                Some(log::messenger_create_info(level))
            }
            Some(level) => {
                tracing::warn!(
                    "Validation requested at {level:?} but the layer or \
                     VK_EXT_debug_utils is unavailable"
                );
                None
            }
            None => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"tritex")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if let Some(info) = messenger_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to live on this
        // stack frame for the duration of the call.
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .op("vkCreateInstance")?;

        let debug_messenger = match messenger_info {
            Some(mut info) => {
                info.p_next = std::ptr::null();
                let debug_utils =
                    ash::ext::debug_utils::Instance::new(&entry, &handle);
                // SAFETY: info is a valid standalone create info.
                match unsafe {
                    debug_utils.create_debug_utils_messenger(&info, None)
                } {
                    Ok(messenger) => Some((messenger, debug_utils)),
                    Err(e) => {
                        tracing::error!(
                            "Continuing without a debug messenger: {}",
                            ApiError::new("vkCreateDebugUtilsMessengerEXT", e)
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let surface_instance = display
            .is_some()
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        let ver = VkVersion::from_raw(api_version);
        tracing::info!(
            "Created Vulkan instance (api {ver}, validation: {}, surface: {})",
            debug_messenger.is_some(),
            surface_instance.is_some(),
        );

        Ok(Instance {
            entry,
            handle,
            debug_messenger,
            surface_instance,
            ver,
        })
    }

    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn has_surface_support(&self) -> bool {
        self.surface_instance.is_some()
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

// Physical device queries
impl Instance {
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, ApiError> {
        // SAFETY: the instance handle is valid for the life of self.
        unsafe { self.handle.enumerate_physical_devices() }
            .op("vkEnumeratePhysicalDevices")
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, ApiError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
        .op("vkEnumerateDeviceExtensionProperties")
    }

    /// # Safety
    /// `physical_device` must be derived from this instance and
    /// `create_info` must be a valid device create info whose pointers stay
    /// live for the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, ApiError> {
        // SAFETY: caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
            .op("vkCreateDevice")
    }
}

// Surface functionality
impl Instance {
    /// # Safety
    /// The surface must be destroyed before `source` is dropped or
    /// invalidated (for example on a winit suspend).
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_instance.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?
            .as_raw();
        let window = source
            .window_handle()
            .map_err(Error::InvalidWindowHandle)?
            .as_raw();
        // SAFETY: handles come from a live source; the caller upholds the
        // source-outlives-surface contract.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display,
                window,
                None,
            )
        }
        .op("vkCreateSurfaceKHR")
        .map_err(Error::Api)
    }

    /// # Safety
    /// `surface` must come from this instance, and every object derived
    /// from it must already be destroyed.
    pub unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR) {
        if let Some(surface_instance) = self.surface_instance.as_ref() {
            // SAFETY: caller guarantees provenance and destruction order.
            unsafe { surface_instance.destroy_surface(surface, None) };
        }
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        Ok(unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .op("vkGetPhysicalDeviceSurfaceSupportKHR")?)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        Ok(unsafe {
            surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        Ok(unsafe {
            surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        Ok(unsafe {
            surface_instance
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfacePresentModesKHR")?)
    }
}

// Device extension loaders
impl Instance {
    pub fn create_swapchain_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_components() {
        let version = VkVersion::from_raw(vk::make_api_version(0, 1, 3, 275));
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
    }

    #[test]
    fn vk_version_orders_by_release() {
        assert!(VkVersion::new(0, 1, 2, 0) < VkVersion::new(0, 1, 3, 0));
        assert_eq!(
            VkVersion::new(0, 1, 1, 0).to_raw(),
            vk::API_VERSION_1_1
        );
    }
}
