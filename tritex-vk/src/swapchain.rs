//! Presentable image chain ([`Swapchain`]) and the pure negotiation
//! helpers it is built from.
//!
//! Negotiation picks, from what the surface reports:
//! - format: caller preference, else `B8G8R8A8_SRGB` + `SRGB_NONLINEAR`,
//!   else the first reported
//! - present mode: `MAILBOX`, else the [`PresentFallback`] order
//! - extent: the surface's current extent, else the desired extent
//!   clamped to the advertised range
//! - image count: `clamp(min + 1, min, max)`, where `max == 0` means
//!   unbounded
//! - sharing: exclusive when graphics and present share a family,
//!   concurrent across both otherwise

use std::sync::{Arc, Mutex};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::Device;
use crate::error::ApiError;
use crate::image::{CreateImageViewError, ImageView};
use crate::surface::{Surface, SurfaceQueryError};
use crate::sync::Semaphore;

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Device, surface, and optional old swapchain must be derived from \
         the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("No supported present modes were reported")]
    NoPresentModes,

    #[error("Invalid requested swapchain extent ({width}x{height})")]
    InvalidExtent { width: u32, height: u32 },

    #[error("Swapchain support was not enabled on this device")]
    SwapchainNotEnabled,

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Failed to create swapchain image view: {0}")]
    ImageView(#[from] CreateImageViewError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum AcquireImageError {
    #[error("Swapchain is out of date and must be rebuilt")]
    OutOfDate,
    #[error("Acquired index {index} is out of range for {count} images")]
    IndexOutOfRange { index: u32, count: usize },
    #[error(transparent)]
    Api(ApiError),
}

/// An index handed back by acquire must name one of the chain's images.
fn check_acquired_index(
    index: u32,
    count: usize,
) -> Result<u32, AcquireImageError> {
    if index as usize >= count {
        return Err(AcquireImageError::IndexOutOfRange { index, count });
    }
    Ok(index)
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// What to use when `MAILBOX` is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentFallback {
    /// `IMMEDIATE`, then `FIFO`. Allows tearing.
    #[default]
    Immediate,
    /// `FIFO`, which every implementation supports.
    Fifo,
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred_format: Option<vk::Format>,
) -> Option<vk::SurfaceFormatKHR> {
    if let Some(preferred) = preferred_format
        && let Some(found) = formats.iter().copied().find(|f| f.format == preferred)
    {
        return Some(found);
    }
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    fallback: PresentFallback,
) -> vk::PresentModeKHR {
    let has = |m| present_modes.contains(&m);
    if has(vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    match fallback {
        PresentFallback::Immediate if has(vk::PresentModeKHR::IMMEDIATE) => {
            vk::PresentModeKHR::IMMEDIATE
        }
        PresentFallback::Immediate | PresentFallback::Fifo => {
            vk::PresentModeKHR::FIFO
        }
    }
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = if capabilities.max_image_count == 0 {
        u32::MAX
    } else {
        capabilities.max_image_count.max(min)
    };
    min.saturating_add(1).clamp(min, max)
}

pub fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|a| capabilities.supported_composite_alpha.contains(*a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Sharing mode and the family list to pass alongside it.
pub fn choose_sharing_mode(
    graphics_family: u32,
    present_family: u32,
) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![graphics_family, present_family],
        )
    }
}

/// Create one value per image, dropping those already built if any
/// creation fails.
fn create_per_image<V, E>(
    images: &[vk::Image],
    mut create: impl FnMut(usize, vk::Image) -> Result<V, E>,
) -> Result<Vec<V>, E> {
    images
        .iter()
        .copied()
        .enumerate()
        .map(|(i, image)| create(i, image))
        .collect()
}

// ---------------------------------------------------------------------------
// Swapchain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Used only when the surface leaves the extent to the swapchain.
    pub desired_extent: vk::Extent2D,
    pub preferred_format: Option<vk::Format>,
    pub present_fallback: PresentFallback,
    pub graphics_family: u32,
    pub present_family: u32,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            desired_extent: vk::Extent2D {
                width: 1600,
                height: 900,
            },
            preferred_format: None,
            present_fallback: PresentFallback::default(),
            graphics_family: 0,
            present_family: 0,
        }
    }
}

/// An image returned by [`Swapchain::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Always `< image_count()`.
    pub index: u32,
    /// Usable, but the swapchain should be rebuilt.
    pub suboptimal: bool,
}

/// A `VkSwapchainKHR` with one view per image.
///
/// The images belong to the presentation engine and are never destroyed
/// here; the views and the chain handle are.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    parent: Arc<Device>,
    surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<ImageView>,
    /// `vkAcquireNextImageKHR` must be externally synchronized on the
    /// swapchain handle.
    acquire_lock: Mutex<()>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("surface_format", &self.surface_format)
            .field("present_mode", &self.present_mode)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    /// Negotiate with `surface` and create the chain.
    ///
    /// Pass the previous chain as `old` when rebuilding; it must come from
    /// the same device and surface and may be dropped once this returns.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        desc: &SwapchainDesc,
        old: Option<&Self>,
    ) -> Result<Self, CreateSwapchainError> {
        if !device.has_swapchain_support() {
            return Err(CreateSwapchainError::SwapchainNotEnabled);
        }
        let desired = desc.desired_extent;
        if desired.width == 0 || desired.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: desired.width,
                height: desired.height,
            });
        }
        if !Arc::ptr_eq(surface.parent(), device.parent()) {
            return Err(CreateSwapchainError::MismatchedParams);
        }
        if let Some(old) = old
            && (!Arc::ptr_eq(&old.parent, device) || !Arc::ptr_eq(&old.surface, surface))
        {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        let physical_device = device.physical_device();
        // SAFETY: physical_device belongs to device's instance, which is
        // the surface's instance (checked above).
        let capabilities = unsafe { surface.query_capabilities(physical_device) }?;
        // SAFETY: as above.
        let formats = unsafe { surface.query_formats(physical_device) }?;
        // SAFETY: as above.
        let present_modes = unsafe { surface.query_present_modes(physical_device) }?;

        let surface_format = choose_surface_format(&formats, desc.preferred_format)
            .ok_or(CreateSwapchainError::NoSurfaceFormats)?;
        if present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }
        let present_mode = choose_present_mode(&present_modes, desc.present_fallback);
        let extent = choose_extent(&capabilities, desired);
        let image_count = choose_image_count(&capabilities);
        let composite_alpha = choose_composite_alpha(&capabilities);
        let (sharing_mode, families) =
            choose_sharing_mode(desc.graphics_family, desc.present_family);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.handle));

        // SAFETY: create_info references the live surface and values chosen
        // from its reported support.
        let handle = unsafe { device.create_raw_swapchain(&create_info) }?;
        // SAFETY: handle is a valid swapchain from device.
        unsafe { device.name_or_warn(handle, "swapchain", Some("swapchain")) };

        let built = Self::collect_views(device, handle, surface_format.format);
        let (images, views) = match built {
            Ok(parts) => parts,
            Err(e) => {
                // SAFETY: handle was created above and has no live views.
                unsafe { device.destroy_raw_swapchain(handle) };
                return Err(e);
            }
        };

        tracing::info!(
            "Created swapchain: {}x{} {:?}/{:?}, {:?}, {} images (min {}), {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            images.len(),
            image_count,
            sharing_mode,
        );

        Ok(Self {
            parent: Arc::clone(device),
            surface: Arc::clone(surface),
            handle,
            surface_format,
            present_mode,
            extent,
            images,
            views,
            acquire_lock: Mutex::new(()),
        })
    }

    fn collect_views(
        device: &Arc<Device>,
        handle: vk::SwapchainKHR,
        format: vk::Format,
    ) -> Result<(Vec<vk::Image>, Vec<ImageView>), CreateSwapchainError> {
        // SAFETY: handle is a live swapchain from device.
        let images = unsafe { device.get_raw_swapchain_images(handle) }?;
        let views = create_per_image(&images, |i, image| {
            // SAFETY: image belongs to the live swapchain and the view is
            // destroyed before it.
            unsafe {
                ImageView::from_raw_image(
                    device,
                    image,
                    format,
                    Some(&format!("swapchain view {i}")),
                )
            }
        })?;
        Ok((images, views))
    }

    /// Block until an image is available and signal `signal` when the
    /// presentation engine releases it.
    ///
    /// `VK_ERROR_OUT_OF_DATE_KHR` is reported as
    /// [`AcquireImageError::OutOfDate`]; `signal` is then left unsignaled.
    pub fn acquire_next_image(
        &self,
        signal: &Semaphore,
    ) -> Result<AcquiredImage, AcquireImageError> {
        let _guard = self
            .acquire_lock
            .lock()
            .expect("swapchain acquire lock poisoned");
        // SAFETY: handle is live for the lifetime of self. The semaphore
        // comes from the same device, and the frame loop never reuses it
        // while a previous acquire's signal is still pending.
        let acquired = unsafe {
            self.parent.acquire_next_swapchain_image(
                self.handle,
                u64::MAX,
                signal.raw_semaphore(),
                vk::Fence::null(),
            )
        };
        let (index, suboptimal) = match acquired {
            Ok(v) => v,
            Err(e) if e.is_out_of_date() => return Err(AcquireImageError::OutOfDate),
            Err(e) => return Err(AcquireImageError::Api(e)),
        };
        let index = check_acquired_index(index, self.images.len())?;
        Ok(AcquiredImage { index, suboptimal })
    }

    pub fn raw_swapchain(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[ImageView] {
        &self.views
    }

    pub fn surface(&self) -> &Arc<Surface<T>> {
        &self.surface
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // Views must go before the chain that owns their images.
        self.views.clear();
        // SAFETY: handle was created by parent and the caller has waited for
        // in-flight work that presents from or renders to it.
        unsafe { self.parent.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn acquired_index_must_be_below_image_count() {
        assert_eq!(check_acquired_index(2, 3).ok(), Some(2));
        assert!(matches!(
            check_acquired_index(3, 3),
            Err(AcquireImageError::IndexOutOfRange { index: 3, count: 3 })
        ));
        assert!(check_acquired_index(0, 0).is_err());
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_takes_one_extra_within_range() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn image_count_stays_within_advertised_range() {
        for (min, max) in [(1, 1), (1, 8), (3, 3), (2, 0), (4, 16)] {
            let count = choose_image_count(&caps(min, max));
            assert!(count >= min);
            if max > 0 {
                assert!(count <= max);
            }
        }
    }

    #[test]
    fn mailbox_wins_when_available() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            PresentFallback::Immediate,
        );
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn immediate_fallback_skips_fifo() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
            PresentFallback::Immediate,
        );
        assert_eq!(chosen, vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn fifo_fallback_ignores_immediate() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
            PresentFallback::Fifo,
        );
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn immediate_fallback_uses_fifo_as_last_resort() {
        let chosen =
            choose_present_mode(&[vk::PresentModeKHR::FIFO], PresentFallback::Immediate);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(
            choose_surface_format(&[fallback, preferred], None),
            Some(preferred)
        );
        assert_eq!(
            choose_surface_format(&[fallback, preferred], Some(vk::Format::R8G8B8A8_UNORM)),
            Some(fallback)
        );
        assert_eq!(choose_surface_format(&[fallback], None), Some(fallback));
        assert_eq!(choose_surface_format(&[], None), None);
    }

    #[test]
    fn extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((chosen.width, chosen.height), (1280, 720));
    }

    #[test]
    fn extent_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );
        assert_eq!((chosen.width, chosen.height), (1920, 480));
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&capabilities),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
    }

    #[test]
    fn sharing_mode_follows_family_split() {
        assert_eq!(
            choose_sharing_mode(0, 0),
            (vk::SharingMode::EXCLUSIVE, vec![])
        );
        assert_eq!(
            choose_sharing_mode(0, 2),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }

    struct Tracked<'a>(u64, &'a RefCell<Vec<u64>>);

    impl Drop for Tracked<'_> {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn per_image_creation_drops_earlier_values_on_failure() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
        ];
        let dropped = RefCell::new(Vec::new());
        let result = create_per_image(&images, |i, image| {
            if i == 2 {
                Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            } else {
                Ok(Tracked(image.as_raw(), &dropped))
            }
        });
        assert!(matches!(
            result,
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
        assert_eq!(dropped.borrow().as_slice(), &[1, 2]);
    }

    #[test]
    fn per_image_creation_keeps_order() {
        let images = [vk::Image::from_raw(7), vk::Image::from_raw(8)];
        let values = create_per_image(&images, |i, image| {
            Ok::<_, ()>((i, image.as_raw()))
        })
        .unwrap();
        assert_eq!(values, vec![(0, 7), (1, 8)]);
    }
}
