use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::error::ApiError;
use crate::image::ImageView;
use crate::render_pass::RenderPass;

#[derive(Debug, Error)]
pub enum CreateFramebufferError {
    #[error("Render pass expects {expected} attachments, got {actual}")]
    AttachmentCount { expected: usize, actual: usize },
    #[error("Framebuffer extent must be non-zero, got {0:?}")]
    ZeroExtent(vk::Extent2D),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Attachment order for one swapchain image: the multisampled colour
/// target first when present, then the swapchain view.
pub fn attachment_order(
    msaa_color: Option<vk::ImageView>,
    swapchain_view: vk::ImageView,
) -> Vec<vk::ImageView> {
    msaa_color.into_iter().chain([swapchain_view]).collect()
}

/// An owned `VkFramebuffer` for one render pass and extent.
pub struct Framebuffer {
    parent: Arc<Device>,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// The views must outlive the framebuffer.
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        name: Option<&str>,
    ) -> Result<Self, CreateFramebufferError> {
        if attachments.len() != render_pass.attachment_count() {
            return Err(CreateFramebufferError::AttachmentCount {
                expected: render_pass.attachment_count(),
                actual: attachments.len(),
            });
        }
        if extent.width == 0 || extent.height == 0 {
            return Err(CreateFramebufferError::ZeroExtent(extent));
        }
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.raw_render_pass())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        // SAFETY: create_info references a live render pass and views from
        // device whose count matches the pass.
        let handle = unsafe { device.create_raw_framebuffer(&create_info) }?;
        // SAFETY: handle is a valid framebuffer from device.
        unsafe { device.name_or_warn(handle, "framebuffer", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            extent,
        })
    }

    /// One framebuffer per swapchain view, sharing `msaa_color` when the
    /// pass is multisampled.
    ///
    /// Framebuffers created before a failure are dropped on return.
    pub fn for_swapchain_views(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        msaa_color: Option<&ImageView>,
        swapchain_views: &[ImageView],
        extent: vk::Extent2D,
    ) -> Result<Vec<Self>, CreateFramebufferError> {
        swapchain_views
            .iter()
            .enumerate()
            .map(|(i, view)| {
                let attachments = attachment_order(
                    msaa_color.map(ImageView::raw_image_view),
                    view.raw_image_view(),
                );
                Self::new(
                    device,
                    render_pass,
                    &attachments,
                    extent,
                    Some(&format!("framebuffer {i}")),
                )
            })
            .collect()
    }

    pub fn raw_framebuffer(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping framebuffer {:?}", self.handle);
        // SAFETY: handle was created from parent and no pending GPU work
        // renders into it.
        unsafe { self.parent.destroy_raw_framebuffer(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn msaa_target_precedes_swapchain_view() {
        let msaa = vk::ImageView::from_raw(1);
        let swap = vk::ImageView::from_raw(2);
        assert_eq!(attachment_order(Some(msaa), swap), vec![msaa, swap]);
        assert_eq!(attachment_order(None, swap), vec![swap]);
    }
}
