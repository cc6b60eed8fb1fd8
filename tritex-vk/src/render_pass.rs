//! Single-subpass colour render pass ([`RenderPass`]).
//!
//! The pass clears one colour attachment, stores it, and leaves it in
//! `PRESENT_SRC_KHR`. With more than one sample the colour attachment is
//! a transient multisampled image and a single-sample resolve attachment
//! takes over the present role.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("Colour format must not be UNDEFINED")]
    UndefinedFormat,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Normally the swapchain's negotiated format.
    pub color_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl Default for RenderPassDesc {
    fn default() -> Self {
        Self {
            color_format: vk::Format::B8G8R8A8_SRGB,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

impl RenderPassDesc {
    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }
}

/// Attachment list in framebuffer order: the colour attachment first,
/// then the resolve attachment when multisampled.
pub fn attachment_descriptions(desc: &RenderPassDesc) -> Vec<vk::AttachmentDescription> {
    if !desc.is_multisampled() {
        return vec![
            vk::AttachmentDescription::default()
                .format(desc.color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        ];
    }
    vec![
        vk::AttachmentDescription::default()
            .format(desc.color_format)
            .samples(desc.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        vk::AttachmentDescription::default()
            .format(desc.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
    ]
}

/// Holds colour writes until the presentation engine has released the
/// image, which the acquire semaphore signals at
/// `COLOR_ATTACHMENT_OUTPUT`.
pub fn external_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
}

pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
    desc: RenderPassDesc,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(
        device: &Arc<Device>,
        desc: &RenderPassDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateRenderPassError> {
        if desc.color_format == vk::Format::UNDEFINED {
            return Err(CreateRenderPassError::UndefinedFormat);
        }
        let attachments = attachment_descriptions(desc);
        let color_ref = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let resolve_ref = [vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref);
        if desc.is_multisampled() {
            subpass = subpass.resolve_attachments(&resolve_ref);
        }
        let dependency = [external_dependency()];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependency);

        // SAFETY: create_info and every array it points at live on this
        // stack frame for the duration of the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }?;
        // SAFETY: handle is a valid render pass from device.
        unsafe { device.name_or_warn(handle, "render pass", name) };
        tracing::debug!(
            "Created render pass {:?} ({:?}, {:?})",
            handle,
            desc.color_format,
            desc.samples
        );

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            desc: *desc,
        })
    }

    pub fn raw_render_pass(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    /// 1 or 2 depending on multisampling.
    pub fn attachment_count(&self) -> usize {
        if self.desc.is_multisampled() { 2 } else { 1 }
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: handle was created from parent. Framebuffers and
        // pipelines built against it are dropped first by their owners.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_pass_clears_stores_and_presents() {
        let a = attachment_descriptions(&RenderPassDesc::default());
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(a[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(a[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(a[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn multisampled_pass_resolves_into_present_attachment() {
        let desc = RenderPassDesc {
            samples: vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        };
        let a = attachment_descriptions(&desc);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(a[0].store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(a[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(a[1].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn dependency_gates_colour_output() {
        let d = external_dependency();
        assert_eq!(d.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(d.dst_subpass, 0);
        assert_eq!(
            d.dst_stage_mask,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(d.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }
}
