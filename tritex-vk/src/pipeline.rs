use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::error::ApiError;
use crate::render_pass::RenderPass;
use crate::shader::EntryPoint;

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkPipelineLayout`.
///
/// Pipelines hold the layout behind an `Arc`, so it survives pipeline
/// rebuilds on swapchain recreation.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create a layout over `set_layouts` with no push constant ranges.
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[&DescriptorSetLayout],
        name: Option<&str>,
    ) -> Result<Self, ApiError> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let create_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: create_info references live set layouts from device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        // SAFETY: handle is a valid pipeline layout from device.
        unsafe { device.name_or_warn(handle, "pipeline layout", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_pipeline_layout(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Every pipeline holds an
        // Arc to the layout, so none remain.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Vertex input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    /// Byte offset within one vertex.
    pub offset: u32,
}

/// One interleaved vertex buffer at binding 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexInputDesc {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputDesc {
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(self.stride)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .binding(0)
                    .location(a.location)
                    .format(a.format)
                    .offset(a.offset)
            })
            .collect()
    }
}

/// A plain vertex record with a fixed interleaved layout.
pub trait Vertex: bytemuck::Pod {
    fn input_desc() -> VertexInputDesc;
}

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

/// Full-extent viewport, depth range 0..1.
pub fn viewport_for(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn scissor_for(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

pub fn rasterization_state(
    desc: &GraphicsPipelineDesc<'_>,
) -> vk::PipelineRasterizationStateCreateInfo<'static> {
    vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false)
        .line_width(1.0)
}

pub fn depth_stencil_state(
    desc: &GraphicsPipelineDesc<'_>,
) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_test && desc.depth_write)
        .depth_compare_op(desc.depth_compare_op)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
}

/// Opaque overwrite of all four channels.
pub fn color_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

// ---------------------------------------------------------------------------
// GraphicsPipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateGraphicsPipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Viewport extent must be non-zero, got {0:?}")]
    ZeroExtent(vk::Extent2D),

    #[error(
        "Pipeline rasterizes with {pipeline:?} but the render pass uses \
         {render_pass:?}"
    )]
    SampleMismatch {
        pipeline: vk::SampleCountFlags,
        render_pass: vk::SampleCountFlags,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Description of a [`GraphicsPipeline`] to create.
///
/// # Defaults (via [`Default`])
/// | field | default |
/// |---|---|
/// | `stages` | `&[]` (must be overridden) |
/// | `vertex_input` | empty |
/// | `extent` | `0x0` (must be overridden) |
/// | `samples` | `TYPE_1` |
/// | `polygon_mode` | `FILL` |
/// | `cull_mode` | `NONE` |
/// | `front_face` | `COUNTER_CLOCKWISE` |
/// | `depth_test` / `depth_write` | `true` / `true` |
/// | `depth_compare_op` | `LESS` |
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [EntryPoint<'a>],
    pub vertex_input: VertexInputDesc,
    /// Fixed viewport and scissor size; normally the swapchain extent.
    pub extent: vk::Extent2D,
    /// Must match the render pass's colour attachment.
    pub samples: vk::SampleCountFlags,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
}

impl Default for GraphicsPipelineDesc<'_> {
    fn default() -> Self {
        Self {
            stages: &[],
            vertex_input: VertexInputDesc::default(),
            extent: vk::Extent2D::default(),
            samples: vk::SampleCountFlags::TYPE_1,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
        }
    }
}

/// An immutable graphics pipeline bound to one render pass and extent.
///
/// Fixed state:
/// - Input assembly: `TRIANGLE_LIST`, no primitive restart
/// - Viewport/scissor: static, sized to `extent`
/// - Multisample: `samples`, no sample shading
/// - Colour blend: disabled, full RGBA write mask
///
/// A new extent or render pass means building a new pipeline.
pub struct GraphicsPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    pub fn new(
        device: &Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        layout: Arc<PipelineLayout>,
        render_pass: &RenderPass,
        name: Option<&str>,
    ) -> Result<Self, CreateGraphicsPipelineError> {
        if desc.stages.is_empty() {
            return Err(CreateGraphicsPipelineError::NoStages);
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(CreateGraphicsPipelineError::ZeroExtent(desc.extent));
        }
        if desc.samples != render_pass.desc().samples {
            return Err(CreateGraphicsPipelineError::SampleMismatch {
                pipeline: desc.samples,
                render_pass: render_pass.desc().samples,
            });
        }

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc
            .stages
            .iter()
            .map(|ep| ep.as_pipeline_stage_create_info())
            .collect();

        let bindings = [desc.vertex_input.binding_description()];
        let attributes = desc.vertex_input.attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [viewport_for(desc.extent)];
        let scissors = [scissor_for(desc.extent)];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization_state = rasterization_state(desc);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples)
            .sample_shading_enable(false);

        let depth_stencil_state = depth_stencil_state(desc);

        let blend_attachments = [color_blend_attachment()];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .layout(layout.raw_pipeline_layout())
            .render_pass(render_pass.raw_render_pass())
            .subpass(0);

        // SAFETY: create_info references shader stages, a live layout and
        // render pass from device, and state structs on this stack frame.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }?;
        // SAFETY: handle is a valid pipeline from device.
        unsafe { device.name_or_warn(handle, "pipeline", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
            extent: desc.extent,
        })
    }

    pub fn raw_pipeline(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent. All in-flight GPU work
        // using it completes before teardown or rebuild.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_triangle_state() {
        let desc = GraphicsPipelineDesc::default();
        let raster = rasterization_state(&desc);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(raster.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(raster.polygon_mode, vk::PolygonMode::FILL);

        let depth = depth_stencil_state(&desc);
        assert_eq!(depth.depth_test_enable, vk::TRUE);
        assert_eq!(depth.depth_write_enable, vk::TRUE);
        assert_eq!(depth.depth_compare_op, vk::CompareOp::LESS);

        let blend = color_blend_attachment();
        assert_eq!(blend.blend_enable, vk::FALSE);
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn depth_write_needs_depth_test() {
        let desc = GraphicsPipelineDesc {
            depth_test: false,
            ..Default::default()
        };
        assert_eq!(depth_stencil_state(&desc).depth_write_enable, vk::FALSE);
    }

    #[test]
    fn viewport_covers_extent() {
        let extent = vk::Extent2D {
            width: 1600,
            height: 900,
        };
        let v = viewport_for(extent);
        assert_eq!((v.width, v.height), (1600.0, 900.0));
        assert_eq!((v.min_depth, v.max_depth), (0.0, 1.0));
        assert_eq!(scissor_for(extent).extent, extent);
    }

    #[test]
    fn vertex_attributes_share_binding_zero() {
        let input = VertexInputDesc {
            stride: 28,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 8,
                },
                VertexAttribute {
                    location: 2,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 20,
                },
            ],
        };
        let binding = input.binding_description();
        assert_eq!(binding.stride, 28);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
        let attrs = input.attribute_descriptions();
        assert!(attrs.iter().all(|a| a.binding == 0));
        assert_eq!(attrs[2].offset, 20);
    }
}
