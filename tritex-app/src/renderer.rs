//! The Vulkan side of the app: everything needed to draw the triangle, and
//! the [`FrameBackend`] that drives one frame of it.

use std::{path::PathBuf, sync::Arc, time::Instant};

use eyre::{OptionExt, WrapErr};
use tritex_vk::{
    adapter::{Adapter, AdapterRequirements, select_adapter},
    ash::vk,
    buffer::{Buffer, BufferDesc},
    command::{CommandBuffer, CommandPool},
    descriptor::{
        DescriptorPool, DescriptorSet, DescriptorSetLayout, TEXTURE_BINDING,
        UNIFORM_BINDING, triangle_bindings,
    },
    device::{Device, DeviceDesc},
    frame::{self, Acquired, FrameBackend},
    framebuffer::Framebuffer,
    image::{Image, ImageDesc, ImageView, Sampler, SamplerDesc},
    instance::Instance,
    memory::MemoryUsage,
    pipeline::{GraphicsPipeline, GraphicsPipelineDesc, PipelineLayout, Vertex},
    queue::{GraphicsPresentQueue, PresentStatus, Presentable, SubmitBatch, Submittable},
    render_pass::{RenderPass, RenderPassDesc},
    shader::{ShaderModule, ShaderStage},
    surface::Surface,
    swapchain::{
        AcquireImageError, AcquiredImage, PresentFallback, Swapchain, SwapchainDesc,
    },
    sync::{Fence, Semaphore},
};
use winit::window::Window;

use crate::{
    scene::{FrameState, TRIANGLE_INDICES, TRIANGLE_VERTICES, TexturedVertex, Transforms},
    texture::Texture,
};

const VERTEX_ENTRY: &str = "vertMain";
const FRAGMENT_ENTRY: &str = "fragMain";

const CLEAR_COLOR: vk::ClearValue = vk::ClearValue {
    color: vk::ClearColorValue {
        float32: [0.02, 0.02, 0.03, 1.0],
    },
};

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub shader_path: PathBuf,
    pub texture_path: Option<PathBuf>,
    pub present_fallback: PresentFallback,
    /// Clamped to what the adapter supports.
    pub samples: vk::SampleCountFlags,
}

pub fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Objects tied to one swapchain. Rebuilt as a unit, never patched.
///
/// Fields drop in declaration order, children before parents.
struct SwapchainResources {
    framebuffers: Vec<Framebuffer>,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    _msaa_view: Option<ImageView>,
    _msaa_image: Option<Image>,
    descriptor_sets: Vec<DescriptorSet>,
    _descriptor_pool: DescriptorPool,
    /// One per swapchain image, persistently mapped.
    uniform_buffers: Vec<Buffer>,
    swapchain: Swapchain<Window>,
}

/// The window surface and, unless the window is zero-sized, a swapchain
/// for it. Absent while suspended.
struct PresentTarget {
    chain: Option<SwapchainResources>,
    surface: Arc<Surface<Window>>,
}

pub struct Renderer {
    target: Option<PresentTarget>,
    command_buffer: CommandBuffer,
    in_flight: Fence,
    image_available: Semaphore,
    render_finished: Semaphore,
    sampler: Sampler,
    texture_view: ImageView,
    _texture: Image,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    pipeline_layout: Arc<PipelineLayout>,
    descriptor_layout: DescriptorSetLayout,
    shader: ShaderModule,
    _command_pool: CommandPool,
    queue: GraphicsPresentQueue,
    device: Arc<Device>,
    window: Arc<Window>,
    queue_family: u32,
    samples: vk::SampleCountFlags,
    present_fallback: PresentFallback,
    started: Instant,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("device", &self.device)
            .field("queue_family", &self.queue_family)
            .field("samples", &self.samples)
            .field("suspended", &self.target.is_none())
            .finish_non_exhaustive()
    }
}

fn live_chain(target: &Option<PresentTarget>) -> eyre::Result<&SwapchainResources> {
    target
        .as_ref()
        .and_then(|t| t.chain.as_ref())
        .ok_or_eyre("No swapchain to draw with")
}

fn live_chain_mut(
    target: &mut Option<PresentTarget>,
) -> eyre::Result<&mut SwapchainResources> {
    target
        .as_mut()
        .and_then(|t| t.chain.as_mut())
        .ok_or_eyre("No swapchain to draw with")
}

impl Renderer {
    pub fn new(
        instance: &Arc<Instance>,
        window: Arc<Window>,
        config: &RendererConfig,
    ) -> eyre::Result<Self> {
        let _span = tracing::debug_span!("renderer_init").entered();

        //SAFETY: The surface is dropped in `suspend`, before winit
        //invalidates the native window surface.
        let surface = Arc::new(unsafe { Surface::new(instance, Arc::clone(&window)) }?);

        let adapters = Adapter::enumerate_for_surface(instance, &surface)?;
        let selection = select_adapter(&adapters, &AdapterRequirements::default())?;
        let adapter = &adapters[selection.adapter_index];
        let queue_family = selection.queue_family_index;

        let samples = adapter.clamp_color_samples(config.samples);
        if samples != config.samples {
            tracing::warn!(
                "{:?} samples not supported by {}, using {:?}",
                config.samples,
                adapter.name(),
                samples
            );
        }

        let device = Arc::new(Device::new(
            instance,
            adapter,
            &DeviceDesc::single_queue(queue_family, true),
        )?);
        let queue = device.queue::<GraphicsPresentQueue>(queue_family, 0)?;
        let command_pool = CommandPool::new(&device, queue_family, Some("renderer"))?;
        let command_buffer = command_pool.allocate(Some("frame"))?;

        let shader_bytes = std::fs::read(&config.shader_path).wrap_err_with(|| {
            format!("Failed to read shader {}", config.shader_path.display())
        })?;
        let shader = ShaderModule::new(&device, &shader_bytes, Some("triangle"))?;

        let descriptor_layout =
            DescriptorSetLayout::new(&device, &triangle_bindings(), Some("triangle"))?;
        let pipeline_layout = Arc::new(PipelineLayout::new(
            &device,
            &[&descriptor_layout],
            Some("triangle"),
        )?);

        let vertex_buffer = Buffer::upload_via_staging(
            &device,
            &command_pool,
            &queue,
            &TRIANGLE_VERTICES,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            Some("triangle vertices"),
        )?;
        let index_buffer = Buffer::upload_via_staging(
            &device,
            &command_pool,
            &queue,
            &TRIANGLE_INDICES,
            vk::BufferUsageFlags::INDEX_BUFFER,
            Some("triangle indices"),
        )?;

        let pixels = Texture::load_or_checkerboard(config.texture_path.as_deref())?;
        let mut texture = Image::allocated(
            &device,
            &ImageDesc {
                extent: pixels.extent(),
                ..Default::default()
            },
            Some("texture"),
        )?;
        texture.upload_rgba8(&command_pool, &queue, &pixels.pixels)?;
        let texture_view = ImageView::new(&device, &texture, Some("texture"))?;
        let sampler = Sampler::new(&device, &SamplerDesc::default(), Some("texture"))?;

        let in_flight = Fence::new(&device, true, Some("in flight"))?;
        let image_available = Semaphore::new(&device, Some("image available"))?;
        let render_finished = Semaphore::new(&device, Some("render finished"))?;

        let mut renderer = Self {
            target: Some(PresentTarget {
                chain: None,
                surface,
            }),
            command_buffer,
            in_flight,
            image_available,
            render_finished,
            sampler,
            texture_view,
            _texture: texture,
            index_buffer,
            vertex_buffer,
            pipeline_layout,
            descriptor_layout,
            shader,
            _command_pool: command_pool,
            queue,
            device,
            window,
            queue_family,
            samples,
            present_fallback: config.present_fallback,
            started: Instant::now(),
        };
        let extent = window_extent(&renderer.window);
        renderer.rebuild(extent)?;
        Ok(renderer)
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// A surface and a non-empty swapchain both exist.
    pub fn can_render(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.chain.is_some())
    }

    /// Draw one frame, rebuilding the swapchain afterwards if the frame
    /// reported it stale or suboptimal. Does nothing while suspended or
    /// zero-sized.
    pub fn render(&mut self) -> eyre::Result<()> {
        if !self.can_render() {
            return Ok(());
        }
        let outcome = frame::draw_frame(self)?;
        if outcome.needs_rebuild() {
            tracing::debug!("Rebuilding swapchain after {:?}", outcome);
            self.rebuild(window_extent(&self.window))?;
        }
        Ok(())
    }

    /// Match the swapchain to a new window size. Zero in either dimension
    /// tears the swapchain down until the next non-zero resize.
    pub fn resize(&mut self, extent: vk::Extent2D) -> eyre::Result<()> {
        let Some(target) = self.target.as_ref() else {
            return Ok(());
        };
        if let Some(chain) = &target.chain
            && chain.swapchain.extent() == extent
        {
            tracing::trace!(
                "Skipping swapchain recreate because extent is unchanged: {}x{}",
                extent.width,
                extent.height
            );
            return Ok(());
        }
        self.rebuild(extent)
    }

    /// Drop the surface and everything derived from it.
    pub fn suspend(&mut self) -> eyre::Result<()> {
        self.device
            .wait_idle()
            .wrap_err("Waiting for device idle during suspend")?;
        self.target = None;
        Ok(())
    }

    /// Recreate the surface after [`suspend`](Self::suspend).
    pub fn resume(&mut self) -> eyre::Result<()> {
        //SAFETY: Dropped again in `suspend`.
        let surface = Arc::new(unsafe {
            Surface::new(self.device.parent(), Arc::clone(&self.window))
        }?);
        // SAFETY: the device's physical device was enumerated from the
        // instance the surface was created with.
        let supported = unsafe {
            surface.supports_queue_family(self.device.physical_device(), self.queue_family)
        }?;
        if !supported {
            eyre::bail!(
                "Queue family {} cannot present to the resumed surface",
                self.queue_family
            );
        }
        self.target = Some(PresentTarget {
            chain: None,
            surface,
        });
        self.rebuild(window_extent(&self.window))
    }

    fn rebuild(&mut self, extent: vk::Extent2D) -> eyre::Result<()> {
        let _span = tracing::debug_span!(
            "rebuild_swapchain",
            width = extent.width,
            height = extent.height
        )
        .entered();
        self.device
            .wait_idle()
            .wrap_err("Waiting for device idle before swapchain rebuild")?;

        let Some(mut target) = self.target.take() else {
            return Ok(());
        };
        let old = target.chain.take();
        let built = if extent.width == 0 || extent.height == 0 {
            tracing::trace!(
                "Received zero extent ({}x{}); leaving swapchain torn down",
                extent.width,
                extent.height
            );
            Ok(None)
        } else {
            self.build_chain(
                &target.surface,
                extent,
                old.as_ref().map(|c| &c.swapchain),
            )
            .map(Some)
        };
        drop(old);
        let result = built.map(|chain| target.chain = chain);
        self.target = Some(target);
        result
    }

    fn build_chain(
        &self,
        surface: &Arc<Surface<Window>>,
        extent: vk::Extent2D,
        old: Option<&Swapchain<Window>>,
    ) -> eyre::Result<SwapchainResources> {
        let device = &self.device;
        let swapchain = Swapchain::new(
            device,
            surface,
            &SwapchainDesc {
                desired_extent: extent,
                preferred_format: None,
                present_fallback: self.present_fallback,
                graphics_family: self.queue_family,
                present_family: self.queue_family,
            },
            old,
        )?;
        let extent = swapchain.extent();
        let image_count = swapchain.image_count() as u32;

        let render_pass = RenderPass::new(
            device,
            &RenderPassDesc {
                color_format: swapchain.format(),
                samples: self.samples,
            },
            Some("triangle"),
        )?;

        let (msaa_image, msaa_view) = if render_pass.desc().is_multisampled() {
            let image = Image::allocated(
                device,
                &ImageDesc {
                    extent,
                    format: swapchain.format(),
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                    samples: self.samples,
                },
                Some("msaa color"),
            )?;
            let view = ImageView::new(device, &image, Some("msaa color"))?;
            (Some(image), Some(view))
        } else {
            (None, None)
        };

        let stages = [
            self.shader.entry_point(VERTEX_ENTRY, ShaderStage::Vertex)?,
            self.shader.entry_point(FRAGMENT_ENTRY, ShaderStage::Fragment)?,
        ];
        let pipeline = GraphicsPipeline::new(
            device,
            &GraphicsPipelineDesc {
                stages: &stages,
                vertex_input: TexturedVertex::input_desc(),
                extent,
                samples: self.samples,
                ..Default::default()
            },
            Arc::clone(&self.pipeline_layout),
            &render_pass,
            Some("triangle"),
        )?;

        let framebuffers = Framebuffer::for_swapchain_views(
            device,
            &render_pass,
            msaa_view.as_ref(),
            swapchain.image_views(),
            extent,
        )?;

        let ubo_size = size_of::<Transforms>() as vk::DeviceSize;
        let uniform_buffers = (0..image_count)
            .map(|i| {
                Buffer::allocated(
                    device,
                    &BufferDesc {
                        size: ubo_size,
                        usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    },
                    MemoryUsage::CpuToGpu,
                    Some(&format!("transforms {i}")),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptor_pool = DescriptorPool::for_layout(
            device,
            &self.descriptor_layout,
            image_count,
            Some("per-image"),
        )?;
        let descriptor_sets =
            descriptor_pool.allocate_sets(&self.descriptor_layout, image_count)?;
        for (set, ubo) in descriptor_sets.iter().zip(&uniform_buffers) {
            // SAFETY: the sets are fresh, so no GPU work uses them. The
            // buffer, view and sampler all come from device and outlive
            // the sets: the buffers drop with them, the texture with self.
            unsafe {
                set.write_uniform_buffer(device, UNIFORM_BINDING, ubo, ubo_size);
                set.write_combined_image_sampler(
                    device,
                    TEXTURE_BINDING,
                    &self.texture_view,
                    &self.sampler,
                );
            }
        }

        Ok(SwapchainResources {
            framebuffers,
            pipeline,
            render_pass,
            _msaa_view: msaa_view,
            _msaa_image: msaa_image,
            descriptor_sets,
            _descriptor_pool: descriptor_pool,
            uniform_buffers,
            swapchain,
        })
    }
}

impl FrameBackend for Renderer {
    type Error = eyre::Report;

    fn wait_in_flight(&mut self) -> eyre::Result<()> {
        if self.in_flight.is_ready() {
            // The previous frame was abandoned before submit.
            return Ok(());
        }
        self.in_flight.wait_and_reset(u64::MAX)?;
        Ok(())
    }

    fn acquire(&mut self) -> eyre::Result<Acquired> {
        let chain = live_chain(&self.target)?;
        match chain.swapchain.acquire_next_image(&self.image_available) {
            Ok(AcquiredImage { index, suboptimal }) => {
                Ok(Acquired::Image { index, suboptimal })
            }
            Err(AcquireImageError::OutOfDate) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&mut self, image_index: u32) -> eyre::Result<()> {
        let chain = live_chain(&self.target)?;
        let i = image_index as usize;
        let framebuffer = chain
            .framebuffers
            .get(i)
            .ok_or_eyre("No framebuffer for acquired image")?;
        let set = chain
            .descriptor_sets
            .get(i)
            .ok_or_eyre("No descriptor set for acquired image")?;
        let clear_values = vec![CLEAR_COLOR; chain.render_pass.attachment_count()];

        let cmd = &mut self.command_buffer;
        // SAFETY: wait_in_flight proved the last submission finished.
        unsafe { cmd.reset() }?;
        cmd.begin(false)?;
        // SAFETY: every object recorded is owned by self and only dropped
        // after a device wait idle. The framebuffer was built for this
        // render pass and the set for this pipeline layout.
        unsafe {
            cmd.begin_render_pass(&chain.render_pass, framebuffer, &clear_values)?;
            cmd.bind_graphics_pipeline(&chain.pipeline)?;
            cmd.bind_vertex_buffer(0, &self.vertex_buffer, 0)?;
            cmd.bind_index_buffer(&self.index_buffer, 0, vk::IndexType::UINT16)?;
            cmd.bind_descriptor_set(&self.pipeline_layout, set.raw_descriptor_set())?;
            cmd.draw_indexed(TRIANGLE_INDICES.len() as u32, 1, 0, 0, 0)?;
        }
        cmd.end_render_pass()?;
        cmd.end()?;
        Ok(())
    }

    fn update_uniforms(&mut self, image_index: u32) -> eyre::Result<()> {
        let seconds = self.started.elapsed().as_secs_f32();
        let chain = live_chain_mut(&mut self.target)?;
        let state = FrameState {
            seconds,
            extent: chain.swapchain.extent(),
        };
        chain
            .uniform_buffers
            .get_mut(image_index as usize)
            .ok_or_eyre("No uniform buffer for acquired image")?
            .write_pod(0, &[state.transforms()])?;
        Ok(())
    }

    fn submit(&mut self, _image_index: u32) -> eyre::Result<()> {
        let wait = [(
            &self.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )];
        // SAFETY: everything the buffer references is owned by self and
        // outlives the work; the fence is waited on before the buffer is
        // re-recorded, and Drop waits for device idle.
        unsafe {
            self.queue.submit(
                &[SubmitBatch {
                    wait: &wait,
                    command_buffers: &[&self.command_buffer],
                    signal: &[&self.render_finished],
                }],
                Some(&mut self.in_flight),
            )
        }?;
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> eyre::Result<PresentStatus> {
        let chain = live_chain(&self.target)?;
        // SAFETY: image_index was acquired from this swapchain this frame,
        // the render pass leaves it in PRESENT_SRC_KHR, and render_finished
        // is signaled by the submission just made. The queue family was
        // selected for presenting to this surface.
        let status = unsafe {
            self.queue
                .present(&chain.swapchain, image_index, &[&self.render_finished])
        }?;
        Ok(status)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        tracing::debug!("Dropping renderer");
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Error while waiting for device idle on drop: {}", e);
        }
    }
}
