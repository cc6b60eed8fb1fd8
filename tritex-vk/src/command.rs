//! Command pools and state-tracked command buffers.
//!
//! A [`CommandBuffer`] follows the scoped sequence
//! `begin → begin_render_pass → binds → draw → end_render_pass → end`.
//! Every recording call is checked against [`CommandBufferState`] so an
//! out-of-order call is an error instead of undefined behaviour.

use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;
use crate::error::ApiError;
use crate::framebuffer::Framebuffer;
use crate::pipeline::{GraphicsPipeline, PipelineLayout};
use crate::queue::{SubmitBatch, SubmitError, Submittable};
use crate::render_pass::RenderPass;

pub trait CommandBufferHandle {
    fn raw_command_buffer(&self) -> vk::CommandBuffer;
}

impl<T> CommandBufferHandle for &T
where
    T: CommandBufferHandle + ?Sized,
{
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        (*self).raw_command_buffer()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Cannot {operation} while command buffer is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CommandBufferState,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum OneTimeSubmitError {
    #[error("Failed to allocate command buffer: {0}")]
    Allocate(#[from] AllocateCommandBufferError),
    #[error("Failed to record commands: {0}")]
    Record(#[from] RecordError),
    #[error("Failed to submit commands: {0}")]
    Submit(#[from] SubmitError),
}

// ---------------------------------------------------------------------------
// Recording state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    InRenderPass,
    Executable,
}

/// A state-changing recording step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStep {
    Reset,
    Begin,
    BeginRenderPass,
    EndRenderPass,
    End,
}

impl RecordStep {
    fn name(self) -> &'static str {
        match self {
            RecordStep::Reset => "reset",
            RecordStep::Begin => "begin",
            RecordStep::BeginRenderPass => "begin a render pass",
            RecordStep::EndRenderPass => "end a render pass",
            RecordStep::End => "end",
        }
    }
}

/// Next state after `step`, or the error if `step` is illegal in `state`.
pub fn transition(
    state: CommandBufferState,
    step: RecordStep,
) -> Result<CommandBufferState, RecordError> {
    use CommandBufferState as S;
    match (state, step) {
        // Pending buffers are guarded by the caller's fence, not here.
        (_, RecordStep::Reset) => Ok(S::Initial),
        (S::Initial, RecordStep::Begin) => Ok(S::Recording),
        (S::Recording, RecordStep::BeginRenderPass) => Ok(S::InRenderPass),
        (S::InRenderPass, RecordStep::EndRenderPass) => Ok(S::Recording),
        (S::Recording, RecordStep::End) => Ok(S::Executable),
        (state, step) => Err(RecordError::InvalidState {
            operation: step.name(),
            state,
        }),
    }
}

// ---------------------------------------------------------------------------
// CommandPool
// ---------------------------------------------------------------------------

/// Raw pool handle co-owned by the pool and every buffer allocated from
/// it, so no buffer can outlive its pool.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: runs only once the pool wrapper and every buffer from it
        // are gone. vkDestroyCommandPool frees all remaining buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

/// A pool of individually resettable primary command buffers.
///
/// `!Sync`: pool operations need external synchronisation, which this
/// gets structurally by never being shared across threads.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    queue_family: u32,
    /// Dropped buffers send their handles back here for reuse.
    sender: mpsc::Sender<vk::CommandBuffer>,
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .field("queue_family", &self.queue_family)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: create_info has no borrowed pointers; the driver rejects an
        // unknown family with an error.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }?;
        // SAFETY: pool is a valid command pool created from device.
        unsafe { device.name_or_warn(pool, "command pool", name) };

        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            queue_family,
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocate one primary command buffer, recycling a returned handle
    /// when there is one. The result is always reset to
    /// [`CommandBufferState::Initial`].
    pub fn allocate(
        &self,
        name: Option<&str>,
    ) -> Result<CommandBuffer, AllocateCommandBufferError> {
        let parent = &self.shared.parent;
        let mut returned: Vec<vk::CommandBuffer> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let handle = match returned.pop() {
            Some(recycled) => {
                if !returned.is_empty() {
                    // SAFETY: every handle came from this pool and was
                    // dropped idle; the pool is !Sync so access is external
                    // synchronised.
                    unsafe {
                        parent.free_raw_command_buffers(self.shared.pool, &returned)
                    };
                }
                // SAFETY: the dropped buffer was idle and the pool has
                // RESET_COMMAND_BUFFER.
                unsafe { parent.reset_raw_command_buffer(recycled) }?;
                recycled
            }
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.shared.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                // SAFETY: allocate_info names a live pool from parent.
                unsafe { parent.allocate_raw_command_buffers(&allocate_info) }?
                    .into_iter()
                    .next()
                    .ok_or(ApiError::new(
                        "vkAllocateCommandBuffers",
                        vk::Result::ERROR_UNKNOWN,
                    ))?
            }
        };
        // SAFETY: handle is a valid command buffer from parent.
        unsafe { parent.name_or_warn(handle, "command buffer", name) };

        Ok(CommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(parent),
            handle,
            state: CommandBufferState::Initial,
            return_sender: self.sender.clone(),
        })
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }

    /// Record with `record`, submit to `queue`, and block until the queue
    /// is idle. For startup uploads only.
    pub fn one_time_submit<Q: Submittable>(
        &self,
        queue: &Q,
        record: impl FnOnce(&mut CommandBuffer) -> Result<(), RecordError>,
    ) -> Result<(), OneTimeSubmitError> {
        let _span = tracing::debug_span!("one_time_submit").entered();
        let mut cmd = self.allocate(Some("one-time"))?;
        cmd.begin(true)?;
        record(&mut cmd)?;
        cmd.end()?;
        // SAFETY: the queue is drained below before cmd, or anything the
        // closure recorded, can be dropped.
        unsafe {
            queue.submit(
                &[SubmitBatch {
                    wait: &[],
                    command_buffers: &[&cmd],
                    signal: &[],
                }],
                None,
            )
        }?;
        queue.wait_idle().map_err(SubmitError::Api)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// A primary command buffer allocated from a [`CommandPool`].
///
/// On drop the handle goes back to the pool for reuse. The caller must
/// not drop a buffer while the GPU is still executing it.
pub struct CommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // A closed channel means the pool is gone and vkDestroyCommandPool
        // will free the handle.
        let _ = self.return_sender.send(self.handle);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    fn step(&mut self, step: RecordStep) -> Result<(), RecordError> {
        self.state = transition(self.state, step)?;
        Ok(())
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[CommandBufferState],
    ) -> Result<(), RecordError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RecordError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Return to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), RecordError> {
        let next = transition(self.state, RecordStep::Reset)?;
        // SAFETY: caller guarantees the buffer is not pending.
        unsafe { self.parent.reset_raw_command_buffer(self.handle) }?;
        self.state = next;
        Ok(())
    }

    /// Begin recording. `one_time` sets `ONE_TIME_SUBMIT`.
    pub fn begin(&mut self, one_time: bool) -> Result<(), RecordError> {
        transition(self.state, RecordStep::Begin)?;
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: the state check proves the buffer is in the initial state.
        unsafe { self.parent.begin_raw_command_buffer(self.handle, &begin_info) }?;
        self.step(RecordStep::Begin)
    }

    pub fn end(&mut self) -> Result<(), RecordError> {
        transition(self.state, RecordStep::End)?;
        // SAFETY: the state check proves recording outside a render pass.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }?;
        self.step(RecordStep::End)
    }

    /// Begin `render_pass` on `framebuffer`, covering its full extent.
    ///
    /// # Safety
    /// `framebuffer` must have been created for `render_pass`, and both
    /// must outlive the GPU execution of this buffer. `clear_values` must
    /// hold one entry per attachment.
    pub unsafe fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
    ) -> Result<(), RecordError> {
        transition(self.state, RecordStep::BeginRenderPass)?;
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_render_pass())
            .framebuffer(framebuffer.raw_framebuffer())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent(),
            })
            .clear_values(clear_values);
        // SAFETY: state checked; caller guarantees handle compatibility.
        unsafe { self.parent.cmd_begin_render_pass(self.handle, &begin_info) };
        self.step(RecordStep::BeginRenderPass)
    }

    pub fn end_render_pass(&mut self) -> Result<(), RecordError> {
        transition(self.state, RecordStep::EndRenderPass)?;
        // SAFETY: the state check proves a render pass is active.
        unsafe { self.parent.cmd_end_render_pass(self.handle) };
        self.step(RecordStep::EndRenderPass)
    }

    /// # Safety
    /// `pipeline` must outlive the GPU execution of this buffer and be
    /// compatible with the active render pass.
    pub unsafe fn bind_graphics_pipeline(
        &mut self,
        pipeline: &GraphicsPipeline,
    ) -> Result<(), RecordError> {
        self.require(
            "bind a pipeline",
            &[CommandBufferState::Recording, CommandBufferState::InRenderPass],
        )?;
        // SAFETY: state checked; caller guarantees pipeline lifetime.
        unsafe {
            self.parent
                .cmd_bind_graphics_pipeline(self.handle, pipeline.raw_pipeline())
        };
        Ok(())
    }

    /// # Safety
    /// `buffer` must have `VERTEX_BUFFER` usage, come from the same device,
    /// and outlive the GPU execution of this buffer.
    pub unsafe fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: impl BufferHandle,
        offset: vk::DeviceSize,
    ) -> Result<(), RecordError> {
        self.require(
            "bind a vertex buffer",
            &[CommandBufferState::Recording, CommandBufferState::InRenderPass],
        )?;
        // SAFETY: state checked; caller guarantees buffer validity.
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                self.handle,
                binding,
                &[buffer.raw_buffer()],
                &[offset],
            )
        };
        Ok(())
    }

    /// # Safety
    /// `buffer` must have `INDEX_BUFFER` usage, come from the same device,
    /// and outlive the GPU execution of this buffer.
    pub unsafe fn bind_index_buffer(
        &mut self,
        buffer: impl BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<(), RecordError> {
        self.require(
            "bind an index buffer",
            &[CommandBufferState::Recording, CommandBufferState::InRenderPass],
        )?;
        // SAFETY: state checked; caller guarantees buffer validity.
        unsafe {
            self.parent.cmd_bind_index_buffer(
                self.handle,
                buffer.raw_buffer(),
                offset,
                index_type,
            )
        };
        Ok(())
    }

    /// # Safety
    /// `set` must be a live descriptor set compatible with set 0 of
    /// `layout`, with every descriptor written, and must outlive the GPU
    /// execution of this buffer.
    pub unsafe fn bind_descriptor_set(
        &mut self,
        layout: &PipelineLayout,
        set: vk::DescriptorSet,
    ) -> Result<(), RecordError> {
        self.require(
            "bind a descriptor set",
            &[CommandBufferState::Recording, CommandBufferState::InRenderPass],
        )?;
        // SAFETY: state checked; caller guarantees set validity.
        unsafe {
            self.parent.cmd_bind_descriptor_sets(
                self.handle,
                layout.raw_pipeline_layout(),
                0,
                &[set],
            )
        };
        Ok(())
    }

    /// # Safety
    /// A pipeline, vertex buffer and index buffer matching the draw must be
    /// bound, and `index_count` must stay within the index buffer.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), RecordError> {
        self.require("draw", &[CommandBufferState::InRenderPass])?;
        // SAFETY: state checked; caller guarantees bound state.
        unsafe {
            self.parent.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        Ok(())
    }

    /// # Safety
    /// `src` needs `TRANSFER_SRC` and `dst` needs `TRANSFER_DST` usage;
    /// every region must be in bounds and both buffers must outlive the
    /// GPU execution of this buffer.
    pub unsafe fn copy_buffer(
        &mut self,
        src: impl BufferHandle,
        dst: impl BufferHandle,
        regions: &[vk::BufferCopy],
    ) -> Result<(), RecordError> {
        self.require("copy a buffer", &[CommandBufferState::Recording])?;
        // SAFETY: state checked; caller guarantees usage and bounds.
        unsafe {
            self.parent.cmd_copy_buffer(
                self.handle,
                src.raw_buffer(),
                dst.raw_buffer(),
                regions,
            )
        };
        Ok(())
    }

    /// # Safety
    /// `dst` must be in `TRANSFER_DST_OPTIMAL`; regions must be in bounds
    /// and both resources must outlive the GPU execution of this buffer.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: impl BufferHandle,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) -> Result<(), RecordError> {
        self.require("copy a buffer to an image", &[CommandBufferState::Recording])?;
        // SAFETY: state checked; caller guarantees layout and bounds.
        unsafe {
            self.parent.cmd_copy_buffer_to_image(
                self.handle,
                src.raw_buffer(),
                dst,
                regions,
            )
        };
        Ok(())
    }

    /// # Safety
    /// Every barrier must name a live image whose current layout matches
    /// its `old_layout`.
    pub unsafe fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) -> Result<(), RecordError> {
        self.require("record a barrier", &[CommandBufferState::Recording])?;
        // SAFETY: state checked; caller guarantees barrier validity.
        unsafe {
            self.parent.cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                image_barriers,
            )
        };
        Ok(())
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl CommandBufferHandle for CommandBuffer {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }
}

// CommandPool: Send + !Sync. CommandBuffer: Send + !Sync.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandBufferState as S;

    #[test]
    fn scoped_sequence_is_accepted() {
        let steps = [
            RecordStep::Begin,
            RecordStep::BeginRenderPass,
            RecordStep::EndRenderPass,
            RecordStep::End,
        ];
        let end = steps
            .iter()
            .try_fold(S::Initial, |s, &step| transition(s, step))
            .unwrap();
        assert_eq!(end, S::Executable);
    }

    #[test]
    fn end_inside_render_pass_is_rejected() {
        assert_eq!(
            transition(S::InRenderPass, RecordStep::End),
            Err(RecordError::InvalidState {
                operation: "end",
                state: S::InRenderPass
            })
        );
    }

    #[test]
    fn begin_twice_is_rejected() {
        assert!(transition(S::Recording, RecordStep::Begin).is_err());
        assert!(transition(S::Executable, RecordStep::Begin).is_err());
    }

    #[test]
    fn reset_returns_to_initial_from_any_state() {
        for state in [S::Initial, S::Recording, S::InRenderPass, S::Executable] {
            assert_eq!(transition(state, RecordStep::Reset), Ok(S::Initial));
        }
    }

    #[test]
    fn buffer_abandoned_mid_pass_can_be_rerecorded() {
        let mut state = S::Initial;
        for step in [RecordStep::Begin, RecordStep::BeginRenderPass] {
            state = transition(state, step).unwrap();
        }
        // Recording fails before the pass is closed.
        assert!(transition(state, RecordStep::End).is_err());
        state = transition(state, RecordStep::Reset).unwrap();
        assert_eq!(transition(state, RecordStep::Begin), Ok(S::Recording));
    }

    #[test]
    fn render_pass_needs_recording() {
        assert!(transition(S::Initial, RecordStep::BeginRenderPass).is_err());
        assert!(transition(S::Recording, RecordStep::EndRenderPass).is_err());
    }
}
