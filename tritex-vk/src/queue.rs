//! Typed queue handles.
//!
//! [`Device::queue`] checks a queue's family capabilities once, at
//! construction, and returns a handle that only exposes the operations
//! its roles allow: [`Submittable`] for graphics/compute/transfer work,
//! [`Presentable`] for presentation, both for [`GraphicsPresentQueue`].

use std::sync::{Arc, Mutex};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::adapter::QueueCapabilities;
use crate::command::{CommandBuffer, CommandBufferState};
use crate::device::Device;
use crate::error::ApiError;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, MarkSubmittedError, Semaphore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueRoleError {
    #[error("Queue {index} of family {family} was not opened on this device")]
    NotOpened { family: u32, index: u32 },
    #[error("Queue family {family} lacks {missing:?} needed for a {kind}")]
    MissingRoles {
        family: u32,
        kind: &'static str,
        missing: QueueCapabilities,
    },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Command buffer {index} is {state:?}, not executable")]
    NotExecutable {
        index: usize,
        state: CommandBufferState,
    },
    #[error("Fence is not unsignaled; wait and reset it before submitting")]
    FenceNotReady,
    #[error(transparent)]
    MarkSubmitted(#[from] MarkSubmittedError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("Image index {index} is out of range for {count} swapchain images")]
    IndexOutOfRange { index: u32, count: usize },
    #[error(transparent)]
    Api(#[from] ApiError),
}

fn check_present_index(index: u32, count: usize) -> Result<(), PresentError> {
    if index as usize >= count {
        return Err(PresentError::IndexOutOfRange { index, count });
    }
    Ok(())
}

/// Result of a successful presentation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the swapchain no longer matches the surface.
    Suboptimal,
    /// Not presented; the swapchain must be rebuilt.
    OutOfDate,
}

/// Capabilities in `wanted` that `available` lacks.
pub fn missing_roles(
    available: QueueCapabilities,
    wanted: QueueCapabilities,
) -> QueueCapabilities {
    wanted.difference(available)
}

/// An untyped queue: the shared handle plus where it came from.
pub struct RawQueue {
    parent: Arc<Device>,
    handle: Arc<Mutex<vk::Queue>>,
    family: u32,
    index: u32,
}

impl std::fmt::Debug for RawQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawQueue")
            .field("family", &self.family)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl RawQueue {
    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

pub trait QueueHandle {
    fn raw_queue(&self) -> &RawQueue;
}

/// One `vkQueueSubmit` batch.
pub struct SubmitBatch<'a> {
    /// Semaphores to wait on, each with the stage the wait applies at.
    pub wait: &'a [(&'a Semaphore, vk::PipelineStageFlags)],
    pub command_buffers: &'a [&'a CommandBuffer],
    pub signal: &'a [&'a Semaphore],
}

/// A queue that accepts command buffer submissions.
pub trait Submittable: QueueHandle {
    /// Submit `batches`, signalling `fence` when all of them complete.
    ///
    /// Every command buffer must be executable and `fence` must be
    /// unsignaled. The queue executes asynchronously.
    ///
    /// # Safety
    /// Every resource recorded into the command buffers, and the
    /// semaphores, must stay alive until the GPU finishes the work. No
    /// command buffer may already be pending unless it allows
    /// simultaneous use.
    unsafe fn submit(
        &self,
        batches: &[SubmitBatch<'_>],
        fence: Option<&mut Fence>,
    ) -> Result<(), SubmitError> {
        let raw = self.raw_queue();
        for (index, cmd) in batches
            .iter()
            .flat_map(|b| b.command_buffers.iter())
            .enumerate()
        {
            if cmd.state() != CommandBufferState::Executable {
                return Err(SubmitError::NotExecutable {
                    index,
                    state: cmd.state(),
                });
            }
        }
        if let Some(fence) = fence.as_ref()
            && !fence.is_ready()
        {
            return Err(SubmitError::FenceNotReady);
        }

        struct Storage {
            wait: Vec<vk::Semaphore>,
            stages: Vec<vk::PipelineStageFlags>,
            cmds: Vec<vk::CommandBuffer>,
            signal: Vec<vk::Semaphore>,
        }
        let storage: Vec<Storage> = batches
            .iter()
            .map(|b| Storage {
                wait: b.wait.iter().map(|(s, _)| s.raw_semaphore()).collect(),
                stages: b.wait.iter().map(|(_, stage)| *stage).collect(),
                cmds: b
                    .command_buffers
                    .iter()
                    .map(|c| c.raw_command_buffer())
                    .collect(),
                signal: b.signal.iter().map(|s| s.raw_semaphore()).collect(),
            })
            .collect();
        let infos: Vec<vk::SubmitInfo<'_>> = storage
            .iter()
            .map(|s| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&s.wait)
                    .wait_dst_stage_mask(&s.stages)
                    .command_buffers(&s.cmds)
                    .signal_semaphores(&s.signal)
            })
            .collect();

        let raw_fence = fence
            .as_ref()
            .map_or(vk::Fence::null(), |f| f.raw_fence());
        // SAFETY: states were checked above; the caller guarantees resource
        // lifetimes. Handles all come from raw.parent.
        unsafe { raw.parent.queue_submit(&raw.handle, &infos, raw_fence) }?;
        if let Some(fence) = fence {
            // SAFETY: the fence was just passed to vkQueueSubmit.
            unsafe { fence.mark_submitted() }?;
        }
        Ok(())
    }

    /// Block until this queue has drained.
    fn wait_idle(&self) -> Result<(), ApiError> {
        let raw = self.raw_queue();
        // SAFETY: the handle belongs to raw.parent.
        unsafe { raw.parent.queue_wait_idle(&raw.handle) }
    }
}

/// A queue that can present swapchain images.
pub trait Presentable: QueueHandle {
    /// Present `image_index` of `swapchain` after `wait` is signaled.
    ///
    /// An out-of-date swapchain is reported as
    /// [`PresentStatus::OutOfDate`], not an error.
    ///
    /// # Safety
    /// The image must have been acquired from `swapchain`, be in
    /// `PRESENT_SRC_KHR` once `wait` signals, and `wait` must be signaled
    /// by previously submitted work. The queue must support presenting to
    /// the swapchain's surface.
    unsafe fn present<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        swapchain: &Swapchain<T>,
        image_index: u32,
        wait: &[&Semaphore],
    ) -> Result<PresentStatus, PresentError> {
        check_present_index(image_index, swapchain.image_count())?;
        let raw = self.raw_queue();
        let wait: Vec<vk::Semaphore> =
            wait.iter().map(|s| s.raw_semaphore()).collect();
        let swapchains = [swapchain.raw_swapchain()];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: index checked above; the caller guarantees the rest.
        match unsafe { raw.parent.queue_present(&raw.handle, &present_info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(e) if e.is_out_of_date() => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

/// A typed queue handle constructible through [`Device::queue`].
pub trait QueueKind: QueueHandle + Sized {
    const ROLES: QueueCapabilities;
    const NAME: &'static str;
    fn from_raw(raw: RawQueue) -> Self;
}

macro_rules! queue_kind {
    ($(#[$meta:meta])* $name:ident, $label:literal, $roles:expr) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(RawQueue);

        impl QueueHandle for $name {
            fn raw_queue(&self) -> &RawQueue {
                &self.0
            }
        }

        impl QueueKind for $name {
            const ROLES: QueueCapabilities = $roles;
            const NAME: &'static str = $label;
            fn from_raw(raw: RawQueue) -> Self {
                Self(raw)
            }
        }
    };
}

queue_kind!(
    /// Submits graphics work.
    GraphicsQueue,
    "graphics queue",
    QueueCapabilities::GRAPHICS
);
queue_kind!(
    /// Presents swapchain images.
    PresentQueue,
    "present queue",
    QueueCapabilities::PRESENT
);
queue_kind!(
    /// Submits graphics work and presents.
    GraphicsPresentQueue,
    "graphics+present queue",
    QueueCapabilities::GRAPHICS.union(QueueCapabilities::PRESENT)
);
queue_kind!(ComputeQueue, "compute queue", QueueCapabilities::COMPUTE);
queue_kind!(TransferQueue, "transfer queue", QueueCapabilities::TRANSFER);

impl Submittable for GraphicsQueue {}
impl Submittable for GraphicsPresentQueue {}
impl Submittable for ComputeQueue {}
impl Submittable for TransferQueue {}
impl Presentable for PresentQueue {}
impl Presentable for GraphicsPresentQueue {}

impl Device {
    /// Get queue `index` of `family` as a `Q`, failing if the family lacks
    /// any of `Q`'s roles.
    ///
    /// Aliased handles share one lock, so taking the same queue as two
    /// kinds is allowed.
    pub fn queue<Q: QueueKind>(
        self: &Arc<Self>,
        family: u32,
        index: u32,
    ) -> Result<Q, QueueRoleError> {
        let not_opened = QueueRoleError::NotOpened { family, index };
        let capabilities = self
            .queue_family(family)
            .ok_or(not_opened.clone())?
            .capabilities;
        let handle = self.queue_slot(family, index).ok_or(not_opened)?;
        let missing = missing_roles(capabilities, Q::ROLES);
        if !missing.is_empty() {
            return Err(QueueRoleError::MissingRoles {
                family,
                kind: Q::NAME,
                missing,
            });
        }
        tracing::debug!("Took {} {index} from family {family}", Q::NAME);
        Ok(Q::from_raw(RawQueue {
            parent: Arc::clone(self),
            handle: Arc::clone(handle),
            family,
            index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_rejects_index_past_chain() {
        assert!(check_present_index(0, 2).is_ok());
        assert!(check_present_index(1, 2).is_ok());
        assert!(matches!(
            check_present_index(2, 2),
            Err(PresentError::IndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn graphics_present_family_fills_every_role() {
        let caps = QueueCapabilities::GRAPHICS
            | QueueCapabilities::TRANSFER
            | QueueCapabilities::PRESENT;
        assert!(missing_roles(caps, GraphicsPresentQueue::ROLES).is_empty());
        assert!(missing_roles(caps, GraphicsQueue::ROLES).is_empty());
        assert!(missing_roles(caps, PresentQueue::ROLES).is_empty());
        assert!(missing_roles(caps, TransferQueue::ROLES).is_empty());
    }

    #[test]
    fn family_without_surface_check_cannot_present() {
        let caps = QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE;
        assert_eq!(
            missing_roles(caps, GraphicsPresentQueue::ROLES),
            QueueCapabilities::PRESENT
        );
    }

    #[test]
    fn transfer_only_family_is_not_graphics() {
        let caps = QueueCapabilities::TRANSFER;
        assert_eq!(
            missing_roles(caps, GraphicsQueue::ROLES),
            QueueCapabilities::GRAPHICS
        );
        assert!(missing_roles(caps, TransferQueue::ROLES).is_empty());
    }
}
