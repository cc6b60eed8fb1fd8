//! GPU synchronisation primitives: [`Fence`] and [`Semaphore`].
//!
//! [`Fence`] is a CPU–GPU synchronisation object. It tracks its own
//! state so the render loop cannot reset a fence it has not waited on,
//! submit a fence that is already pending, or wait on one nothing will
//! ever signal.
//!
//! [`Semaphore`] is a GPU–GPU synchronisation object used to order
//! swapchain acquisition, rendering and presentation.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Asked to wait for fence but fence was never marked as submitted")]
    NotSubmitted,
    #[error(transparent)]
    Api(ApiError),
}

#[derive(Debug, Error)]
pub enum ResetFenceError {
    #[error("Fence must be waited on before it is reset")]
    NotWaited,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkSubmittedError {
    #[error(
        "This fence is already submitted or signaled and must be reset \
         before it is submitted again"
    )]
    NotUnsignaled,
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// CPU-side view of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Reset and free to hand to a submission.
    Unsignaled,
    /// Handed to a submission; the GPU will signal it.
    Pending,
    /// Known to be signaled, either from creation or after a wait.
    Signaled,
}

impl FenceState {
    fn after_submit(self) -> Result<Self, MarkSubmittedError> {
        match self {
            FenceState::Unsignaled => Ok(FenceState::Pending),
            FenceState::Pending | FenceState::Signaled => {
                Err(MarkSubmittedError::NotUnsignaled)
            }
        }
    }

    fn after_reset(self) -> Result<Self, ResetFenceError> {
        match self {
            FenceState::Signaled => Ok(FenceState::Unsignaled),
            FenceState::Pending | FenceState::Unsignaled => {
                Err(ResetFenceError::NotWaited)
            }
        }
    }
}

/// An owned binary fence.
///
/// Use [`wait`](Self::wait) to block until the GPU signals the fence,
/// then [`reset`](Self::reset) to return it to the unsignaled state
/// before the next submission.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    state: FenceState,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence.
    ///
    /// Pass `signaled = true` so the first wait of a render loop returns
    /// immediately.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }?;
        // SAFETY: handle is a valid fence created from device.
        unsafe { device.name_or_warn(handle, "fence", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: if signaled {
                FenceState::Signaled
            } else {
                FenceState::Unsignaled
            },
        })
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    ///
    /// Pass `u64::MAX` to wait indefinitely.
    pub fn wait(&mut self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        match self.state {
            FenceState::Signaled => Ok(()),
            FenceState::Unsignaled => Err(WaitFenceError::NotSubmitted),
            FenceState::Pending => {
                // SAFETY: handle is a valid fence created from parent.
                unsafe {
                    self.parent.wait_for_raw_fences(
                        &[self.handle],
                        true,
                        timeout_ns,
                    )
                }
                .map_err(|e| {
                    if e.result == vk::Result::TIMEOUT {
                        WaitFenceError::Timeout
                    } else {
                        WaitFenceError::Api(e)
                    }
                })?;
                self.state = FenceState::Signaled;
                Ok(())
            }
        }
    }

    /// Poll without blocking. Returns `true` once signaled.
    pub fn poll(&mut self) -> Result<bool, WaitFenceError> {
        match self.wait(0) {
            Ok(()) => Ok(true),
            Err(WaitFenceError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Return a waited-on fence to the unsignaled state.
    pub fn reset(&mut self) -> Result<(), ResetFenceError> {
        let next = self.state.after_reset()?;
        // SAFETY: the state check proves the fence is signaled, so it is
        // not pending on any queue.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }?;
        self.state = next;
        Ok(())
    }

    /// Wait then reset: the start of every frame.
    pub fn wait_and_reset(
        &mut self,
        timeout_ns: u64,
    ) -> Result<(), WaitFenceError> {
        self.wait(timeout_ns)?;
        self.reset().map_err(|e| match e {
            ResetFenceError::Api(e) => WaitFenceError::Api(e),
            ResetFenceError::NotWaited => WaitFenceError::NotSubmitted,
        })
    }

    /// Record that the fence was handed to a submission.
    ///
    /// # Safety
    /// The fence must actually have been passed to an operation that will
    /// signal it, such as vkQueueSubmit.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        self.state = self.state.after_submit()?;
        Ok(())
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Unsignaled and free to submit.
    pub fn is_ready(&self) -> bool {
        self.state == FenceState::Unsignaled
    }

    /// Pending on a submission.
    pub fn is_submitted(&self) -> bool {
        self.state == FenceState::Pending
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        if self.state == FenceState::Pending {
            tracing::warn!("Fence {:?} dropped while pending", self.handle);
        }
        // SAFETY: handle was created from parent. Owners wait for device
        // idle before tearing down in-flight fences.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// An owned binary semaphore.
///
/// Signaled by one queue operation and waited on by another. The CPU
/// cannot observe or reset it.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }?;
        // SAFETY: handle is a valid semaphore created from device.
        unsafe { device.name_or_warn(handle, "semaphore", name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: handle was created from parent. No GPU work may be
        // waiting on or about to signal it during teardown.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_cycle_transitions() {
        let s = FenceState::Signaled;
        let s = s.after_reset().unwrap();
        assert_eq!(s, FenceState::Unsignaled);
        let s = s.after_submit().unwrap();
        assert_eq!(s, FenceState::Pending);
    }

    #[test]
    fn reset_requires_wait() {
        assert!(matches!(
            FenceState::Pending.after_reset(),
            Err(ResetFenceError::NotWaited)
        ));
        assert!(matches!(
            FenceState::Unsignaled.after_reset(),
            Err(ResetFenceError::NotWaited)
        ));
    }

    #[test]
    fn double_submit_is_rejected() {
        assert_eq!(
            FenceState::Pending.after_submit(),
            Err(MarkSubmittedError::NotUnsignaled)
        );
        assert_eq!(
            FenceState::Signaled.after_submit(),
            Err(MarkSubmittedError::NotUnsignaled)
        );
    }
}
