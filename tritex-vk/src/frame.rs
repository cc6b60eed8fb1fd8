//! The single-frame-in-flight draw loop.
//!
//! [`draw_frame`] runs one iteration in a fixed order:
//!
//! 1. wait for the in-flight fence, then reset it
//! 2. acquire the next swapchain image (signals "image available")
//! 3. re-record the command buffer for that image
//! 4. write this frame's uniforms into the image's mapped buffer
//! 5. submit, waiting on "image available" at colour output and
//!    signaling "render finished" plus the fence
//! 6. present, waiting on "render finished"
//!
//! The steps themselves live behind [`FrameBackend`] so the ordering can
//! be checked without a GPU. Step 4 needs no synchronisation of its own:
//! the wait in step 1 already proved the GPU finished the previous frame,
//! and with one frame in flight that is the only reader.

use crate::queue::PresentStatus;

/// Result of step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was signaled.
    OutOfDate,
}

/// What happened to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain should be rebuilt.
    PresentedSuboptimal,
    /// Abandoned or not shown; the swapchain must be rebuilt before the
    /// next frame.
    SwapchainStale,
}

impl FrameOutcome {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, FrameOutcome::Presented)
    }
}

/// The six steps of a frame. Implementors own the fence, semaphores,
/// command buffer, uniform buffers and swapchain.
pub trait FrameBackend {
    type Error;

    /// Step 1. Must leave the fence unsignaled and free to submit.
    fn wait_in_flight(&mut self) -> Result<(), Self::Error>;
    fn acquire(&mut self) -> Result<Acquired, Self::Error>;
    fn record(&mut self, image_index: u32) -> Result<(), Self::Error>;
    fn update_uniforms(&mut self, image_index: u32) -> Result<(), Self::Error>;
    fn submit(&mut self, image_index: u32) -> Result<(), Self::Error>;
    fn present(&mut self, image_index: u32) -> Result<PresentStatus, Self::Error>;
}

/// Run one frame. Any backend error aborts the frame and is returned
/// unchanged.
pub fn draw_frame<B: FrameBackend>(backend: &mut B) -> Result<FrameOutcome, B::Error> {
    backend.wait_in_flight()?;

    let (index, acquire_suboptimal) = match backend.acquire()? {
        Acquired::Image { index, suboptimal } => (index, suboptimal),
        Acquired::OutOfDate => {
            tracing::debug!("Swapchain out of date at acquire");
            return Ok(FrameOutcome::SwapchainStale);
        }
    };

    let _span = tracing::trace_span!("frame", image_index = index).entered();
    backend.record(index)?;
    backend.update_uniforms(index)?;
    backend.submit(index)?;

    Ok(match backend.present(index)? {
        PresentStatus::OutOfDate => {
            tracing::debug!("Swapchain out of date at present");
            FrameOutcome::SwapchainStale
        }
        PresentStatus::Suboptimal => FrameOutcome::PresentedSuboptimal,
        PresentStatus::Optimal if acquire_suboptimal => FrameOutcome::PresentedSuboptimal,
        PresentStatus::Optimal => FrameOutcome::Presented,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        WaitFence,
        ResetFence,
        Acquire,
        SignalImageAvailable,
        Record(u32),
        Update(u32),
        WaitImageAvailable,
        SignalRenderFinished,
        Submit(u32),
        WaitRenderFinished,
        Present(u32),
    }

    /// Records calls and tracks fence/semaphore state the way the GPU
    /// would, panicking on any ordering violation.
    struct FakeBackend {
        calls: Vec<Call>,
        next_index: u32,
        image_count: u32,
        fence_signaled: bool,
        fence_waited: bool,
        image_available: bool,
        render_finished: bool,
        acquire_result: Option<Acquired>,
        present_result: PresentStatus,
        fail_submit: bool,
    }

    impl FakeBackend {
        fn new(image_count: u32) -> Self {
            Self {
                calls: Vec::new(),
                next_index: 0,
                image_count,
                fence_signaled: true,
                fence_waited: false,
                image_available: false,
                render_finished: false,
                acquire_result: None,
                present_result: PresentStatus::Optimal,
                fail_submit: false,
            }
        }
    }

    impl FrameBackend for FakeBackend {
        type Error = &'static str;

        fn wait_in_flight(&mut self) -> Result<(), Self::Error> {
            assert!(self.fence_signaled, "waited on a fence nothing will signal");
            self.calls.push(Call::WaitFence);
            self.fence_waited = true;
            self.calls.push(Call::ResetFence);
            self.fence_signaled = false;
            Ok(())
        }

        fn acquire(&mut self) -> Result<Acquired, Self::Error> {
            self.calls.push(Call::Acquire);
            if let Some(forced) = self.acquire_result {
                if matches!(forced, Acquired::OutOfDate) {
                    // Nothing will be submitted; keep the fence usable.
                    self.fence_signaled = true;
                }
                return Ok(forced);
            }
            let index = self.next_index;
            self.next_index = (self.next_index + 1) % self.image_count;
            self.calls.push(Call::SignalImageAvailable);
            self.image_available = true;
            Ok(Acquired::Image {
                index,
                suboptimal: false,
            })
        }

        fn record(&mut self, image_index: u32) -> Result<(), Self::Error> {
            self.calls.push(Call::Record(image_index));
            Ok(())
        }

        fn update_uniforms(&mut self, image_index: u32) -> Result<(), Self::Error> {
            assert!(!self.fence_signaled && self.fence_waited);
            self.calls.push(Call::Update(image_index));
            Ok(())
        }

        fn submit(&mut self, image_index: u32) -> Result<(), Self::Error> {
            if self.fail_submit {
                return Err("submit failed");
            }
            assert!(self.image_available, "render before image available");
            self.calls.push(Call::WaitImageAvailable);
            self.image_available = false;
            self.calls.push(Call::SignalRenderFinished);
            self.render_finished = true;
            self.calls.push(Call::Submit(image_index));
            self.fence_signaled = true;
            self.fence_waited = false;
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<PresentStatus, Self::Error> {
            assert!(self.render_finished, "present before render finished");
            self.calls.push(Call::WaitRenderFinished);
            self.render_finished = false;
            self.calls.push(Call::Present(image_index));
            Ok(self.present_result)
        }
    }

    fn position(calls: &[Call], call: Call) -> usize {
        calls.iter().position(|c| *c == call).unwrap()
    }

    #[test]
    fn steps_run_in_order() {
        let mut backend = FakeBackend::new(3);
        assert_eq!(draw_frame(&mut backend), Ok(FrameOutcome::Presented));
        assert_eq!(
            backend.calls,
            vec![
                Call::WaitFence,
                Call::ResetFence,
                Call::Acquire,
                Call::SignalImageAvailable,
                Call::Record(0),
                Call::Update(0),
                Call::WaitImageAvailable,
                Call::SignalRenderFinished,
                Call::Submit(0),
                Call::WaitRenderFinished,
                Call::Present(0),
            ]
        );
    }

    #[test]
    fn render_finished_follows_image_available_wait_every_frame() {
        let mut backend = FakeBackend::new(2);
        for _ in 0..5 {
            draw_frame(&mut backend).unwrap();
        }
        for frame in backend.calls.split(|c| *c == Call::WaitFence).skip(1) {
            let wait = position(frame, Call::WaitImageAvailable);
            let signal = position(frame, Call::SignalRenderFinished);
            assert!(wait < signal);
        }
        let presented: Vec<u32> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Present(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(presented, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn stale_acquire_abandons_frame_and_next_frame_proceeds() {
        let mut backend = FakeBackend::new(2);
        backend.acquire_result = Some(Acquired::OutOfDate);
        assert_eq!(draw_frame(&mut backend), Ok(FrameOutcome::SwapchainStale));
        assert_eq!(
            backend.calls,
            vec![Call::WaitFence, Call::ResetFence, Call::Acquire]
        );

        backend.acquire_result = None;
        assert_eq!(draw_frame(&mut backend), Ok(FrameOutcome::Presented));
    }

    #[test]
    fn present_status_maps_to_outcome() {
        let mut backend = FakeBackend::new(2);
        backend.present_result = PresentStatus::OutOfDate;
        assert_eq!(draw_frame(&mut backend), Ok(FrameOutcome::SwapchainStale));
        backend.present_result = PresentStatus::Suboptimal;
        assert_eq!(
            draw_frame(&mut backend),
            Ok(FrameOutcome::PresentedSuboptimal)
        );
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let mut backend = FakeBackend::new(2);
        backend.acquire_result = Some(Acquired::Image {
            index: 1,
            suboptimal: true,
        });
        backend.image_available = true;
        let outcome = draw_frame(&mut backend).unwrap();
        assert_eq!(outcome, FrameOutcome::PresentedSuboptimal);
        assert!(outcome.needs_rebuild());
        assert!(backend.calls.contains(&Call::Present(1)));
    }

    #[test]
    fn errors_stop_the_frame() {
        let mut backend = FakeBackend::new(2);
        backend.fail_submit = true;
        assert_eq!(draw_frame(&mut backend), Err("submit failed"));
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Present(_))));
    }
}
