//! The status-code wrapper shared by every module.
//!
//! Raw calls on [`Device`](crate::device::Device) and
//! [`Instance`](crate::instance::Instance) convert `vk::Result` failures
//! into [`ApiError`] through [`VkResultExt::op`], tagging them with the
//! entry point that failed. Higher-level error enums embed it with
//! `#[from]`.

use ash::vk;
use thiserror::Error;

/// A non-success status returned by a Vulkan entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} failed: {result}")]
pub struct ApiError {
    pub operation: &'static str,
    pub result: vk::Result,
}

impl ApiError {
    pub fn new(operation: &'static str, result: vk::Result) -> Self {
        Self { operation, result }
    }

    /// `VK_ERROR_OUT_OF_DATE_KHR`: the swapchain no longer matches its
    /// surface and must be rebuilt.
    pub fn is_out_of_date(&self) -> bool {
        self.result == vk::Result::ERROR_OUT_OF_DATE_KHR
    }

    pub fn is_device_lost(&self) -> bool {
        self.result == vk::Result::ERROR_DEVICE_LOST
    }
}

/// Attaches an operation name to a raw `ash` result.
pub trait VkResultExt<T> {
    fn op(self, operation: &'static str) -> Result<T, ApiError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn op(self, operation: &'static str) -> Result<T, ApiError> {
        self.map_err(|result| ApiError { operation, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_operation_and_status() {
        let err = ApiError::new(
            "vkAllocateMemory",
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        );
        let text = err.to_string();
        assert!(text.starts_with("vkAllocateMemory failed: "));
        assert!(text.len() > "vkAllocateMemory failed: ".len());
    }

    #[test]
    fn op_passes_success_through() {
        let ok: Result<u32, vk::Result> = Ok(7);
        assert_eq!(ok.op("vkCreateFence"), Ok(7));
    }

    #[test]
    fn op_tags_failures() {
        let failed: Result<(), vk::Result> =
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let err = failed.op("vkQueuePresentKHR").unwrap_err();
        assert_eq!(err.operation, "vkQueuePresentKHR");
        assert!(err.is_out_of_date());
        assert!(!err.is_device_lost());
    }
}
