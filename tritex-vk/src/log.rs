//! Validation-layer message forwarding.
//!
//! There is no global logger here. A caller opts into validation output
//! by passing a [`VulkanLogLevel`] to
//! [`Instance::new`](crate::instance::Instance::new); messages then flow
//! to whatever [`tracing`] subscriber the application installed.

use std::ffi::CStr;

use ash::vk;

/// Target used for every event emitted by the debug messenger.
pub const DEBUG_MESSENGER_TARGET: &str = "tritex-debug-messenger";

/// Minimum severity of validation messages to forward.
///
/// Ordered least-to-most severe: `Verbose < Info < Warning < Error`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    /// Severity bits covering this level and everything above it.
    pub fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            VulkanLogLevel::Verbose => {
                S::VERBOSE | S::INFO | S::WARNING | S::ERROR
            }
            VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Warning => S::WARNING | S::ERROR,
            VulkanLogLevel::Error => S::ERROR,
        }
    }
}

pub(crate) fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(level.severity_flags())
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

fn message_type_label(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback-data struct whose
    // p_message is a NUL-terminated string for the duration of the call.
    let message = unsafe {
        let data = &*p_callback_data;
        if data.p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(data.p_message)
    }
    .to_string_lossy();
    let kind = message_type_label(message_type);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}")
        }
        _ => {
            tracing::debug!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}")
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;

    #[test]
    fn error_level_only_forwards_errors() {
        assert_eq!(VulkanLogLevel::Error.severity_flags(), S::ERROR);
    }

    #[test]
    fn lower_levels_include_higher_severities() {
        let verbose = VulkanLogLevel::Verbose.severity_flags();
        let info = VulkanLogLevel::Info.severity_flags();
        let warning = VulkanLogLevel::Warning.severity_flags();

        assert!(verbose.contains(info));
        assert!(info.contains(warning));
        assert!(!info.contains(S::VERBOSE));
        assert!(warning.contains(S::ERROR));
    }

    #[test]
    fn unknown_message_type_is_labelled() {
        assert_eq!(
            message_type_label(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION),
            "VALIDATION"
        );
        assert_eq!(
            message_type_label(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            ),
            "UNKNOWN"
        );
    }
}
